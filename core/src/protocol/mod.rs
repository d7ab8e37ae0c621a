//! Wire codec, protocol constants and payload message types

pub mod constants;
pub mod messages;
pub mod wire;

pub use messages::{now_millis, AppEntry, AppListMessage, AuthProof, IconEntry, IconMessage};
pub use wire::{DataLine, DataTag, DeviceType, Heartbeat, HelloFrame, Line};
