//! Request/response sync protocols layered on the data channel

pub mod apps;
pub mod icons;
pub mod relay;

pub use apps::{AppListSync, AppRegistry, MemoryAppRegistry};
pub use icons::{IconStore, IconSync, MemoryIconStore};
pub use relay::{EventSink, NullSink, RelayDispatch};
