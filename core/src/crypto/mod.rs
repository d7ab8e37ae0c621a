//! Cryptographic primitives for lanlink
//!
//! - Ed25519 for device identity and handshake signatures
//! - X25519 for ECDH during pairing
//! - AES-256-GCM for payload sealing under the per-pair shared secret

mod keys;
mod secret;
pub mod serde_utils;

pub use keys::{EphemeralSecret, ExchangeKey, SigningKey, VerifyingKey};
pub use secret::SharedSecret;
