use thiserror::Error;

/// Lanlink error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Failed to serialize/deserialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Malformed wire data: {0}")]
    Malformed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Device not trusted: {0}")]
    NotTrusted(uuid::Uuid),

    #[error("No active session for device {0}")]
    NoSession(uuid::Uuid),

    #[error("Service is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
