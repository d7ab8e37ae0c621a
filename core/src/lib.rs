//! Lanlink Core - trusted-device LAN sync protocol
//!
//! This library lets a set of trusted devices on a local network discover
//! each other over UDP heartbeats, pair into a per-device shared secret,
//! and exchange small structured payloads (notifications, clipboard,
//! application metadata, icons, media control) over an encrypted,
//! line-multiplexed TCP channel. No central server.

pub mod conn;
pub mod crypto;
pub mod discovery;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod service;
pub mod sync;
pub mod trust;

mod error;

pub use error::{Error, Result};

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::SigningKey;
use crate::protocol::wire::DeviceType;

/// This device's identity: a stable uuid plus the Ed25519 key that signs
/// its pairing handshakes. Name and device class come from configuration
/// and may change between runs; the uuid and key do not.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub uuid: Uuid,
    pub name: String,
    pub device_type: DeviceType,
    pub signing_key: SigningKey,
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    uuid: Uuid,
    #[serde(with = "crate::crypto::serde_utils::base64_array_32")]
    signing_key: [u8; 32],
}

impl DeviceIdentity {
    /// Fresh identity with generated uuid and key.
    pub fn generate(name: String, device_type: DeviceType) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            device_type,
            signing_key: SigningKey::generate(),
        }
    }

    /// Load the persisted identity, or generate and persist a new one.
    /// Peers key their trust records by our uuid, so it must survive
    /// restarts.
    pub fn load_or_generate(path: &Path, name: String, device_type: DeviceType) -> Result<Self> {
        if let Ok(bytes) = std::fs::read(path) {
            match serde_json::from_slice::<StoredIdentity>(&bytes) {
                Ok(stored) => {
                    return Ok(Self {
                        uuid: stored.uuid,
                        name,
                        device_type,
                        signing_key: SigningKey::from_bytes(&stored.signing_key),
                    });
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "identity file unreadable, regenerating");
                }
            }
        }

        let identity = Self::generate(name, device_type);
        let stored = StoredIdentity {
            uuid: identity.uuid,
            signing_key: identity.signing_key.to_bytes(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&stored)?)?;
        Ok(identity)
    }

    /// Public key fingerprint for display and pairing confirmation.
    pub fn fingerprint(&self) -> String {
        self.signing_key.fingerprint()
    }
}

/// Configuration for the lanlink service.
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP port for heartbeat discovery.
    pub discovery_port: u16,
    /// TCP port for the session listener; 0 binds an ephemeral port.
    pub tcp_port: u16,
    /// Where identity and trust records persist.
    pub data_dir: std::path::PathBuf,
    /// Accept inbound pairings without waiting for `approve_peer`.
    pub auto_accept: bool,
    pub heartbeat_interval: std::time::Duration,
    pub presence_timeout: std::time::Duration,
    pub connect_timeout: std::time::Duration,
    pub reconnect_interval: std::time::Duration,
    /// Spacing between per-peer attempts in a network-change sweep.
    pub reconnect_spacing: std::time::Duration,
    /// Delay before the extra reconnect pass on peer-link networks.
    pub peer_link_retry_delay: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        use protocol::constants;
        Self {
            discovery_port: constants::DISCOVERY_PORT,
            tcp_port: constants::DEFAULT_TCP_PORT,
            data_dir: dirs_home().join(".lanlink"),
            auto_accept: false,
            heartbeat_interval: constants::HEARTBEAT_INTERVAL,
            presence_timeout: constants::PRESENCE_TIMEOUT,
            connect_timeout: constants::CONNECT_TIMEOUT,
            reconnect_interval: constants::RECONNECT_INTERVAL,
            reconnect_spacing: constants::RECONNECT_SPACING,
            peer_link_retry_delay: constants::PEER_LINK_RETRY_DELAY,
        }
    }
}

fn dirs_home() -> std::path::PathBuf {
    dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."))
}

// Re-export key types for convenience
pub use conn::{ConnectOutcome, ConnectionManager, PeerState};
pub use crypto::SharedSecret;
pub use discovery::{DiscoveryEngine, NetworkClass, NetworkClassifier};
pub use presence::DeviceInfo;
pub use protocol::{DataTag, Heartbeat};
pub use service::{LanlinkService, LinkEvent};
pub use trust::{AuthInfo, TrustStore};
