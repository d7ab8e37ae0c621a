//! Centralized protocol constants
//!
//! All protocol-level constants are defined here to ensure consistency
//! across the codebase and make configuration easier.

use std::time::Duration;

/// UDP port for heartbeat discovery broadcasts
pub const DISCOVERY_PORT: u16 = 23334;

/// Default TCP port for the session listener
pub const DEFAULT_TCP_PORT: u16 = 23335;

/// Interval between heartbeat broadcasts
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// A peer with no heartbeat for this long is considered offline
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(8);

/// Interval of the periodic reconnect task
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Spacing between per-peer connection attempts after a network change
pub const RECONNECT_SPACING: Duration = Duration::from_millis(500);

/// Delay before the extra reconnect pass on peer-link networks
pub const PEER_LINK_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Consecutive connect failures before retries are suppressed
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Timeout for an outbound TCP connect + handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Window during which a repeated icon request for the same package is suppressed
pub const ICON_REQUEST_WINDOW: Duration = Duration::from_secs(10);

/// Window during which a repeated app-list request to the same peer is suppressed
pub const APP_LIST_REQUEST_WINDOW: Duration = Duration::from_secs(10);

/// Payloads whose embedded `time` is older than this are dropped as stale
pub const PAYLOAD_STALENESS: Duration = Duration::from_secs(60);

/// Allowed clock skew on re-authentication proofs
pub const AUTH_TIME_SKEW: Duration = Duration::from_secs(60);

/// Maximum accepted length of a single TCP protocol line (8 MiB)
pub const MAX_LINE_LEN: usize = 8 * 1024 * 1024;

/// Info string mixed into shared-secret derivation
pub const SECRET_INFO: &[u8] = b"lanlink-pair-secret";

/// /24 prefixes scanned by unicast when broadcast is unreliable
pub const PEER_LINK_SCAN_PREFIXES: &[[u8; 3]] = &[
    [192, 168, 49],
    [192, 168, 43],
    [192, 168, 42],
    [10, 0, 0],
];
