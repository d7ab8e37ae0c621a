//! JSON payload bodies carried inside encrypted data lines
//!
//! Each sync protocol defines its own message shape; all of them embed a
//! `time` field (epoch millis) that receivers use for staleness checks.

use serde::{Deserialize, Serialize};

use crate::protocol::wire::DeviceType;

/// Current time as epoch milliseconds, the `time` field unit everywhere.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Icon sync request/response bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IconMessage {
    /// Single and batch requests share this shape: `packageName` for one,
    /// `packageNames` for many. Both may be present; the union is requested.
    #[serde(rename = "ICON_REQUEST", rename_all = "camelCase")]
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        package_name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        package_names: Vec<String>,
        time: u64,
    },
    #[serde(rename = "ICON_RESPONSE", rename_all = "camelCase")]
    Response {
        icons: Vec<IconEntry>,
        /// Packages the responder definitively does not have. A package in
        /// neither list is still unknown and may be re-requested.
        #[serde(default)]
        missing: Vec<String>,
        time: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IconEntry {
    pub package_name: String,
    #[serde(with = "crate::crypto::serde_utils::base64_bytes")]
    pub icon_data: Vec<u8>,
}

/// Application-list sync bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AppListMessage {
    #[serde(rename = "APP_LIST_REQUEST", rename_all = "camelCase")]
    Request { time: u64 },
    #[serde(rename = "APP_LIST_RESPONSE", rename_all = "camelCase")]
    Response { apps: Vec<AppEntry>, time: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEntry {
    pub package_name: String,
    pub label: String,
}

/// Sealed body of an AUTH / AUTH_OK line. Decrypting it with the stored
/// shared secret proves possession; the embedded fields refresh the trust
/// record without another pairing round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProof {
    pub time: u64,
    pub display_name: String,
    pub device_type: DeviceType,
    pub tcp_port: u16,
}
