//! Protocol router: the single entry point for authenticated data lines
//!
//! Every line is checked against the trust store, decrypted under the
//! sender's shared secret, and dispatched to exactly one handler by tag.
//! Unknown/unaccepted senders, decrypt failures and malformed JSON are hard
//! stops: the line is logged and dropped, nothing is partially processed,
//! and the connection itself is not penalized.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::protocol::wire::{DataLine, DataTag, DeviceType};
use crate::protocol::{AppListMessage, IconMessage};
use crate::sync::{AppListSync, IconSync, RelayDispatch};
use crate::trust::TrustStore;

pub struct ProtocolRouter {
    trust: Arc<TrustStore>,
    icons: Arc<IconSync>,
    apps: Arc<AppListSync>,
    relay: Arc<RelayDispatch>,
}

impl ProtocolRouter {
    pub fn new(
        trust: Arc<TrustStore>,
        icons: Arc<IconSync>,
        apps: Arc<AppListSync>,
        relay: Arc<RelayDispatch>,
    ) -> Self {
        Self {
            trust,
            icons,
            apps,
            relay,
        }
    }

    /// Route one data line. Always "handles" the line from the session's
    /// point of view; rejected input is dropped here, never propagated.
    pub async fn handle_line(&self, line: DataLine) {
        let from = line.uuid;

        let Some(auth) = self.trust.get(&from).await else {
            tracing::warn!(peer = %from, "data line from unknown device dropped");
            return;
        };
        if !auth.is_accepted {
            tracing::warn!(peer = %from, "data line from unaccepted device dropped");
            return;
        }
        let plain = match auth.shared_secret.open(&line.payload) {
            Ok(plain) => plain,
            Err(_) => {
                tracing::warn!(peer = %from, tag = line.tag.as_header(), "payload decryption failed, dropped");
                return;
            }
        };
        let payload: Value = match serde_json::from_slice(&plain) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "payload is not valid JSON, dropped");
                return;
            }
        };

        // Certain channels are only honored from PC-class peers; the line is
        // accepted at the transport level but the action is refused here.
        if matches!(line.tag, DataTag::Ftp | DataTag::MediaPlay)
            && auth.device_type != DeviceType::Pc
        {
            tracing::info!(
                peer = %from,
                device_type = %auth.device_type,
                tag = line.tag.as_header(),
                "channel refused for this device class"
            );
            return;
        }

        match line.tag {
            DataTag::IconRequest => self.dispatch_icon(from, payload).await,
            DataTag::IconResponse => self.dispatch_icon(from, payload).await,
            DataTag::AppListRequest | DataTag::AppListResponse => {
                self.dispatch_app_list(from, payload).await
            }
            DataTag::Ftp => {
                // File-transfer control spins up local I/O; keep it off the
                // session's read loop.
                let relay = self.relay.clone();
                let tag = line.tag.clone();
                tokio::spawn(async move {
                    relay.handle(&tag, from, payload);
                });
            }
            DataTag::Notification
            | DataTag::SuperIsland
            | DataTag::MediaPlay
            | DataTag::MediaControl
            | DataTag::Clipboard
            | DataTag::Status => self.relay.handle(&line.tag, from, payload),
            DataTag::Unknown(ref header) => {
                // Forward compatibility: newer peers may send tags we do not
                // know yet.
                tracing::debug!(peer = %from, header, "unknown data tag dropped");
            }
        }
    }

    async fn dispatch_icon(&self, from: Uuid, payload: Value) {
        match serde_json::from_value::<IconMessage>(payload) {
            Ok(IconMessage::Request {
                package_name,
                package_names,
                time,
            }) => {
                self.icons
                    .handle_request(from, package_name, package_names, time)
                    .await;
            }
            Ok(IconMessage::Response { icons, missing, .. }) => {
                self.icons.handle_response(from, icons, missing);
            }
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "malformed icon message dropped");
            }
        }
    }

    async fn dispatch_app_list(&self, from: Uuid, payload: Value) {
        match serde_json::from_value::<AppListMessage>(payload) {
            Ok(AppListMessage::Request { time }) => self.apps.handle_request(from, time).await,
            Ok(AppListMessage::Response { apps, .. }) => self.apps.handle_response(from, apps),
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "malformed app list message dropped");
            }
        }
    }
}
