//! Application-list sync
//!
//! Same request/response pattern as icon sync: ask a peer for the apps it
//! hosts, remember the answer, and feed the package-to-peer mapping into the
//! icon sync's authority map so later icon requests go to the right device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::conn::OutboundData;
use crate::protocol::constants::{APP_LIST_REQUEST_WINDOW, PAYLOAD_STALENESS};
use crate::protocol::wire::DataTag;
use crate::protocol::{now_millis, AppEntry, AppListMessage};
use crate::sync::icons::IconSync;
use crate::sync::relay::EventSink;
use crate::Result;

/// What this device itself has installed. The platform integration that
/// enumerates real applications lives outside the core.
pub trait AppRegistry: Send + Sync {
    fn installed(&self) -> Vec<AppEntry>;
    fn is_installed(&self, package: &str) -> bool;
}

/// In-memory registry used by tests and the CLI.
#[derive(Default)]
pub struct MemoryAppRegistry {
    apps: std::sync::RwLock<HashMap<String, String>>,
}

impl MemoryAppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, package: &str, label: &str) {
        self.apps
            .write()
            .expect("app registry lock")
            .insert(package.to_string(), label.to_string());
    }
}

impl AppRegistry for MemoryAppRegistry {
    fn installed(&self) -> Vec<AppEntry> {
        self.apps
            .read()
            .expect("app registry lock")
            .iter()
            .map(|(package, label)| AppEntry {
                package_name: package.clone(),
                label: label.clone(),
            })
            .collect()
    }

    fn is_installed(&self, package: &str) -> bool {
        self.apps
            .read()
            .expect("app registry lock")
            .contains_key(package)
    }
}

struct AppListState {
    in_flight: HashMap<Uuid, Instant>,
    peer_apps: HashMap<Uuid, HashMap<String, String>>,
}

pub struct AppListSync {
    registry: Arc<dyn AppRegistry>,
    icons: Arc<IconSync>,
    sink: Arc<dyn EventSink>,
    outbound: mpsc::Sender<OutboundData>,
    state: Mutex<AppListState>,
    request_window: Duration,
}

impl AppListSync {
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        icons: Arc<IconSync>,
        sink: Arc<dyn EventSink>,
        outbound: mpsc::Sender<OutboundData>,
    ) -> Self {
        Self {
            registry,
            icons,
            sink,
            outbound,
            state: Mutex::new(AppListState {
                in_flight: HashMap::new(),
                peer_apps: HashMap::new(),
            }),
            request_window: APP_LIST_REQUEST_WINDOW,
        }
    }

    /// Ask a peer for its app list; repeats inside the window are
    /// suppressed. Returns whether a request was sent.
    pub async fn request_from(&self, peer: Uuid) -> Result<bool> {
        {
            let mut state = self.state.lock().expect("app list lock");
            if let Some(sent) = state.in_flight.get(&peer) {
                if sent.elapsed() <= self.request_window {
                    return Ok(false);
                }
            }
            state.in_flight.insert(peer, Instant::now());
        }

        let body = serde_json::to_vec(&AppListMessage::Request { time: now_millis() })?;
        if self
            .outbound
            .send(OutboundData {
                to: peer,
                tag: DataTag::AppListRequest,
                body,
            })
            .await
            .is_err()
        {
            tracing::debug!("outbound queue closed, app list request dropped");
        }
        Ok(true)
    }

    pub async fn handle_request(&self, from: Uuid, time: u64) {
        if time > 0 && now_millis().saturating_sub(time) > PAYLOAD_STALENESS.as_millis() as u64 {
            tracing::debug!(peer = %from, "stale app list request dropped");
            return;
        }

        let apps = self.registry.installed();
        tracing::debug!(peer = %from, count = apps.len(), "answering app list request");
        let body = match serde_json::to_vec(&AppListMessage::Response {
            apps,
            time: now_millis(),
        }) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "app list response serialization failed");
                return;
            }
        };
        if self
            .outbound
            .send(OutboundData {
                to: from,
                tag: DataTag::AppListResponse,
                body,
            })
            .await
            .is_err()
        {
            tracing::debug!("outbound queue closed, app list response dropped");
        }
    }

    /// Apply a response: upsert the peer's remembered apps and record that
    /// peer as the authority for every package it hosts.
    pub fn handle_response(&self, from: Uuid, apps: Vec<AppEntry>) {
        let count = apps.len();
        let packages: Vec<String> = apps.iter().map(|a| a.package_name.clone()).collect();

        {
            let mut state = self.state.lock().expect("app list lock");
            state.in_flight.remove(&from);
            let remembered = state.peer_apps.entry(from).or_default();
            for app in apps {
                remembered.insert(app.package_name, app.label);
            }
        }

        self.icons.record_authority(from, packages);
        self.sink.app_list_updated(from, count);
    }

    /// The last app list a peer reported.
    pub fn apps_of(&self, peer: &Uuid) -> Vec<AppEntry> {
        self.state
            .lock()
            .expect("app list lock")
            .peer_apps
            .get(peer)
            .map(|apps| {
                apps.iter()
                    .map(|(package, label)| AppEntry {
                        package_name: package.clone(),
                        label: label.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::icons::MemoryIconStore;
    use crate::sync::relay::NullSink;

    fn make_sync() -> (AppListSync, Arc<IconSync>, mpsc::Receiver<OutboundData>) {
        let registry = Arc::new(MemoryAppRegistry::new());
        registry.add("com.example.music", "Music");
        let (tx, rx) = mpsc::channel(16);
        let icons = Arc::new(IconSync::new(
            Arc::new(MemoryIconStore::new()),
            registry.clone(),
            Arc::new(NullSink),
            tx.clone(),
        ));
        (
            AppListSync::new(registry, icons.clone(), Arc::new(NullSink), tx),
            icons,
            rx,
        )
    }

    #[tokio::test]
    async fn request_suppressed_within_window() {
        let (sync, _icons, mut rx) = make_sync();
        let peer = Uuid::new_v4();

        assert!(sync.request_from(peer).await.unwrap());
        assert!(!sync.request_from(peer).await.unwrap());

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.tag, DataTag::AppListRequest);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn request_answered_with_installed_apps() {
        let (sync, _icons, mut rx) = make_sync();
        let from = Uuid::new_v4();

        sync.handle_request(from, now_millis()).await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.tag, DataTag::AppListResponse);
        match serde_json::from_slice(&frame.body).unwrap() {
            AppListMessage::Response { apps, .. } => {
                assert_eq!(apps.len(), 1);
                assert_eq!(apps[0].package_name, "com.example.music");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_records_icon_authority() {
        let (sync, icons, _rx) = make_sync();
        let peer = Uuid::new_v4();

        sync.handle_response(
            peer,
            vec![AppEntry {
                package_name: "com.peer.app".to_string(),
                label: "Peer App".to_string(),
            }],
        );

        assert_eq!(icons.authority_for("com.peer.app"), Some(peer));
        let remembered = sync.apps_of(&peer);
        assert_eq!(remembered.len(), 1);
        assert_eq!(remembered[0].label, "Peer App");
    }

    #[tokio::test]
    async fn response_is_idempotent() {
        let (sync, _icons, _rx) = make_sync();
        let peer = Uuid::new_v4();
        let apps = vec![AppEntry {
            package_name: "com.peer.app".to_string(),
            label: "Peer App".to_string(),
        }];

        sync.handle_response(peer, apps.clone());
        sync.handle_response(peer, apps);
        assert_eq!(sync.apps_of(&peer).len(), 1);
    }
}
