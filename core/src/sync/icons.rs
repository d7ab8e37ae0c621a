//! Icon sync
//!
//! Requests application icons from the peer that is authoritative for them
//! (the device the app actually runs on) and answers the mirror-image
//! requests from peers. Requests are deduplicated within a window and batch
//! requests are pre-filtered down to the minimal necessary set before
//! anything touches the network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::conn::OutboundData;
use crate::protocol::constants::{ICON_REQUEST_WINDOW, PAYLOAD_STALENESS};
use crate::protocol::wire::DataTag;
use crate::protocol::{now_millis, IconEntry, IconMessage};
use crate::sync::relay::EventSink;
use crate::sync::AppRegistry;
use crate::Result;

/// Local icon cache. The decode/render side of icons lives outside the
/// core; this store only moves opaque bytes.
pub trait IconStore: Send + Sync {
    fn get(&self, package: &str) -> Option<Vec<u8>>;
    /// Pure upsert keyed by package name.
    fn put(&self, package: &str, data: &[u8]);
    fn contains(&self, package: &str) -> bool;
}

/// In-memory icon store used by tests and the CLI.
#[derive(Default)]
pub struct MemoryIconStore {
    icons: std::sync::RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryIconStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IconStore for MemoryIconStore {
    fn get(&self, package: &str) -> Option<Vec<u8>> {
        self.icons.read().expect("icon store lock").get(package).cloned()
    }

    fn put(&self, package: &str, data: &[u8]) {
        self.icons
            .write()
            .expect("icon store lock")
            .insert(package.to_string(), data.to_vec());
    }

    fn contains(&self, package: &str) -> bool {
        self.icons.read().expect("icon store lock").contains_key(package)
    }
}

struct IconSyncState {
    /// package -> when a request went out; repeats inside the window are
    /// suppressed.
    in_flight: HashMap<String, Instant>,
    /// package -> peer that last supplied data for it.
    authority: HashMap<String, Uuid>,
    /// Packages a peer definitively reported as missing.
    known_missing: HashSet<String>,
}

pub struct IconSync {
    store: Arc<dyn IconStore>,
    registry: Arc<dyn AppRegistry>,
    sink: Arc<dyn EventSink>,
    outbound: mpsc::Sender<OutboundData>,
    state: Mutex<IconSyncState>,
    request_window: Duration,
}

impl IconSync {
    pub fn new(
        store: Arc<dyn IconStore>,
        registry: Arc<dyn AppRegistry>,
        sink: Arc<dyn EventSink>,
        outbound: mpsc::Sender<OutboundData>,
    ) -> Self {
        Self {
            store,
            registry,
            sink,
            outbound,
            state: Mutex::new(IconSyncState {
                in_flight: HashMap::new(),
                authority: HashMap::new(),
                known_missing: HashSet::new(),
            }),
            request_window: ICON_REQUEST_WINDOW,
        }
    }

    /// The peer that last supplied data for a package, if any.
    pub fn authority_for(&self, package: &str) -> Option<Uuid> {
        self.state
            .lock()
            .expect("icon sync lock")
            .authority
            .get(package)
            .copied()
    }

    /// Remember which peer owns a set of packages (fed by app-list sync).
    pub fn record_authority(&self, peer: Uuid, packages: impl IntoIterator<Item = String>) {
        let mut state = self.state.lock().expect("icon sync lock");
        for package in packages {
            state.authority.insert(package, peer);
        }
    }

    /// Request one icon from whichever peer is authoritative for it.
    /// Returns false without sending when the icon is not needed, already
    /// in flight, or has no known source yet.
    pub async fn request_icon(&self, package: &str) -> Result<bool> {
        let target = {
            let mut state = self.state.lock().expect("icon sync lock");
            if !needed(&*self.store, &*self.registry, &state, package, self.request_window) {
                return Ok(false);
            }
            let Some(target) = state.authority.get(package).copied() else {
                return Ok(false);
            };
            state.in_flight.insert(package.to_string(), Instant::now());
            target
        };

        let body = serde_json::to_vec(&IconMessage::Request {
            package_name: Some(package.to_string()),
            package_names: vec![],
            time: now_millis(),
        })?;
        self.queue(target, body).await;
        Ok(true)
    }

    /// Batch-request icons from a specific peer, collapsing the set to the
    /// packages actually needed first. Returns the packages requested; an
    /// empty result means nothing was sent.
    pub async fn request_icons_from(&self, peer: Uuid, packages: &[String]) -> Result<Vec<String>> {
        let wanted: Vec<String> = {
            let mut state = self.state.lock().expect("icon sync lock");
            let wanted: Vec<String> = packages
                .iter()
                .filter(|p| needed(&*self.store, &*self.registry, &state, p, self.request_window))
                .cloned()
                .collect();
            for package in &wanted {
                state.in_flight.insert(package.clone(), Instant::now());
            }
            wanted
        };

        if wanted.is_empty() {
            return Ok(vec![]);
        }

        let body = serde_json::to_vec(&IconMessage::Request {
            package_name: None,
            package_names: wanted.clone(),
            time: now_millis(),
        })?;
        self.queue(peer, body).await;
        Ok(wanted)
    }

    /// Answer a request: icons we have go in `icons`, the rest is
    /// definitively `missing`. Single and batch requests land here alike.
    pub async fn handle_request(
        &self,
        from: Uuid,
        package_name: Option<String>,
        package_names: Vec<String>,
        time: u64,
    ) {
        if is_stale(time) {
            tracing::debug!(peer = %from, "stale icon request dropped");
            return;
        }

        let mut seen = HashSet::new();
        let requested: Vec<String> = package_name
            .into_iter()
            .chain(package_names)
            .filter(|p| seen.insert(p.clone()))
            .collect();
        if requested.is_empty() {
            return;
        }

        let mut icons = Vec::new();
        let mut missing = Vec::new();
        for package in requested {
            match self.store.get(&package) {
                Some(data) => icons.push(IconEntry {
                    package_name: package,
                    icon_data: data,
                }),
                None => missing.push(package),
            }
        }

        tracing::debug!(peer = %from, found = icons.len(), missing = missing.len(), "answering icon request");
        let body = match serde_json::to_vec(&IconMessage::Response {
            icons,
            missing,
            time: now_millis(),
        }) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "icon response serialization failed");
                return;
            }
        };
        self.queue_response(from, body).await;
    }

    /// Apply a response. Upserting is idempotent: the same response twice
    /// leaves the cache exactly as once.
    pub fn handle_response(&self, from: Uuid, icons: Vec<IconEntry>, missing: Vec<String>) {
        let mut updated = Vec::with_capacity(icons.len());
        for entry in icons {
            self.store.put(&entry.package_name, &entry.icon_data);
            updated.push(entry.package_name);
        }

        {
            let mut state = self.state.lock().expect("icon sync lock");
            for package in &updated {
                state.authority.insert(package.clone(), from);
                state.in_flight.remove(package);
                state.known_missing.remove(package);
            }
            for package in &missing {
                state.in_flight.remove(package);
                state.known_missing.insert(package.clone());
            }
        }

        if !updated.is_empty() {
            self.sink.icons_updated(from, updated);
        }
    }

    async fn queue(&self, to: Uuid, body: Vec<u8>) {
        if self
            .outbound
            .send(OutboundData {
                to,
                tag: DataTag::IconRequest,
                body,
            })
            .await
            .is_err()
        {
            tracing::debug!("outbound queue closed, icon request dropped");
        }
    }

    async fn queue_response(&self, to: Uuid, body: Vec<u8>) {
        if self
            .outbound
            .send(OutboundData {
                to,
                tag: DataTag::IconResponse,
                body,
            })
            .await
            .is_err()
        {
            tracing::debug!("outbound queue closed, icon response dropped");
        }
    }
}

fn needed(
    store: &dyn IconStore,
    registry: &dyn AppRegistry,
    state: &IconSyncState,
    package: &str,
    window: Duration,
) -> bool {
    if store.contains(package) || registry.is_installed(package) {
        return false;
    }
    if state.known_missing.contains(package) {
        return false;
    }
    match state.in_flight.get(package) {
        Some(sent) => sent.elapsed() > window,
        None => true,
    }
}

fn is_stale(time: u64) -> bool {
    time > 0 && now_millis().saturating_sub(time) > PAYLOAD_STALENESS.as_millis() as u64
}
