//! Ephemeral device presence
//!
//! Rebuilt from heartbeats at runtime, never persisted. A peer is online
//! when it is accepted, was seen within the timeout, and has been
//! heartbeated in the current discovery cycle.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{DeviceType, Heartbeat};

/// Snapshot of a reachable peer, rebuilt from its latest heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub uuid: Uuid,
    pub display_name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub battery_level: u8,
    pub charging: bool,
    pub device_type: DeviceType,
}

impl DeviceInfo {
    pub fn from_heartbeat(hb: &Heartbeat, ip: IpAddr) -> Self {
        Self {
            uuid: hb.uuid,
            display_name: hb.display_name.clone(),
            ip,
            port: hb.tcp_port,
            battery_level: hb.battery_level,
            charging: hb.charging,
            device_type: hb.device_type.clone(),
        }
    }
}

struct PresenceEntry {
    device: DeviceInfo,
    last_seen: Instant,
}

/// In-memory presence cache plus the per-cycle heartbeated set.
pub struct PresenceCache {
    entries: RwLock<HashMap<Uuid, PresenceEntry>>,
    heartbeated: RwLock<HashSet<Uuid>>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            heartbeated: RwLock::new(HashSet::new()),
        }
    }

    /// Record a device snapshot. Returns true when the uuid was not present
    /// before (first sighting since startup or eviction).
    pub async fn observe(&self, device: DeviceInfo) -> bool {
        let mut entries = self.entries.write().await;
        entries
            .insert(
                device.uuid,
                PresenceEntry {
                    device,
                    last_seen: Instant::now(),
                },
            )
            .is_none()
    }

    /// Refresh last-seen without new device data (any routed message counts
    /// as a liveness signal). Returns false for unknown uuids.
    pub async fn touch(&self, uuid: &Uuid) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(uuid) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn mark_heartbeated(&self, uuid: Uuid) {
        self.heartbeated.write().await.insert(uuid);
    }

    pub async fn is_heartbeated(&self, uuid: &Uuid) -> bool {
        self.heartbeated.read().await.contains(uuid)
    }

    /// Start a fresh discovery cycle: membership in the heartbeated set must
    /// be re-earned by a live exchange, not remembered from a past cycle.
    pub async fn begin_cycle(&self) {
        self.heartbeated.write().await.clear();
    }

    pub async fn last_seen(&self, uuid: &Uuid) -> Option<Instant> {
        self.entries.read().await.get(uuid).map(|e| e.last_seen)
    }

    pub async fn seen_within(&self, uuid: &Uuid, timeout: Duration) -> bool {
        self.last_seen(uuid)
            .await
            .map(|t| t.elapsed() <= timeout)
            .unwrap_or(false)
    }

    /// Online means seen within the timeout and heartbeated this cycle.
    /// Acceptance is the trust store's call, checked by the caller.
    pub async fn online(&self, uuid: &Uuid, timeout: Duration) -> bool {
        self.seen_within(uuid, timeout).await && self.is_heartbeated(uuid).await
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<DeviceInfo> {
        self.entries.read().await.get(uuid).map(|e| e.device.clone())
    }

    pub async fn devices(&self) -> Vec<DeviceInfo> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.device.clone())
            .collect()
    }

    /// Drop entries not seen within the timeout; returns the evicted uuids.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<Uuid> {
        let mut entries = self.entries.write().await;
        let stale: Vec<Uuid> = entries
            .iter()
            .filter(|(_, e)| e.last_seen.elapsed() > timeout)
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in &stale {
            entries.remove(uuid);
        }
        if !stale.is_empty() {
            let mut heartbeated = self.heartbeated.write().await;
            for uuid in &stale {
                heartbeated.remove(uuid);
            }
        }
        stale
    }
}

impl Default for PresenceCache {
    fn default() -> Self {
        Self::new()
    }
}
