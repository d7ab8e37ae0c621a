//! Persisted per-peer trust records
//!
//! One `AuthInfo` per paired device, written to a JSON file so trust (and
//! the shared secret) survives restarts. Records are only ever removed by an
//! explicit forget; everything else is an upsert.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::crypto::SharedSecret;
use crate::protocol::DeviceType;
use crate::Result;

/// Persisted trust record for one paired peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    pub uuid: Uuid,
    pub display_name: String,
    pub shared_secret: SharedSecret,
    pub last_ip: IpAddr,
    pub last_port: u16,
    pub device_type: DeviceType,
    pub is_accepted: bool,
}

/// On-disk trust store, keyed by peer uuid.
pub struct TrustStore {
    path: PathBuf,
    records: RwLock<HashMap<Uuid, AuthInfo>>,
}

impl TrustStore {
    /// Load the store from disk. A missing file is an empty store; a corrupt
    /// file is logged and treated as empty rather than failing startup.
    pub async fn load(path: PathBuf) -> Self {
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<AuthInfo>>(&bytes) {
                Ok(list) => list.into_iter().map(|a| (a.uuid, a)).collect(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "trust store unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            records: RwLock::new(records),
        }
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<AuthInfo> {
        self.records.read().await.get(uuid).cloned()
    }

    pub async fn is_accepted(&self, uuid: &Uuid) -> bool {
        self.records
            .read()
            .await
            .get(uuid)
            .map(|a| a.is_accepted)
            .unwrap_or(false)
    }

    /// Insert or replace a record and persist.
    pub async fn upsert(&self, info: AuthInfo) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(info.uuid, info);
        self.persist(&records).await
    }

    /// Flip the acceptance flag. Returns false when the uuid is unknown.
    pub async fn set_accepted(&self, uuid: &Uuid, accepted: bool) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(uuid) {
            Some(info) => {
                info.is_accepted = accepted;
                self.persist(&records).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refresh the peer's advertised name, address and device class,
    /// persisting only when something actually changed. Returns whether a
    /// write happened.
    pub async fn update_endpoint(
        &self,
        uuid: &Uuid,
        display_name: &str,
        ip: IpAddr,
        port: u16,
        device_type: &DeviceType,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        let Some(info) = records.get_mut(uuid) else {
            return Ok(false);
        };
        let changed = info.display_name != display_name
            || info.last_ip != ip
            || info.last_port != port
            || info.device_type != *device_type;
        if changed {
            info.display_name = display_name.to_string();
            info.last_ip = ip;
            info.last_port = port;
            info.device_type = device_type.clone();
            self.persist(&records).await?;
        }
        Ok(changed)
    }

    /// Explicit forget. The only path that deletes a record.
    pub async fn remove(&self, uuid: &Uuid) -> Result<Option<AuthInfo>> {
        let mut records = self.records.write().await;
        let removed = records.remove(uuid);
        if removed.is_some() {
            self.persist(&records).await?;
        }
        Ok(removed)
    }

    pub async fn all(&self) -> Vec<AuthInfo> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn accepted(&self) -> Vec<AuthInfo> {
        self.records
            .read()
            .await
            .values()
            .filter(|a| a.is_accepted)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn persist(&self, records: &HashMap<Uuid, AuthInfo>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut list: Vec<&AuthInfo> = records.values().collect();
        list.sort_by_key(|a| a.uuid);
        let json = serde_json::to_vec_pretty(&list)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}
