//! High-level lanlink service that coordinates all components
//!
//! Constructed once at process start with an explicit lifecycle; every
//! shared map lives behind this object rather than in process-wide state.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::conn::{ConnEvent, ConnectOutcome, ConnectionManager, PeerState};
use crate::discovery::{DiscoveryEngine, IfAddrClassifier, NetworkClassifier};
use crate::presence::{DeviceInfo, PresenceCache};
use crate::protocol::now_millis;
use crate::protocol::wire::DataTag;
use crate::router::ProtocolRouter;
use crate::sync::{
    AppListSync, AppRegistry, EventSink, IconStore, IconSync, MemoryAppRegistry, MemoryIconStore,
    RelayDispatch,
};
use crate::trust::{AuthInfo, TrustStore};
use crate::{Config, DeviceIdentity, Error, Result};

/// Events emitted by the lanlink service.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// An unpaired device became discoverable.
    DeviceDiscovered(DeviceInfo),
    /// An authenticated session to a trusted device came up.
    DeviceOnline(DeviceInfo),
    /// A session closed or the device's presence expired.
    DeviceOffline(Uuid),
    /// An inbound pairing completed and awaits `approve_peer`.
    PairingRequest { uuid: Uuid, display_name: String },
    /// A pairing handshake established a new shared secret.
    Paired(DeviceInfo),
    Notification { from: Uuid, payload: Value },
    SuperIsland { from: Uuid, payload: Value },
    MediaPlay { from: Uuid, payload: Value },
    MediaControl { from: Uuid, payload: Value },
    Clipboard { from: Uuid, payload: Value },
    Status { from: Uuid, payload: Value },
    FileTransfer { from: Uuid, payload: Value },
    IconsUpdated { from: Uuid, packages: Vec<String> },
    AppListUpdated { from: Uuid, count: usize },
}

/// `EventSink` implementation that forwards payloads into the service's
/// event channel. Sink methods are synchronous, so a full channel drops the
/// event rather than blocking a session's read loop.
struct ChannelSink {
    tx: mpsc::Sender<LinkEvent>,
}

impl ChannelSink {
    fn push(&self, event: LinkEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("event channel full, payload event dropped");
        }
    }
}

impl EventSink for ChannelSink {
    fn notification(&self, from: Uuid, payload: Value) {
        self.push(LinkEvent::Notification { from, payload });
    }
    fn super_island(&self, from: Uuid, payload: Value) {
        self.push(LinkEvent::SuperIsland { from, payload });
    }
    fn media_play(&self, from: Uuid, payload: Value) {
        self.push(LinkEvent::MediaPlay { from, payload });
    }
    fn media_control(&self, from: Uuid, payload: Value) {
        self.push(LinkEvent::MediaControl { from, payload });
    }
    fn clipboard(&self, from: Uuid, payload: Value) {
        self.push(LinkEvent::Clipboard { from, payload });
    }
    fn status(&self, from: Uuid, payload: Value) {
        self.push(LinkEvent::Status { from, payload });
    }
    fn file_transfer(&self, from: Uuid, payload: Value) {
        self.push(LinkEvent::FileTransfer { from, payload });
    }
    fn icons_updated(&self, from: Uuid, packages: Vec<String>) {
        self.push(LinkEvent::IconsUpdated { from, packages });
    }
    fn app_list_updated(&self, from: Uuid, count: usize) {
        self.push(LinkEvent::AppListUpdated { from, count });
    }
}

struct ServiceInner {
    manager: Arc<ConnectionManager>,
    discovery: Arc<DiscoveryEngine>,
    icons: Arc<IconSync>,
    apps: Arc<AppListSync>,
}

/// Main lanlink service.
pub struct LanlinkService {
    config: Config,
    identity: Arc<DeviceIdentity>,
    classifier: Arc<dyn NetworkClassifier>,
    icon_store: Arc<dyn IconStore>,
    app_registry: Arc<dyn AppRegistry>,
    inner: Option<ServiceInner>,
}

impl LanlinkService {
    /// Create a service with the default config. Identity (uuid and signing
    /// key) persists under the data directory so peers keep recognizing this
    /// device across restarts.
    pub fn new(device_name: String, device_type: crate::protocol::DeviceType) -> Result<Self> {
        Self::with_config(device_name, device_type, Config::default())
    }

    pub fn with_config(
        device_name: String,
        device_type: crate::protocol::DeviceType,
        config: Config,
    ) -> Result<Self> {
        let identity = DeviceIdentity::load_or_generate(
            &config.data_dir.join("identity.json"),
            device_name,
            device_type,
        )?;
        Ok(Self {
            config,
            identity: Arc::new(identity),
            classifier: Arc::new(IfAddrClassifier),
            icon_store: Arc::new(MemoryIconStore::new()),
            app_registry: Arc::new(MemoryAppRegistry::new()),
            inner: None,
        })
    }

    /// Swap in a platform implementation before `start`.
    pub fn set_classifier(&mut self, classifier: Arc<dyn NetworkClassifier>) {
        self.classifier = classifier;
    }

    pub fn set_icon_store(&mut self, store: Arc<dyn IconStore>) {
        self.icon_store = store;
    }

    pub fn set_app_registry(&mut self, registry: Arc<dyn AppRegistry>) {
        self.app_registry = registry;
    }

    pub fn device_id(&self) -> Uuid {
        self.identity.uuid
    }

    pub fn device_name(&self) -> &str {
        &self.identity.name
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    /// Start all components and return the event channel.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<LinkEvent>> {
        let (event_tx, event_rx) = mpsc::channel(64);

        let trust =
            Arc::new(TrustStore::load(self.config.data_dir.join("trusted_devices.json")).await);
        let presence = Arc::new(PresenceCache::new());

        let (conn_tx, mut conn_rx) = mpsc::channel(64);
        let manager = ConnectionManager::new(
            self.config.clone(),
            self.identity.clone(),
            trust.clone(),
            presence,
            conn_tx,
        );

        let sink: Arc<dyn EventSink> = Arc::new(ChannelSink {
            tx: event_tx.clone(),
        });
        let icons = Arc::new(IconSync::new(
            self.icon_store.clone(),
            self.app_registry.clone(),
            sink.clone(),
            manager.outbound_sender(),
        ));
        let apps = Arc::new(AppListSync::new(
            self.app_registry.clone(),
            icons.clone(),
            sink.clone(),
            manager.outbound_sender(),
        ));
        let relay = Arc::new(RelayDispatch::new(sink));
        manager.set_router(Arc::new(ProtocolRouter::new(
            trust,
            icons.clone(),
            apps.clone(),
            relay,
        )));

        let port = manager.start().await?;

        let discovery = Arc::new(DiscoveryEngine::new(
            self.config.clone(),
            self.identity.clone(),
            manager.clone(),
            self.classifier.clone(),
        ));
        // Losing the discovery port disables finding peers, but the session
        // side keeps serving already-known ones.
        if let Err(e) = discovery.start().await {
            tracing::error!(error = %e, "running without discovery");
        }

        tokio::spawn(async move {
            while let Some(event) = conn_rx.recv().await {
                let forwarded = match event {
                    ConnEvent::Discovered(device) => vec![LinkEvent::DeviceDiscovered(device)],
                    ConnEvent::SessionEstablished {
                        device,
                        newly_paired,
                    } => {
                        let mut events = Vec::new();
                        if newly_paired {
                            events.push(LinkEvent::Paired(device.clone()));
                        }
                        events.push(LinkEvent::DeviceOnline(device));
                        events
                    }
                    ConnEvent::PairingPending { uuid, display_name } => {
                        vec![LinkEvent::PairingRequest { uuid, display_name }]
                    }
                    ConnEvent::SessionClosed { uuid } | ConnEvent::Lost(uuid) => {
                        vec![LinkEvent::DeviceOffline(uuid)]
                    }
                };
                for event in forwarded {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        self.inner = Some(ServiceInner {
            manager,
            discovery,
            icons,
            apps,
        });
        tracing::info!(port, "lanlink service started");
        Ok(event_rx)
    }

    pub async fn stop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.discovery.stop().await;
            inner.manager.stop().await;
        }
    }

    fn inner(&self) -> Result<&ServiceInner> {
        self.inner.as_ref().ok_or(Error::NotRunning)
    }

    /// Accept a pending pairing; the peer becomes trusted and routable.
    pub async fn approve_peer(&self, uuid: Uuid) -> Result<()> {
        let inner = self.inner()?;
        if !inner.manager.trust().set_accepted(&uuid, true).await? {
            return Err(Error::NotTrusted(uuid));
        }
        Ok(())
    }

    /// Explicitly unpair: drop the trust record and any live session.
    pub async fn forget_device(&self, uuid: Uuid) -> Result<()> {
        let inner = self.inner()?;
        inner.manager.trust().remove(&uuid).await?;
        inner.manager.disconnect(&uuid).await;
        Ok(())
    }

    /// Pair with a device currently visible in the presence cache.
    pub async fn pair_with(&self, uuid: Uuid) -> Result<ConnectOutcome> {
        let inner = self.inner()?;
        let device = inner
            .manager
            .presence()
            .get(&uuid)
            .await
            .ok_or_else(|| Error::Discovery("device is not currently discovered".to_string()))?;
        Ok(inner.manager.connect_to_device(&device).await)
    }

    pub async fn peer_state(&self, uuid: Uuid) -> Result<PeerState> {
        Ok(self.inner()?.manager.peer_state(&uuid).await)
    }

    pub async fn online_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.inner()?.manager.online_devices().await)
    }

    /// Devices visible on the network but not (yet) trusted; what a pairing
    /// UI would list.
    pub async fn discoverable_devices(&self) -> Result<Vec<DeviceInfo>> {
        let inner = self.inner()?;
        let mut devices = Vec::new();
        for device in inner.manager.presence().devices().await {
            if !inner.manager.trust().is_accepted(&device.uuid).await {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    /// Peers that completed pairing but were not approved yet.
    pub async fn pending_peers(&self) -> Result<Vec<AuthInfo>> {
        let inner = self.inner()?;
        Ok(inner
            .manager
            .trust()
            .all()
            .await
            .into_iter()
            .filter(|a| !a.is_accepted)
            .collect())
    }

    /// Report a platform network change.
    pub async fn network_changed(&self) -> Result<()> {
        self.inner()?.discovery.network_changed().await;
        Ok(())
    }

    pub async fn set_battery(&self, level: u8, charging: bool) -> Result<()> {
        self.inner()?.discovery.set_battery(level, charging).await;
        Ok(())
    }

    async fn send_relay(&self, to: Uuid, tag: DataTag, mut payload: Value) -> Result<()> {
        if let Some(object) = payload.as_object_mut() {
            object
                .entry("time")
                .or_insert_with(|| Value::from(now_millis()));
        }
        let body = serde_json::to_vec(&payload)?;
        self.inner()?.manager.send_data(&to, tag, &body).await
    }

    pub async fn send_notification(&self, to: Uuid, payload: Value) -> Result<()> {
        self.send_relay(to, DataTag::Notification, payload).await
    }

    pub async fn send_clipboard(&self, to: Uuid, payload: Value) -> Result<()> {
        self.send_relay(to, DataTag::Clipboard, payload).await
    }

    pub async fn send_media_control(&self, to: Uuid, payload: Value) -> Result<()> {
        self.send_relay(to, DataTag::MediaControl, payload).await
    }

    pub async fn send_status(&self, to: Uuid, payload: Value) -> Result<()> {
        self.send_relay(to, DataTag::Status, payload).await
    }

    /// Request one icon from its authoritative source, if known.
    pub async fn request_icon(&self, package: &str) -> Result<bool> {
        self.inner()?.icons.request_icon(package).await
    }

    /// Batch-request icons from a specific peer; returns what was actually
    /// requested after pre-filtering.
    pub async fn request_icons_from(&self, peer: Uuid, packages: &[String]) -> Result<Vec<String>> {
        self.inner()?.icons.request_icons_from(peer, packages).await
    }

    pub async fn request_app_list(&self, peer: Uuid) -> Result<bool> {
        self.inner()?.apps.request_from(peer).await
    }

    /// The last app list a peer reported.
    pub async fn apps_of(&self, peer: Uuid) -> Result<Vec<crate::protocol::AppEntry>> {
        Ok(self.inner()?.apps.apps_of(&peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceType;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            discovery_port: 0,
            tcp_port: 0,
            data_dir: dir.to_path_buf(),
            auto_accept: true,
            ..Config::default()
        }
    }

    async fn recv_until<F>(rx: &mut mpsc::Receiver<LinkEvent>, mut pred: F) -> Option<LinkEvent>
    where
        F: FnMut(&LinkEvent) -> bool,
    {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(event)) if pred(&event) => return Some(event),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn identity_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let service =
            LanlinkService::with_config("desk".to_string(), DeviceType::Pc, config.clone())
                .unwrap();
        let first_id = service.device_id();
        drop(service);

        let service =
            LanlinkService::with_config("desk-renamed".to_string(), DeviceType::Pc, config)
                .unwrap();
        assert_eq!(service.device_id(), first_id);
        assert_eq!(service.device_name(), "desk-renamed");
    }

    #[tokio::test]
    async fn not_running_errors() {
        let dir = tempfile::tempdir().unwrap();
        let service = LanlinkService::with_config(
            "idle".to_string(),
            DeviceType::Pc,
            test_config(dir.path()),
        )
        .unwrap();
        assert!(matches!(
            service.approve_peer(Uuid::new_v4()).await,
            Err(Error::NotRunning)
        ));
    }

    #[tokio::test]
    async fn two_services_pair_and_relay_over_loopback() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let mut a = LanlinkService::with_config(
            "alpha".to_string(),
            DeviceType::Pc,
            test_config(dir_a.path()),
        )
        .unwrap();
        let mut b = LanlinkService::with_config(
            "beta".to_string(),
            DeviceType::Phone,
            test_config(dir_b.path()),
        )
        .unwrap();

        let mut a_rx = a.start().await.unwrap();
        let mut b_rx = b.start().await.unwrap();

        // Hand b's presence cache a's coordinates the way a heartbeat would.
        let a_inner = a.inner.as_ref().unwrap();
        let b_inner = b.inner.as_ref().unwrap();
        let a_device = DeviceInfo {
            uuid: a.device_id(),
            display_name: "alpha".to_string(),
            ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: a_inner.manager.listen_port(),
            battery_level: 0,
            charging: false,
            device_type: DeviceType::Pc,
        };
        b_inner.manager.presence().observe(a_device).await;

        assert_eq!(
            b.pair_with(a.device_id()).await.unwrap(),
            ConnectOutcome::Connected
        );

        assert!(
            recv_until(&mut b_rx, |e| matches!(e, LinkEvent::DeviceOnline(_)))
                .await
                .is_some()
        );
        assert!(
            recv_until(&mut a_rx, |e| matches!(e, LinkEvent::DeviceOnline(_)))
                .await
                .is_some()
        );

        // b relays a notification to a.
        b.send_notification(
            a.device_id(),
            serde_json::json!({"title": "ping", "text": "from beta"}),
        )
        .await
        .unwrap();

        let event = recv_until(&mut a_rx, |e| matches!(e, LinkEvent::Notification { .. }))
            .await
            .unwrap();
        match event {
            LinkEvent::Notification { from, payload } => {
                assert_eq!(from, b.device_id());
                assert_eq!(payload["title"], "ping");
                assert!(payload["time"].as_u64().unwrap() > 0);
            }
            _ => unreachable!(),
        }

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn icon_sync_end_to_end() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        // alpha hosts an app and its icon.
        let a_store = Arc::new(MemoryIconStore::new());
        a_store.put("com.example.camera", b"camera-icon");
        let a_registry = Arc::new(MemoryAppRegistry::new());
        a_registry.add("com.example.camera", "Camera");

        let mut a = LanlinkService::with_config(
            "alpha".to_string(),
            DeviceType::Phone,
            test_config(dir_a.path()),
        )
        .unwrap();
        a.set_icon_store(a_store);
        a.set_app_registry(a_registry);

        let mut b = LanlinkService::with_config(
            "beta".to_string(),
            DeviceType::Pc,
            test_config(dir_b.path()),
        )
        .unwrap();
        let b_store = Arc::new(MemoryIconStore::new());
        b.set_icon_store(b_store.clone());

        let _a_rx = a.start().await.unwrap();
        let mut b_rx = b.start().await.unwrap();

        let a_inner = a.inner.as_ref().unwrap();
        let b_inner = b.inner.as_ref().unwrap();
        b_inner
            .manager
            .presence()
            .observe(DeviceInfo {
                uuid: a.device_id(),
                display_name: "alpha".to_string(),
                ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                port: a_inner.manager.listen_port(),
                battery_level: 0,
                charging: false,
                device_type: DeviceType::Phone,
            })
            .await;
        b.pair_with(a.device_id()).await.unwrap();
        recv_until(&mut b_rx, |e| matches!(e, LinkEvent::DeviceOnline(_)))
            .await
            .unwrap();

        // beta learns alpha's app list, then requests the icon it now knows
        // alpha owns.
        assert!(b.request_app_list(a.device_id()).await.unwrap());
        recv_until(&mut b_rx, |e| matches!(e, LinkEvent::AppListUpdated { .. }))
            .await
            .unwrap();

        assert!(b.request_icon("com.example.camera").await.unwrap());
        let event = recv_until(&mut b_rx, |e| matches!(e, LinkEvent::IconsUpdated { .. }))
            .await
            .unwrap();
        match event {
            LinkEvent::IconsUpdated { from, packages } => {
                assert_eq!(from, a.device_id());
                assert_eq!(packages, vec!["com.example.camera"]);
            }
            _ => unreachable!(),
        }
        assert_eq!(
            b_store.get("com.example.camera").unwrap(),
            b"camera-icon".to_vec()
        );

        a.stop().await;
        b.stop().await;
    }
}
