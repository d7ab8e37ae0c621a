//! UDP heartbeat discovery
//!
//! Every device broadcasts a heartbeat datagram on a fixed port and listens
//! on the same port for everyone else's. The scanning strategy adapts to the
//! network: on peer-to-peer links where broadcast is unreliable, heartbeats
//! are additionally unicast across the small set of address ranges such
//! links hand out, and to the last known address of every trusted peer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use crate::conn::ConnectionManager;
use crate::protocol::constants::PEER_LINK_SCAN_PREFIXES;
use crate::protocol::wire::Heartbeat;
use crate::{Config, DeviceIdentity, Error, Result};

/// How the active network behaves for discovery purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    /// Ordinary LAN, broadcast works.
    Regular,
    /// Phone hotspot: broadcast works but the address range differs.
    Hotspot,
    /// Direct peer-to-peer link, broadcast may be unreliable.
    PeerLink,
}

/// Platform hook that inspects the active network. The engine only depends
/// on this trait, never on how the answer is obtained.
pub trait NetworkClassifier: Send + Sync {
    fn classify(&self) -> NetworkClass;
    fn local_ip(&self) -> Option<IpAddr>;
}

/// Default classifier: derives the network class from the local interface
/// addresses.
pub struct IfAddrClassifier;

impl NetworkClassifier for IfAddrClassifier {
    fn classify(&self) -> NetworkClass {
        classify_addresses(&get_local_ips())
    }

    fn local_ip(&self) -> Option<IpAddr> {
        get_local_ips().into_iter().find(|ip| ip.is_ipv4())
    }
}

fn classify_addresses(ips: &[IpAddr]) -> NetworkClass {
    let v4: Vec<Ipv4Addr> = ips
        .iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .collect();

    if v4.iter().any(|ip| ip.octets()[..3] == [192, 168, 49]) {
        return NetworkClass::PeerLink;
    }
    if v4
        .iter()
        .any(|ip| ip.octets()[..3] == [192, 168, 43] || ip.octets()[..3] == [172, 20, 10])
    {
        return NetworkClass::Hotspot;
    }
    NetworkClass::Regular
}

/// Local non-loopback addresses.
pub fn get_local_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();
    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            if !iface.is_loopback() {
                ips.push(iface.ip());
            }
        }
    }
    ips
}

/// Periodic heartbeat broadcaster plus the listener that feeds peer
/// heartbeats into the connection manager.
pub struct DiscoveryEngine {
    config: Config,
    identity: Arc<DeviceIdentity>,
    manager: Arc<ConnectionManager>,
    classifier: Arc<dyn NetworkClassifier>,
    battery: RwLock<(u8, bool)>,
    bound_port: AtomicU16,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl DiscoveryEngine {
    pub fn new(
        config: Config,
        identity: Arc<DeviceIdentity>,
        manager: Arc<ConnectionManager>,
        classifier: Arc<dyn NetworkClassifier>,
    ) -> Self {
        Self {
            config,
            identity,
            manager,
            classifier,
            battery: RwLock::new((100, false)),
            bound_port: AtomicU16::new(0),
            stop_tx: Mutex::new(None),
        }
    }

    /// Battery status advertised in subsequent heartbeats; fed by whatever
    /// platform integration knows it.
    pub async fn set_battery(&self, level: u8, charging: bool) {
        *self.battery.write().await = (level.min(100), charging);
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Relaxed)
    }

    async fn heartbeat(&self) -> Heartbeat {
        let (battery_level, charging) = *self.battery.read().await;
        Heartbeat {
            uuid: self.identity.uuid,
            display_name: self.identity.name.clone(),
            tcp_port: self.manager.listen_port(),
            battery_level,
            charging,
            device_type: self.identity.device_type.clone(),
        }
    }

    /// Bind the discovery socket and spawn the broadcast and listener loops.
    ///
    /// A bind failure on the discovery port disables discovery entirely for
    /// this device, so it is logged distinctly before returning the error.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let bind_addr: SocketAddr = ([0, 0, 0, 0], self.config.discovery_port).into();
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!(
                    port = self.config.discovery_port,
                    error = %e,
                    "FATAL: discovery port bind failed, this device is not discoverable"
                );
                return Err(Error::Discovery(format!(
                    "failed to bind discovery port {}: {e}",
                    self.config.discovery_port
                )));
            }
        };
        socket
            .set_broadcast(true)
            .map_err(|e| Error::Discovery(format!("failed to enable broadcast: {e}")))?;
        let socket = Arc::new(socket);
        if let Ok(addr) = socket.local_addr() {
            self.bound_port.store(addr.port(), Ordering::Relaxed);
        }

        // A new discovery cycle: heartbeated membership must be re-earned.
        self.manager.presence().begin_cycle().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().await = Some(stop_tx);

        let engine = self.clone();
        let listen_socket = socket.clone();
        let mut listen_stop = stop_rx.clone();
        tokio::spawn(async move {
            engine.run_listener(listen_socket, &mut listen_stop).await;
        });

        let engine = self.clone();
        let mut broadcast_stop = stop_rx;
        tokio::spawn(async move {
            engine.run_broadcast(socket, &mut broadcast_stop).await;
        });

        tracing::info!(port = self.bound_port(), "discovery started");
        Ok(())
    }

    /// Cooperative stop: flip the flag and let in-flight receives drain.
    pub async fn stop(&self) {
        if let Some(stop) = self.stop_tx.lock().await.take() {
            let _ = stop.send(true);
        }
    }

    async fn run_listener(&self, socket: Arc<UdpSocket>, stop: &mut watch::Receiver<bool>) {
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    tracing::debug!("discovery listener stopping");
                    break;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                            tracing::debug!(%from, "non-utf8 datagram dropped");
                            continue;
                        };
                        match Heartbeat::decode(text) {
                            Ok(hb) if hb.uuid == self.identity.uuid => {}
                            Ok(hb) => {
                                self.manager.observe_heartbeat(hb, from.ip()).await;
                            }
                            Err(e) => {
                                tracing::debug!(%from, error = %e, "malformed heartbeat dropped");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "discovery receive error");
                    }
                }
            }
        }
    }

    async fn run_broadcast(&self, socket: Arc<UdpSocket>, stop: &mut watch::Receiver<bool>) {
        let mut tick: u32 = 0;
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    tracing::debug!("discovery broadcast stopping");
                    break;
                }
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                    self.broadcast_once(&socket, tick).await;
                    tick = tick.wrapping_add(1);
                }
            }
        }
    }

    async fn broadcast_once(&self, socket: &UdpSocket, tick: u32) {
        let datagram = self.heartbeat().await.encode();
        let port = self.config.discovery_port;
        let class = self.classifier.classify();

        let broadcast: SocketAddr = (Ipv4Addr::BROADCAST, port).into();
        if let Err(e) = socket.send_to(datagram.as_bytes(), broadcast).await {
            tracing::debug!(error = %e, "broadcast send failed");
        }

        match class {
            NetworkClass::Regular => {}
            NetworkClass::Hotspot => {
                // Hotspot ranges sometimes filter the global broadcast
                // address; hit the directed one too.
                for prefix in [[192u8, 168, 43], [172, 20, 10]] {
                    let directed: SocketAddr =
                        (Ipv4Addr::new(prefix[0], prefix[1], prefix[2], 255), port).into();
                    let _ = socket.send_to(datagram.as_bytes(), directed).await;
                }
            }
            NetworkClass::PeerLink => {
                // Unicast to every trusted peer's last address each tick,
                // and sweep the known peer-link ranges every fifth tick.
                for auth in self.manager.trust().accepted().await {
                    let target = SocketAddr::new(auth.last_ip, port);
                    let _ = socket.send_to(datagram.as_bytes(), target).await;
                }
                if tick % 5 == 0 {
                    self.unicast_sweep(socket, &datagram, port).await;
                }
            }
        }

        // Heartbeat over TCP keeps established sessions marked live even
        // where UDP never arrives.
        self.manager.broadcast_heartbeat_line().await;
    }

    async fn unicast_sweep(&self, socket: &UdpSocket, datagram: &str, port: u16) {
        for prefix in PEER_LINK_SCAN_PREFIXES {
            for host in 1..255u8 {
                let target: SocketAddr =
                    (Ipv4Addr::new(prefix[0], prefix[1], prefix[2], host), port).into();
                if let Err(e) = socket.send_to(datagram.as_bytes(), target).await {
                    tracing::trace!(%target, error = %e, "unicast heartbeat failed");
                }
            }
        }
    }

    /// React to a network change: recompute the local address, restart the
    /// discovery loops, then re-attempt every trusted peer with spacing so
    /// the new network is not flooded. Peer-link networks get a delayed
    /// second pass.
    pub async fn network_changed(self: &Arc<Self>) {
        let local_ip = self.classifier.local_ip();
        let class = self.classifier.classify();
        tracing::info!(?local_ip, ?class, "network changed, restarting discovery");

        self.stop().await;
        if let Err(e) = self.start().await {
            tracing::error!(error = %e, "discovery restart failed");
            return;
        }

        if local_ip.is_none() {
            tracing::info!("no viable network, skipping reconnect sweep");
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.reconnect_sweep().await;
            if class == NetworkClass::PeerLink {
                tokio::time::sleep(engine.config.peer_link_retry_delay).await;
                engine.reconnect_sweep().await;
            }
        });
    }

    async fn reconnect_sweep(&self) {
        for auth in self.manager.trust().accepted().await {
            self.manager.connect_by_auth(&auth).await;
            tokio::time::sleep(self.config.reconnect_spacing).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceCache;
    use crate::protocol::wire::DeviceType;
    use crate::trust::TrustStore;
    use tokio::sync::mpsc;

    #[test]
    fn classification_from_addresses() {
        let regular = vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))];
        assert_eq!(classify_addresses(&regular), NetworkClass::Regular);

        let hotspot = vec![IpAddr::V4(Ipv4Addr::new(192, 168, 43, 2))];
        assert_eq!(classify_addresses(&hotspot), NetworkClass::Hotspot);

        let iphone_hotspot = vec![IpAddr::V4(Ipv4Addr::new(172, 20, 10, 3))];
        assert_eq!(classify_addresses(&iphone_hotspot), NetworkClass::Hotspot);

        let peer_link = vec![
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1)),
        ];
        assert_eq!(classify_addresses(&peer_link), NetworkClass::PeerLink);

        assert_eq!(classify_addresses(&[]), NetworkClass::Regular);
    }

    struct FixedClassifier(NetworkClass);

    impl NetworkClassifier for FixedClassifier {
        fn classify(&self) -> NetworkClass {
            self.0
        }
        fn local_ip(&self) -> Option<IpAddr> {
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
    }

    async fn make_engine(dir: &std::path::Path) -> (Arc<DiscoveryEngine>, Arc<ConnectionManager>) {
        let config = Config {
            discovery_port: 0, // ephemeral, tests deliver datagrams by unicast
            tcp_port: 0,
            data_dir: dir.to_path_buf(),
            ..Config::default()
        };
        let identity = Arc::new(DeviceIdentity::generate(
            "engine".to_string(),
            DeviceType::Pc,
        ));
        let trust = Arc::new(TrustStore::load(dir.join("trust.json")).await);
        let presence = Arc::new(PresenceCache::new());
        let (events_tx, _events_rx) = mpsc::channel(64);
        let manager = ConnectionManager::new(
            config.clone(),
            identity.clone(),
            trust,
            presence,
            events_tx,
        );
        let engine = Arc::new(DiscoveryEngine::new(
            config,
            identity,
            manager.clone(),
            Arc::new(FixedClassifier(NetworkClass::Regular)),
        ));
        (engine, manager)
    }

    #[tokio::test]
    async fn listener_ingests_unicast_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = make_engine(dir.path()).await;
        engine.start().await.unwrap();
        let port = engine.bound_port();
        assert_ne!(port, 0);

        let hb = Heartbeat {
            uuid: Uuid::new_v4(),
            display_name: "neighbor".to_string(),
            tcp_port: 1,
            battery_level: 64,
            charging: true,
            device_type: DeviceType::Phone,
        };
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(hb.encode().as_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();

        // The listener task ingests asynchronously.
        let mut seen = false;
        for _ in 0..50 {
            if manager.presence().get(&hb.uuid).await.is_some() {
                seen = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(seen, "heartbeat never reached the presence cache");

        let device = manager.presence().get(&hb.uuid).await.unwrap();
        assert_eq!(device.display_name, "neighbor");
        assert_eq!(device.battery_level, 64);
        assert!(device.charging);

        engine.stop().await;
    }

    #[tokio::test]
    async fn own_heartbeat_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = make_engine(dir.path()).await;
        engine.start().await.unwrap();
        let port = engine.bound_port();

        let own = engine.heartbeat().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(own.encode().as_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(manager.presence().get(&own.uuid).await.is_none());

        engine.stop().await;
    }

    #[tokio::test]
    async fn network_change_reconnects_trusted_peers_without_duplicates() {
        use crate::trust::AuthInfo;

        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (engine_b, manager_b) = make_engine(dir_b.path()).await;
        let (_engine_a, manager_a) = make_engine(dir_a.path()).await;

        let a_port = manager_a.start().await.unwrap();
        manager_b.start().await.unwrap();

        let secret = crate::crypto::SharedSecret::from_bytes([2u8; 32]);
        let a_uuid = manager_a.device_id();
        manager_a
            .trust()
            .upsert(AuthInfo {
                uuid: manager_b.device_id(),
                display_name: "b".to_string(),
                shared_secret: secret.clone(),
                last_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                last_port: manager_b.listen_port(),
                device_type: DeviceType::Pc,
                is_accepted: true,
            })
            .await
            .unwrap();
        manager_b
            .trust()
            .upsert(AuthInfo {
                uuid: a_uuid,
                display_name: "a".to_string(),
                shared_secret: secret,
                last_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                last_port: a_port,
                device_type: DeviceType::Pc,
                is_accepted: true,
            })
            .await
            .unwrap();

        engine_b.network_changed().await;

        let mut connected = false;
        for _ in 0..150 {
            if manager_b.has_session(&a_uuid).await {
                connected = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(connected, "reconnect sweep never re-established the session");

        // The re-auth refreshed the record in place, no duplicates.
        assert_eq!(manager_b.trust().len().await, 1);

        engine_b.stop().await;
        manager_a.stop().await;
        manager_b.stop().await;
    }

    #[tokio::test]
    async fn malformed_datagram_does_not_kill_listener() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = make_engine(dir.path()).await;
        engine.start().await.unwrap();
        let port = engine.bound_port();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"garbage", ("127.0.0.1", port)).await.unwrap();
        sender
            .send_to(&[0xff, 0xfe, 0x00], ("127.0.0.1", port))
            .await
            .unwrap();

        // A valid heartbeat after the garbage still lands.
        let hb = Heartbeat {
            uuid: Uuid::new_v4(),
            display_name: "survivor".to_string(),
            tcp_port: 1,
            battery_level: 10,
            charging: false,
            device_type: DeviceType::Tv,
        };
        sender
            .send_to(hb.encode().as_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if manager.presence().get(&hb.uuid).await.is_some() {
                seen = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(seen);

        engine.stop().await;
    }
}
