//! Connection manager: handshake orchestration and session lifecycle
//!
//! Owns the trust store and presence cache on behalf of every other
//! component; discovery and the router go through the accessors here so the
//! two maps never diverge. Maintains at most one authenticated session per
//! peer, with a single-flight guard on outbound attempts and a
//! consecutive-failure circuit breaker reset by discovery sightings.

pub mod handshake;
pub mod session;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::presence::{DeviceInfo, PresenceCache};
use crate::protocol::constants::MAX_CONSECUTIVE_FAILURES;
use crate::protocol::wire::{encode_heartbeat_line, parse_line, DataLine, DataTag, Heartbeat, Line};
use crate::router::ProtocolRouter;
use crate::trust::{AuthInfo, TrustStore};
use crate::{Config, DeviceIdentity, Error, Result};

pub use handshake::HandshakeResult;
pub use session::SessionHandle;

/// Result of a connect attempt. Idempotent callers get told why nothing new
/// happened instead of a second handshake being raced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    InFlight,
    Failed(String),
}

/// Lifecycle position of a peer as seen by this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown,
    Discovered,
    Handshaking,
    Online,
    Silent,
}

/// Internal events surfaced to the service layer.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// An unknown or not-yet-accepted device appeared in the presence cache.
    Discovered(DeviceInfo),
    /// A handshake completed and the session is registered.
    SessionEstablished { device: DeviceInfo, newly_paired: bool },
    /// An inbound pairing finished but awaits local approval.
    PairingPending { uuid: Uuid, display_name: String },
    SessionClosed { uuid: Uuid },
    /// A stale presence entry was evicted.
    Lost(Uuid),
}

/// A data frame queued for encryption and transmission.
#[derive(Debug)]
pub struct OutboundData {
    pub to: Uuid,
    pub tag: DataTag,
    pub body: Vec<u8>,
}

struct SessionEntry {
    handle: SessionHandle,
    reader: JoinHandle<()>,
}

pub struct ConnectionManager {
    config: Config,
    identity: Arc<DeviceIdentity>,
    trust: Arc<TrustStore>,
    presence: Arc<PresenceCache>,
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    in_flight: Mutex<HashSet<Uuid>>,
    failures: Mutex<HashMap<Uuid, u32>>,
    router: OnceLock<Arc<ProtocolRouter>>,
    events: mpsc::Sender<ConnEvent>,
    outbound_tx: mpsc::Sender<OutboundData>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundData>>>,
    listen_port: AtomicU16,
    session_counter: AtomicU64,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl ConnectionManager {
    pub fn new(
        config: Config,
        identity: Arc<DeviceIdentity>,
        trust: Arc<TrustStore>,
        presence: Arc<PresenceCache>,
        events: mpsc::Sender<ConnEvent>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        Arc::new(Self {
            config,
            identity,
            trust,
            presence,
            sessions: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            router: OnceLock::new(),
            events,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            listen_port: AtomicU16::new(0),
            session_counter: AtomicU64::new(0),
            stop_tx: Mutex::new(None),
        })
    }

    /// Install the router after construction; the router needs the manager's
    /// outbound queue, so the two are wired in this order.
    pub fn set_router(&self, router: Arc<ProtocolRouter>) {
        let _ = self.router.set(router);
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn presence(&self) -> &Arc<PresenceCache> {
        &self.presence
    }

    /// Queue for components that emit data frames without holding the
    /// manager (sync protocol responders).
    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundData> {
        self.outbound_tx.clone()
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    pub fn device_id(&self) -> Uuid {
        self.identity.uuid
    }

    /// Bind the session listener and spawn the accept, reconnect and
    /// outbound-pump tasks. Returns the actual bound port.
    pub async fn start(self: &Arc<Self>) -> Result<u16> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.tcp_port).into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind session listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?
            .port();
        self.listen_port.store(port, Ordering::Relaxed);
        tracing::info!(port, "session listener bound");

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.stop_tx.lock().await = Some(stop_tx);

        let cm = self.clone();
        let mut accept_stop = stop_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_stop.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!(%addr, "incoming connection");
                            let cm = cm.clone();
                            tokio::spawn(async move {
                                if let Err(e) = cm.handle_inbound(stream, addr).await {
                                    tracing::debug!(%addr, error = %e, "inbound handshake failed");
                                }
                            });
                        }
                        Err(e) => tracing::error!(error = %e, "accept error"),
                    }
                }
            }
        });

        let cm = self.clone();
        let mut pump_stop = stop_rx.clone();
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Network("manager already started".to_string()))?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_stop.changed() => break,
                    frame = outbound_rx.recv() => match frame {
                        Some(OutboundData { to, tag, body }) => {
                            if let Err(e) = cm.send_data(&to, tag, &body).await {
                                tracing::debug!(peer = %to, error = %e, "outbound frame dropped");
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let cm = self.clone();
        let mut reconnect_stop = stop_rx;
        tokio::spawn(async move {
            let interval = cm.config.reconnect_interval;
            loop {
                tokio::select! {
                    _ = reconnect_stop.changed() => break,
                    _ = tokio::time::sleep(interval) => cm.reconnect_pass().await,
                }
            }
        });

        Ok(port)
    }

    pub async fn stop(&self) {
        if let Some(stop) = self.stop_tx.lock().await.take() {
            let _ = stop.send(true);
        }
        let mut sessions = self.sessions.write().await;
        for (_, entry) in sessions.drain() {
            entry.reader.abort();
        }
    }

    /// Attempt an authenticated session to a reachable device. Idempotent:
    /// an existing session or an attempt already in flight short-circuits.
    pub async fn connect_to_device(self: &Arc<Self>, target: &DeviceInfo) -> ConnectOutcome {
        if target.uuid == self.identity.uuid {
            return ConnectOutcome::Failed("refusing to connect to self".to_string());
        }
        {
            let mut in_flight = self.in_flight.lock().await;
            // Session existence is re-checked under the in-flight guard so a
            // caller racing a just-finished attempt cannot start a second
            // handshake.
            if self.sessions.read().await.contains_key(&target.uuid) {
                return ConnectOutcome::AlreadyConnected;
            }
            if !in_flight.insert(target.uuid) {
                return ConnectOutcome::InFlight;
            }
        }

        let attempt = tokio::time::timeout(self.config.connect_timeout, self.dial(target)).await;
        self.in_flight.lock().await.remove(&target.uuid);

        match attempt {
            Ok(Ok(())) => {
                self.failures.lock().await.remove(&target.uuid);
                ConnectOutcome::Connected
            }
            Ok(Err(e)) => {
                self.note_failure(&target.uuid).await;
                tracing::debug!(peer = %target.uuid, error = %e, "connect failed");
                ConnectOutcome::Failed(e.to_string())
            }
            Err(_) => {
                self.note_failure(&target.uuid).await;
                ConnectOutcome::Failed("connect timed out".to_string())
            }
        }
    }

    /// Connect using a trust record's last known endpoint.
    pub async fn connect_by_auth(self: &Arc<Self>, auth: &AuthInfo) -> ConnectOutcome {
        let target = DeviceInfo {
            uuid: auth.uuid,
            display_name: auth.display_name.clone(),
            ip: auth.last_ip,
            port: auth.last_port,
            battery_level: 0,
            charging: false,
            device_type: auth.device_type.clone(),
        };
        self.connect_to_device(&target).await
    }

    async fn dial(self: &Arc<Self>, target: &DeviceInfo) -> Result<()> {
        let stream = TcpStream::connect((target.ip, target.port))
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let peer_addr = stream.peer_addr().map_err(|e| Error::Network(e.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let known = self.trust.get(&target.uuid).await;
        let hs = handshake::initiate(
            &mut reader,
            &mut writer,
            &self.identity,
            self.listen_port(),
            known.as_ref(),
        )
        .await?;
        self.finish_handshake(hs, peer_addr, reader, writer, true).await
    }

    async fn handle_inbound(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;
        let hs = handshake::respond(
            &mut reader,
            &mut writer,
            &self.identity,
            self.listen_port(),
            &self.trust,
        )
        .await?;
        self.finish_handshake(hs, addr, reader, writer, false).await
    }

    /// Reconcile trust and presence after either handshake direction, then
    /// register the session.
    async fn finish_handshake(
        self: &Arc<Self>,
        hs: HandshakeResult,
        peer_addr: SocketAddr,
        reader: BufReader<OwnedReadHalf>,
        writer: tokio::net::tcp::OwnedWriteHalf,
        outbound: bool,
    ) -> Result<()> {
        let uuid = hs.peer_uuid;
        let existing = self.trust.get(&uuid).await;

        let accepted = if hs.newly_paired {
            // Re-pairing keeps the previous decision; a fresh pairing is
            // accepted when we initiated it (explicit local action) or when
            // the auto-accept policy is on.
            let accepted = existing
                .as_ref()
                .map(|e| e.is_accepted)
                .unwrap_or(outbound || self.config.auto_accept);
            self.trust
                .upsert(AuthInfo {
                    uuid,
                    display_name: hs.display_name.clone(),
                    shared_secret: hs.secret.clone(),
                    last_ip: peer_addr.ip(),
                    last_port: hs.tcp_port,
                    device_type: hs.device_type.clone(),
                    is_accepted: accepted,
                })
                .await?;
            if !accepted {
                let _ = self
                    .events
                    .send(ConnEvent::PairingPending {
                        uuid,
                        display_name: hs.display_name.clone(),
                    })
                    .await;
            }
            accepted
        } else {
            self.trust
                .update_endpoint(
                    &uuid,
                    &hs.display_name,
                    peer_addr.ip(),
                    hs.tcp_port,
                    &hs.device_type,
                )
                .await?;
            existing.map(|e| e.is_accepted).unwrap_or(false)
        };

        let device = DeviceInfo {
            uuid,
            display_name: hs.display_name.clone(),
            ip: peer_addr.ip(),
            port: hs.tcp_port,
            battery_level: 0,
            charging: false,
            device_type: hs.device_type.clone(),
        };
        if self.presence.get(&uuid).await.is_none() {
            self.presence.observe(device.clone()).await;
        } else {
            self.presence.touch(&uuid).await;
        }
        self.presence.mark_heartbeated(uuid).await;

        self.register_session(uuid, peer_addr, reader, writer).await;

        if accepted {
            let _ = self
                .events
                .send(ConnEvent::SessionEstablished {
                    device,
                    newly_paired: hs.newly_paired,
                })
                .await;
        }
        Ok(())
    }

    async fn register_session(
        self: &Arc<Self>,
        uuid: Uuid,
        peer_addr: SocketAddr,
        reader: BufReader<OwnedReadHalf>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    ) {
        let id = self.session_counter.fetch_add(1, Ordering::Relaxed);
        let handle = SessionHandle::new(uuid, peer_addr, writer, id);
        let cm = self.clone();
        let reader_task = tokio::spawn(async move {
            cm.read_loop(uuid, id, reader).await;
        });

        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.insert(
            uuid,
            SessionEntry {
                handle,
                reader: reader_task,
            },
        ) {
            // Newest session wins; a stale connection must not linger.
            tracing::debug!(peer = %uuid, "replacing stale session");
            old.reader.abort();
        }
    }

    async fn read_loop(self: Arc<Self>, uuid: Uuid, id: u64, mut reader: BufReader<OwnedReadHalf>) {
        loop {
            match session::read_wire_line(&mut reader).await {
                Ok(Some(line)) => self.handle_line(uuid, &line).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(peer = %uuid, error = %e, "session read error");
                    break;
                }
            }
        }
        self.session_closed(uuid, id).await;
    }

    async fn handle_line(self: &Arc<Self>, session_uuid: Uuid, raw: &str) {
        match parse_line(raw) {
            Ok(Line::Heartbeat { uuid }) if uuid == session_uuid => {
                self.refresh_presence(&uuid).await;
                self.presence.mark_heartbeated(uuid).await;
            }
            Ok(Line::Data(data)) => {
                if data.uuid != session_uuid {
                    tracing::warn!(
                        claimed = %data.uuid,
                        session = %session_uuid,
                        "data line uuid does not match session, dropped"
                    );
                    return;
                }
                self.refresh_presence(&session_uuid).await;
                if let Some(router) = self.router.get() {
                    router.handle_line(data).await;
                }
            }
            Ok(_) => {
                tracing::debug!(peer = %session_uuid, "ignoring non-data line mid-session");
            }
            Err(e) => {
                tracing::debug!(peer = %session_uuid, error = %e, "malformed line dropped");
            }
        }
    }

    /// Any routed message counts as liveness; if the entry was evicted,
    /// rebuild it from the trust record.
    async fn refresh_presence(&self, uuid: &Uuid) {
        if !self.presence.touch(uuid).await {
            if let Some(auth) = self.trust.get(uuid).await {
                self.presence
                    .observe(DeviceInfo {
                        uuid: auth.uuid,
                        display_name: auth.display_name,
                        ip: auth.last_ip,
                        port: auth.last_port,
                        battery_level: 0,
                        charging: false,
                        device_type: auth.device_type,
                    })
                    .await;
            }
        }
    }

    async fn session_closed(&self, uuid: Uuid, id: u64) {
        let mut sessions = self.sessions.write().await;
        let matches = sessions.get(&uuid).map(|e| e.handle.id == id).unwrap_or(false);
        if matches {
            sessions.remove(&uuid);
            drop(sessions);
            tracing::info!(peer = %uuid, "session closed");
            let _ = self.events.send(ConnEvent::SessionClosed { uuid }).await;
        }
    }

    pub async fn has_session(&self, uuid: &Uuid) -> bool {
        self.sessions.read().await.contains_key(uuid)
    }

    pub async fn disconnect(&self, uuid: &Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.remove(uuid) {
            entry.reader.abort();
        }
    }

    /// Ingest one heartbeat, applying the trust-dependent rules: accepted
    /// peers refresh presence and trigger a connect-back when no session
    /// exists; everyone else is only made discoverable.
    pub async fn observe_heartbeat(self: &Arc<Self>, hb: Heartbeat, from: IpAddr) {
        if hb.uuid == self.identity.uuid {
            return;
        }
        let device = DeviceInfo::from_heartbeat(&hb, from);

        match self.trust.get(&hb.uuid).await {
            Some(auth) if auth.is_accepted => {
                self.presence.observe(device.clone()).await;
                self.presence.mark_heartbeated(hb.uuid).await;
                // Seen alive again: the circuit breaker resets.
                self.failures.lock().await.remove(&hb.uuid);

                if let Err(e) = self
                    .trust
                    .update_endpoint(&hb.uuid, &hb.display_name, from, hb.tcp_port, &hb.device_type)
                    .await
                {
                    tracing::warn!(peer = %hb.uuid, error = %e, "trust record refresh failed");
                }

                if !self.has_session(&hb.uuid).await {
                    let cm = self.clone();
                    tokio::spawn(async move {
                        cm.connect_to_device(&device).await;
                    });
                }
            }
            _ => {
                // Discoverable but mute: presence only, never a connection
                // and never a trust mutation.
                if self.presence.observe(device.clone()).await {
                    let _ = self.events.send(ConnEvent::Discovered(device)).await;
                }
            }
        }
    }

    /// Seal and send one data frame on the peer's live session.
    pub async fn send_data(&self, to: &Uuid, tag: DataTag, body: &[u8]) -> Result<()> {
        let auth = self.trust.get(to).await.ok_or(Error::NotTrusted(*to))?;
        let sealed = auth.shared_secret.seal(body)?;
        let line = DataLine {
            tag,
            uuid: self.identity.uuid,
            payload: sealed,
        }
        .encode();

        let handle = self
            .sessions
            .read()
            .await
            .get(to)
            .map(|e| e.handle.clone())
            .ok_or(Error::NoSession(*to))?;
        handle.send_line(&line).await
    }

    /// Send a TCP heartbeat line on every live session.
    pub async fn broadcast_heartbeat_line(&self) {
        let line = encode_heartbeat_line(self.identity.uuid);
        let handles: Vec<SessionHandle> = self
            .sessions
            .read()
            .await
            .values()
            .map(|e| e.handle.clone())
            .collect();
        for handle in handles {
            if let Err(e) = handle.send_line(&line).await {
                tracing::debug!(peer = %handle.uuid, error = %e, "heartbeat line failed");
            }
        }
    }

    async fn note_failure(&self, uuid: &Uuid) {
        let mut failures = self.failures.lock().await;
        let count = failures.entry(*uuid).or_insert(0);
        *count += 1;
        if *count >= MAX_CONSECUTIVE_FAILURES {
            tracing::info!(peer = %uuid, failures = *count, "suppressing reconnects until peer is seen again");
        }
    }

    async fn failure_count(&self, uuid: &Uuid) -> u32 {
        self.failures.lock().await.get(uuid).copied().unwrap_or(0)
    }

    /// One pass of the periodic reconnect task: retry trusted peers without
    /// a session, skipping those past the failure cap, then evict stale
    /// presence entries.
    async fn reconnect_pass(self: &Arc<Self>) {
        for auth in self.trust.accepted().await {
            if self.has_session(&auth.uuid).await {
                continue;
            }
            if self.failure_count(&auth.uuid).await >= MAX_CONSECUTIVE_FAILURES {
                continue;
            }
            let cm = self.clone();
            tokio::spawn(async move {
                cm.connect_by_auth(&auth).await;
            });
        }

        let evicted = self
            .presence
            .evict_stale(self.config.presence_timeout)
            .await;
        for uuid in evicted {
            if !self.has_session(&uuid).await {
                let _ = self.events.send(ConnEvent::Lost(uuid)).await;
            }
        }
    }

    /// Where a peer currently sits in its lifecycle.
    pub async fn peer_state(&self, uuid: &Uuid) -> PeerState {
        if self.in_flight.lock().await.contains(uuid) {
            return PeerState::Handshaking;
        }
        match self.trust.get(uuid).await {
            Some(auth) if auth.is_accepted => {
                let online = self.has_session(uuid).await
                    && self
                        .presence
                        .online(uuid, self.config.presence_timeout)
                        .await;
                if online {
                    PeerState::Online
                } else {
                    PeerState::Silent
                }
            }
            _ => {
                if self.presence.get(uuid).await.is_some() {
                    PeerState::Discovered
                } else {
                    PeerState::Unknown
                }
            }
        }
    }

    /// Devices that are accepted, recently heartbeated and connected.
    pub async fn online_devices(&self) -> Vec<DeviceInfo> {
        let mut online = Vec::new();
        for device in self.presence.devices().await {
            if self.trust.is_accepted(&device.uuid).await
                && self
                    .presence
                    .online(&device.uuid, self.config.presence_timeout)
                    .await
            {
                online.push(device);
            }
        }
        online
    }
}
