//! The engine: peer-table reconciliation and wiring.
//!
//! Network maps arrive through the sync stream; the engine applies each
//! accepted map by diffing its peer table — closing machines for peers
//! that vanished, spawning machines for new ones, swapping configuration
//! in place for the rest. Updates at or below the last applied serial are
//! dropped; every applied map moves the serial strictly forward.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use canopy_proto::wire::{
    parse_credentials, Credential, DnsConfig, NetworkMap, OverlayConfig, RemotePeerConfig, Route,
    SignalKind, SyncResponse,
};
use canopy_proto::{PublicKey, SecretKey, Status};
use canopy_signal::client::SignalEvent;
use canopy_signal::SignalHandle;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, DEFAULT_WG_PORT};
use crate::device::TunDevice;
use crate::ice::udp::UdpAgentFactory;
use crate::ice::{Credentials, IceAgentFactory, IceConfig};
use crate::mgmt::MgmtClient;
use crate::peer::conn::{ConnConfig, PeerConn, SignalHooks};
use crate::peer::status::StatusRecorder;

/// First retry delay for a failed peer connection attempt.
const CONN_RETRY_INITIAL: Duration = Duration::from_millis(800);
/// Retry delay ceiling.
const CONN_RETRY_MAX: Duration = Duration::from_secs(3);

/// Applies the account's DNS configuration to the host. The resolver and
/// hostname machinery live outside this crate; the engine only hands the
/// latest config over.
#[async_trait::async_trait]
pub trait DnsApplier: Send + Sync {
    async fn apply_dns(&self, config: &DnsConfig) -> Result<(), Status>;
}

/// Applies distributed routes to the host routing table.
#[async_trait::async_trait]
pub trait RouteApplier: Send + Sync {
    async fn apply_routes(&self, routes: &[Route]) -> Result<(), Status>;
}

/// How the engine talks to the signal relay. The production implementation
/// is [`SignalHandle`]; tests wire engines to each other directly.
pub trait SignalSender: Send + Sync {
    fn send_offer(&self, remote: &PublicKey, ufrag: &str, pwd: &str) -> Result<(), Status>;
    fn send_answer(&self, remote: &PublicKey, ufrag: &str, pwd: &str) -> Result<(), Status>;
    fn send_candidate(&self, remote: &PublicKey, candidate: &str) -> Result<(), Status>;
}

impl SignalSender for SignalHandle {
    fn send_offer(&self, remote: &PublicKey, ufrag: &str, pwd: &str) -> Result<(), Status> {
        SignalHandle::send_offer(self, remote, ufrag, pwd)
    }

    fn send_answer(&self, remote: &PublicKey, ufrag: &str, pwd: &str) -> Result<(), Status> {
        SignalHandle::send_answer(self, remote, ufrag, pwd)
    }

    fn send_candidate(&self, remote: &PublicKey, candidate: &str) -> Result<(), Status> {
        SignalHandle::send_candidate(self, remote, candidate)
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Local tunnel device listen port.
    pub wg_port: u16,
    /// Port remote tunnel devices are assumed to listen on (direct path).
    pub wg_endpoint_port: u16,
    /// Budget for waiting on remote credentials per attempt.
    pub conn_timeout: Duration,
    pub keepalive: Duration,
    pub interface_blacklist: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            wg_port: DEFAULT_WG_PORT,
            wg_endpoint_port: DEFAULT_WG_PORT,
            conn_timeout: Duration::from_secs(6),
            keepalive: Duration::from_secs(25),
            interface_blacklist: Vec::new(),
        }
    }
}

struct PeerEntry {
    conn: Arc<PeerConn>,
    remote: RemotePeerConfig,
}

pub struct Engine {
    secret: SecretKey,
    settings: EngineSettings,
    peers: Mutex<HashMap<PublicKey, PeerEntry>>,
    /// Serial of the last applied map; `None` until the first one.
    last_serial: Mutex<Option<u64>>,
    stun_servers: Mutex<Vec<String>>,
    /// Latest side tables, kept for the status surface and handed to the
    /// appliers on every applied map.
    dns: Mutex<DnsConfig>,
    routes: Mutex<Vec<Route>>,
    dns_applier: Mutex<Option<Arc<dyn DnsApplier>>>,
    route_applier: Mutex<Option<Arc<dyn RouteApplier>>>,
    signal: Arc<dyn SignalSender>,
    device: Arc<dyn TunDevice>,
    agent_factory: Arc<dyn IceAgentFactory>,
    recorder: Arc<StatusRecorder>,
    cancel: CancellationToken,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        secret: SecretKey,
        settings: EngineSettings,
        signal: Arc<dyn SignalSender>,
        device: Arc<dyn TunDevice>,
        agent_factory: Arc<dyn IceAgentFactory>,
        recorder: Arc<StatusRecorder>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Engine {
            secret,
            settings,
            peers: Mutex::new(HashMap::new()),
            last_serial: Mutex::new(None),
            stun_servers: Mutex::new(Vec::new()),
            dns: Mutex::new(DnsConfig::default()),
            routes: Mutex::new(Vec::new()),
            dns_applier: Mutex::new(None),
            route_applier: Mutex::new(None),
            signal,
            device,
            agent_factory,
            recorder,
            cancel,
        })
    }

    pub fn recorder(&self) -> Arc<StatusRecorder> {
        self.recorder.clone()
    }

    pub async fn last_serial(&self) -> Option<u64> {
        *self.last_serial.lock().await
    }

    pub async fn peer_keys(&self) -> Vec<PublicKey> {
        self.peers.lock().await.keys().copied().collect()
    }

    pub async fn peer_conn(&self, key: &PublicKey) -> Option<Arc<PeerConn>> {
        self.peers.lock().await.get(key).map(|e| e.conn.clone())
    }

    pub async fn dns_config(&self) -> DnsConfig {
        self.dns.lock().await.clone()
    }

    pub async fn routes(&self) -> Vec<Route> {
        self.routes.lock().await.clone()
    }

    pub async fn set_dns_applier(&self, applier: Arc<dyn DnsApplier>) {
        *self.dns_applier.lock().await = Some(applier);
    }

    pub async fn set_route_applier(&self, applier: Arc<dyn RouteApplier>) {
        *self.route_applier.lock().await = Some(applier);
    }

    /// Adopt the STUN/TURN endpoints Management handed us.
    pub async fn set_overlay(&self, overlay: &OverlayConfig) {
        let servers = overlay
            .stuns
            .iter()
            .map(|host| {
                host.uri
                    .strip_prefix("stun:")
                    .unwrap_or(&host.uri)
                    .to_owned()
            })
            .collect();
        *self.stun_servers.lock().await = servers;
    }

    /// Apply one sync response: overlay refresh plus the network map.
    pub async fn apply_sync(&self, sync: SyncResponse) {
        if let Some(overlay) = &sync.overlay {
            self.set_overlay(overlay).await;
        }
        self.update_network_map(&sync.network_map).await;
    }

    /// Reconcile the peer table with `map`. Returns whether the map was
    /// applied (stale serials are dropped).
    pub async fn update_network_map(&self, map: &NetworkMap) -> bool {
        let mut last_serial = self.last_serial.lock().await;
        if let Some(last) = *last_serial {
            if map.serial <= last {
                debug!(serial = map.serial, last, "dropping stale network map");
                return false;
            }
        }

        // An empty peer list only means "remove everyone" when the
        // sentinel says so; otherwise the peer list is unchanged.
        let peer_list_changed = map.remote_peers_is_empty || !map.remote_peers.is_empty();

        if peer_list_changed {
            let target: HashMap<PublicKey, RemotePeerConfig> = map
                .remote_peers
                .iter()
                .map(|p| (p.pub_key, p.clone()))
                .collect();

            let mut peers = self.peers.lock().await;

            let removed: Vec<PublicKey> =
                peers.keys().filter(|k| !target.contains_key(k)).copied().collect();
            for key in removed {
                if let Some(entry) = peers.remove(&key) {
                    info!(peer = ?key, "peer left the network map");
                    let _ = entry.conn.close();
                    if let Err(e) = self.device.remove_peer(&key).await {
                        warn!(peer = ?key, error = %e, "failed removing peer from device");
                    }
                    self.recorder.remove_peer(&key).await;
                }
            }

            for (key, remote) in target {
                match peers.get_mut(&key) {
                    None => {
                        info!(peer = ?key, "peer joined the network map");
                        let conn = self.create_conn(&remote).await;
                        self.spawn_conn_task(conn.clone());
                        peers.insert(key, PeerEntry { conn, remote });
                    }
                    Some(entry) if entry.remote != remote => {
                        debug!(peer = ?key, "peer configuration changed");
                        entry.conn.update_config(self.conn_config(&remote).await).await;
                        entry.remote = remote;
                    }
                    Some(_) => {}
                }
            }
        }

        *self.dns.lock().await = map.dns.clone();
        *self.routes.lock().await = map.routes.clone();

        // An applier failure is the collaborator's problem to log and
        // retry; it never unwinds an applied map.
        let dns_applier = self.dns_applier.lock().await.clone();
        if let Some(applier) = dns_applier {
            if let Err(e) = applier.apply_dns(&map.dns).await {
                warn!(error = %e, "dns applier rejected the new config");
            }
        }
        let route_applier = self.route_applier.lock().await.clone();
        if let Some(applier) = route_applier {
            if let Err(e) = applier.apply_routes(&map.routes).await {
                warn!(error = %e, "route applier rejected the new routes");
            }
        }

        *last_serial = Some(map.serial);
        debug!(serial = map.serial, "network map applied");
        true
    }

    /// Route a relay message to the matching connection machine.
    pub async fn handle_signal_event(&self, event: SignalEvent) {
        let SignalEvent::Message { from, body } = event;
        let conn = self.peers.lock().await.get(&from).map(|e| e.conn.clone());
        let Some(conn) = conn else {
            debug!(peer = ?from, "signal message for unknown peer dropped");
            return;
        };

        match body.kind {
            SignalKind::Offer => match parse_credentials(&body.payload) {
                Ok((ufrag, pwd)) => {
                    conn.on_remote_offer(Credentials { ufrag, pwd });
                }
                Err(e) => debug!(peer = ?from, error = %e, "malformed offer dropped"),
            },
            SignalKind::Answer => match parse_credentials(&body.payload) {
                Ok((ufrag, pwd)) => {
                    conn.on_remote_answer(Credentials { ufrag, pwd });
                }
                Err(e) => debug!(peer = ?from, error = %e, "malformed answer dropped"),
            },
            SignalKind::Candidate => match body.payload.parse() {
                Ok(candidate) => conn.on_remote_candidate(candidate).await,
                Err(e) => debug!(peer = ?from, error = %e, "malformed candidate dropped"),
            },
        }
    }

    /// Stop everything: every connection machine, then the engine token.
    pub async fn shutdown(&self) {
        let peers: Vec<Arc<PeerConn>> = {
            let mut table = self.peers.lock().await;
            table.drain().map(|(_, entry)| entry.conn).collect()
        };
        for conn in peers {
            let _ = conn.close();
        }
        self.cancel.cancel();
        info!("engine shut down");
    }

    async fn conn_config(&self, remote: &RemotePeerConfig) -> ConnConfig {
        ConnConfig {
            key: remote.pub_key,
            local_key: self.secret.public_key(),
            ice: IceConfig {
                stun_servers: self.stun_servers.lock().await.clone(),
                interface_blacklist: self.settings.interface_blacklist.clone(),
            },
            timeout: self.settings.conn_timeout,
            allowed_ips: remote.allowed_ips.clone(),
            wg_endpoint_port: self.settings.wg_endpoint_port,
            keepalive: self.settings.keepalive,
        }
    }

    async fn create_conn(&self, remote: &RemotePeerConfig) -> Arc<PeerConn> {
        let key = remote.pub_key;
        let offer_signal = self.signal.clone();
        let answer_signal = self.signal.clone();
        let candidate_signal = self.signal.clone();
        let hooks = SignalHooks {
            offer: Box::new(move |creds: &Credentials| {
                offer_signal.send_offer(&key, &creds.ufrag, &creds.pwd)
            }),
            answer: Box::new(move |creds: &Credentials| {
                answer_signal.send_answer(&key, &creds.ufrag, &creds.pwd)
            }),
            candidate: Box::new(move |candidate| {
                candidate_signal.send_candidate(&key, &candidate.marshal())
            }),
        };

        PeerConn::new(
            self.conn_config(remote).await,
            hooks,
            self.agent_factory.clone(),
            self.device.clone(),
            self.recorder.clone(),
        )
    }

    /// Drive one connection machine until it is closed or the engine
    /// stops. A failed attempt backs off and tries again; failures stay
    /// confined to this peer.
    fn spawn_conn_task(&self, conn: Arc<PeerConn>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut backoff = CONN_RETRY_INITIAL;
            loop {
                if conn.is_closed() || cancel.is_cancelled() {
                    return;
                }
                match conn.open().await {
                    Err(e) if e.is_closed() => return,
                    Err(e) => debug!(peer = ?conn.key(), error = %e, "connection attempt ended"),
                    Ok(()) => {}
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return,
                }
                backoff = (backoff * 2).min(CONN_RETRY_MAX);
            }
        });
    }
}

/// Bring the client online: login, configure the device, open the signal
/// and sync streams, and reconcile until `cancel` fires.
pub async fn run(
    config: ClientConfig,
    credential: Option<Credential>,
    device: Arc<dyn TunDevice>,
    cancel: CancellationToken,
) -> Result<(), Status> {
    let secret = config.secret_key()?;
    let mgmt = MgmtClient::new(config.management_addr.clone(), secret.clone());

    let login = mgmt.login_with_retry(credential, None).await?;
    info!(address = %login.peer.address, "logged in to management");

    // Failure to bring up the tunnel device is fatal.
    device
        .configure(&secret, &login.peer.address, config.wg_port)
        .await?;

    let recorder = Arc::new(StatusRecorder::new());
    let (signal_events_tx, mut signal_events_rx) = mpsc::unbounded_channel();
    let signal_handle = canopy_signal::client::spawn(
        login.overlay.signal.uri.clone(),
        secret.clone(),
        signal_events_tx,
        cancel.clone(),
    );

    // Mirror the signal stream state into the status surface.
    {
        let mut connected = signal_handle.connected();
        let recorder = recorder.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let up = *connected.borrow();
                recorder.set_signal_connected(up).await;
                tokio::select! {
                    changed = connected.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    let settings = EngineSettings {
        wg_port: config.wg_port,
        interface_blacklist: config.interface_blacklist.clone(),
        ..EngineSettings::default()
    };
    let engine = Engine::new(
        secret,
        settings,
        Arc::new(signal_handle),
        device,
        Arc::new(UdpAgentFactory),
        recorder.clone(),
        cancel.clone(),
    );
    engine.set_overlay(&login.overlay).await;

    // Pump relay messages into the engine.
    {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = signal_events_rx.recv() => match event {
                        Some(event) => engine.handle_signal_event(event).await,
                        None => return,
                    },
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    let sync_engine = engine.clone();
    let sync_recorder = recorder.clone();
    mgmt.run_sync(
        move |sync| {
            let engine = sync_engine.clone();
            async move { engine.apply_sync(sync).await }
        },
        move |up| {
            let recorder = sync_recorder.clone();
            async move { recorder.set_management_connected(up).await }
        },
        cancel.clone(),
    )
    .await;

    engine.shutdown().await;
    Ok(())
}
