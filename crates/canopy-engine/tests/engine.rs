//! Engine-level tests: network-map reconciliation ordering, the relay
//! fallback data path, and the connection machine's edge behavior.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canopy_engine::engine::{DnsApplier, Engine, EngineSettings, RouteApplier, SignalSender};
use canopy_engine::ice::{
    AgentState, Candidate, CandidatePair, Credentials, IceAgent, IceAgentFactory, IceConfig,
    IceConn,
};
use canopy_engine::peer::conn::{ConnConfig, ConnStatus, PeerConn, SignalHooks};
use canopy_engine::{MockDevice, StatusRecorder};
use canopy_proto::wire::{
    encode_credentials, parse_credentials, DnsConfig, NetworkMap, PeerConfig, RemotePeerConfig,
    SignalBody, SignalKind,
};
use canopy_proto::{PublicKey, SecretKey, Status};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

// ── Test doubles ──────────────────────────────────────────────────────

/// Signal sink for tests that never need delivery.
struct NullSignal;

impl SignalSender for NullSignal {
    fn send_offer(&self, _: &PublicKey, _: &str, _: &str) -> Result<(), Status> {
        Ok(())
    }
    fn send_answer(&self, _: &PublicKey, _: &str, _: &str) -> Result<(), Status> {
        Ok(())
    }
    fn send_candidate(&self, _: &PublicKey, _: &str) -> Result<(), Status> {
        Ok(())
    }
}

/// Agent that gathers nothing and blocks in dial/accept until cancelled.
struct StallingAgent {
    creds: Credentials,
    remote_tx: mpsc::UnboundedSender<Candidate>,
    _remote_rx: mpsc::UnboundedReceiver<Candidate>,
}

impl StallingAgent {
    fn boxed() -> Box<dyn IceAgent> {
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Box::new(StallingAgent {
            creds: Credentials::generate(),
            remote_tx,
            _remote_rx: remote_rx,
        })
    }
}

#[async_trait::async_trait]
impl IceAgent for StallingAgent {
    fn local_credentials(&self) -> Credentials {
        self.creds.clone()
    }
    fn take_local_candidates(&mut self) -> Option<mpsc::UnboundedReceiver<Candidate>> {
        None
    }
    fn take_states(&mut self) -> Option<mpsc::UnboundedReceiver<AgentState>> {
        None
    }
    fn remote_candidates_sink(&self) -> mpsc::UnboundedSender<Candidate> {
        self.remote_tx.clone()
    }
    async fn gather(&mut self) -> Result<(), Status> {
        Ok(())
    }
    async fn dial(&mut self, session: CancellationToken, _: Credentials) -> Result<IceConn, Status> {
        session.cancelled().await;
        Err(Status::unavailable("cancelled"))
    }
    async fn accept(
        &mut self,
        session: CancellationToken,
        _: Credentials,
    ) -> Result<IceConn, Status> {
        session.cancelled().await;
        Err(Status::unavailable("cancelled"))
    }
    fn selected_pair(&self) -> Option<CandidatePair> {
        None
    }
    async fn close(&mut self) {}
}

struct StallingFactory;

#[async_trait::async_trait]
impl IceAgentFactory for StallingFactory {
    async fn create(&self, _: &IceConfig) -> Result<Box<dyn IceAgent>, Status> {
        Ok(StallingAgent::boxed())
    }
}

fn test_engine(device: Arc<MockDevice>) -> Arc<Engine> {
    Engine::new(
        SecretKey::generate(),
        EngineSettings { conn_timeout: Duration::from_millis(300), ..Default::default() },
        Arc::new(NullSignal),
        device,
        Arc::new(StallingFactory),
        Arc::new(StatusRecorder::new()),
        CancellationToken::new(),
    )
}

fn remote(key: PublicKey, n: u8) -> RemotePeerConfig {
    RemotePeerConfig {
        pub_key: key,
        allowed_ips: vec![format!("100.64.0.{n}/32")],
        ssh_pub_key: None,
    }
}

fn map(serial: u64, peers: Vec<RemotePeerConfig>, peers_is_empty: bool) -> NetworkMap {
    NetworkMap {
        serial,
        peer: PeerConfig { address: "100.64.0.1/10".into(), ssh_enabled: false },
        remote_peers_is_empty: peers_is_empty,
        remote_peers: peers,
        routes: vec![],
        dns: DnsConfig::default(),
    }
}

fn key() -> PublicKey {
    SecretKey::generate().public_key()
}

// ── Map reconciliation ────────────────────────────────────────────────

#[tokio::test]
async fn stale_map_is_ignored() {
    let engine = test_engine(Arc::new(MockDevice::new(0)));
    let (a, b, c) = (key(), key(), key());

    assert!(
        engine
            .update_network_map(&map(2, vec![remote(a, 2), remote(b, 3)], false))
            .await
    );
    assert_eq!(engine.last_serial().await, Some(2));

    // An older map, even with more peers, changes nothing.
    assert!(
        !engine
            .update_network_map(&map(0, vec![remote(a, 2), remote(b, 3), remote(c, 4)], false))
            .await
    );
    assert_eq!(engine.last_serial().await, Some(2));
    let mut keys = engine.peer_keys().await;
    keys.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn equal_serial_is_a_no_op() {
    let engine = test_engine(Arc::new(MockDevice::new(0)));
    let a = key();
    assert!(engine.update_network_map(&map(3, vec![remote(a, 2)], false)).await);
    assert!(!engine.update_network_map(&map(3, vec![], true)).await);
    assert_eq!(engine.peer_keys().await, vec![a]);
}

#[tokio::test]
async fn forward_map_reconciles_peer_set() {
    let device = Arc::new(MockDevice::new(0));
    let engine = test_engine(device.clone());
    let (a, b, c) = (key(), key(), key());

    assert!(
        engine
            .update_network_map(&map(2, vec![remote(a, 2), remote(b, 3)], false))
            .await
    );
    let conn_a = engine.peer_conn(&a).await.unwrap();

    assert!(
        engine
            .update_network_map(&map(4, vec![remote(b, 3), remote(c, 4)], false))
            .await
    );
    assert_eq!(engine.last_serial().await, Some(4));

    let mut keys = engine.peer_keys().await;
    keys.sort();
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(keys, expected);

    // The vanished peer's machine is closed and its device entry gone.
    assert!(conn_a.is_closed());
    assert!(engine.peer_conn(&a).await.is_none());
    assert!(device.peer(&a).await.is_none());
    assert!(engine.peer_conn(&c).await.is_some());
}

#[tokio::test]
async fn empty_sentinel_clears_all_peers() {
    let engine = test_engine(Arc::new(MockDevice::new(0)));
    let (b, c) = (key(), key());

    assert!(
        engine
            .update_network_map(&map(4, vec![remote(b, 3), remote(c, 4)], false))
            .await
    );
    assert!(engine.update_network_map(&map(5, vec![], true)).await);
    assert_eq!(engine.last_serial().await, Some(5));
    assert!(engine.peer_keys().await.is_empty());
}

#[tokio::test]
async fn empty_list_without_sentinel_keeps_peers() {
    let engine = test_engine(Arc::new(MockDevice::new(0)));
    let a = key();

    assert!(engine.update_network_map(&map(1, vec![remote(a, 2)], false)).await);
    // Peer list untouched; only the serial (and side tables) move.
    assert!(engine.update_network_map(&map(2, vec![], false)).await);
    assert_eq!(engine.peer_keys().await, vec![a]);
    assert_eq!(engine.last_serial().await, Some(2));
}

#[tokio::test]
async fn reconfigured_peer_keeps_its_machine() {
    let engine = test_engine(Arc::new(MockDevice::new(0)));
    let a = key();

    assert!(engine.update_network_map(&map(1, vec![remote(a, 2)], false)).await);
    let before = engine.peer_conn(&a).await.unwrap();

    let mut changed = remote(a, 2);
    changed.allowed_ips.push("10.44.0.0/24".into());
    assert!(engine.update_network_map(&map(2, vec![changed], false)).await);

    let after = engine.peer_conn(&a).await.unwrap();
    assert!(Arc::ptr_eq(&before, &after), "machine must be reconfigured, not replaced");
    assert!(!after.is_closed());
}

/// Collaborator double that records everything it is handed.
#[derive(Default)]
struct RecordingApplier {
    dns_seen: Mutex<Vec<DnsConfig>>,
    routes_seen: Mutex<Vec<usize>>,
}

#[async_trait::async_trait]
impl DnsApplier for RecordingApplier {
    async fn apply_dns(&self, config: &DnsConfig) -> Result<(), Status> {
        self.dns_seen.lock().await.push(config.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl RouteApplier for RecordingApplier {
    async fn apply_routes(&self, routes: &[canopy_proto::wire::Route]) -> Result<(), Status> {
        self.routes_seen.lock().await.push(routes.len());
        Ok(())
    }
}

#[tokio::test]
async fn side_tables_reach_their_collaborators() {
    let engine = test_engine(Arc::new(MockDevice::new(0)));
    let applier = Arc::new(RecordingApplier::default());
    engine.set_dns_applier(applier.clone()).await;
    engine.set_route_applier(applier.clone()).await;

    let mut m = map(1, vec![], false);
    m.dns = DnsConfig { service_enabled: true, ..Default::default() };
    m.routes = vec![canopy_proto::wire::Route {
        id: "r1".into(),
        network: "10.9.0.0/24".into(),
        peer: key(),
        metric: 100,
        masquerade: true,
    }];

    assert!(engine.update_network_map(&m).await);
    assert!(engine.dns_config().await.service_enabled);
    assert_eq!(engine.routes().await.len(), 1);

    assert_eq!(applier.dns_seen.lock().await.len(), 1);
    assert!(applier.dns_seen.lock().await[0].service_enabled);
    assert_eq!(*applier.routes_seen.lock().await, vec![1]);

    // A stale map must not re-trigger the collaborators.
    assert!(!engine.update_network_map(&map(1, vec![], false)).await);
    assert_eq!(applier.dns_seen.lock().await.len(), 1);
}

#[tokio::test]
async fn shutdown_closes_every_machine() {
    let engine = test_engine(Arc::new(MockDevice::new(0)));
    let (a, b) = (key(), key());
    assert!(
        engine
            .update_network_map(&map(1, vec![remote(a, 2), remote(b, 3)], false))
            .await
    );

    let conn_a = engine.peer_conn(&a).await.unwrap();
    let conn_b = engine.peer_conn(&b).await.unwrap();
    engine.shutdown().await;
    assert!(conn_a.is_closed());
    assert!(conn_b.is_closed());
    assert!(engine.peer_keys().await.is_empty());
}

// ── Connection machine edges ──────────────────────────────────────────

fn conn_config(local: &SecretKey, remote_key: PublicKey, timeout: Duration) -> ConnConfig {
    ConnConfig {
        key: remote_key,
        local_key: local.public_key(),
        ice: IceConfig::default(),
        timeout,
        allowed_ips: vec!["100.64.0.9/32".into()],
        wg_endpoint_port: 51820,
        keepalive: Duration::from_secs(25),
    }
}

fn silent_hooks() -> SignalHooks {
    SignalHooks {
        offer: Box::new(|_| Ok(())),
        answer: Box::new(|_| Ok(())),
        candidate: Box::new(|_| Ok(())),
    }
}

#[tokio::test]
async fn open_times_out_without_remote_credentials() {
    let local = SecretKey::generate();
    let conn = PeerConn::new(
        conn_config(&local, key(), Duration::from_millis(200)),
        silent_hooks(),
        Arc::new(StallingFactory),
        Arc::new(MockDevice::new(0)),
        Arc::new(StatusRecorder::new()),
    );

    let started = std::time::Instant::now();
    let err = conn.open().await.unwrap_err();
    assert!(matches!(err, canopy_engine::ConnError::Timeout { .. }), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(conn.status().await, ConnStatus::Disconnected);
}

#[tokio::test]
async fn close_interrupts_a_waiting_open() {
    let local = SecretKey::generate();
    let conn = PeerConn::new(
        conn_config(&local, key(), Duration::from_secs(30)),
        silent_hooks(),
        Arc::new(StallingFactory),
        Arc::new(MockDevice::new(0)),
        Arc::new(StatusRecorder::new()),
    );

    let opener = conn.clone();
    let task = tokio::spawn(async move { opener.open().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.close().unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, canopy_engine::ConnError::Closed { .. }), "got {err}");
    assert!(matches!(
        conn.close(),
        Err(canopy_engine::ConnError::AlreadyClosed { .. })
    ));
}

#[tokio::test]
async fn offer_mailbox_holds_one_message() {
    let local = SecretKey::generate();
    let conn = PeerConn::new(
        conn_config(&local, key(), Duration::from_secs(30)),
        silent_hooks(),
        Arc::new(StallingFactory),
        Arc::new(MockDevice::new(0)),
        Arc::new(StatusRecorder::new()),
    );

    // Nobody is waiting: the single slot fills, the rest drop.
    assert!(conn.on_remote_offer(Credentials::generate()));
    assert!(!conn.on_remote_offer(Credentials::generate()));
    assert!(!conn.on_remote_offer(Credentials::generate()));
    assert!(conn.on_remote_answer(Credentials::generate()));
    assert!(!conn.on_remote_answer(Credentials::generate()));
}

// ── Relay fallback end to end ─────────────────────────────────────────

/// Agent scripted to "complete" with a relay pair over a pre-bound UDP
/// socket; what the relay-fallback path needs from the agent seam.
struct RelayedAgent {
    creds: Credentials,
    socket: Option<Arc<UdpSocket>>,
    remote_addr: SocketAddr,
    remote_tx: mpsc::UnboundedSender<Candidate>,
    _remote_rx: mpsc::UnboundedReceiver<Candidate>,
}

#[async_trait::async_trait]
impl IceAgent for RelayedAgent {
    fn local_credentials(&self) -> Credentials {
        self.creds.clone()
    }
    fn take_local_candidates(&mut self) -> Option<mpsc::UnboundedReceiver<Candidate>> {
        None
    }
    fn take_states(&mut self) -> Option<mpsc::UnboundedReceiver<AgentState>> {
        None
    }
    fn remote_candidates_sink(&self) -> mpsc::UnboundedSender<Candidate> {
        self.remote_tx.clone()
    }
    async fn gather(&mut self) -> Result<(), Status> {
        Ok(())
    }
    async fn dial(&mut self, _: CancellationToken, _: Credentials) -> Result<IceConn, Status> {
        self.finish()
    }
    async fn accept(&mut self, _: CancellationToken, _: Credentials) -> Result<IceConn, Status> {
        self.finish()
    }
    fn selected_pair(&self) -> Option<CandidatePair> {
        None
    }
    async fn close(&mut self) {}
}

impl RelayedAgent {
    fn finish(&mut self) -> Result<IceConn, Status> {
        let socket = self.socket.take().ok_or_else(|| Status::internal("socket taken twice"))?;
        let local = Candidate::relay(socket.local_addr()?);
        let remote = Candidate::relay(self.remote_addr);
        Ok(IceConn {
            socket,
            remote_addr: self.remote_addr,
            pair: CandidatePair { local, remote },
        })
    }
}

struct RelayedFactory {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    remote_addr: SocketAddr,
}

#[async_trait::async_trait]
impl IceAgentFactory for RelayedFactory {
    async fn create(&self, _: &IceConfig) -> Result<Box<dyn IceAgent>, Status> {
        let socket = self
            .socket
            .lock()
            .await
            .take()
            .ok_or_else(|| Status::internal("factory exhausted"))?;
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        Ok(Box::new(RelayedAgent {
            creds: Credentials::generate(),
            socket: Some(socket),
            remote_addr: self.remote_addr,
            remote_tx,
            _remote_rx: remote_rx,
        }))
    }
}

/// Routes signal bodies straight into the other side's connection. The
/// hooks are synchronous, so each delivery runs as its own task — the
/// same at-a-distance arrival the real relay produces.
struct PairRouter {
    table: Mutex<HashMap<PublicKey, Arc<PeerConn>>>,
}

struct PairSignal {
    router: Arc<PairRouter>,
}

impl PairSignal {
    fn spawn_deliver(&self, remote: PublicKey, body: SignalBody) {
        let router = self.router.clone();
        tokio::spawn(async move {
            let conn = router.table.lock().await.get(&remote).cloned();
            let Some(conn) = conn else { return };
            match body.kind {
                SignalKind::Offer => {
                    let (ufrag, pwd) = parse_credentials(&body.payload).unwrap();
                    conn.on_remote_offer(Credentials { ufrag, pwd });
                }
                SignalKind::Answer => {
                    let (ufrag, pwd) = parse_credentials(&body.payload).unwrap();
                    conn.on_remote_answer(Credentials { ufrag, pwd });
                }
                SignalKind::Candidate => {
                    conn.on_remote_candidate(body.payload.parse().unwrap()).await;
                }
            }
        });
    }

    fn hooks(self: Arc<Self>, remote: PublicKey) -> SignalHooks {
        let offer = self.clone();
        let answer = self.clone();
        let candidate = self;
        SignalHooks {
            offer: Box::new(move |c| {
                offer.spawn_deliver(
                    remote,
                    SignalBody {
                        kind: SignalKind::Offer,
                        payload: encode_credentials(&c.ufrag, &c.pwd),
                    },
                );
                Ok(())
            }),
            answer: Box::new(move |c| {
                answer.spawn_deliver(
                    remote,
                    SignalBody {
                        kind: SignalKind::Answer,
                        payload: encode_credentials(&c.ufrag, &c.pwd),
                    },
                );
                Ok(())
            }),
            candidate: Box::new(move |c| {
                candidate.spawn_deliver(
                    remote,
                    SignalBody { kind: SignalKind::Candidate, payload: c.marshal() },
                );
                Ok(())
            }),
        }
    }
}

#[tokio::test]
async fn relay_pair_comes_up_proxied_and_passes_traffic() {
    // Fake tunnel devices: plain loopback sockets standing in for the
    // local WireGuard ports.
    let wg_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let wg_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // The "relay allocation" each agent hands over.
    let sock_a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let sock_b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr_a = sock_a.local_addr().unwrap();
    let addr_b = sock_b.local_addr().unwrap();

    let secret_a = SecretKey::generate();
    let secret_b = SecretKey::generate();
    let key_a = secret_a.public_key();
    let key_b = secret_b.public_key();

    let device_a = Arc::new(MockDevice::new(wg_a.local_addr().unwrap().port()));
    let device_b = Arc::new(MockDevice::new(wg_b.local_addr().unwrap().port()));
    let recorder_a = Arc::new(StatusRecorder::new());
    let recorder_b = Arc::new(StatusRecorder::new());

    let router = Arc::new(PairRouter { table: Mutex::new(HashMap::new()) });
    let signal_a = Arc::new(PairSignal { router: router.clone() });
    let signal_b = Arc::new(PairSignal { router: router.clone() });

    let conn_a = PeerConn::new(
        conn_config(&secret_a, key_b, Duration::from_secs(5)),
        signal_a.hooks(key_b),
        Arc::new(RelayedFactory { socket: Mutex::new(Some(sock_a)), remote_addr: addr_b }),
        device_a.clone(),
        recorder_a.clone(),
    );
    let conn_b = PeerConn::new(
        conn_config(&secret_b, key_a, Duration::from_secs(5)),
        signal_b.hooks(key_a),
        Arc::new(RelayedFactory { socket: Mutex::new(Some(sock_b)), remote_addr: addr_a }),
        device_b.clone(),
        recorder_b.clone(),
    );

    router.table.lock().await.insert(key_a, conn_a.clone());
    router.table.lock().await.insert(key_b, conn_b.clone());

    let open_a = {
        let conn = conn_a.clone();
        tokio::spawn(async move { conn.open().await })
    };
    let open_b = {
        let conn = conn_b.clone();
        tokio::spawn(async move { conn.open().await })
    };

    // Wait until both sides report Connected.
    for _ in 0..100 {
        if conn_a.status().await == ConnStatus::Connected
            && conn_b.status().await == ConnStatus::Connected
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(conn_a.status().await, ConnStatus::Connected);
    assert_eq!(conn_b.status().await, ConnStatus::Connected);

    // Both ends chose the proxy path and flag the connection as relayed.
    let state_a = recorder_a.peer(&key_b).await.unwrap();
    assert!(state_a.relayed);
    assert!(!state_a.direct);

    // Exactly one data path: the device endpoint is the splice's local
    // socket, not the remote relay address.
    let endpoint_a = device_a.peer(&key_b).await.unwrap().endpoint.unwrap();
    let endpoint_b = device_b.peer(&key_a).await.unwrap().endpoint.unwrap();
    assert!(endpoint_a.ip().is_loopback());
    assert_ne!(endpoint_a, addr_b);

    // Traffic written to A's tunnel port reaches B's tunnel port.
    wg_a.send_to(b"wire-payload", endpoint_a).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), wg_b.recv_from(&mut buf))
        .await
        .expect("timed out waiting for spliced datagram")
        .unwrap();
    assert_eq!(&buf[..len], b"wire-payload");

    // And the reverse direction.
    wg_b.send_to(b"return-payload", endpoint_b).await.unwrap();
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), wg_a.recv_from(&mut buf))
        .await
        .expect("timed out waiting for return datagram")
        .unwrap();
    assert_eq!(&buf[..len], b"return-payload");

    conn_a.close().unwrap();
    conn_b.close().unwrap();
    let _ = open_a.await;
    let _ = open_b.await;
}
