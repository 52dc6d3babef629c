//! The per-peer connection state machine.
//!
//! One `PeerConn` per remote peer. `open()` runs a single connection
//! attempt end to end: offer out through the signal relay, wait for the
//! remote's credentials (or timeout, or close), gather and exchange
//! candidates, dial or accept depending on who controls, then bring up
//! exactly one data path — direct endpoint or proxy splice — and hold it
//! until the connection dies or the engine closes us.
//!
//! Remote offers, answers, and candidates arrive asynchronously from the
//! signal stream. The offer/answer mailboxes hold one message and never
//! block the caller: anything that arrives while nobody is waiting is
//! dropped, and the remote's retry drives recovery.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canopy_proto::{PublicKey, Status};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::status::{PeerState, StatusRecorder};
use crate::device::TunDevice;
use crate::error::ConnError;
use crate::ice::{
    AgentState, Candidate, CandidatePair, CandidateType, Credentials, IceAgent, IceAgentFactory,
    IceConfig, IceConn,
};
use crate::proxy::{decide_path, is_public_ip, PathKind, UdpSplice};

/// Client-side view of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnStatus::Disconnected => "Disconnected",
            ConnStatus::Connecting => "Connecting",
            ConnStatus::Connected => "Connected",
        };
        f.write_str(s)
    }
}

/// Everything one connection attempt needs to know.
#[derive(Clone)]
pub struct ConnConfig {
    /// Remote peer's public key.
    pub key: PublicKey,
    /// Our public key; the greater of the two keys controls the dial.
    pub local_key: PublicKey,
    pub ice: IceConfig,
    /// How long to wait for the remote side's credentials.
    pub timeout: Duration,
    pub allowed_ips: Vec<String>,
    /// The port the remote's tunnel device listens on (direct path).
    pub wg_endpoint_port: u16,
    pub keepalive: Duration,
}

/// Callbacks into the signal client.
pub struct SignalHooks {
    pub offer: Box<dyn Fn(&Credentials) -> Result<(), Status> + Send + Sync>,
    pub answer: Box<dyn Fn(&Credentials) -> Result<(), Status> + Send + Sync>,
    pub candidate: Box<dyn Fn(&Candidate) -> Result<(), Status> + Send + Sync>,
}

pub struct PeerConn {
    /// Remote peer identity. Immutable for the life of this machine: a
    /// changed key means a new `PeerConn`.
    key: PublicKey,
    config: Mutex<ConnConfig>,
    status: Mutex<ConnStatus>,
    offers_tx: mpsc::Sender<Credentials>,
    answers_tx: mpsc::Sender<Credentials>,
    offers_rx: Mutex<mpsc::Receiver<Credentials>>,
    answers_rx: Mutex<mpsc::Receiver<Credentials>>,
    close: CancellationToken,
    /// Live agent's inbound-candidate sink, present only while `open()`
    /// runs.
    remote_sink: Mutex<Option<mpsc::UnboundedSender<Candidate>>>,
    hooks: Arc<SignalHooks>,
    agent_factory: Arc<dyn IceAgentFactory>,
    device: Arc<dyn TunDevice>,
    recorder: Arc<StatusRecorder>,
}

impl PeerConn {
    pub fn new(
        config: ConnConfig,
        hooks: SignalHooks,
        agent_factory: Arc<dyn IceAgentFactory>,
        device: Arc<dyn TunDevice>,
        recorder: Arc<StatusRecorder>,
    ) -> Arc<Self> {
        let (offers_tx, offers_rx) = mpsc::channel(1);
        let (answers_tx, answers_rx) = mpsc::channel(1);
        Arc::new(PeerConn {
            key: config.key,
            config: Mutex::new(config),
            status: Mutex::new(ConnStatus::Disconnected),
            offers_tx,
            answers_tx,
            offers_rx: Mutex::new(offers_rx),
            answers_rx: Mutex::new(answers_rx),
            close: CancellationToken::new(),
            remote_sink: Mutex::new(None),
            hooks: Arc::new(hooks),
            agent_factory,
            device,
            recorder,
        })
    }

    pub fn key(&self) -> PublicKey {
        self.key
    }

    pub async fn status(&self) -> ConnStatus {
        *self.status.lock().await
    }

    /// Replace the connection's configuration in place. A running attempt
    /// keeps its agent; the new values apply from the next attempt.
    pub async fn update_config(&self, config: ConnConfig) {
        *self.config.lock().await = config;
    }

    /// Remote offer arrived. Non-blocking; reports whether it was taken.
    pub fn on_remote_offer(&self, remote: Credentials) -> bool {
        match self.offers_tx.try_send(remote) {
            Ok(()) => true,
            Err(_) => {
                debug!(peer = ?self.key(), "offer dropped: connection not ready");
                false
            }
        }
    }

    /// Remote answer arrived. Non-blocking; reports whether it was taken.
    pub fn on_remote_answer(&self, remote: Credentials) -> bool {
        match self.answers_tx.try_send(remote) {
            Ok(()) => true,
            Err(_) => {
                debug!(peer = ?self.key(), "answer dropped: connection not ready");
                false
            }
        }
    }

    /// Remote candidate arrived; handed to the live agent if one exists.
    pub async fn on_remote_candidate(&self, candidate: Candidate) {
        let sink = self.remote_sink.lock().await;
        match sink.as_ref() {
            Some(tx) => {
                let _ = tx.send(candidate);
            }
            None => debug!(peer = ?self.key(), "candidate dropped: no live agent"),
        }
    }

    /// Ask the state machine to stop. Idempotence is an error so callers
    /// notice double teardown.
    pub fn close(&self) -> Result<(), ConnError> {
        if self.close.is_cancelled() {
            return Err(ConnError::AlreadyClosed { peer: self.key() });
        }
        self.close.cancel();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// One full connection attempt. Returns only when the attempt is over;
    /// the error says why.
    pub async fn open(&self) -> Result<(), ConnError> {
        let config = self.config.lock().await.clone();
        debug!(peer = ?config.key, "conn: opening");
        self.record(&config, ConnStatus::Connecting, None).await;

        let mut agent = match self.agent_factory.create(&config.ice).await {
            Ok(agent) => agent,
            Err(e) => {
                self.record(&config, ConnStatus::Disconnected, None).await;
                return Err(e.into());
            }
        };
        *self.remote_sink.lock().await = Some(agent.remote_candidates_sink());

        let outcome = self.run_session(agent.as_mut(), &config).await;

        agent.close().await;
        *self.remote_sink.lock().await = None;
        self.record(&config, ConnStatus::Disconnected, None).await;
        debug!(peer = ?config.key, "conn: cleaned up");
        outcome
    }

    async fn run_session(
        &self,
        agent: &mut dyn IceAgent,
        config: &ConnConfig,
    ) -> Result<(), ConnError> {
        let local_creds = agent.local_credentials();
        (self.hooks.offer)(&local_creds)?;
        debug!(peer = ?config.key, "conn: offer sent, waiting for remote credentials");

        // Wait for the remote side. Whoever's offer reaches the other
        // first decides which arm fires; both ends still end up with the
        // same credential pair.
        let remote_creds = {
            let mut offers = self.offers_rx.lock().await;
            let mut answers = self.answers_rx.lock().await;
            tokio::select! {
                received = offers.recv() => {
                    let remote = received.ok_or(ConnError::Closed { peer: config.key })?;
                    (self.hooks.answer)(&local_creds)?;
                    remote
                }
                received = answers.recv() => {
                    received.ok_or(ConnError::Closed { peer: config.key })?
                }
                _ = tokio::time::sleep(config.timeout) => {
                    return Err(ConnError::Timeout {
                        peer: config.key,
                        seconds: config.timeout.as_secs(),
                    });
                }
                _ = self.close.cancelled() => {
                    return Err(ConnError::Closed { peer: config.key });
                }
            }
        };
        debug!(peer = ?config.key, "conn: remote credentials received");

        // Forward locally discovered candidates through the relay.
        if let Some(mut candidates) = agent.take_local_candidates() {
            let hooks = self.hooks.clone();
            let peer = config.key;
            tokio::spawn(async move {
                while let Some(candidate) = candidates.recv().await {
                    if let Err(e) = (hooks.candidate)(&candidate) {
                        warn!(peer = ?peer, error = %e, "conn: failed signalling candidate");
                    }
                }
            });
        }

        // Watch the agent for a broken connection.
        let disconnect = CancellationToken::new();
        if let Some(mut states) = agent.take_states() {
            let disconnect = disconnect.clone();
            let peer = config.key;
            tokio::spawn(async move {
                while let Some(state) = states.recv().await {
                    debug!(peer = ?peer, ?state, "conn: agent state");
                    if matches!(state, AgentState::Failed | AgentState::Disconnected) {
                        disconnect.cancel();
                        return;
                    }
                }
            });
        }

        agent.gather().await.map_err(ConnError::Status)?;

        // The session ends when the engine closes us or the agent reports
        // a broken link.
        let session = CancellationToken::new();
        {
            let session = session.clone();
            let close = self.close.clone();
            let disconnect = disconnect.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = close.cancelled() => session.cancel(),
                    _ = disconnect.cancelled() => session.cancel(),
                    _ = session.cancelled() => {}
                }
            });
        }

        // Key order picks the dialer; the comparison is identical on both
        // ends, so exactly one side controls.
        let is_controlling = config.local_key > config.key;
        let connect = if is_controlling {
            agent.dial(session.clone(), remote_creds).await
        } else {
            agent.accept(session.clone(), remote_creds).await
        };
        let conn = match connect {
            Ok(conn) => conn,
            Err(e) => {
                session.cancel();
                if self.close.is_cancelled() {
                    return Err(ConnError::Closed { peer: config.key });
                }
                if disconnect.is_cancelled() {
                    return Err(ConnError::Disconnected { peer: config.key });
                }
                return Err(e.into());
            }
        };

        let result = self.hold_data_path(config, conn, &disconnect).await;
        session.cancel();
        result
    }

    /// Bring up exactly one data path for the established connection and
    /// hold it until close or disconnect.
    async fn hold_data_path(
        &self,
        config: &ConnConfig,
        conn: IceConn,
        disconnect: &CancellationToken,
    ) -> Result<(), ConnError> {
        let pair = conn.pair;
        let path = decide_path(&pair.local, &pair.remote, is_public_ip);

        // Holding the splice here is what guarantees at most one active
        // path: the direct arm never creates one, and this binding dies
        // with the session.
        let mut active_splice: Option<UdpSplice> = None;
        match path {
            PathKind::Direct => {
                let endpoint = SocketAddr::new(conn.remote_addr.ip(), config.wg_endpoint_port);
                self.device
                    .upsert_peer(
                        &config.key,
                        &config.allowed_ips,
                        Some(endpoint),
                        Some(config.keepalive),
                    )
                    .await
                    .map_err(ConnError::Status)?;
                info!(
                    peer = ?config.key,
                    %endpoint,
                    local = %pair.local.marshal(),
                    remote = %pair.remote.marshal(),
                    "conn: direct tunnel up"
                );
            }
            PathKind::Proxy => {
                let splice =
                    UdpSplice::start(conn.socket.clone(), conn.remote_addr, self.device.udp_port())
                        .await
                        .map_err(ConnError::Status)?;
                self.device
                    .upsert_peer(
                        &config.key,
                        &config.allowed_ips,
                        Some(splice.wg_endpoint()),
                        Some(config.keepalive),
                    )
                    .await
                    .map_err(ConnError::Status)?;
                info!(
                    peer = ?config.key,
                    local = %pair.local.marshal(),
                    remote = %pair.remote.marshal(),
                    "conn: proxied tunnel up"
                );
                active_splice = Some(splice);
            }
        }

        self.record(config, ConnStatus::Connected, Some((path, pair))).await;

        let ended = tokio::select! {
            _ = self.close.cancelled() => ConnError::Closed { peer: config.key },
            _ = disconnect.cancelled() => ConnError::Disconnected { peer: config.key },
        };

        if let Some(splice) = active_splice.take() {
            splice.close();
        }
        Err(ended)
    }

    async fn record(
        &self,
        config: &ConnConfig,
        status: ConnStatus,
        path: Option<(PathKind, CandidatePair)>,
    ) {
        *self.status.lock().await = status;

        let ip = config
            .allowed_ips
            .first()
            .map(|cidr| cidr.split('/').next().unwrap_or(cidr).to_owned())
            .unwrap_or_default();
        let mut state = PeerState::new(config.key, ip);
        state.status = status;
        state.last_change = Utc::now();
        if let Some((kind, pair)) = path {
            state.direct = kind == PathKind::Direct;
            state.relayed = pair.local.typ == CandidateType::Relay
                || pair.remote.typ == CandidateType::Relay;
            state.local_candidate_type = Some(pair.local.typ);
            state.remote_candidate_type = Some(pair.remote.typ);
        }
        self.recorder.update_peer(state).await;
    }
}
