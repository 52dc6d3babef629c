//! The production agent: one UDP socket, host + server-reflexive
//! candidates, and credential-tagged connectivity checks.
//!
//! Both sides probe every candidate they know about and answer probes they
//! can validate; the first validated exchange selects the pair. A check
//! proves knowledge of the *remote* side's credentials (learned through
//! the signal relay), so a stray host on the path cannot complete one.
//!
//! Once a pair is selected the agent stops touching the socket — the data
//! path (direct endpoint or proxy splice) owns it from then on, and
//! liveness is the tunnel's own concern.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canopy_proto::Status;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    stun, AgentState, Candidate, CandidatePair, CandidateType, Credentials, IceAgent,
    IceAgentFactory, IceConfig, IceConn,
};
use crate::proxy::is_public_ip;

/// Interval between probe bursts.
const CHECK_INTERVAL: Duration = Duration::from_millis(250);

pub struct UdpAgentFactory;

#[async_trait::async_trait]
impl IceAgentFactory for UdpAgentFactory {
    async fn create(&self, config: &IceConfig) -> Result<Box<dyn IceAgent>, Status> {
        Ok(Box::new(UdpAgent::bind(config.clone())?))
    }
}

pub struct UdpAgent {
    socket: Arc<UdpSocket>,
    creds: Credentials,
    config: IceConfig,
    local_candidates_tx: mpsc::UnboundedSender<Candidate>,
    local_candidates_rx: Option<mpsc::UnboundedReceiver<Candidate>>,
    states_tx: mpsc::UnboundedSender<AgentState>,
    states_rx: Option<mpsc::UnboundedReceiver<AgentState>>,
    remote_tx: mpsc::UnboundedSender<Candidate>,
    remote_rx: mpsc::UnboundedReceiver<Candidate>,
    known_remotes: Vec<Candidate>,
    local_host: Option<Candidate>,
    local_srflx: Option<Candidate>,
    selected: Option<CandidatePair>,
}

impl UdpAgent {
    pub fn bind(config: IceConfig) -> Result<Self, Status> {
        let std_socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| Status::internal(format!("socket registration: {e}")))?;

        let (local_candidates_tx, local_candidates_rx) = mpsc::unbounded_channel();
        let (states_tx, states_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();

        Ok(UdpAgent {
            socket: Arc::new(socket),
            creds: Credentials::generate(),
            config,
            local_candidates_tx,
            local_candidates_rx: Some(local_candidates_rx),
            states_tx,
            states_rx: Some(states_rx),
            remote_tx,
            remote_rx,
            known_remotes: Vec::new(),
            local_host: None,
            local_srflx: None,
            selected: None,
        })
    }

    fn blacklisted(&self, addr: &SocketAddr) -> bool {
        let ip = addr.ip().to_string();
        self.config
            .interface_blacklist
            .iter()
            .any(|prefix| ip.starts_with(prefix.as_str()))
    }

    fn emit_candidate(&mut self, candidate: Candidate) {
        if self.blacklisted(&candidate.addr) {
            debug!(candidate = %candidate.marshal(), "agent: candidate blacklisted");
            return;
        }
        match candidate.typ {
            CandidateType::Host => self.local_host = Some(candidate),
            CandidateType::ServerReflexive => self.local_srflx = Some(candidate),
            CandidateType::Relay => {}
        }
        let _ = self.local_candidates_tx.send(candidate);
    }

    /// The host address this socket is reachable at. The bind address is
    /// wildcard, so the default-route interface address is probed with a
    /// throwaway connected socket.
    fn probe_host_addr(&self) -> Option<SocketAddr> {
        let port = self.socket.local_addr().ok()?.port();
        let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        let target = self
            .config
            .stun_servers
            .first()
            .cloned()
            .unwrap_or_else(|| "198.51.100.1:3478".to_owned());
        let ip = match probe.connect(target).and_then(|_| probe.local_addr()) {
            Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
            _ => std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        };
        Some(SocketAddr::new(ip, port))
    }

    fn drain_remote_candidates(&mut self) {
        while let Ok(candidate) = self.remote_rx.try_recv() {
            if !self.known_remotes.contains(&candidate) {
                debug!(candidate = %candidate.marshal(), "agent: learned remote candidate");
                self.known_remotes.push(candidate);
            }
        }
    }

    fn local_candidate_for(&self, remote_addr: SocketAddr) -> Candidate {
        match (self.local_host, self.local_srflx) {
            (Some(host), _) if !is_public_ip(&remote_addr.ip()) => host,
            (_, Some(srflx)) => srflx,
            (Some(host), None) => host,
            (None, _) => Candidate::host(
                self.socket
                    .local_addr()
                    .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap_or_else(|_| unreachable!())),
            ),
        }
    }

    fn remote_candidate_for(&self, addr: SocketAddr) -> Candidate {
        self.known_remotes
            .iter()
            .copied()
            .find(|c| c.addr == addr)
            // An address we never learned is peer-reflexive; classify it
            // with the reflexive type for the path decision.
            .unwrap_or_else(|| Candidate::server_reflexive(addr))
    }

    async fn establish(
        &mut self,
        session: CancellationToken,
        remote: Credentials,
        role: &str,
    ) -> Result<IceConn, Status> {
        let _ = self.states_tx.send(AgentState::Checking);
        let socket = self.socket.clone();
        let local_creds = self.creds.clone();
        let probe = check_packet(&remote, &local_creds);
        let ack = ack_packet(&remote, &local_creds);
        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        let mut buf = [0u8; 256];

        let (remote_addr, via) = loop {
            tokio::select! {
                _ = session.cancelled() => {
                    let _ = self.states_tx.send(AgentState::Failed);
                    return Err(Status::unavailable("connectivity checks cancelled"));
                }
                _ = interval.tick() => {
                    self.drain_remote_candidates();
                    for candidate in &self.known_remotes {
                        trace!(role, to = %candidate.addr, "agent: probe");
                        let _ = socket.send_to(probe.as_bytes(), candidate.addr).await;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    let Ok(text) = std::str::from_utf8(&buf[..len]) else { continue };
                    match parse_packet(text) {
                        Some(Packet::Check { ufrag, peer_ufrag, pwd })
                            if ufrag == local_creds.ufrag
                                && pwd == local_creds.pwd
                                && peer_ufrag == remote.ufrag =>
                        {
                            let _ = socket.send_to(ack.as_bytes(), from).await;
                            break (from, "check");
                        }
                        Some(Packet::Ack { ufrag, peer_ufrag })
                            if ufrag == local_creds.ufrag && peer_ufrag == remote.ufrag =>
                        {
                            break (from, "ack");
                        }
                        _ => trace!(role, %from, "agent: discarded packet"),
                    }
                }
            }
        };

        self.drain_remote_candidates();
        let pair = CandidatePair {
            local: self.local_candidate_for(remote_addr),
            remote: self.remote_candidate_for(remote_addr),
        };
        self.selected = Some(pair);
        let _ = self.states_tx.send(AgentState::Connected);
        debug!(
            role,
            via,
            local = %pair.local.marshal(),
            remote = %pair.remote.marshal(),
            "agent: pair selected"
        );

        Ok(IceConn { socket: self.socket.clone(), remote_addr, pair })
    }
}

#[async_trait::async_trait]
impl IceAgent for UdpAgent {
    fn local_credentials(&self) -> Credentials {
        self.creds.clone()
    }

    fn take_local_candidates(&mut self) -> Option<mpsc::UnboundedReceiver<Candidate>> {
        self.local_candidates_rx.take()
    }

    fn take_states(&mut self) -> Option<mpsc::UnboundedReceiver<AgentState>> {
        self.states_rx.take()
    }

    fn remote_candidates_sink(&self) -> mpsc::UnboundedSender<Candidate> {
        self.remote_tx.clone()
    }

    async fn gather(&mut self) -> Result<(), Status> {
        if let Some(host) = self.probe_host_addr() {
            self.emit_candidate(Candidate::host(host));
        }

        if !self.config.stun_servers.is_empty() {
            let servers = self.config.stun_servers.clone();
            match stun::discover_reflexive_addr(&self.socket, &servers).await {
                Ok(mapped) => self.emit_candidate(Candidate::server_reflexive(mapped)),
                Err(e) => debug!(error = %e, "agent: reflexive discovery failed"),
            }
        }
        Ok(())
    }

    async fn dial(
        &mut self,
        session: CancellationToken,
        remote: Credentials,
    ) -> Result<IceConn, Status> {
        self.establish(session, remote, "dial").await
    }

    async fn accept(
        &mut self,
        session: CancellationToken,
        remote: Credentials,
    ) -> Result<IceConn, Status> {
        self.establish(session, remote, "accept").await
    }

    fn selected_pair(&self) -> Option<CandidatePair> {
        self.selected
    }

    async fn close(&mut self) {
        let _ = self.states_tx.send(AgentState::Closed);
    }
}

enum Packet<'a> {
    Check { ufrag: &'a str, peer_ufrag: &'a str, pwd: &'a str },
    Ack { ufrag: &'a str, peer_ufrag: &'a str },
}

/// `CHK <their_ufrag>:<our_ufrag>:<their_pwd>` — the receiver validates
/// its own ufrag and password.
fn check_packet(remote: &Credentials, local: &Credentials) -> String {
    format!("CHK {}:{}:{}", remote.ufrag, local.ufrag, remote.pwd)
}

/// `ACK <their_ufrag>:<our_ufrag>` — sent in reply to a valid check.
fn ack_packet(remote: &Credentials, local: &Credentials) -> String {
    format!("ACK {}:{}", remote.ufrag, local.ufrag)
}

fn parse_packet(text: &str) -> Option<Packet<'_>> {
    if let Some(rest) = text.strip_prefix("CHK ") {
        let mut parts = rest.splitn(3, ':');
        return Some(Packet::Check {
            ufrag: parts.next()?,
            peer_ufrag: parts.next()?,
            pwd: parts.next()?,
        });
    }
    if let Some(rest) = text.strip_prefix("ACK ") {
        let (ufrag, peer_ufrag) = rest.split_once(':')?;
        return Some(Packet::Ack { ufrag, peer_ufrag });
    }
    None
}
