//! Connectivity establishment.
//!
//! The agent is a collaborator behind a trait: the connection machine only
//! needs credentials, candidate exchange, dial/accept, and the selected
//! pair. [`udp::UdpAgent`] is the production implementation; tests script
//! their own.

pub mod stun;
pub mod udp;

use std::net::SocketAddr;
use std::str::FromStr;

use canopy_proto::Status;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Short-lived credentials identifying one agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
}

impl Credentials {
    /// Fresh random credentials.
    pub fn generate() -> Self {
        Credentials { ufrag: random_token(8), pwd: random_token(24) }
    }
}

fn random_token(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relay => "relay",
        }
    }
}

/// A transport address one side can be reached at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub typ: CandidateType,
    pub addr: SocketAddr,
}

impl Candidate {
    pub fn host(addr: SocketAddr) -> Self {
        Candidate { typ: CandidateType::Host, addr }
    }

    pub fn server_reflexive(addr: SocketAddr) -> Self {
        Candidate { typ: CandidateType::ServerReflexive, addr }
    }

    pub fn relay(addr: SocketAddr) -> Self {
        Candidate { typ: CandidateType::Relay, addr }
    }

    /// Wire form carried in signal candidate payloads.
    pub fn marshal(&self) -> String {
        format!("{} {}", self.typ.as_str(), self.addr)
    }
}

impl FromStr for Candidate {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (typ, addr) = s
            .split_once(' ')
            .ok_or_else(|| Status::invalid_argument("candidate payload missing separator"))?;
        let typ = match typ {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::ServerReflexive,
            "relay" => CandidateType::Relay,
            other => {
                return Err(Status::invalid_argument(format!("unknown candidate type {other:?}")))
            }
        };
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| Status::invalid_argument("candidate payload has no valid address"))?;
        Ok(Candidate { typ, addr })
    }
}

/// The pair the agent settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// The socket an agent hands over once a pair is selected. The agent does
/// no further I/O on it; the data path (proxy splice or the tunnel device
/// itself) owns it from here.
pub struct IceConn {
    pub socket: std::sync::Arc<tokio::net::UdpSocket>,
    pub remote_addr: SocketAddr,
    pub pair: CandidatePair,
}

#[async_trait::async_trait]
pub trait IceAgent: Send {
    fn local_credentials(&self) -> Credentials;

    /// Locally discovered candidates, produced during [`gather`]. May be
    /// taken once.
    fn take_local_candidates(&mut self) -> Option<mpsc::UnboundedReceiver<Candidate>>;

    /// Agent state transitions. May be taken once.
    fn take_states(&mut self) -> Option<mpsc::UnboundedReceiver<AgentState>>;

    /// Sink for candidates the remote peer signalled to us. Cloneable and
    /// usable while `dial`/`accept` is in flight.
    fn remote_candidates_sink(&self) -> mpsc::UnboundedSender<Candidate>;

    /// Start candidate gathering.
    async fn gather(&mut self) -> Result<(), Status>;

    /// Run connectivity checks as the controlling side.
    async fn dial(
        &mut self,
        session: CancellationToken,
        remote: Credentials,
    ) -> Result<IceConn, Status>;

    /// Run connectivity checks as the controlled side.
    async fn accept(
        &mut self,
        session: CancellationToken,
        remote: Credentials,
    ) -> Result<IceConn, Status>;

    fn selected_pair(&self) -> Option<CandidatePair>;

    async fn close(&mut self);
}

/// Creates one agent per connection attempt.
#[async_trait::async_trait]
pub trait IceAgentFactory: Send + Sync {
    async fn create(&self, config: &IceConfig) -> Result<Box<dyn IceAgent>, Status>;
}

/// Per-connection agent configuration.
#[derive(Debug, Clone, Default)]
pub struct IceConfig {
    /// STUN server addresses (`host:port`).
    pub stun_servers: Vec<String>,
    /// Interface/address prefixes excluded from host candidate gathering.
    pub interface_blacklist: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_marshal_round_trip() {
        let candidate = Candidate::server_reflexive("203.0.113.9:3478".parse().unwrap());
        let text = candidate.marshal();
        assert_eq!(text, "srflx 203.0.113.9:3478");
        assert_eq!(text.parse::<Candidate>().unwrap(), candidate);
    }

    #[test]
    fn candidate_rejects_garbage() {
        assert!("".parse::<Candidate>().is_err());
        assert!("host".parse::<Candidate>().is_err());
        assert!("prflx 1.2.3.4:5".parse::<Candidate>().is_err());
        assert!("host notanaddr".parse::<Candidate>().is_err());
    }

    #[test]
    fn generated_credentials_differ() {
        let a = Credentials::generate();
        let b = Credentials::generate();
        assert_ne!(a.pwd, b.pwd);
        assert_eq!(a.ufrag.len(), 8);
        assert_eq!(a.pwd.len(), 24);
    }
}
