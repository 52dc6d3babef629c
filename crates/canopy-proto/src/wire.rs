//! Frame and body types for the management and signal protocols.
//!
//! Each TCP connection carries newline-delimited JSON frames with a tagged
//! `type` field. Account and signaling state never appears in a frame
//! directly; it rides inside [`EncryptedMessage`] envelopes whose `body` is
//! base64 of a sealed JSON document (see [`crate::sealed`]).
//!
//! The management conversation is request/response except for `Sync`, which
//! turns the connection into a server-push stream of `Update` frames. The
//! signal conversation opens with `Connect` and then flows `Message` frames
//! in both directions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::keys::{PublicKey, SecretKey};
use crate::sealed;
use crate::status::{Code, Status};

// ── Envelope ──────────────────────────────────────────────────────────

/// A sealed body in transit.
///
/// `key` is the sender's public key. `remote_key` is only present on signal
/// messages, where it addresses the destination peer. `body` is base64 of
/// the sealed ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptedMessage {
    pub key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_key: Option<PublicKey>,
    pub body: String,
}

impl EncryptedMessage {
    /// Seal `msg` from `local` to `remote` and wrap it in an envelope.
    pub fn seal<T: Serialize>(
        msg: &T,
        remote: &PublicKey,
        local: &SecretKey,
    ) -> Result<Self, Status> {
        let ciphertext = sealed::seal_message(msg, remote, local)?;
        Ok(EncryptedMessage {
            key: local.public_key(),
            remote_key: None,
            body: BASE64.encode(ciphertext),
        })
    }

    /// Open the envelope, verifying it was sealed by `remote` for `local`.
    pub fn open<T: serde::de::DeserializeOwned>(
        &self,
        remote: &PublicKey,
        local: &SecretKey,
    ) -> Result<T, Status> {
        let ciphertext = BASE64
            .decode(&self.body)
            .map_err(|_| Status::new(Code::InvalidArgument, "body is not valid base64"))?;
        sealed::open_message(&ciphertext, remote, local)
    }

    /// Address this envelope to a destination peer (signal messages only).
    pub fn to(mut self, remote_key: PublicKey) -> Self {
        self.remote_key = Some(remote_key);
        self
    }
}

/// Wire form of a failure: [`Status`] split into its fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Failure {
    pub code: Code,
    pub message: String,
}

impl From<Status> for Failure {
    fn from(status: Status) -> Self {
        Failure {
            code: status.code(),
            message: status.message().to_owned(),
        }
    }
}

impl From<Failure> for Status {
    fn from(failure: Failure) -> Self {
        Status::new(failure.code, failure.message)
    }
}

/// The service's static public key plus a rotation hint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerKey {
    pub key: PublicKey,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

// ── Management frames ─────────────────────────────────────────────────

/// Client → management frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MgmtRequest {
    /// Fetch the server's static key; always the first request.
    GetServerKey,
    /// One-shot registration / login. Body: [`LoginRequest`].
    Login(EncryptedMessage),
    /// Open the network-map stream. Body: [`SyncRequest`]. After this frame
    /// the server owns the connection and pushes `Update` frames.
    Sync(EncryptedMessage),
}

/// Management → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MgmtResponse {
    ServerKey(ServerKey),
    /// Body: [`LoginResponse`].
    LoginResult(EncryptedMessage),
    /// One pushed network map. Body: [`SyncResponse`].
    Update(EncryptedMessage),
    Failure(Failure),
}

/// Tagged registration credential. A login request carries at most one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Credential {
    /// Pre-shared setup key created by an account administrator.
    SetupKey(String),
    /// Token minted by the external identity provider.
    IdentityToken(String),
}

/// System details a peer reports about itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PeerSystemMeta {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub core: String,
    pub platform: String,
    pub agent_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Absent for a re-login from an already-registered peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    pub meta: PeerSystemMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_pub_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub overlay: OverlayConfig,
    pub peer: PeerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRequest {}

/// One pushed state snapshot.
///
/// `remote_peers` mirrors `network_map.remote_peers` for older clients that
/// predate the map; new code reads only `network_map`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayConfig>,
    pub peer: PeerConfig,
    pub remote_peers: Vec<RemotePeerConfig>,
    pub remote_peers_is_empty: bool,
    pub network_map: NetworkMap,
}

/// Everything one peer must know about its account at one serial.
///
/// Always a complete snapshot: applying any map in isolation yields a
/// correct peer state, so a dropped update heals on the next one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMap {
    pub serial: u64,
    pub peer: PeerConfig,
    pub remote_peers: Vec<RemotePeerConfig>,
    /// Distinguishes "the peer list did not change" (false, empty list)
    /// from "the peer list is now empty" (true).
    pub remote_peers_is_empty: bool,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub dns: DnsConfig,
}

/// This peer's own tunnel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    /// Tunnel address in CIDR form, e.g. `100.64.0.7/10`.
    pub address: String,
    pub ssh_enabled: bool,
}

/// A remote peer as seen in a network map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemotePeerConfig {
    pub pub_key: PublicKey,
    pub allowed_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_pub_key: Option<String>,
}

/// A network route distributed to peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub id: String,
    /// Destination in CIDR form.
    pub network: String,
    /// The routing peer.
    pub peer: PublicKey,
    pub metric: u32,
    pub masquerade: bool,
}

/// Account DNS configuration pushed with every map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DnsConfig {
    pub service_enabled: bool,
    #[serde(default)]
    pub custom_zones: Vec<CustomZone>,
    #[serde(default)]
    pub nameserver_groups: Vec<NameServerGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomZone {
    pub domain: String,
    pub records: Vec<DnsRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: String,
    pub ttl: u32,
    pub rdata: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NameServerGroup {
    pub id: String,
    pub name: String,
    pub nameservers: Vec<String>,
    pub domains: Vec<String>,
    /// At most one group per account is flagged primary.
    pub primary: bool,
}

/// STUN, TURN, and signal endpoints handed to a peer at login.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OverlayConfig {
    pub stuns: Vec<HostConfig>,
    pub turns: Vec<RelayHostConfig>,
    pub signal: HostConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    pub uri: String,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
    Http,
    Https,
    Dtls,
}

/// A TURN host with its long-term credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayHostConfig {
    pub host: HostConfig,
    pub user: String,
    pub password: String,
}

// ── Signal frames ─────────────────────────────────────────────────────

/// Client → signal frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalRequest {
    GetServerKey,
    /// Open the receive stream. Body: [`ConnectRequest`] sealed to the
    /// relay's static key — opening it proves possession of the private
    /// half of `key`.
    Connect(EncryptedMessage),
    /// Forward a peer-to-peer message. `remote_key` addresses the
    /// destination; the body is sealed between the two peers.
    Send(EncryptedMessage),
}

/// Signal → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalResponse {
    ServerKey(ServerKey),
    /// The receive stream is live.
    Connected,
    /// A forwarded peer-to-peer message.
    Message(EncryptedMessage),
    Failure(Failure),
}

/// Body of a `Connect` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {}

/// What one peer tells another through the relay. Sealed end to end; the
/// relay forwards the envelope without reading this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalBody {
    pub kind: SignalKind,
    /// `ufrag:pwd` for offers and answers, a marshalled candidate for
    /// candidates.
    pub payload: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// Encode ICE credentials into an offer/answer payload.
pub fn encode_credentials(ufrag: &str, pwd: &str) -> String {
    format!("{ufrag}:{pwd}")
}

/// Split an offer/answer payload back into `(ufrag, pwd)`.
pub fn parse_credentials(payload: &str) -> Result<(String, String), Status> {
    payload
        .split_once(':')
        .map(|(u, p)| (u.to_owned(), p.to_owned()))
        .ok_or_else(|| Status::invalid_argument("credential payload missing separator"))
}
