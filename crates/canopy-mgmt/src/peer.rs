//! Registered peers.

use std::net::Ipv4Addr;

use canopy_proto::wire::PeerSystemMeta;
use canopy_proto::PublicKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Management-side connection state of a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerStatus {
    /// Last time the peer held a live sync stream.
    pub last_seen: DateTime<Utc>,
    /// Whether the peer currently holds a live sync stream.
    pub connected: bool,
}

/// A machine registered in an account, identified by its WireGuard public
/// key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub key: PublicKey,
    /// The setup key this peer registered with, if any.
    pub setup_key: Option<String>,
    /// Tunnel address, unique within the account subnet.
    pub ip: Ipv4Addr,
    /// Machine name; defaults to the reported hostname.
    pub name: String,
    pub meta: PeerSystemMeta,
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub ssh_enabled: bool,
    pub status: PeerStatus,
}

impl Peer {
    /// Tunnel address in CIDR form for a given prefix length.
    pub fn address_cidr(&self, prefix_len: u8) -> String {
        format!("{}/{}", self.ip, prefix_len)
    }
}
