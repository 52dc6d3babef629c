//! Named peer groups.
//!
//! Groups collect peers for access rules and DNS nameserver scoping. Every
//! account carries an `All` group that registration keeps current.

use canopy_proto::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the built-in group holding every peer of the account.
pub const ALL_GROUP: &str = "All";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub peers: Vec<PublicKey>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Group {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            peers: Vec::new(),
        }
    }

    pub fn contains(&self, peer: &PublicKey) -> bool {
        self.peers.contains(peer)
    }

    /// Add a peer if absent. Returns true when the membership changed.
    pub fn insert(&mut self, peer: PublicKey) -> bool {
        if self.contains(&peer) {
            false
        } else {
            self.peers.push(peer);
            true
        }
    }

    /// Remove a peer. Returns true when the membership changed.
    pub fn remove(&mut self, peer: &PublicKey) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer);
        self.peers.len() != before
    }
}
