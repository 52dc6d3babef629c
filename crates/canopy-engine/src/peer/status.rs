//! Connection status bookkeeping.
//!
//! One shared recorder per engine. Connection machines write their state
//! transitions here; the CLI's `status` surface reads a snapshot.

use std::collections::HashMap;

use canopy_proto::PublicKey;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::conn::ConnStatus;
use crate::ice::CandidateType;

/// Observable state of one peer connection.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub key: PublicKey,
    /// Remote tunnel address, without prefix.
    pub ip: String,
    pub status: ConnStatus,
    pub direct: bool,
    pub relayed: bool,
    pub local_candidate_type: Option<CandidateType>,
    pub remote_candidate_type: Option<CandidateType>,
    pub last_change: DateTime<Utc>,
}

impl PeerState {
    pub fn new(key: PublicKey, ip: impl Into<String>) -> Self {
        PeerState {
            key,
            ip: ip.into(),
            status: ConnStatus::Disconnected,
            direct: false,
            relayed: false,
            local_candidate_type: None,
            remote_candidate_type: None,
            last_change: Utc::now(),
        }
    }
}

/// Control-plane stream states.
#[derive(Debug, Clone, Default)]
pub struct ControlStreams {
    pub management_connected: bool,
    pub signal_connected: bool,
}

/// Everything `status` shows.
#[derive(Debug, Clone, Default)]
pub struct FullStatus {
    pub peers: Vec<PeerState>,
    pub streams: ControlStreams,
}

#[derive(Default)]
pub struct StatusRecorder {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<PublicKey, PeerState>,
    streams: ControlStreams,
}

impl StatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert one peer's state.
    pub async fn update_peer(&self, state: PeerState) {
        self.inner.lock().await.peers.insert(state.key, state);
    }

    /// Forget a peer entirely (it left the network map).
    pub async fn remove_peer(&self, key: &PublicKey) {
        self.inner.lock().await.peers.remove(key);
    }

    pub async fn peer(&self, key: &PublicKey) -> Option<PeerState> {
        self.inner.lock().await.peers.get(key).cloned()
    }

    pub async fn set_management_connected(&self, connected: bool) {
        self.inner.lock().await.streams.management_connected = connected;
    }

    pub async fn set_signal_connected(&self, connected: bool) {
        self.inner.lock().await.streams.signal_connected = connected;
    }

    pub async fn full_status(&self) -> FullStatus {
        let inner = self.inner.lock().await;
        let mut peers: Vec<PeerState> = inner.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.key.cmp(&b.key));
        FullStatus { peers, streams: inner.streams.clone() }
    }
}
