//! The live-streams table.

use std::collections::HashMap;

use canopy_proto::wire::EncryptedMessage;
use canopy_proto::PublicKey;
use metrics::gauge;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::STREAMS_ACTIVE;

struct Entry {
    tx: mpsc::UnboundedSender<EncryptedMessage>,
    /// Tells apart successive streams of one peer, so a displaced stream's
    /// cleanup cannot unregister its replacement.
    generation: u64,
}

/// `public key → live stream` map. Everything the relay knows.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<PublicKey, Entry>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream for `peer`, displacing any existing one.
    pub async fn register(
        &self,
        peer: PublicKey,
    ) -> (mpsc::UnboundedReceiver<EncryptedMessage>, u64) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut streams = self.streams.lock().await;
        let generation = streams.get(&peer).map(|e| e.generation + 1).unwrap_or(0);
        if streams.insert(peer, Entry { tx, generation }).is_some() {
            debug!(peer = ?peer, "signal stream displaced an older one");
        }
        gauge!(STREAMS_ACTIVE).set(streams.len() as f64);
        (rx, generation)
    }

    /// Remove `peer`'s stream if it still belongs to `generation`.
    pub async fn deregister(&self, peer: &PublicKey, generation: u64) {
        let mut streams = self.streams.lock().await;
        if streams.get(peer).is_some_and(|e| e.generation == generation) {
            streams.remove(peer);
        }
        gauge!(STREAMS_ACTIVE).set(streams.len() as f64);
    }

    /// Forward a message to `peer`'s stream. Returns false when the peer
    /// has no live stream (the message is dropped).
    pub async fn forward(&self, peer: &PublicKey, message: EncryptedMessage) -> bool {
        let streams = self.streams.lock().await;
        match streams.get(peer) {
            Some(entry) => entry.tx.send(message).is_ok(),
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.streams.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
