//! Per-peer update mailboxes.
//!
//! Every state-changing operation enqueues a freshly computed sync
//! response for each affected peer; the peer's live sync stream drains its
//! mailbox in order. Sends never block: a peer without a mailbox (or with
//! a full one) just misses the update, and heals on its next stream's
//! initial full map.

use std::collections::HashMap;

use canopy_proto::wire::SyncResponse;
use canopy_proto::PublicKey;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::metrics::{UPDATES_DROPPED, UPDATES_OVERFLOWED, UPDATES_SENT};

/// Mailbox capacity. A slow consumer loses intermediate maps, which is
/// safe — every map is a full snapshot.
const MAILBOX_CAPACITY: usize = 100;

/// One queued update.
#[derive(Debug, Clone)]
pub struct UpdateMessage {
    pub update: SyncResponse,
}

struct Mailbox {
    tx: mpsc::Sender<UpdateMessage>,
    /// Distinguishes successive streams of the same peer so a displaced
    /// stream's cleanup cannot remove its successor's mailbox.
    generation: u64,
}

/// Registry of live mailboxes, keyed by peer public key.
#[derive(Default)]
pub struct PeerUpdateManager {
    channels: Mutex<HashMap<PublicKey, Mailbox>>,
}

impl PeerUpdateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a mailbox for `peer`, displacing any existing one. The
    /// previous stream observes its receiver closing and shuts down.
    ///
    /// Returns the receiver plus the generation token to pass back to
    /// [`close_channel`].
    pub async fn create_channel(&self, peer: PublicKey) -> (mpsc::Receiver<UpdateMessage>, u64) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let mut channels = self.channels.lock().await;
        let generation = channels.get(&peer).map(|m| m.generation + 1).unwrap_or(0);
        if channels.insert(peer, Mailbox { tx, generation }).is_some() {
            debug!(peer = ?peer, "update mailbox displaced an older stream");
        }
        (rx, generation)
    }

    /// Remove `peer`'s mailbox if it still belongs to `generation`.
    pub async fn close_channel(&self, peer: &PublicKey, generation: u64) {
        let mut channels = self.channels.lock().await;
        if channels.get(peer).is_some_and(|m| m.generation == generation) {
            channels.remove(peer);
        }
    }

    /// Enqueue an update for `peer`. Never blocks on the consumer; reports
    /// whether the update was accepted.
    pub async fn send_update(&self, peer: &PublicKey, message: UpdateMessage) -> bool {
        let channels = self.channels.lock().await;
        let Some(mailbox) = channels.get(peer) else {
            counter!(UPDATES_DROPPED).increment(1);
            debug!(peer = ?peer, "dropping update: no live mailbox");
            return false;
        };
        match mailbox.tx.try_send(message) {
            Ok(()) => {
                counter!(UPDATES_SENT).increment(1);
                true
            }
            Err(_) => {
                counter!(UPDATES_OVERFLOWED).increment(1);
                debug!(peer = ?peer, "dropping update: mailbox full or closing");
                false
            }
        }
    }

    /// Number of live mailboxes (== open sync streams).
    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_proto::wire::{NetworkMap, PeerConfig, SyncResponse};
    use canopy_proto::SecretKey;

    fn message(serial: u64) -> UpdateMessage {
        let peer = PeerConfig { address: "100.64.0.1/10".into(), ssh_enabled: false };
        UpdateMessage {
            update: SyncResponse {
                overlay: None,
                peer: peer.clone(),
                remote_peers: vec![],
                remote_peers_is_empty: true,
                network_map: NetworkMap {
                    serial,
                    peer,
                    remote_peers: vec![],
                    remote_peers_is_empty: true,
                    routes: vec![],
                    dns: Default::default(),
                },
            },
        }
    }

    #[tokio::test]
    async fn delivery_preserves_enqueue_order() {
        let manager = PeerUpdateManager::new();
        let peer = SecretKey::generate().public_key();
        let (mut rx, _) = manager.create_channel(peer).await;

        for serial in 1..=5 {
            assert!(manager.send_update(&peer, message(serial)).await);
        }
        for serial in 1..=5 {
            assert_eq!(rx.recv().await.unwrap().update.network_map.serial, serial);
        }
    }

    #[tokio::test]
    async fn send_without_mailbox_is_dropped() {
        let manager = PeerUpdateManager::new();
        let peer = SecretKey::generate().public_key();
        assert!(!manager.send_update(&peer, message(1)).await);
    }

    #[tokio::test]
    async fn create_displaces_older_stream() {
        let manager = PeerUpdateManager::new();
        let peer = SecretKey::generate().public_key();

        let (mut old_rx, old_gen) = manager.create_channel(peer).await;
        let (mut new_rx, new_gen) = manager.create_channel(peer).await;
        assert_ne!(old_gen, new_gen);

        // Old receiver observes closure; new one gets the update.
        assert!(old_rx.recv().await.is_none());
        assert!(manager.send_update(&peer, message(1)).await);
        assert_eq!(new_rx.recv().await.unwrap().update.network_map.serial, 1);
    }

    #[tokio::test]
    async fn displaced_stream_cleanup_keeps_successor_mailbox() {
        let manager = PeerUpdateManager::new();
        let peer = SecretKey::generate().public_key();

        let (_old_rx, old_gen) = manager.create_channel(peer).await;
        let (mut new_rx, _) = manager.create_channel(peer).await;

        // The displaced stream closing with its stale generation must not
        // tear down the replacement.
        manager.close_channel(&peer, old_gen).await;
        assert!(manager.send_update(&peer, message(2)).await);
        assert_eq!(new_rx.recv().await.unwrap().update.network_map.serial, 2);
    }

    #[tokio::test]
    async fn close_removes_mailbox() {
        let manager = PeerUpdateManager::new();
        let peer = SecretKey::generate().public_key();
        let (_rx, generation) = manager.create_channel(peer).await;
        assert_eq!(manager.len().await, 1);
        manager.close_channel(&peer, generation).await;
        assert!(manager.is_empty().await);
        assert!(!manager.send_update(&peer, message(1)).await);
    }
}
