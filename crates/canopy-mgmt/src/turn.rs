//! Time-based TURN credentials.
//!
//! When enabled, peers never see the relay's long-term secret. Each
//! credential pair is `username = <expiry unix ts>:<peer key>` and a
//! password derived from the shared secret and that username; the relay
//! derives the same password on its side. A per-peer refresher task pushes
//! a fresh overlay config through the peer's update mailbox before the
//! current credentials lapse, riding the same sync stream as network maps.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use canopy_proto::wire::{OverlayConfig, RelayHostConfig};
use canopy_proto::PublicKey;
use chrono::Utc;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::account::AccountManager;
use crate::updates::{PeerUpdateManager, UpdateMessage};

/// Refresh configuration, part of the service config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRefresh {
    pub enabled: bool,
    /// Credential lifetime in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Shared secret also configured on the relay.
    #[serde(default)]
    pub secret: String,
}

fn default_ttl_secs() -> u64 {
    4 * 3600
}

/// Derive the password for a credential username.
///
/// HKDF-SHA256 over the shared secret, salted with the username: both
/// ends derive, neither transmits.
pub fn derive_password(secret: &str, username: &str) -> String {
    let hk = Hkdf::<Sha256>::new(Some(username.as_bytes()), secret.as_bytes());
    let mut out = [0u8; 32];
    hk.expand(b"turn credential", &mut out)
        .unwrap_or_else(|_| unreachable!("32 bytes is a valid HKDF-SHA256 output length"));
    BASE64.encode(out)
}

pub struct TurnCredentialsManager {
    turns: Vec<RelayHostConfig>,
    refresh: TurnRefresh,
    updates: Arc<PeerUpdateManager>,
    refreshers: Mutex<HashMap<PublicKey, CancellationToken>>,
}

impl TurnCredentialsManager {
    pub fn new(
        turns: Vec<RelayHostConfig>,
        refresh: TurnRefresh,
        updates: Arc<PeerUpdateManager>,
    ) -> Self {
        TurnCredentialsManager {
            turns,
            refresh,
            updates,
            refreshers: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.refresh.enabled && !self.turns.is_empty()
    }

    /// The TURN hosts with credentials minted for `peer`, valid for one
    /// ttl from now. With refresh disabled, the static configuration
    /// passes through unchanged.
    pub fn turns_for(&self, peer: &PublicKey) -> Vec<RelayHostConfig> {
        if !self.enabled() {
            return self.turns.clone();
        }
        let expires_at = Utc::now().timestamp() + self.refresh.ttl_secs as i64;
        let username = format!("{expires_at}:{peer}");
        let password = derive_password(&self.refresh.secret, &username);
        self.turns
            .iter()
            .map(|t| RelayHostConfig {
                host: t.host.clone(),
                user: username.clone(),
                password: password.clone(),
            })
            .collect()
    }

    /// Start pushing refreshed credentials to `peer` at half-ttl cadence.
    /// Replaces any previous refresher for the peer.
    pub async fn setup_refresh(
        self: Arc<Self>,
        peer: PublicKey,
        manager: Arc<AccountManager>,
        base_overlay: OverlayConfig,
    ) {
        if !self.enabled() {
            return;
        }
        let token = CancellationToken::new();
        if let Some(old) = self.refreshers.lock().await.insert(peer, token.clone()) {
            old.cancel();
        }

        let this = self;
        let interval = std::time::Duration::from_secs((this.refresh.ttl_secs / 2).max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let overlay = OverlayConfig {
                    turns: this.turns_for(&peer),
                    ..base_overlay.clone()
                };
                let update = match manager.sync_response(&peer, Some(overlay)).await {
                    Ok(update) => update,
                    Err(e) => {
                        // Peer was deleted while the stream was open.
                        warn!(peer = ?peer, error = %e, "turn: stopping refresh");
                        return;
                    }
                };
                if !this.updates.send_update(&peer, UpdateMessage { update }).await {
                    debug!(peer = ?peer, "turn: refresh dropped, stream gone");
                }
            }
        });
    }

    /// Stop the refresher for `peer`, if any.
    pub async fn cancel_refresh(&self, peer: &PublicKey) {
        if let Some(token) = self.refreshers.lock().await.remove(peer) {
            token.cancel();
        }
    }
}
