//! Accounts and the account manager.
//!
//! The account manager owns every account's authoritative state. One coarse
//! mutex per account covers each mutation together with its serial bump and
//! store write; network-map snapshots are built under that lock and sent to
//! peer mailboxes only after it is released. A mailbox send that fails does
//! not roll anything back — the peer's next sync stream starts with a full
//! map and heals itself.

use std::collections::HashMap;
use std::sync::Arc;

use canopy_proto::wire::{
    NetworkMap, OverlayConfig, PeerConfig, PeerSystemMeta, RemotePeerConfig, SyncResponse,
};
use canopy_proto::{PublicKey, Status};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::dns::DnsSettings;
use crate::group::{Group, ALL_GROUP};
use crate::network::{allocate_peer_ip, Network};
use crate::peer::{Peer, PeerStatus};
use crate::policy::{visible_peers, AccessRule};
use crate::route::StoredRoute;
use crate::setup_key::{self, SetupKey, SetupKeyType};
use crate::store::FileStore;
use crate::updates::{PeerUpdateManager, UpdateMessage};

/// Resolves identity tokens to the account they grant access to. The
/// actual token verification lives with the external identity provider;
/// this seam only maps an accepted token to an account id.
pub trait IdentityProvider: Send + Sync {
    fn account_for_token(&self, token: &str) -> Result<String, Status>;
}

/// Provider used when no identity provider is configured.
pub struct RejectAllTokens;

impl IdentityProvider for RejectAllTokens {
    fn account_for_token(&self, _token: &str) -> Result<String, Status> {
        Err(Status::permission_denied("no identity provider configured"))
    }
}

/// An administrative tenant: peers, credentials, topology, and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Keyed by the normalized (lower-cased) token.
    pub setup_keys: HashMap<String, SetupKey>,
    pub network: Network,
    pub peers: HashMap<PublicKey, Peer>,
    /// Keyed by group id.
    pub groups: HashMap<String, Group>,
    pub rules: Vec<AccessRule>,
    #[serde(default)]
    pub dns: DnsSettings,
    #[serde(default)]
    pub routes: Vec<StoredRoute>,
}

impl Account {
    /// Create an account with its starter credentials and policy: a
    /// reusable default key, a one-off key, the `All` group, and an
    /// all-to-all rule.
    pub fn new() -> Self {
        let mut setup_keys = HashMap::new();
        let default_key = SetupKey::default_key();
        let one_off = SetupKey::generate(
            "One-off key",
            SetupKeyType::OneOff,
            Some(Duration::days(crate::setup_key::DEFAULT_KEY_DURATION_DAYS)),
        );
        setup_keys.insert(default_key.key.clone(), default_key);
        setup_keys.insert(one_off.key.clone(), one_off);

        let all = Group::new(ALL_GROUP);
        let rule = AccessRule::default_rule(all.id.clone());
        let groups = HashMap::from([(all.id.clone(), all)]);

        Account {
            id: Uuid::new_v4().to_string(),
            setup_keys,
            network: Network::new(),
            peers: HashMap::new(),
            groups,
            rules: vec![rule],
            dns: DnsSettings::default(),
            routes: Vec::new(),
        }
    }

    fn all_group_mut(&mut self) -> Option<&mut Group> {
        self.groups.values_mut().find(|g| g.name == ALL_GROUP)
    }

    fn peer_config(&self, peer: &Peer) -> PeerConfig {
        PeerConfig {
            address: peer.address_cidr(self.network.net.prefix_len()),
            ssh_enabled: peer.ssh_enabled,
        }
    }

    /// Build the full network map for one peer at the current serial.
    pub fn network_map_for(&self, peer: &Peer) -> NetworkMap {
        let visible = visible_peers(&peer.key, &self.rules, &self.groups);

        let mut remote_peers: Vec<RemotePeerConfig> = self
            .peers
            .values()
            .filter(|p| visible.contains(&p.key))
            .map(|p| RemotePeerConfig {
                pub_key: p.key,
                allowed_ips: vec![format!("{}/32", p.ip)],
                ssh_pub_key: p.ssh_key.clone(),
            })
            .collect();
        // Deterministic order so identical state serializes identically.
        remote_peers.sort_by(|a, b| a.pub_key.cmp(&b.pub_key));

        let routes = self
            .routes
            .iter()
            .filter(|r| r.enabled && (r.peer == peer.key || visible.contains(&r.peer)))
            .map(StoredRoute::to_wire)
            .collect();

        NetworkMap {
            serial: self.network.serial(),
            peer: self.peer_config(peer),
            remote_peers_is_empty: remote_peers.is_empty(),
            remote_peers,
            routes,
            dns: self.dns.config_for(&peer.key, &self.groups),
        }
    }

    /// Full sync response for one peer.
    pub fn sync_response_for(&self, peer: &Peer, overlay: Option<OverlayConfig>) -> SyncResponse {
        let map = self.network_map_for(peer);
        SyncResponse {
            overlay,
            peer: map.peer.clone(),
            remote_peers: map.remote_peers.clone(),
            remote_peers_is_empty: map.remote_peers_is_empty,
            network_map: map,
        }
    }
}

impl Default for Account {
    fn default() -> Self {
        Account::new()
    }
}

/// Everything a registration needs to know about the joining host.
pub struct PeerTemplate {
    pub key: PublicKey,
    pub name: String,
    pub meta: PeerSystemMeta,
    pub ssh_key: Option<String>,
}

pub struct AccountManager {
    accounts: RwLock<HashMap<String, Arc<Mutex<Account>>>>,
    /// peer public key → owning account id.
    peer_index: RwLock<HashMap<PublicKey, String>>,
    /// normalized setup key → owning account id.
    key_index: RwLock<HashMap<String, String>>,
    store: FileStore,
    updates: Arc<PeerUpdateManager>,
    identity: Box<dyn IdentityProvider>,
}

impl AccountManager {
    /// Load every stored account and build the lookup indexes.
    pub async fn new(
        store: FileStore,
        updates: Arc<PeerUpdateManager>,
        identity: Box<dyn IdentityProvider>,
    ) -> Self {
        let mut accounts = HashMap::new();
        let mut peer_index = HashMap::new();
        let mut key_index = HashMap::new();

        for account in store.accounts().await {
            for key in account.peers.keys() {
                peer_index.insert(*key, account.id.clone());
            }
            for token in account.setup_keys.keys() {
                key_index.insert(token.clone(), account.id.clone());
            }
            accounts.insert(account.id.clone(), Arc::new(Mutex::new(account)));
        }

        AccountManager {
            accounts: RwLock::new(accounts),
            peer_index: RwLock::new(peer_index),
            key_index: RwLock::new(key_index),
            store,
            updates,
            identity,
        }
    }

    /// Create and persist a new account. Returns its id and setup keys.
    pub async fn add_account(&self) -> Result<(String, Vec<SetupKey>), Status> {
        let account = Account::new();
        let id = account.id.clone();
        let keys: Vec<SetupKey> = account.setup_keys.values().cloned().collect();

        self.store
            .save_account(&account)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        {
            let mut key_index = self.key_index.write().await;
            for key in account.setup_keys.keys() {
                key_index.insert(key.clone(), id.clone());
            }
        }
        self.accounts
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(account)));

        info!(account = %id, "account created");
        Ok((id, keys))
    }

    /// True when no accounts exist yet (fresh deployment).
    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }

    async fn account_handle(&self, id: &str) -> Result<Arc<Mutex<Account>>, Status> {
        self.accounts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Status::not_found("account not found"))
    }

    async fn account_of_peer(&self, peer: &PublicKey) -> Result<Arc<Mutex<Account>>, Status> {
        let id = self
            .peer_index
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| Status::not_found("peer is not registered"))?;
        self.account_handle(&id).await
    }

    /// A copy of the stored peer, or `NotFound`.
    pub async fn get_peer(&self, key: &PublicKey) -> Result<Peer, Status> {
        let handle = self.account_of_peer(key).await?;
        let account = handle.lock().await;
        account
            .peers
            .get(key)
            .cloned()
            .ok_or_else(|| Status::not_found("peer is not registered"))
    }

    /// Register a new peer with a setup key.
    ///
    /// On success the peer exists with a fresh tunnel address, the account
    /// serial has advanced, and every other peer of the account has a new
    /// map in its mailbox.
    pub async fn register_with_setup_key(
        &self,
        setup_key: &str,
        template: PeerTemplate,
    ) -> Result<Peer, Status> {
        let token = setup_key::normalize(setup_key);
        let account_id = self
            .key_index
            .read()
            .await
            .get(&token)
            .cloned()
            .ok_or_else(|| Status::permission_denied("unknown setup key"))?;

        self.register_in_account(&account_id, Some(&token), template)
            .await
    }

    /// Register a new peer with an identity token.
    pub async fn register_with_token(
        &self,
        token: &str,
        template: PeerTemplate,
    ) -> Result<Peer, Status> {
        let account_id = self.identity.account_for_token(token)?;
        self.register_in_account(&account_id, None, template).await
    }

    async fn register_in_account(
        &self,
        account_id: &str,
        setup_key: Option<&str>,
        template: PeerTemplate,
    ) -> Result<Peer, Status> {
        let handle = self.account_handle(account_id).await?;
        let (peer, fanout) = {
            let mut account = handle.lock().await;

            // A concurrent login already created this peer; treat the
            // second registration as a plain login.
            if let Some(existing) = account.peers.get(&template.key) {
                return Ok(existing.clone());
            }

            if let Some(token) = setup_key {
                let now = Utc::now();
                let key = account
                    .setup_keys
                    .get(token)
                    .ok_or_else(|| Status::permission_denied("unknown setup key"))?;
                if !key.is_valid(now) {
                    return Err(Status::failed_precondition(
                        "setup key is revoked, expired, or exhausted",
                    ));
                }
            }

            let taken: Vec<_> = account.peers.values().map(|p| p.ip).collect();
            let ip = allocate_peer_ip(account.network.net, &taken)?;

            let peer = Peer {
                key: template.key,
                setup_key: setup_key.map(str::to_owned),
                ip,
                name: template.name,
                meta: template.meta,
                ssh_key: template.ssh_key,
                ssh_enabled: false,
                status: PeerStatus { last_seen: Utc::now(), connected: false },
            };

            account.peers.insert(peer.key, peer.clone());
            if let Some(token) = setup_key {
                if let Some(key) = account.setup_keys.get_mut(token) {
                    key.usage_count += 1;
                }
            }
            if let Some(all) = account.all_group_mut() {
                all.insert(peer.key);
            }
            account.network.bump_serial();

            self.store
                .save_account(&account)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;

            info!(peer = ?peer.key, ip = %peer.ip, account = %account.id, "peer registered");
            (peer.clone(), self.fanout_snapshots(&account, Some(&peer.key)))
        };

        self.peer_index
            .write()
            .await
            .insert(peer.key, account_id.to_owned());
        self.deliver(fanout).await;
        Ok(peer)
    }

    /// Re-login from a registered peer: refresh system metadata
    /// unconditionally, and pick up a changed SSH key (which is
    /// map-visible, so it bumps the serial and fans out).
    pub async fn login_peer(
        &self,
        key: &PublicKey,
        meta: PeerSystemMeta,
        ssh_key: Option<String>,
    ) -> Result<Peer, Status> {
        let handle = self.account_of_peer(key).await?;
        let (peer, fanout) = {
            let mut account = handle.lock().await;
            let ssh_changed = {
                let peer = account
                    .peers
                    .get_mut(key)
                    .ok_or_else(|| Status::not_found("peer is not registered"))?;
                peer.meta = meta;
                let changed = matches!(&ssh_key, Some(k) if peer.ssh_key.as_ref() != Some(k));
                if changed {
                    peer.ssh_key = ssh_key;
                }
                changed
            };

            if ssh_changed {
                account.network.bump_serial();
            }
            self.store
                .save_account(&account)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;

            let peer = account.peers[key].clone();
            let fanout = if ssh_changed {
                self.fanout_snapshots(&account, Some(key))
            } else {
                Vec::new()
            };
            (peer, fanout)
        };
        self.deliver(fanout).await;
        Ok(peer)
    }

    /// Record a sync stream opening or closing.
    pub async fn mark_peer_connected(&self, key: &PublicKey, connected: bool) -> Result<(), Status> {
        let handle = self.account_of_peer(key).await?;
        let mut account = handle.lock().await;
        let peer = account
            .peers
            .get_mut(key)
            .ok_or_else(|| Status::not_found("peer is not registered"))?;
        peer.status = PeerStatus { last_seen: Utc::now(), connected };
        self.store
            .save_account(&account)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(())
    }

    /// Rename a peer. Names are not map-visible, so no serial bump.
    pub async fn rename_peer(
        &self,
        key: &PublicKey,
        name: impl Into<String>,
    ) -> Result<Peer, Status> {
        let handle = self.account_of_peer(key).await?;
        let mut account = handle.lock().await;
        let peer = account
            .peers
            .get_mut(key)
            .ok_or_else(|| Status::not_found("peer is not registered"))?;
        peer.name = name.into();
        let renamed = peer.clone();
        self.store
            .save_account(&account)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(renamed)
    }

    /// Remove a peer from its account.
    ///
    /// The removed peer gets a one-shot "you are gone" update (empty peer
    /// list with the sentinel set) before its mailbox closes; everyone else
    /// gets a fresh map at the bumped serial.
    pub async fn delete_peer(&self, key: &PublicKey) -> Result<Peer, Status> {
        let handle = self.account_of_peer(key).await?;
        let (removed, removal_notice, fanout) = {
            let mut account = handle.lock().await;
            let removed = account
                .peers
                .remove(key)
                .ok_or_else(|| Status::not_found("peer is not registered"))?;
            for group in account.groups.values_mut() {
                group.remove(key);
            }
            account.routes.retain(|r| r.peer != *key);
            account.network.bump_serial();

            self.store
                .save_account(&account)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;

            let notice = SyncResponse {
                overlay: None,
                peer: account.peer_config(&removed),
                remote_peers: Vec::new(),
                remote_peers_is_empty: true,
                network_map: NetworkMap {
                    serial: account.network.serial(),
                    peer: account.peer_config(&removed),
                    remote_peers: Vec::new(),
                    remote_peers_is_empty: true,
                    routes: Vec::new(),
                    dns: Default::default(),
                },
            };

            info!(peer = ?key, account = %account.id, "peer removed");
            (removed, notice, self.fanout_snapshots(&account, None))
        };

        self.updates
            .send_update(key, UpdateMessage { update: removal_notice })
            .await;
        self.peer_index.write().await.remove(key);
        self.deliver(fanout).await;
        Ok(removed)
    }

    // ── Setup key administration ──────────────────────────────────────

    pub async fn add_setup_key(
        &self,
        account_id: &str,
        name: &str,
        key_type: SetupKeyType,
        expires_in: Option<Duration>,
    ) -> Result<SetupKey, Status> {
        let handle = self.account_handle(account_id).await?;
        let key = {
            let mut account = handle.lock().await;
            let key = SetupKey::generate(name, key_type, expires_in);
            account.setup_keys.insert(key.key.clone(), key.clone());
            self.store
                .save_account(&account)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            key
        };
        self.key_index
            .write()
            .await
            .insert(key.key.clone(), account_id.to_owned());
        Ok(key)
    }

    pub async fn revoke_setup_key(&self, account_id: &str, key_id: &str) -> Result<SetupKey, Status> {
        self.mutate_setup_key(account_id, key_id, |key| key.revoked = true)
            .await
    }

    pub async fn rename_setup_key(
        &self,
        account_id: &str,
        key_id: &str,
        name: &str,
    ) -> Result<SetupKey, Status> {
        self.mutate_setup_key(account_id, key_id, |key| key.name = name.to_owned())
            .await
    }

    async fn mutate_setup_key(
        &self,
        account_id: &str,
        key_id: &str,
        mutate: impl FnOnce(&mut SetupKey),
    ) -> Result<SetupKey, Status> {
        let handle = self.account_handle(account_id).await?;
        let mut account = handle.lock().await;
        let key = account
            .setup_keys
            .values_mut()
            .find(|k| k.id == key_id)
            .ok_or_else(|| Status::not_found("unknown setup key"))?;
        mutate(key);
        let key = key.clone();
        self.store
            .save_account(&account)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(key)
    }

    // ── Map-visible account mutations ─────────────────────────────────

    pub async fn save_group(&self, account_id: &str, group: Group) -> Result<(), Status> {
        self.mutate_and_fanout(account_id, move |account| {
            account.groups.insert(group.id.clone(), group);
            Ok(())
        })
        .await
    }

    pub async fn delete_group(&self, account_id: &str, group_id: &str) -> Result<(), Status> {
        self.mutate_and_fanout(account_id, move |account| {
            let group = account
                .groups
                .get(group_id)
                .ok_or_else(|| Status::not_found("unknown group"))?;
            if group.name == ALL_GROUP {
                return Err(Status::invalid_argument("the All group cannot be deleted"));
            }
            account.groups.remove(group_id);
            account.rules.retain(|r| {
                !r.sources.iter().any(|g| g == group_id)
                    && !r.destinations.iter().any(|g| g == group_id)
            });
            Ok(())
        })
        .await
    }

    pub async fn save_rule(&self, account_id: &str, rule: AccessRule) -> Result<(), Status> {
        self.mutate_and_fanout(account_id, move |account| {
            match account.rules.iter_mut().find(|r| r.id == rule.id) {
                Some(existing) => *existing = rule,
                None => account.rules.push(rule),
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_rule(&self, account_id: &str, rule_id: &str) -> Result<(), Status> {
        self.mutate_and_fanout(account_id, move |account| {
            let before = account.rules.len();
            account.rules.retain(|r| r.id != rule_id);
            if account.rules.len() == before {
                return Err(Status::not_found("unknown rule"));
            }
            Ok(())
        })
        .await
    }

    pub async fn save_dns(&self, account_id: &str, dns: DnsSettings) -> Result<(), Status> {
        dns.validate()?;
        self.mutate_and_fanout(account_id, move |account| {
            account.dns = dns;
            Ok(())
        })
        .await
    }

    pub async fn save_route(&self, account_id: &str, route: StoredRoute) -> Result<(), Status> {
        self.mutate_and_fanout(account_id, move |account| {
            if !account.peers.contains_key(&route.peer) {
                return Err(Status::invalid_argument("routing peer is not in this account"));
            }
            match account.routes.iter_mut().find(|r| r.id == route.id) {
                Some(existing) => *existing = route,
                None => account.routes.push(route),
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_route(&self, account_id: &str, route_id: &str) -> Result<(), Status> {
        self.mutate_and_fanout(account_id, move |account| {
            let before = account.routes.len();
            account.routes.retain(|r| r.id != route_id);
            if account.routes.len() == before {
                return Err(Status::not_found("unknown route"));
            }
            Ok(())
        })
        .await
    }

    /// Run a map-visible mutation: lock, mutate, bump serial, persist,
    /// snapshot; then deliver outside the lock.
    async fn mutate_and_fanout(
        &self,
        account_id: &str,
        mutate: impl FnOnce(&mut Account) -> Result<(), Status>,
    ) -> Result<(), Status> {
        let handle = self.account_handle(account_id).await?;
        let fanout = {
            let mut account = handle.lock().await;
            mutate(&mut account)?;
            account.network.bump_serial();
            self.store
                .save_account(&account)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            self.fanout_snapshots(&account, None)
        };
        self.deliver(fanout).await;
        Ok(())
    }

    /// Full sync response for a peer, used for the initial stream message.
    pub async fn sync_response(
        &self,
        key: &PublicKey,
        overlay: Option<OverlayConfig>,
    ) -> Result<SyncResponse, Status> {
        let handle = self.account_of_peer(key).await?;
        let account = handle.lock().await;
        let peer = account
            .peers
            .get(key)
            .ok_or_else(|| Status::not_found("peer is not registered"))?;
        Ok(account.sync_response_for(peer, overlay))
    }

    /// A snapshot of an account's current state (admin and test surface).
    pub async fn account_snapshot(&self, account_id: &str) -> Result<Account, Status> {
        let handle = self.account_handle(account_id).await?;
        let account = handle.lock().await;
        Ok(account.clone())
    }

    /// The account a peer belongs to.
    pub async fn account_id_of(&self, key: &PublicKey) -> Result<String, Status> {
        self.peer_index
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Status::not_found("peer is not registered"))
    }

    fn fanout_snapshots(
        &self,
        account: &Account,
        exclude: Option<&PublicKey>,
    ) -> Vec<(PublicKey, UpdateMessage)> {
        account
            .peers
            .values()
            .filter(|p| exclude != Some(&p.key))
            .map(|p| {
                (
                    p.key,
                    UpdateMessage { update: account.sync_response_for(p, None) },
                )
            })
            .collect()
    }

    async fn deliver(&self, fanout: Vec<(PublicKey, UpdateMessage)>) {
        for (peer, message) in fanout {
            if !self.updates.send_update(&peer, message).await {
                debug!(peer = ?peer, "peer missed an update; will heal on next sync");
            }
        }
    }
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_proto::SecretKey;

    async fn manager() -> (AccountManager, String, String) {
        let dir = std::env::temp_dir().join(format!("canopy-mgr-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = FileStore::open(&dir).unwrap();
        let manager = AccountManager::new(
            store,
            Arc::new(PeerUpdateManager::new()),
            Box::new(RejectAllTokens),
        )
        .await;
        let (account_id, keys) = manager.add_account().await.unwrap();
        let reusable = keys
            .iter()
            .find(|k| k.key_type == SetupKeyType::Reusable)
            .unwrap()
            .key
            .clone();
        (manager, account_id, reusable)
    }

    fn template(key: PublicKey) -> PeerTemplate {
        PeerTemplate {
            key,
            name: "host".into(),
            meta: PeerSystemMeta::default(),
            ssh_key: None,
        }
    }

    #[tokio::test]
    async fn registration_allocates_distinct_ips_and_bumps_serial() {
        let (manager, account_id, key) = manager().await;
        let a = SecretKey::generate().public_key();
        let b = SecretKey::generate().public_key();

        manager.register_with_setup_key(&key, template(a)).await.unwrap();
        manager.register_with_setup_key(&key, template(b)).await.unwrap();

        let account = manager.account_snapshot(&account_id).await.unwrap();
        assert_eq!(account.peers.len(), 2);
        assert_ne!(account.peers[&a].ip, account.peers[&b].ip);
        assert!(account.network.net.contains(&account.peers[&a].ip));
        assert_eq!(account.network.serial(), 2);
    }

    #[tokio::test]
    async fn one_off_key_registers_exactly_once() {
        let (manager, account_id, _) = manager().await;
        let one_off = manager
            .account_snapshot(&account_id)
            .await
            .unwrap()
            .setup_keys
            .into_values()
            .find(|k| k.key_type == SetupKeyType::OneOff)
            .unwrap();

        let first = SecretKey::generate().public_key();
        manager
            .register_with_setup_key(&one_off.key, template(first))
            .await
            .unwrap();

        let second = SecretKey::generate().public_key();
        let err = manager
            .register_with_setup_key(&one_off.key, template(second))
            .await
            .unwrap_err();
        assert_eq!(err.code(), canopy_proto::Code::FailedPrecondition);

        let account = manager.account_snapshot(&account_id).await.unwrap();
        assert_eq!(account.peers.len(), 1, "no peer may be created on a spent key");
    }

    #[tokio::test]
    async fn unknown_setup_key_is_permission_denied() {
        let (manager, _, _) = manager().await;
        let err = manager
            .register_with_setup_key("no-such-key", template(SecretKey::generate().public_key()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), canopy_proto::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn setup_key_lookup_ignores_case() {
        let (manager, _, key) = manager().await;
        let peer = SecretKey::generate().public_key();
        manager
            .register_with_setup_key(&key.to_uppercase(), template(peer))
            .await
            .unwrap();
        assert!(manager.get_peer(&peer).await.is_ok());
    }

    #[tokio::test]
    async fn revoked_key_is_failed_precondition() {
        let (manager, account_id, key) = manager().await;
        let key_id = manager
            .account_snapshot(&account_id)
            .await
            .unwrap()
            .setup_keys
            .get(&key)
            .unwrap()
            .id
            .clone();
        manager.revoke_setup_key(&account_id, &key_id).await.unwrap();

        let err = manager
            .register_with_setup_key(&key, template(SecretKey::generate().public_key()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), canopy_proto::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn peers_see_each_other_in_maps() {
        let (manager, _, key) = manager().await;
        let a = SecretKey::generate().public_key();
        let b = SecretKey::generate().public_key();
        manager.register_with_setup_key(&key, template(a)).await.unwrap();
        manager.register_with_setup_key(&key, template(b)).await.unwrap();

        let map_a = manager.sync_response(&a, None).await.unwrap().network_map;
        assert_eq!(map_a.remote_peers.len(), 1);
        assert_eq!(map_a.remote_peers[0].pub_key, b);
        assert!(!map_a.remote_peers_is_empty);
    }

    #[tokio::test]
    async fn delete_peer_notifies_and_bumps() {
        let (manager, account_id, key) = manager().await;
        let a = SecretKey::generate().public_key();
        let b = SecretKey::generate().public_key();
        manager.register_with_setup_key(&key, template(a)).await.unwrap();
        manager.register_with_setup_key(&key, template(b)).await.unwrap();
        let serial_before = manager
            .account_snapshot(&account_id)
            .await
            .unwrap()
            .network
            .serial();

        manager.delete_peer(&b).await.unwrap();

        let account = manager.account_snapshot(&account_id).await.unwrap();
        assert!(account.network.serial() > serial_before);
        assert!(!account.peers.contains_key(&b));
        assert!(account.groups.values().all(|g| !g.contains(&b)));

        let map_a = manager.sync_response(&a, None).await.unwrap().network_map;
        assert!(map_a.remote_peers_is_empty);
        assert!(manager.get_peer(&b).await.is_err());
    }

    #[tokio::test]
    async fn relogin_updates_meta_without_serial_bump() {
        let (manager, account_id, key) = manager().await;
        let a = SecretKey::generate().public_key();
        manager.register_with_setup_key(&key, template(a)).await.unwrap();
        let serial = manager
            .account_snapshot(&account_id)
            .await
            .unwrap()
            .network
            .serial();

        let meta = PeerSystemMeta { hostname: "renamed".into(), ..Default::default() };
        manager.login_peer(&a, meta.clone(), None).await.unwrap();

        let account = manager.account_snapshot(&account_id).await.unwrap();
        assert_eq!(account.peers[&a].meta, meta);
        assert_eq!(account.network.serial(), serial);
    }

    #[tokio::test]
    async fn ssh_key_change_is_map_visible() {
        let (manager, account_id, key) = manager().await;
        let a = SecretKey::generate().public_key();
        manager.register_with_setup_key(&key, template(a)).await.unwrap();
        let serial = manager
            .account_snapshot(&account_id)
            .await
            .unwrap()
            .network
            .serial();

        manager
            .login_peer(&a, PeerSystemMeta::default(), Some("ssh-ed25519 AAAA".into()))
            .await
            .unwrap();
        assert!(
            manager
                .account_snapshot(&account_id)
                .await
                .unwrap()
                .network
                .serial()
                > serial
        );
    }

    #[tokio::test]
    async fn group_rule_dns_route_mutations_bump_serial() {
        let (manager, account_id, key) = manager().await;
        let a = SecretKey::generate().public_key();
        manager.register_with_setup_key(&key, template(a)).await.unwrap();
        let mut serial = manager
            .account_snapshot(&account_id)
            .await
            .unwrap()
            .network
            .serial();

        manager.save_group(&account_id, Group::new("ops")).await.unwrap();
        let after_group = manager
            .account_snapshot(&account_id)
            .await
            .unwrap()
            .network
            .serial();
        assert!(after_group > serial);
        serial = after_group;

        manager
            .save_dns(&account_id, DnsSettings { service_enabled: true, ..Default::default() })
            .await
            .unwrap();
        let after_dns = manager
            .account_snapshot(&account_id)
            .await
            .unwrap()
            .network
            .serial();
        assert!(after_dns > serial);
        serial = after_dns;

        let route = StoredRoute::new("10.10.0.0/24".parse().unwrap(), a);
        manager.save_route(&account_id, route).await.unwrap();
        assert!(
            manager
                .account_snapshot(&account_id)
                .await
                .unwrap()
                .network
                .serial()
                > serial
        );
    }

    #[tokio::test]
    async fn identity_token_rejected_without_provider() {
        let (manager, _, _) = manager().await;
        let err = manager
            .register_with_token("a-token", template(SecretKey::generate().public_key()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), canopy_proto::Code::PermissionDenied);
    }
}
