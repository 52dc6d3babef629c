//! The management wire service.
//!
//! One TCP connection per client. The conversation is request/response
//! (`GetServerKey`, `Login`) until a `Sync` frame arrives; from then on the
//! connection belongs to the sync session, which pushes the initial full
//! map and then drains the peer's update mailbox until either side goes
//! away.

use std::net::SocketAddr;
use std::sync::Arc;

use canopy_proto::wire::{
    EncryptedMessage, LoginRequest, LoginResponse, MgmtRequest, MgmtResponse, PeerConfig,
    ServerKey, SyncRequest,
};
use canopy_proto::{Code, FrameCodec, PublicKey, SecretKey, Status};
use chrono::{Duration, Utc};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{AccountManager, PeerTemplate};
use crate::config::Config;
use crate::metrics::{LOGINS, STREAMS_ACTIVE, SYNCS};
use crate::peer::Peer;
use crate::turn::TurnCredentialsManager;
use crate::updates::PeerUpdateManager;

type MgmtFramed = Framed<TcpStream, FrameCodec<MgmtResponse, MgmtRequest>>;

pub struct Server {
    manager: Arc<AccountManager>,
    updates: Arc<PeerUpdateManager>,
    key: SecretKey,
    config: Arc<Config>,
    turn: Arc<TurnCredentialsManager>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(
        manager: Arc<AccountManager>,
        updates: Arc<PeerUpdateManager>,
        key: SecretKey,
        config: Arc<Config>,
        shutdown: CancellationToken,
    ) -> Self {
        let turn = Arc::new(TurnCredentialsManager::new(
            config.turns.clone(),
            config.turn_refresh.clone(),
            updates.clone(),
        ));
        Server { manager, updates, key, config, turn, shutdown }
    }

    /// The overlay as one specific peer should see it: TURN entries carry
    /// per-peer credentials when time-based credentials are enabled.
    fn overlay_for(&self, peer: &PublicKey) -> canopy_proto::wire::OverlayConfig {
        let mut overlay = self.config.overlay();
        overlay.turns = self.turn.turns_for(peer);
        overlay
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    /// Accept connections until shutdown.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        info!(%addr, "management: listening");

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                debug!(%peer_addr, error = %e, "management: connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "management: accept error"),
                },
                _ = self.shutdown.cancelled() => {
                    info!("management: shutting down");
                    return;
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), canopy_proto::CodecError> {
        let mut framed = Framed::new(stream, FrameCodec::<MgmtResponse, MgmtRequest>::new());

        while let Some(frame) = framed.next().await {
            match frame? {
                MgmtRequest::GetServerKey => {
                    framed
                        .send(MgmtResponse::ServerKey(ServerKey {
                            key: self.key.public_key(),
                            expires_at: Utc::now() + Duration::hours(24),
                        }))
                        .await?;
                }
                MgmtRequest::Login(envelope) => {
                    counter!(LOGINS).increment(1);
                    let response = match self.handle_login(&envelope, peer_addr).await {
                        Ok(sealed) => MgmtResponse::LoginResult(sealed),
                        Err(status) => {
                            debug!(%peer_addr, error = %status, "management: login rejected");
                            MgmtResponse::Failure(status.into())
                        }
                    };
                    framed.send(response).await?;
                }
                MgmtRequest::Sync(envelope) => {
                    // The sync session owns the connection from here on.
                    self.run_sync(&mut framed, envelope, peer_addr).await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn handle_login(
        &self,
        envelope: &EncryptedMessage,
        peer_addr: SocketAddr,
    ) -> Result<EncryptedMessage, Status> {
        let peer_key = envelope.key;
        let request: LoginRequest = envelope
            .open(&peer_key, &self.key)
            .map_err(|_| Status::unauthenticated("login body did not open under the sender key"))?;

        let peer = match self.manager.get_peer(&peer_key).await {
            Ok(_) => {
                // Known peer: refresh metadata (and SSH key, if supplied).
                self.manager
                    .login_peer(&peer_key, request.meta, request.ssh_pub_key)
                    .await?
            }
            Err(ref e) if e.code() == Code::NotFound => {
                self.register(peer_key, request, peer_addr).await?
            }
            Err(e) => return Err(e),
        };

        let response = LoginResponse {
            overlay: self.overlay_for(&peer_key),
            peer: self.peer_config(&peer).await,
        };
        EncryptedMessage::seal(&response, &peer_key, &self.key)
    }

    async fn register(
        &self,
        peer_key: PublicKey,
        request: LoginRequest,
        peer_addr: SocketAddr,
    ) -> Result<Peer, Status> {
        let credential = request.credential.ok_or_else(|| {
            Status::invalid_argument(format!(
                "peer {peer_key:?} at {peer_addr} is not registered and supplied no credential"
            ))
        })?;

        let name = if request.meta.hostname.is_empty() {
            peer_key.to_string()
        } else {
            request.meta.hostname.clone()
        };
        let template = PeerTemplate {
            key: peer_key,
            name,
            meta: request.meta,
            ssh_key: request.ssh_pub_key,
        };

        use canopy_proto::wire::Credential;
        match credential {
            Credential::SetupKey(key) => {
                self.manager.register_with_setup_key(&key, template).await
            }
            Credential::IdentityToken(token) => {
                self.manager.register_with_token(&token, template).await
            }
        }
    }

    async fn peer_config(&self, peer: &Peer) -> PeerConfig {
        let mut prefix_len = 10;
        if let Ok(id) = self.manager.account_id_of(&peer.key).await {
            if let Ok(account) = self.manager.account_snapshot(&id).await {
                prefix_len = account.network.net.prefix_len();
            }
        }
        PeerConfig {
            address: peer.address_cidr(prefix_len),
            ssh_enabled: peer.ssh_enabled,
        }
    }

    /// Serve one sync stream: initial full map, then the mailbox.
    async fn run_sync(
        &self,
        framed: &mut MgmtFramed,
        envelope: EncryptedMessage,
        peer_addr: SocketAddr,
    ) {
        counter!(SYNCS).increment(1);
        let peer_key = envelope.key;

        let _request: SyncRequest = match envelope.open(&peer_key, &self.key) {
            Ok(req) => req,
            Err(_) => {
                let status = Status::unauthenticated("sync body did not open under the sender key");
                let _ = framed.send(MgmtResponse::Failure(status.into())).await;
                return;
            }
        };

        // First message: a full map computed at stream-open time.
        let initial = match self
            .manager
            .sync_response(&peer_key, Some(self.overlay_for(&peer_key)))
            .await
        {
            Ok(response) => response,
            Err(status) => {
                debug!(%peer_addr, error = %status, "management: sync rejected");
                let status = if status.code() == Code::NotFound {
                    Status::permission_denied("peer is not registered")
                } else {
                    status
                };
                let _ = framed.send(MgmtResponse::Failure(status.into())).await;
                return;
            }
        };
        if self.send_update(framed, &peer_key, &initial).await.is_err() {
            return;
        }

        let (mut mailbox, generation) = self.updates.create_channel(peer_key).await;
        if let Err(e) = self.manager.mark_peer_connected(&peer_key, true).await {
            warn!(peer = ?peer_key, error = %e, "management: failed marking peer connected");
        }
        self.turn
            .clone()
            .setup_refresh(peer_key, self.manager.clone(), self.config.overlay())
            .await;
        gauge!(STREAMS_ACTIVE).increment(1.0);
        info!(peer = ?peer_key, %peer_addr, "management: sync stream open");

        loop {
            tokio::select! {
                update = mailbox.recv() => match update {
                    Some(message) => {
                        if self.send_update(framed, &peer_key, &message.update).await.is_err() {
                            break;
                        }
                    }
                    // Mailbox closed: a newer stream displaced this one.
                    None => {
                        debug!(peer = ?peer_key, "management: stream displaced");
                        break;
                    }
                },
                frame = framed.next() => match frame {
                    // Clients do not speak after Sync; tolerate noise,
                    // stop on close or transport error.
                    Some(Ok(_)) => debug!(peer = ?peer_key, "management: ignoring frame on sync stream"),
                    Some(Err(e)) => {
                        debug!(peer = ?peer_key, error = %e, "management: sync stream error");
                        break;
                    }
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.updates.close_channel(&peer_key, generation).await;
        self.turn.cancel_refresh(&peer_key).await;
        if let Err(e) = self.manager.mark_peer_connected(&peer_key, false).await {
            debug!(peer = ?peer_key, error = %e, "management: failed marking peer disconnected");
        }
        gauge!(STREAMS_ACTIVE).decrement(1.0);
        info!(peer = ?peer_key, "management: sync stream closed");
    }

    async fn send_update(
        &self,
        framed: &mut MgmtFramed,
        peer_key: &PublicKey,
        update: &canopy_proto::wire::SyncResponse,
    ) -> Result<(), ()> {
        let sealed = match EncryptedMessage::seal(update, peer_key, &self.key) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(peer = ?peer_key, error = %e, "management: failed sealing update");
                return Err(());
            }
        };
        framed
            .send(MgmtResponse::Update(sealed))
            .await
            .map_err(|e| {
                debug!(peer = ?peer_key, error = %e, "management: failed sending update");
            })
    }
}
