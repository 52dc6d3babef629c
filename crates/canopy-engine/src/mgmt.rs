//! Management service client.
//!
//! `login` is one-shot with a bounded retry budget; `run_sync` holds the
//! server-push stream open forever, reconnecting with exponential backoff
//! and handing every decrypted sync response to the engine. Every map is a
//! full snapshot, so a dropped stream costs nothing but latency.

use std::time::{Duration, Instant};

use canopy_proto::wire::{
    Credential, EncryptedMessage, LoginRequest, LoginResponse, MgmtRequest, MgmtResponse,
    PeerSystemMeta, SyncRequest, SyncResponse,
};
use canopy_proto::{FrameCodec, PublicKey, SecretKey, Status};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// First retry delay for both login and sync.
const BACKOFF_INITIAL: Duration = Duration::from_millis(800);
/// Retry delay ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(3);
/// Cumulative time budget for the one-shot login flow.
const LOGIN_BUDGET: Duration = Duration::from_secs(10);

type MgmtFramed = Framed<TcpStream, FrameCodec<MgmtRequest, MgmtResponse>>;

/// The system details this host reports at login.
pub fn system_meta() -> PeerSystemMeta {
    PeerSystemMeta {
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default(),
        os: std::env::consts::OS.to_owned(),
        kernel: std::env::consts::FAMILY.to_owned(),
        core: String::new(),
        platform: std::env::consts::ARCH.to_owned(),
        agent_version: env!("CARGO_PKG_VERSION").to_owned(),
    }
}

pub struct MgmtClient {
    addr: String,
    secret: SecretKey,
}

impl MgmtClient {
    pub fn new(addr: impl Into<String>, secret: SecretKey) -> Self {
        MgmtClient { addr: addr.into(), secret }
    }

    async fn connect(&self) -> Result<MgmtFramed, Status> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(Framed::new(stream, FrameCodec::new()))
    }

    async fn fetch_server_key(framed: &mut MgmtFramed) -> Result<PublicKey, Status> {
        framed
            .send(MgmtRequest::GetServerKey)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        match framed.next().await {
            Some(Ok(MgmtResponse::ServerKey(sk))) => Ok(sk.key),
            Some(Ok(MgmtResponse::Failure(failure))) => Err(failure.into()),
            Some(Ok(other)) => Err(Status::internal(format!("expected server key, got {other:?}"))),
            Some(Err(e)) => Err(Status::unavailable(e.to_string())),
            None => Err(Status::unavailable("management closed during handshake")),
        }
    }

    /// One login attempt.
    pub async fn login(
        &self,
        credential: Option<Credential>,
        ssh_pub_key: Option<String>,
    ) -> Result<LoginResponse, Status> {
        let mut framed = self.connect().await?;
        let server_key = Self::fetch_server_key(&mut framed).await?;

        let request = LoginRequest { credential, meta: system_meta(), ssh_pub_key };
        let envelope = EncryptedMessage::seal(&request, &server_key, &self.secret)?;
        framed
            .send(MgmtRequest::Login(envelope))
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        match framed.next().await {
            Some(Ok(MgmtResponse::LoginResult(sealed))) => sealed.open(&server_key, &self.secret),
            Some(Ok(MgmtResponse::Failure(failure))) => Err(failure.into()),
            Some(Ok(other)) => Err(Status::internal(format!("unexpected login reply: {other:?}"))),
            Some(Err(e)) => Err(Status::unavailable(e.to_string())),
            None => Err(Status::unavailable("management closed during login")),
        }
    }

    /// Login with retries on transport errors, bounded by a cumulative
    /// time budget. Rejections (bad key, denied) surface immediately.
    pub async fn login_with_retry(
        &self,
        credential: Option<Credential>,
        ssh_pub_key: Option<String>,
    ) -> Result<LoginResponse, Status> {
        let started = Instant::now();
        let mut backoff = BACKOFF_INITIAL;
        loop {
            match self.login(credential.clone(), ssh_pub_key.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && started.elapsed() + backoff < LOGIN_BUDGET => {
                    debug!(error = %e, "login failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Hold the sync stream open until `cancel` fires, reconnecting with
    /// backoff. Each received full map goes to `on_update`; `on_state`
    /// observes stream up/down transitions. Both handlers return futures
    /// so they can reach into async state.
    pub async fn run_sync<U, UFut, S, SFut>(
        &self,
        mut on_update: U,
        on_state: S,
        cancel: CancellationToken,
    ) where
        U: FnMut(SyncResponse) -> UFut,
        UFut: std::future::Future<Output = ()>,
        S: Fn(bool) -> SFut,
        SFut: std::future::Future<Output = ()>,
    {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self.sync_session(&mut on_update, &on_state, &cancel, &mut backoff).await {
                Ok(()) => return, // cancelled
                Err(e) => debug!(error = %e, "sync stream failed"),
            }
            on_state(false).await;

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn sync_session<U, UFut, S, SFut>(
        &self,
        on_update: &mut U,
        on_state: &S,
        cancel: &CancellationToken,
        backoff: &mut Duration,
    ) -> Result<(), Status>
    where
        U: FnMut(SyncResponse) -> UFut,
        UFut: std::future::Future<Output = ()>,
        S: Fn(bool) -> SFut,
        SFut: std::future::Future<Output = ()>,
    {
        let mut framed = self.connect().await?;
        let server_key = Self::fetch_server_key(&mut framed).await?;

        let envelope = EncryptedMessage::seal(&SyncRequest {}, &server_key, &self.secret)?;
        framed
            .send(MgmtRequest::Sync(envelope))
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        info!(addr = %self.addr, "management sync stream open");
        on_state(true).await;

        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(MgmtResponse::Update(sealed))) => {
                        match sealed.open::<SyncResponse>(&server_key, &self.secret) {
                            Ok(update) => {
                                // A healthy stream resets the retry clock.
                                *backoff = BACKOFF_INITIAL;
                                on_update(update).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "discarding unopenable sync update");
                            }
                        }
                    }
                    Some(Ok(MgmtResponse::Failure(failure))) => {
                        return Err(failure.into());
                    }
                    Some(Ok(other)) => debug!("ignoring frame on sync stream: {other:?}"),
                    Some(Err(e)) => return Err(Status::unavailable(e.to_string())),
                    None => return Err(Status::unavailable("sync stream closed")),
                },
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}
