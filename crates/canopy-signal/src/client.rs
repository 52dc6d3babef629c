//! Engine-side relay client.
//!
//! Owns one long-lived stream to the relay, reconnecting forever with
//! exponential backoff. Outbound messages are sealed to the destination
//! peer before they leave this module; inbound envelopes are opened here
//! and handed to the engine as [`SignalEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use canopy_proto::wire::{
    encode_credentials, ConnectRequest, EncryptedMessage, SignalBody, SignalKind, SignalRequest,
    SignalResponse,
};
use canopy_proto::{Code, FrameCodec, PublicKey, SecretKey, Status};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Initial reconnect delay.
const BACKOFF_INITIAL: Duration = Duration::from_millis(800);
/// Reconnect delay ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(3);

/// Something the relay delivered for us.
#[derive(Debug)]
pub enum SignalEvent {
    Message { from: PublicKey, body: SignalBody },
}

/// Handle the engine uses to signal remote peers.
#[derive(Clone)]
pub struct SignalHandle {
    secret: Arc<SecretKey>,
    out_tx: mpsc::UnboundedSender<EncryptedMessage>,
    connected: watch::Receiver<bool>,
}

impl SignalHandle {
    /// Send our connection offer (local ICE credentials) to `remote`.
    pub fn send_offer(&self, remote: &PublicKey, ufrag: &str, pwd: &str) -> Result<(), Status> {
        self.send_body(
            remote,
            SignalBody { kind: SignalKind::Offer, payload: encode_credentials(ufrag, pwd) },
        )
    }

    /// Answer a remote offer with our local ICE credentials.
    pub fn send_answer(&self, remote: &PublicKey, ufrag: &str, pwd: &str) -> Result<(), Status> {
        self.send_body(
            remote,
            SignalBody { kind: SignalKind::Answer, payload: encode_credentials(ufrag, pwd) },
        )
    }

    /// Forward a discovered local candidate to `remote`.
    pub fn send_candidate(&self, remote: &PublicKey, candidate: &str) -> Result<(), Status> {
        self.send_body(
            remote,
            SignalBody { kind: SignalKind::Candidate, payload: candidate.to_owned() },
        )
    }

    fn send_body(&self, remote: &PublicKey, body: SignalBody) -> Result<(), Status> {
        let envelope = EncryptedMessage::seal(&body, remote, &self.secret)?.to(*remote);
        self.out_tx
            .send(envelope)
            .map_err(|_| Status::unavailable("signal client is shut down"))
    }

    /// Observe the stream state; `true` while the relay stream is live.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

/// Spawn the relay client. Delivered messages arrive on `events`; the
/// returned handle sends. The task runs until `cancel` fires.
pub fn spawn(
    addr: String,
    secret: SecretKey,
    events: mpsc::UnboundedSender<SignalEvent>,
    cancel: CancellationToken,
) -> SignalHandle {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (connected_tx, connected_rx) = watch::channel(false);
    let secret = Arc::new(secret);

    let handle = SignalHandle {
        secret: secret.clone(),
        out_tx,
        connected: connected_rx,
    };

    tokio::spawn(run(addr, secret, out_rx, events, connected_tx, cancel));
    handle
}

async fn run(
    addr: String,
    secret: Arc<SecretKey>,
    mut out_rx: mpsc::UnboundedReceiver<EncryptedMessage>,
    events: mpsc::UnboundedSender<SignalEvent>,
    connected_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match session(&addr, &secret, &mut out_rx, &events, &connected_tx, &cancel).await {
            Ok(()) => {
                // Clean close (shutdown or displacement): retry promptly.
                backoff = BACKOFF_INITIAL;
            }
            Err(e) => {
                debug!(%addr, error = %e, "signal: session failed");
            }
        }
        let _ = connected_tx.send(false);

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// One connect-and-stream session. Returns `Ok` on an orderly close.
async fn session(
    addr: &str,
    secret: &SecretKey,
    out_rx: &mut mpsc::UnboundedReceiver<EncryptedMessage>,
    events: &mpsc::UnboundedSender<SignalEvent>,
    connected_tx: &watch::Sender<bool>,
    cancel: &CancellationToken,
) -> Result<(), Status> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, FrameCodec::<SignalRequest, SignalResponse>::new());

    framed
        .send(SignalRequest::GetServerKey)
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;
    let server_key = match framed.next().await {
        Some(Ok(SignalResponse::ServerKey(sk))) => sk.key,
        Some(Ok(other)) => {
            return Err(Status::internal(format!("expected server key, got {other:?}")))
        }
        Some(Err(e)) => return Err(Status::unavailable(e.to_string())),
        None => return Err(Status::unavailable("relay closed during handshake")),
    };

    let connect = EncryptedMessage::seal(&ConnectRequest {}, &server_key, secret)?;
    framed
        .send(SignalRequest::Connect(connect))
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;
    match framed.next().await {
        Some(Ok(SignalResponse::Connected)) => {}
        Some(Ok(SignalResponse::Failure(failure))) => return Err(failure.into()),
        Some(Ok(other)) => {
            return Err(Status::internal(format!("unexpected connect reply: {other:?}")))
        }
        Some(Err(e)) => return Err(Status::unavailable(e.to_string())),
        None => return Err(Status::unavailable("relay closed during connect")),
    }

    let _ = connected_tx.send(true);
    info!(%addr, "signal: stream connected");

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(envelope) => {
                    framed
                        .send(SignalRequest::Send(envelope))
                        .await
                        .map_err(|e| Status::unavailable(e.to_string()))?;
                }
                None => return Ok(()),
            },
            frame = framed.next() => match frame {
                Some(Ok(SignalResponse::Message(envelope))) => {
                    match envelope.open::<SignalBody>(&envelope.key, secret) {
                        Ok(body) => {
                            let _ = events.send(SignalEvent::Message { from: envelope.key, body });
                        }
                        Err(e) => {
                            warn!(from = ?envelope.key, error = %e, "signal: discarding unopenable message");
                        }
                    }
                }
                Some(Ok(SignalResponse::Failure(failure))) if failure.code == Code::NotConnected => {
                    // The destination peer is simply offline; the next
                    // connection retry re-signals.
                    debug!("signal: destination not connected, message dropped");
                }
                Some(Ok(SignalResponse::Failure(failure))) => {
                    return Err(failure.into());
                }
                Some(Ok(other)) => {
                    debug!("signal: ignoring frame {other:?}");
                }
                Some(Err(e)) => return Err(Status::unavailable(e.to_string())),
                None => return Err(Status::unavailable("relay stream closed")),
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}
