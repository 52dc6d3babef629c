//! The relay service.
//!
//! A connection may ask for the server key and send messages without ever
//! registering; `Connect` upgrades it to a receive stream. Registration
//! requires opening the sealed connect body under the claimed sender key —
//! possession of the matching private key is the whole authentication.

use std::net::SocketAddr;
use std::sync::Arc;

use canopy_proto::wire::{
    ConnectRequest, EncryptedMessage, ServerKey, SignalRequest, SignalResponse,
};
use canopy_proto::{Code, FrameCodec, SecretKey, Status};
use chrono::{Duration, Utc};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::StreamRegistry;
use crate::{MESSAGES_DROPPED, MESSAGES_FORWARDED};

type SignalFramed = Framed<TcpStream, FrameCodec<SignalResponse, SignalRequest>>;

pub struct SignalServer {
    key: SecretKey,
    registry: Arc<StreamRegistry>,
    shutdown: CancellationToken,
}

impl SignalServer {
    pub fn new(key: SecretKey, shutdown: CancellationToken) -> Self {
        SignalServer {
            key,
            registry: Arc::new(StreamRegistry::new()),
            shutdown,
        }
    }

    pub fn public_key(&self) -> canopy_proto::PublicKey {
        self.key.public_key()
    }

    pub fn registry(&self) -> Arc<StreamRegistry> {
        self.registry.clone()
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        info!(%addr, "signal: listening");

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                debug!(%peer_addr, error = %e, "signal: connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "signal: accept error"),
                },
                _ = self.shutdown.cancelled() => {
                    info!("signal: shutting down");
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
        let mut framed = Framed::new(stream, FrameCodec::<SignalResponse, SignalRequest>::new());

        while let Some(frame) = framed.next().await {
            match frame? {
                SignalRequest::GetServerKey => {
                    framed
                        .send(SignalResponse::ServerKey(ServerKey {
                            key: self.key.public_key(),
                            expires_at: Utc::now() + Duration::hours(24),
                        }))
                        .await?;
                }
                SignalRequest::Send(envelope) => {
                    self.relay(&mut framed, envelope).await?;
                }
                SignalRequest::Connect(envelope) => {
                    match self.authenticate(&envelope) {
                        Ok(()) => {
                            // The stream session owns the connection now.
                            self.serve_stream(&mut framed, envelope.key, peer_addr).await;
                            return Ok(());
                        }
                        Err(status) => {
                            debug!(%peer_addr, error = %status, "signal: connect rejected");
                            framed.send(SignalResponse::Failure(status.into())).await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn authenticate(&self, envelope: &EncryptedMessage) -> Result<(), Status> {
        let _: ConnectRequest = envelope
            .open(&envelope.key, &self.key)
            .map_err(|_| Status::unauthenticated("connect body did not open under the sender key"))?;
        Ok(())
    }

    /// Forward one message; a missing destination is a non-fatal
    /// `NotConnected` answer to the sender.
    async fn relay(
        &self,
        framed: &mut SignalFramed,
        envelope: EncryptedMessage,
    ) -> Result<(), canopy_proto::CodecError> {
        let Some(destination) = envelope.remote_key else {
            framed
                .send(SignalResponse::Failure(
                    Status::invalid_argument("send frame has no destination key").into(),
                ))
                .await?;
            return Ok(());
        };

        if self.registry.forward(&destination, envelope).await {
            counter!(MESSAGES_FORWARDED).increment(1);
        } else {
            counter!(MESSAGES_DROPPED).increment(1);
            debug!(peer = ?destination, "signal: destination not connected, dropped");
            framed
                .send(SignalResponse::Failure(
                    Status::new(Code::NotConnected, "destination peer is not connected").into(),
                ))
                .await?;
        }
        Ok(())
    }

    async fn serve_stream(
        &self,
        framed: &mut SignalFramed,
        peer: canopy_proto::PublicKey,
        peer_addr: SocketAddr,
    ) {
        let (mut rx, generation) = self.registry.register(peer).await;
        if framed.send(SignalResponse::Connected).await.is_err() {
            self.registry.deregister(&peer, generation).await;
            return;
        }
        info!(peer = ?peer, %peer_addr, "signal: stream open");

        loop {
            tokio::select! {
                forwarded = rx.recv() => match forwarded {
                    Some(message) => {
                        if framed.send(SignalResponse::Message(message)).await.is_err() {
                            break;
                        }
                    }
                    // Displaced by a newer stream for the same key.
                    None => break,
                },
                frame = framed.next() => match frame {
                    Some(Ok(SignalRequest::Send(envelope))) => {
                        if self.relay(framed, envelope).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(SignalRequest::GetServerKey)) => {
                        let reply = SignalResponse::ServerKey(ServerKey {
                            key: self.key.public_key(),
                            expires_at: Utc::now() + Duration::hours(24),
                        });
                        if framed.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(SignalRequest::Connect(_))) => {
                        debug!(peer = ?peer, "signal: ignoring repeated connect");
                    }
                    Some(Err(e)) => {
                        debug!(peer = ?peer, error = %e, "signal: stream error");
                        break;
                    }
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.registry.deregister(&peer, generation).await;
        info!(peer = ?peer, "signal: stream closed");
    }
}
