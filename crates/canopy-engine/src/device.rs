//! The tunnel device seam.
//!
//! The WireGuard device itself is an external collaborator; the engine
//! only needs this narrow surface. [`MockDevice`] records every call and
//! backs both the test suite and unprivileged runs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use canopy_proto::{PublicKey, SecretKey, Status};
use tokio::sync::Mutex;

#[async_trait::async_trait]
pub trait TunDevice: Send + Sync {
    /// Bind the device with its key and listen port. Failure here is fatal
    /// to the engine.
    async fn configure(
        &self,
        private_key: &SecretKey,
        address: &str,
        listen_port: u16,
    ) -> Result<(), Status>;

    /// Add or update a peer. `endpoint = None` leaves the data path to a
    /// userspace proxy feeding the device's own UDP port.
    async fn upsert_peer(
        &self,
        peer: &PublicKey,
        allowed_ips: &[String],
        endpoint: Option<SocketAddr>,
        keepalive: Option<Duration>,
    ) -> Result<(), Status>;

    async fn remove_peer(&self, peer: &PublicKey) -> Result<(), Status>;

    /// The UDP port the device reads encrypted traffic from; proxy splices
    /// terminate here on loopback.
    fn udp_port(&self) -> u16;
}

/// A peer entry as last written to the mock device.
#[derive(Debug, Clone, PartialEq)]
pub struct MockPeerEntry {
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<SocketAddr>,
    pub keepalive: Option<Duration>,
}

#[derive(Default)]
struct MockState {
    configured: Option<(String, u16)>,
    peers: HashMap<PublicKey, MockPeerEntry>,
}

/// In-memory device for tests and unprivileged runs.
pub struct MockDevice {
    state: Mutex<MockState>,
    udp_port: u16,
}

impl MockDevice {
    pub fn new(udp_port: u16) -> Self {
        MockDevice { state: Mutex::new(MockState::default()), udp_port }
    }

    pub async fn peer(&self, key: &PublicKey) -> Option<MockPeerEntry> {
        self.state.lock().await.peers.get(key).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn configured(&self) -> Option<(String, u16)> {
        self.state.lock().await.configured.clone()
    }
}

#[async_trait::async_trait]
impl TunDevice for MockDevice {
    async fn configure(
        &self,
        _private_key: &SecretKey,
        address: &str,
        listen_port: u16,
    ) -> Result<(), Status> {
        self.state.lock().await.configured = Some((address.to_owned(), listen_port));
        Ok(())
    }

    async fn upsert_peer(
        &self,
        peer: &PublicKey,
        allowed_ips: &[String],
        endpoint: Option<SocketAddr>,
        keepalive: Option<Duration>,
    ) -> Result<(), Status> {
        self.state.lock().await.peers.insert(
            *peer,
            MockPeerEntry { allowed_ips: allowed_ips.to_vec(), endpoint, keepalive },
        );
        Ok(())
    }

    async fn remove_peer(&self, peer: &PublicKey) -> Result<(), Status> {
        self.state.lock().await.peers.remove(peer);
        Ok(())
    }

    fn udp_port(&self) -> u16 {
        self.udp_port
    }
}
