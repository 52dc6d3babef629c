//! Data-path selection and the userspace UDP splice.
//!
//! After the agent selects a pair, exactly one of two paths comes up:
//!
//! - **Direct**: the tunnel device's peer endpoint is set to the remote's
//!   socket and the device talks to it natively.
//! - **Proxy**: a process-local splice pumps bytes between the agent's UDP
//!   socket and the device's own UDP port on loopback.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use canopy_proto::Status;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ice::{Candidate, CandidateType};

/// Which data path to bring up for a selected pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Direct,
    Proxy,
}

/// Decide the data path from the selected pair.
///
/// Direct needs an address the tunnel device can send to on its own:
/// either side holding a public host address, or both sides on the same
/// private network. Anything through a relay, and any reflexive-only
/// reachability, goes through the proxy. Pure by construction — the IP
/// classifier is injected.
pub fn decide_path(
    local: &Candidate,
    remote: &Candidate,
    is_public: impl Fn(&IpAddr) -> bool,
) -> PathKind {
    if local.typ == CandidateType::Relay || remote.typ == CandidateType::Relay {
        return PathKind::Proxy;
    }

    let local_public = is_public(&local.addr.ip());
    let remote_public = is_public(&remote.addr.ip());

    if remote.typ == CandidateType::Host && remote_public {
        return PathKind::Direct;
    }
    if local.typ == CandidateType::Host && local_public {
        return PathKind::Direct;
    }
    if local.typ == CandidateType::Host
        && remote.typ == CandidateType::Host
        && !local_public
        && !remote_public
    {
        // Same private network.
        return PathKind::Direct;
    }

    PathKind::Proxy
}

/// Whether an address is publicly routable.
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                // CGNAT range 100.64.0.0/10, where overlay addresses live.
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                // link-local fe80::/10 and unique-local fc00::/7
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00)
        }
    }
}

/// Bidirectional pump between the agent's socket and the local tunnel
/// port.
///
/// The wg-side socket is bound on loopback and connected to the device's
/// UDP port; its local address is what the device should use as the peer
/// endpoint so return traffic lands back in the splice.
pub struct UdpSplice {
    wg_side_addr: SocketAddr,
    cancel: CancellationToken,
}

impl UdpSplice {
    /// Start pumping. `ice_socket` carries peer traffic to/from
    /// `remote_addr`; `wg_port` is the local tunnel device's UDP port.
    pub async fn start(
        ice_socket: Arc<UdpSocket>,
        remote_addr: SocketAddr,
        wg_port: u16,
    ) -> Result<Self, Status> {
        let wg_side = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        wg_side.connect(("127.0.0.1", wg_port)).await?;
        let wg_side_addr = wg_side.local_addr()?;

        let cancel = CancellationToken::new();

        // Peer → tunnel.
        {
            let ice_socket = ice_socket.clone();
            let wg_side = wg_side.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 65_535];
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        received = ice_socket.recv_from(&mut buf) => match received {
                            Ok((len, from)) => {
                                // Late connectivity-check retries from the
                                // peer may still arrive; only tunnel
                                // payload from the selected address counts.
                                if from != remote_addr {
                                    trace!(%from, "splice: dropping stray datagram");
                                    continue;
                                }
                                if wg_side.send(&buf[..len]).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "splice: peer-side receive failed");
                                return;
                            }
                        },
                    }
                }
            });
        }

        // Tunnel → peer.
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 65_535];
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        received = wg_side.recv(&mut buf) => match received {
                            Ok(len) => {
                                if ice_socket.send_to(&buf[..len], remote_addr).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "splice: tunnel-side receive failed");
                                return;
                            }
                        },
                    }
                }
            });
        }

        Ok(UdpSplice { wg_side_addr, cancel })
    }

    /// The endpoint to configure on the tunnel device for this peer.
    pub fn wg_endpoint(&self) -> SocketAddr {
        self.wg_side_addr
    }

    /// Stop both pumps.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UdpSplice {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::Candidate;

    fn host(addr: &str) -> Candidate {
        Candidate::host(addr.parse().unwrap())
    }

    fn srflx(addr: &str) -> Candidate {
        Candidate::server_reflexive(addr.parse().unwrap())
    }

    fn relay(addr: &str) -> Candidate {
        Candidate::relay(addr.parse().unwrap())
    }

    #[test]
    fn relay_on_either_side_forces_proxy() {
        assert_eq!(
            decide_path(&relay("203.0.113.1:1"), &host("203.0.113.2:1"), is_public_ip),
            PathKind::Proxy
        );
        assert_eq!(
            decide_path(&host("203.0.113.1:1"), &relay("10.0.0.2:1"), is_public_ip),
            PathKind::Proxy
        );
    }

    #[test]
    fn public_remote_host_goes_direct() {
        assert_eq!(
            decide_path(&host("10.0.0.1:1"), &host("203.0.113.2:1"), is_public_ip),
            PathKind::Direct
        );
    }

    #[test]
    fn public_local_host_goes_direct() {
        assert_eq!(
            decide_path(&host("203.0.113.1:1"), &srflx("10.0.0.2:1"), is_public_ip),
            PathKind::Direct
        );
    }

    #[test]
    fn both_private_hosts_go_direct() {
        assert_eq!(
            decide_path(&host("192.168.1.10:1"), &host("192.168.1.20:1"), is_public_ip),
            PathKind::Direct
        );
    }

    #[test]
    fn reflexive_only_reachability_is_proxied() {
        assert_eq!(
            decide_path(&srflx("203.0.113.1:1"), &srflx("203.0.113.2:1"), is_public_ip),
            PathKind::Proxy
        );
        assert_eq!(
            decide_path(&host("10.0.0.1:1"), &srflx("203.0.113.2:1"), is_public_ip),
            PathKind::Proxy
        );
    }

    #[test]
    fn ip_classification() {
        let public: IpAddr = "203.0.113.7".parse().unwrap();
        let private: IpAddr = "192.168.0.1".parse().unwrap();
        let cgnat: IpAddr = "100.64.0.5".parse().unwrap();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(is_public_ip(&public));
        assert!(!is_public_ip(&private));
        assert!(!is_public_ip(&cgnat));
        assert!(!is_public_ip(&loopback));
        assert!(!is_public_ip(&"fe80::1".parse().unwrap()));
        assert!(!is_public_ip(&"fd00::1".parse().unwrap()));
        assert!(is_public_ip(&"2001:db8::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn splice_pumps_both_directions() {
        // Fake tunnel device: a loopback socket.
        let wg = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let wg_port = wg.local_addr().unwrap().port();

        // Fake remote peer.
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        // The agent's socket.
        let ice_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let ice_addr = ice_socket.local_addr().unwrap();

        let splice = UdpSplice::start(ice_socket, peer_addr, wg_port).await.unwrap();

        // Peer → tunnel.
        peer.send_to(b"from-peer", ice_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = wg.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"from-peer");
        assert_eq!(from, splice.wg_endpoint());

        // Tunnel → peer: reply to the splice's wg-side endpoint.
        wg.send_to(b"from-wg", splice.wg_endpoint()).await.unwrap();
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"from-wg");
        assert_eq!(from, ice_addr);

        splice.close();
    }

    #[tokio::test]
    async fn splice_drops_datagrams_from_strangers() {
        let wg = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let wg_port = wg.local_addr().unwrap().port();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ice_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let ice_addr = ice_socket.local_addr().unwrap();

        let _splice = UdpSplice::start(ice_socket, peer.local_addr().unwrap(), wg_port)
            .await
            .unwrap();

        stranger.send_to(b"intruder", ice_addr).await.unwrap();
        peer.send_to(b"legit", ice_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = wg.recv_from(&mut buf).await.unwrap();
        // Only the legitimate datagram comes through.
        assert_eq!(&buf[..len], b"legit");
    }
}
