//! The account overlay network: subnet, address allocation, and the map
//! serial.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use canopy_proto::{Code, Status};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default overlay subnet for new accounts (the CGNAT range).
pub const DEFAULT_NET: &str = "100.64.0.0/10";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub net: Ipv4Net,
    /// Version of this account's network map. Strictly increasing; bumped
    /// by every mutation that changes what any peer's map contains.
    serial: u64,
}

impl Network {
    pub fn new() -> Self {
        Network {
            id: Uuid::new_v4().to_string(),
            // The literal is a valid CIDR, parse cannot fail.
            net: DEFAULT_NET.parse().unwrap_or_else(|_| unreachable!()),
            serial: 0,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Advance the serial. Call exactly once per map-visible mutation.
    pub fn bump_serial(&mut self) {
        self.serial += 1;
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::new()
    }
}

/// Pick the smallest free host address in `net`.
///
/// Linear scan over the host range checking against the taken set.
/// Accounts hold at most a few hundred peers, so the O(n) walk is cheaper
/// than maintaining an allocation structure; the caller serializes
/// allocations under the account lock.
pub fn allocate_peer_ip(net: Ipv4Net, taken: &[Ipv4Addr]) -> Result<Ipv4Addr, Status> {
    let taken: HashSet<&Ipv4Addr> = taken.iter().collect();
    net.hosts()
        .find(|host| !taken.contains(host))
        .ok_or_else(|| Status::new(Code::Internal, "account subnet exhausted"))
}
