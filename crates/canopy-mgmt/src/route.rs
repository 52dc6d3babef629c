//! Network routes distributed through the map.

use canopy_proto::wire;
use canopy_proto::PublicKey;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRoute {
    pub id: String,
    /// Destination network reachable through the routing peer.
    pub network: Ipv4Net,
    /// The peer that forwards traffic for `network`.
    pub peer: PublicKey,
    pub metric: u32,
    pub masquerade: bool,
    pub enabled: bool,
}

impl StoredRoute {
    pub fn new(network: Ipv4Net, peer: PublicKey) -> Self {
        StoredRoute {
            id: Uuid::new_v4().simple().to_string(),
            network,
            peer,
            metric: 100,
            masquerade: true,
            enabled: true,
        }
    }

    pub fn to_wire(&self) -> wire::Route {
        wire::Route {
            id: self.id.clone(),
            network: self.network.to_string(),
            peer: self.peer,
            metric: self.metric,
            masquerade: self.masquerade,
        }
    }
}
