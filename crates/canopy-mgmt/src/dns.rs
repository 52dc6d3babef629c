//! Account DNS settings.
//!
//! Administrators define custom zones and nameserver groups; the network
//! map computation projects them into the wire `DnsConfig` each peer
//! receives. Nameserver groups are scoped to peer groups, and at most one
//! group is flagged primary (the catch-all resolver).

use canopy_proto::wire::{self, CustomZone};
use canopy_proto::{PublicKey, Status};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::group::Group;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsSettings {
    pub service_enabled: bool,
    #[serde(default)]
    pub custom_zones: Vec<CustomZone>,
    #[serde(default)]
    pub nameserver_groups: Vec<NameServerGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServerGroup {
    pub id: String,
    pub name: String,
    pub nameservers: Vec<String>,
    /// Match domains; empty means this group only serves as primary.
    pub domains: Vec<String>,
    pub primary: bool,
    /// Peer groups this nameserver set applies to.
    pub distribution_groups: Vec<String>,
}

impl DnsSettings {
    /// Reject settings with more than one primary nameserver group.
    pub fn validate(&self) -> Result<(), Status> {
        let primaries = self.nameserver_groups.iter().filter(|g| g.primary).count();
        if primaries > 1 {
            return Err(Status::invalid_argument(
                "at most one nameserver group may be primary",
            ));
        }
        Ok(())
    }

    /// Project these settings into the wire config for one peer.
    ///
    /// Custom zones go to everyone; a nameserver group goes to a peer when
    /// it has no distribution groups or when any of them contains the peer.
    pub fn config_for(&self, peer: &PublicKey, groups: &HashMap<String, Group>) -> wire::DnsConfig {
        let nameserver_groups = self
            .nameserver_groups
            .iter()
            .filter(|ns| {
                ns.distribution_groups.is_empty()
                    || ns
                        .distribution_groups
                        .iter()
                        .any(|gid| groups.get(gid).is_some_and(|g| g.contains(peer)))
            })
            .map(|ns| wire::NameServerGroup {
                id: ns.id.clone(),
                name: ns.name.clone(),
                nameservers: ns.nameservers.clone(),
                domains: ns.domains.clone(),
                primary: ns.primary,
            })
            .collect();

        wire::DnsConfig {
            service_enabled: self.service_enabled,
            custom_zones: self.custom_zones.clone(),
            nameserver_groups,
        }
    }
}
