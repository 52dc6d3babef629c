//! Access rules.
//!
//! A rule connects a source group to a destination group. The network map
//! computation turns the account's enabled rules into peer visibility:
//! two peers appear in each other's maps iff some enabled rule links
//! groups containing them in the rule's direction.

use std::collections::{HashMap, HashSet};

use canopy_proto::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::group::Group;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    /// Source reaches destination only.
    SrcToDst,
    /// Traffic permitted both ways.
    Bidirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Accept,
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: String,
    pub name: String,
    pub disabled: bool,
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub direction: RuleDirection,
    pub action: RuleAction,
}

impl AccessRule {
    /// The default all-to-all rule every new account starts with.
    pub fn default_rule(all_group_id: impl Into<String>) -> Self {
        let id = all_group_id.into();
        AccessRule {
            id: Uuid::new_v4().simple().to_string(),
            name: "Default".into(),
            disabled: false,
            sources: vec![id.clone()],
            destinations: vec![id],
            direction: RuleDirection::Bidirect,
            action: RuleAction::Accept,
        }
    }
}

/// Compute the set of peers visible to `peer` under the account's rules.
///
/// A remote peer is visible when an enabled Accept rule places `peer` in
/// its sources and the remote in its destinations, or the reverse for
/// bidirectional rules. Drop rules only withhold visibility (they do not
/// override an Accept from another rule).
pub fn visible_peers(
    peer: &PublicKey,
    rules: &[AccessRule],
    groups: &HashMap<String, Group>,
) -> HashSet<PublicKey> {
    let mut visible = HashSet::new();

    for rule in rules {
        if rule.disabled || rule.action != RuleAction::Accept {
            continue;
        }
        let in_sources = rule
            .sources
            .iter()
            .any(|gid| groups.get(gid).is_some_and(|g| g.contains(peer)));
        let in_destinations = rule
            .destinations
            .iter()
            .any(|gid| groups.get(gid).is_some_and(|g| g.contains(peer)));

        if in_sources {
            for gid in &rule.destinations {
                if let Some(group) = groups.get(gid) {
                    visible.extend(group.peers.iter().copied());
                }
            }
        }
        if in_destinations && rule.direction == RuleDirection::Bidirect {
            for gid in &rule.sources {
                if let Some(group) = groups.get(gid) {
                    visible.extend(group.peers.iter().copied());
                }
            }
        }
    }

    visible.remove(peer);
    visible
}
