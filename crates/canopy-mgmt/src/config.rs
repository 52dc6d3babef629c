//! Service configuration.
//!
//! Loaded from a JSON file; the binary's flags override the listen address
//! and data directory. The overlay section (STUN/TURN/signal endpoints) is
//! handed verbatim to peers at login and in every initial sync.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use canopy_proto::wire::{HostConfig, OverlayConfig, Protocol, RelayHostConfig};
use serde::{Deserialize, Serialize};

use crate::turn::TurnRefresh;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the management service listens on.
    pub listen_addr: SocketAddr,
    /// Directory holding the JSON store and the service key.
    pub data_dir: PathBuf,
    #[serde(default)]
    pub stuns: Vec<HostConfig>,
    #[serde(default)]
    pub turns: Vec<RelayHostConfig>,
    /// Time-based TURN credential settings; disabled by default.
    #[serde(default)]
    pub turn_refresh: TurnRefresh,
    pub signal: HostConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The endpoints handed to every peer.
    pub fn overlay(&self) -> OverlayConfig {
        OverlayConfig {
            stuns: self.stuns.clone(),
            turns: self.turns.clone(),
            signal: self.signal.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "0.0.0.0:33073".parse().unwrap_or_else(|_| unreachable!()),
            data_dir: PathBuf::from("/var/lib/canopy"),
            stuns: vec![HostConfig {
                uri: "stun:stun.l.google.com:19302".into(),
                protocol: Protocol::Udp,
            }],
            turns: vec![],
            turn_refresh: TurnRefresh::default(),
            signal: HostConfig {
                uri: "signal.canopy.local:10000".into(),
                protocol: Protocol::Tcp,
            },
        }
    }
}
