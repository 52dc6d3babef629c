//! Client configuration file.
//!
//! A JSON document next to the service state. First run generates the
//! private key; it never leaves this host.

use std::fs;
use std::path::Path;

use canopy_proto::{SecretKey, Status};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default tunnel device listen port.
pub const DEFAULT_WG_PORT: u16 = 51820;

fn default_wg_port() -> u16 {
    DEFAULT_WG_PORT
}

fn default_blacklist() -> Vec<String> {
    // Tunnel-ish interfaces we must never build a tunnel across.
    ["wt", "wg", "utun", "tun", "zt", "ts", "tailscale"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base64 X25519 private key.
    pub private_key: String,
    /// Management service address (`host:port`).
    pub management_addr: String,
    #[serde(default = "default_wg_port")]
    pub wg_port: u16,
    #[serde(default = "default_blacklist")]
    pub interface_blacklist: Vec<String>,
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Status> {
        let raw = fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw)
            .map_err(|e| Status::invalid_argument(format!("client config: {e}")))
    }

    /// Load the config, creating it with a fresh key when absent.
    pub fn load_or_create(path: impl AsRef<Path>, management_addr: &str) -> Result<Self, Status> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let config = ClientConfig {
            private_key: SecretKey::generate().to_base64(),
            management_addr: management_addr.to_owned(),
            wg_port: DEFAULT_WG_PORT,
            interface_blacklist: default_blacklist(),
        };
        config.save(path)?;
        info!(path = %path.display(), "client config created");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Status> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Status::internal(format!("encode client config: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn secret_key(&self) -> Result<SecretKey, Status> {
        SecretKey::parse(&self.private_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_create_is_stable() {
        let dir = std::env::temp_dir().join(format!("canopy-cfg-{}", rand::random::<u64>()));
        let path = dir.join("config.json");

        let first = ClientConfig::load_or_create(&path, "mgmt.example:33073").unwrap();
        let second = ClientConfig::load_or_create(&path, "ignored.example:1").unwrap();
        assert_eq!(first.private_key, second.private_key);
        assert_eq!(second.management_addr, "mgmt.example:33073");
        assert_eq!(second.wg_port, DEFAULT_WG_PORT);
        assert!(first.secret_key().is_ok());

        let _ = fs::remove_dir_all(&dir);
    }
}
