//! On-disk persistence.
//!
//! The whole deployment persists as one JSON document: every account with
//! its peers, keys, groups, rules, DNS settings, and routes. Writes are
//! synchronous and whole-file (temp file + rename) so a crash never leaves
//! a half-written store. A store that exists but does not parse is a fatal
//! startup error — silently starting empty would orphan every registered
//! peer.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::account::Account;

const STORE_FILE: &str = "store.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed reading store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed writing store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed encoding store: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredState {
    accounts: HashMap<String, Account>,
}

/// Whole-file JSON store.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoredState>,
}

impl FileStore {
    /// Open the store under `data_dir`, creating an empty one when no file
    /// exists yet.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref();
        let path = dir.join(STORE_FILE);

        let state = if path.exists() {
            let raw = fs::read(&path).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            let state: StoredState =
                serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?;
            info!(path = %path.display(), accounts = state.accounts.len(), "store loaded");
            state
        } else {
            fs::create_dir_all(dir).map_err(|source| StoreError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
            info!(path = %path.display(), "store initialized empty");
            StoredState::default()
        };

        Ok(FileStore { path, state: Mutex::new(state) })
    }

    /// All accounts, for loading into the account manager at startup.
    pub async fn accounts(&self) -> Vec<Account> {
        self.state.lock().await.accounts.values().cloned().collect()
    }

    /// Write `account` through to disk. The caller holds the account lock,
    /// so successive writes of one account are serialized.
    pub async fn save_account(&self, account: &Account) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.accounts.insert(account.id.clone(), account.clone());
        self.persist(&state)
    }

    fn persist(&self, state: &StoredState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
