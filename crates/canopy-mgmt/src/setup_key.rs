//! Setup keys: the credential an unregistered host presents to join an
//! account.
//!
//! Keys are UUID-form tokens compared case-insensitively — lookups always
//! lower-case first. A key is valid iff it is not revoked, not expired, and
//! (for one-off keys) has never been used.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default lifetime for a newly generated key.
pub const DEFAULT_KEY_DURATION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupKeyType {
    /// Registers exactly one peer, then becomes invalid.
    OneOff,
    /// Registers any number of peers until revoked or expired.
    Reusable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupKey {
    pub id: String,
    /// The token itself, stored lower-cased.
    pub key: String,
    pub name: String,
    pub key_type: SetupKeyType,
    pub created_at: DateTime<Utc>,
    /// Absent means the key never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub usage_count: u64,
}

impl SetupKey {
    /// Generate a fresh key with the given lifetime. `expires_in = None`
    /// produces a key without expiry.
    pub fn generate(name: impl Into<String>, key_type: SetupKeyType, expires_in: Option<Duration>) -> Self {
        let now = Utc::now();
        SetupKey {
            id: Uuid::new_v4().simple().to_string(),
            key: Uuid::new_v4().to_string(),
            name: name.into(),
            key_type,
            created_at: now,
            expires_at: expires_in.map(|d| now + d),
            revoked: false,
            usage_count: 0,
        }
    }

    /// Default reusable key every new account starts with.
    pub fn default_key() -> Self {
        SetupKey::generate(
            "Default key",
            SetupKeyType::Reusable,
            Some(Duration::days(DEFAULT_KEY_DURATION_DAYS)),
        )
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at < now)
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.revoked || self.is_expired(now) {
            return false;
        }
        match self.key_type {
            SetupKeyType::OneOff => self.usage_count < 1,
            SetupKeyType::Reusable => true,
        }
    }
}

/// Canonical lookup form of a key token.
pub fn normalize(key: &str) -> String {
    key.trim().to_lowercase()
}
