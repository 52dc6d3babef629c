//! Static X25519 identity keys.
//!
//! A peer's identity is its WireGuard public key: 32 bytes, written as
//! standard base64 everywhere a key appears in text (config files, wire
//! frames, logs). The private key is generated locally and never leaves
//! the host.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::status::{Code, Status};

/// Size of an X25519 key in bytes.
pub const KEY_SIZE: usize = 32;

/// A peer's public identity key.
///
/// Ordered by raw key bytes. The ordering is total and identical on every
/// host, which is what the connection controller election relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Parse a base64-encoded key, the WireGuard text form.
    pub fn parse(s: &str) -> Result<Self, Status> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|_| Status::new(Code::InvalidArgument, "public key is not valid base64"))?;
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Status::new(Code::InvalidArgument, "public key must be 32 bytes"))?;
        Ok(PublicKey(arr))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys are long; the first 8 characters are enough to tell peers
        // apart in log output.
        let full = BASE64.encode(self.0);
        write!(f, "PublicKey({}…)", &full[..8.min(full.len())])
    }
}

impl FromStr for PublicKey {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublicKey::parse(s)
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<X25519Public> for PublicKey {
    fn from(key: X25519Public) -> Self {
        PublicKey(key.to_bytes())
    }
}

impl From<&PublicKey> for X25519Public {
    fn from(key: &PublicKey) -> Self {
        X25519Public::from(key.0)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A locally held private key.
#[derive(Clone)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        SecretKey(StaticSecret::random_from_rng(&mut OsRng))
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        SecretKey(StaticSecret::from(bytes))
    }

    /// Parse a base64-encoded private key.
    pub fn parse(s: &str) -> Result<Self, Status> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|_| Status::new(Code::InvalidArgument, "private key is not valid base64"))?;
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Status::new(Code::InvalidArgument, "private key must be 32 bytes"))?;
        Ok(SecretKey(StaticSecret::from(arr)))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.0).to_bytes())
    }

    /// Base64 text form, for writing into a config file.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }

    pub(crate) fn diffie_hellman(&self, remote: &PublicKey) -> [u8; KEY_SIZE] {
        self.0.diffie_hellman(&X25519Public::from(remote)).to_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(…)")
    }
}
