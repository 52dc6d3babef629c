//! Sealed bodies between two static keys.
//!
//! Authenticated public-key encryption: X25519 ECDH between the sender's
//! private key and the receiver's public key, HKDF-SHA256 to derive the
//! AEAD key, ChaCha20-Poly1305 with a random 12-byte nonce prepended to
//! the ciphertext. Because the shared secret is symmetric, the same pair
//! of keys opens messages in either direction — the management service
//! and a peer seal to each other, and two peers seal their signaling
//! bodies end to end so the relay only ever sees ciphertext.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;

use crate::keys::{PublicKey, SecretKey};
use crate::status::{Code, Status};

/// Size of the AEAD nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the Poly1305 authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const HKDF_INFO: &[u8] = b"canopy sealed body v1";

fn derive_key(shared: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = [0u8; 32];
    // Output length is fixed and valid for SHA-256, expand cannot fail.
    hk.expand(HKDF_INFO, &mut key)
        .unwrap_or_else(|_| unreachable!("32 bytes is a valid HKDF-SHA256 output length"));
    key
}

/// Seal `plaintext` from `local` to `remote`.
///
/// Returns nonce || ciphertext || tag.
pub fn seal(plaintext: &[u8], remote: &PublicKey, local: &SecretKey) -> Result<Vec<u8>, Status> {
    let key = derive_key(&local.diffie_hellman(remote));
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| Status::new(Code::Internal, format!("cipher init: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Status::new(Code::Internal, format!("seal: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed body produced by [`seal`] with the mirrored key pair.
///
/// Fails with `Unauthenticated` when the body was not sealed between these
/// two keys or has been tampered with.
pub fn open(sealed: &[u8], remote: &PublicKey, local: &SecretKey) -> Result<Vec<u8>, Status> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Status::new(Code::Unauthenticated, "sealed body too short"));
    }

    let key = derive_key(&local.diffie_hellman(remote));
    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| Status::new(Code::Internal, format!("cipher init: {e}")))?;

    let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &sealed[NONCE_SIZE..])
        .map_err(|_| Status::new(Code::Unauthenticated, "sealed body failed to open"))
}

/// Seal a JSON-serializable message body.
pub fn seal_message<T: Serialize>(
    msg: &T,
    remote: &PublicKey,
    local: &SecretKey,
) -> Result<Vec<u8>, Status> {
    let plaintext = serde_json::to_vec(msg)
        .map_err(|e| Status::new(Code::Internal, format!("encode body: {e}")))?;
    seal(&plaintext, remote, local)
}

/// Open and decode a JSON message body.
pub fn open_message<T: DeserializeOwned>(
    sealed: &[u8],
    remote: &PublicKey,
    local: &SecretKey,
) -> Result<T, Status> {
    let plaintext = open(sealed, remote, local)?;
    serde_json::from_slice(&plaintext)
        .map_err(|_| Status::new(Code::InvalidArgument, "malformed message body"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_between_two_parties() {
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();

        let sealed = seal(b"over the wall", &bob.public_key(), &alice).unwrap();
        let opened = open(&sealed, &alice.public_key(), &bob).unwrap();
        assert_eq!(opened, b"over the wall");
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();
        let eve = SecretKey::generate();

        let sealed = seal(b"secret", &bob.public_key(), &alice).unwrap();
        let err = open(&sealed, &alice.public_key(), &eve).unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[test]
    fn tampered_body_fails_to_open() {
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();

        let mut sealed = seal(b"secret", &bob.public_key(), &alice).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open(&sealed, &alice.public_key(), &bob).is_err());
    }

    #[test]
    fn short_body_is_rejected() {
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();
        assert!(open(&[0u8; 10], &alice.public_key(), &bob).is_err());
    }

    #[test]
    fn message_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Body {
            n: u64,
            s: String,
        }

        let alice = SecretKey::generate();
        let bob = SecretKey::generate();

        let body = Body { n: 7, s: "hi".into() };
        let sealed = seal_message(&body, &bob.public_key(), &alice).unwrap();
        let opened: Body = open_message(&sealed, &alice.public_key(), &bob).unwrap();
        assert_eq!(opened, body);
    }
}
