//! Wire protocol for the canopy control plane.
//!
//! Everything that travels between a client and the management or signal
//! service lives here: the static X25519 identity keys, the sealed-box
//! encryption between two static keys, the tagged JSON frame types, the
//! newline-delimited framing codec, and the status codes both services
//! answer errors with.
//!
//! Frames are JSON text, one per line. Bodies that carry account or
//! signaling state are sealed — the frame only ever shows the sender's
//! public key and ciphertext.

pub mod codec;
pub mod keys;
pub mod sealed;
pub mod status;
pub mod wire;

pub use codec::{CodecError, FrameCodec};
pub use keys::{PublicKey, SecretKey, KEY_SIZE};
pub use sealed::{open, open_message, seal, seal_message};
pub use status::{Code, Status};
