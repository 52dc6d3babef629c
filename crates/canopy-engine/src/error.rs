//! Peer connection failures.

use canopy_proto::{PublicKey, Status};

/// Why a peer connection attempt ended.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection to {peer:?} timed out after {seconds}s waiting for remote credentials")]
    Timeout { peer: PublicKey, seconds: u64 },

    #[error("connection to {peer:?} was closed")]
    Closed { peer: PublicKey },

    #[error("connection to {peer:?} disconnected")]
    Disconnected { peer: PublicKey },

    #[error("connection to {peer:?} was already closed")]
    AlreadyClosed { peer: PublicKey },

    #[error(transparent)]
    Status(#[from] Status),
}

impl ConnError {
    /// True for the orderly endings that should not be retried.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnError::Closed { .. } | ConnError::AlreadyClosed { .. })
    }
}
