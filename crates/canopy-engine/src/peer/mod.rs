//! Per-peer connection machinery.

pub mod conn;
pub mod status;

pub use conn::{ConnConfig, ConnStatus, PeerConn};
pub use status::{FullStatus, PeerState, StatusRecorder};
