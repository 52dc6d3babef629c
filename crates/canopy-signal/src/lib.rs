//! canopy signal relay.
//!
//! Forwards small sealed messages (connection offers, answers, and
//! candidates) between two peers that cannot yet reach each other. The
//! relay is stateless beyond its table of live streams: it never opens the
//! peer-to-peer payloads, never persists anything, and drops messages for
//! peers that are not connected.

pub mod client;
pub mod registry;
pub mod server;

pub use client::{SignalEvent, SignalHandle};
pub use registry::StreamRegistry;
pub use server::SignalServer;

/// Metric: messages forwarded to a live destination stream.
pub const MESSAGES_FORWARDED: &str = "canopy_signal_messages_forwarded_total";
/// Metric: messages dropped because the destination was not connected.
pub const MESSAGES_DROPPED: &str = "canopy_signal_messages_dropped_total";
/// Metric: currently registered streams (gauge).
pub const STREAMS_ACTIVE: &str = "canopy_signal_streams_active";
