//! Metric name constants.
//!
//! Call sites use these constants rather than raw strings so renames stay
//! centralized.

/// Updates dropped because the destination peer had no live mailbox.
pub const UPDATES_DROPPED: &str = "canopy_mgmt_updates_dropped_total";
/// Updates dropped because the destination mailbox was full.
pub const UPDATES_OVERFLOWED: &str = "canopy_mgmt_updates_overflowed_total";
/// Updates successfully enqueued to a peer mailbox.
pub const UPDATES_SENT: &str = "canopy_mgmt_updates_sent_total";
/// Currently open sync streams (gauge).
pub const STREAMS_ACTIVE: &str = "canopy_mgmt_sync_streams_active";
/// Total login requests handled.
pub const LOGINS: &str = "canopy_mgmt_login_requests_total";
/// Total sync streams opened.
pub const SYNCS: &str = "canopy_mgmt_sync_requests_total";
