//! Header names used by the relay protocol.

/// Per-request participant identifier, exactly [`crate::CLIENT_ID_LENGTH`] characters.
pub const CLIENT_ID: &str = "x-keyexchange-id";

/// Set on the `new_channel` response; carries the allocated channel id.
pub const CHANNEL: &str = "x-keyexchange-channel";

/// Channel to tear down when posting a report.
pub const REPORT_CHANNEL: &str = "x-keyexchange-cid";

/// Report message (joined with the request body, if any).
pub const REPORT_LOG: &str = "x-keyexchange-log";
