//! Inbound message type, decoupled from the transport.

use chrono::{DateTime, Utc};

/// One inbound event from the messaging platform.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub user_id: i64,
    /// Chat the message arrived in (negative = group, positive = DM).
    pub chat_id: i64,
    pub username: Option<String>,
    pub display_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}
