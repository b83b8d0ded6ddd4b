use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// A chat message as broadcast to every member of a room.
///
/// Built once when the hub boundary receives it and shared read-only
/// (behind an `Arc`) with every mailbox afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub message: String,
    pub when: DateTime<Utc>,
}

impl Message {
    /// Attributes `body` to `sender` and timestamps it with the current time.
    pub fn stamped(sender: &Identity, body: String) -> Self {
        Self {
            name: sender.name.clone(),
            avatar_url: sender.avatar_url.clone(),
            message: body,
            when: Utc::now(),
        }
    }
}

/// The payload a peer sends.
///
/// Peers may echo `name`, `avatar_url` or `when` back; those fields are
/// ignored because attribution comes from the connection's identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message: String,
}
