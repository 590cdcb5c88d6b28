//! Kernel-originated notification payloads (§4.6 "reply-timed-out", §4.7
//! "reply-dead" / `ID_REMOVE`, §4.8 name-owner-changed).
//!
//! Carried as a single `Metadata` item on an otherwise-empty
//! kernel-originated message (`send.rs::OutboundMessage::notify`), encoded
//! as JSON for the same reason `control.rs` encodes Hello/ConnInfo/Name*
//! that way: these are low-frequency, irregularly-shaped control events,
//! not hot-path payload bytes.

use serde::{Deserialize, Serialize};

use crate::error::BusError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Notification {
    /// §4.7 step 4: a message drained from a disconnecting connection's
    /// own queue had an expecting sender; that sender never gets its
    /// answer.
    ReplyDead { cookie: u64 },
    /// §4.6: an async reply slot's deadline elapsed before a match.
    ReplyTimedOut { cookie: u64 },
    /// §4.7 step 6: bus-wide notice that a connection id is gone.
    IdRemove { id: u64 },
    /// §4.8: a well-known name changed hands.
    NameOwnerChanged { name: String, old_owner: Option<u64>, new_owner: u64, sequence: u64 },
}

impl Notification {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Notification is always representable as JSON")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Internal(format!("malformed notification: {e}")))
    }
}
