//! JSON-encoded control commands: connection setup, introspection, and
//! name-registry management (§4.1, §4.8).
//!
//! `Send`/`Recv` carry a binary [`crate::protocol::Header`] + items payload
//! because they're on the hot path and already have a purpose-built TLV
//! format (§4.3). Everything else here is low-frequency and irregularly
//! shaped (optional fields, string lists), which is exactly the split the
//! teacher draws in `broker/protocol.rs`: `HubControl`/`BrokerControl` carry
//! JSON-encoded enums for session/config commands, while `PtyInput`/
//! `PtyOutput` stay raw binary for the data path. Carried in a frame whose
//! type byte is one of the `HELLO`/`CONN_INFO`/`NAME_*` constants in
//! `protocol::frame_type`; the payload bytes are this module's
//! `serde_json`-encoded request or reply.

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// A request carried in a `HELLO` / `CONN_INFO` / `NAME_*` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ControlRequest {
    /// Open a connection on the bus (§4.1). `activator_name` is required
    /// (and only meaningful) when `flags` sets `hello_flags::ACTIVATOR`.
    Hello { flags: u64, activator_name: Option<String>, label: Option<String> },
    /// Describe a connection by id or by the name it currently owns.
    ConnInfo { target: ConnInfoTarget, flags: u64 },
    /// Acquire a well-known name (§4.8).
    NameAcquire { name: String, flags: u32 },
    /// Release a name this connection owns or is queued behind.
    NameRelease { name: String },
    /// List every registered name and its owner/activator.
    NameList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnInfoTarget {
    Id(u64),
    Name(String),
}

/// One row of a `NameList` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NameListing {
    pub name: String,
    pub owner: Option<u64>,
    pub activator: Option<u64>,
}

/// A reply carried in the matching `*_REPLY` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result")]
pub enum ControlReply {
    Hello { id: u64 },
    ConnInfo { id: u64, flags: u64, names: Vec<String>, label: Option<String> },
    NameAcquireOwner { sequence: u64 },
    NameAcquireQueued,
    NameReleaseOk,
    NameList { names: Vec<NameListing> },
    /// Anything else failed; `status` is the matching [`crate::protocol::status`]
    /// byte for callers that want to match on the kind without parsing `message`.
    Error { status: u8, message: String },
}

impl ControlReply {
    pub fn from_error(err: &BusError) -> Self {
        ControlReply::Error { status: crate::protocol::error_status(err), message: err.to_string() }
    }
}

pub fn encode_request(req: &ControlRequest) -> Vec<u8> {
    serde_json::to_vec(req).expect("ControlRequest is always representable as JSON")
}

pub fn decode_request(bytes: &[u8]) -> Result<ControlRequest, BusError> {
    serde_json::from_slice(bytes).map_err(|e| BusError::Internal(format!("malformed control request: {e}")))
}

pub fn encode_reply(reply: &ControlReply) -> Vec<u8> {
    serde_json::to_vec(reply).expect("ControlReply is always representable as JSON")
}

pub fn decode_reply(bytes: &[u8]) -> Result<ControlReply, BusError> {
    serde_json::from_slice(bytes).map_err(|e| BusError::Internal(format!("malformed control reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_request_round_trips() {
        let req = ControlRequest::Hello { flags: 3, activator_name: Some("com.example.Svc".into()), label: None };
        let bytes = encode_request(&req);
        let decoded = decode_request(&bytes).unwrap();
        match decoded {
            ControlRequest::Hello { flags, activator_name, label } => {
                assert_eq!(flags, 3);
                assert_eq!(activator_name.as_deref(), Some("com.example.Svc"));
                assert!(label.is_none());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn name_list_reply_round_trips() {
        let reply = ControlReply::NameList {
            names: vec![NameListing { name: "a".into(), owner: Some(1), activator: None }],
        };
        let bytes = encode_reply(&reply);
        let decoded = decode_reply(&bytes).unwrap();
        match decoded {
            ControlReply::NameList { names } => assert_eq!(names.len(), 1),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn error_reply_carries_matching_status_byte() {
        let reply = ControlReply::from_error(&BusError::NoSuchAddress);
        match reply {
            ControlReply::Error { status, .. } => assert_eq!(status, crate::protocol::status::NO_SUCH_ADDRESS),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn malformed_request_bytes_are_rejected() {
        assert!(decode_request(b"not json").is_err());
    }
}
