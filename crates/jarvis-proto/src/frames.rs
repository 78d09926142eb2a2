// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The three-frame WebSocket protocol between clients and the hub.
//!
//! Exactly one JSON value per text message, discriminated by `type`:
//!
//! ```text
//! Client                              Hub
//!    │                                 │
//!    │── {type:"req", id, method} ────►│
//!    │◄─ {type:"res", id, result} ─────│
//!    │                                 │
//!    │◄─ {type:"event", event, ...} ───│  (unsolicited, fan-out)
//! ```
//!
//! Clients originate requests and receive events; the hub originates
//! responses and events.  Responses may complete out of send order — clients
//! match by `id`.  Malformed frames are dropped silently by the receiver.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes carried in [`ErrorBody::code`].
///
/// The set is intentionally small; free-text detail goes in `message`.
pub mod code {
    pub const INVALID_REQUEST: u32 = 400;
    pub const UNAUTHORIZED: u32 = 401;
    pub const NOT_FOUND: u32 = 404;
    pub const METHOD_NOT_FOUND: u32 = 405;
    pub const RATE_LIMITED: u32 = 429;
    pub const INTERNAL: u32 = 500;
    pub const PROVIDER_ERROR: u32 = 502;
}

/// One WebSocket frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Res {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Event { event: String, payload: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

impl Frame {
    /// A successful response to request `id`.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Frame::Res {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// An error response to request `id`.
    pub fn err(id: impl Into<String>, code: u32, message: impl Into<String>) -> Self {
        Frame::Res {
            id: id.into(),
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// An unsolicited event frame.
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Frame::Event {
            event: event.into(),
            payload,
        }
    }

    /// Decode one text message.  Unknown `type` tags and malformed JSON are
    /// both decode errors — the caller drops the frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> String {
        // Frame serialization cannot fail: all fields are JSON-native.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip() {
        let f = Frame::Req {
            id: "r1".into(),
            method: "tasks.create".into(),
            params: Some(json!({"title": "t"})),
        };
        let text = f.encode();
        match Frame::decode(&text).unwrap() {
            Frame::Req { id, method, params } => {
                assert_eq!(id, "r1");
                assert_eq!(method, "tasks.create");
                assert_eq!(params.unwrap()["title"], "t");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn request_params_are_optional() {
        let f = Frame::decode(r#"{"type":"req","id":"1","method":"agents.list"}"#).unwrap();
        match f {
            Frame::Req { params, .. } => assert!(params.is_none()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ok_response_omits_error_field() {
        let text = Frame::ok("1", json!({"x": 1})).encode();
        assert!(!text.contains("error"));
    }

    #[test]
    fn err_response_carries_code_and_message() {
        let f = Frame::err("9", code::METHOD_NOT_FOUND, "no such method");
        match Frame::decode(&f.encode()).unwrap() {
            Frame::Res { id, error, result } => {
                assert_eq!(id, "9");
                assert!(result.is_none());
                let e = error.unwrap();
                assert_eq!(e.code, code::METHOD_NOT_FOUND);
                assert_eq!(e.message, "no such method");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn event_round_trip() {
        let f = Frame::event("task.updated", json!({"id": "t1"}));
        match Frame::decode(&f.encode()).unwrap() {
            Frame::Event { event, payload } => {
                assert_eq!(event, "task.updated");
                assert_eq!(payload["id"], "t1");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        assert!(Frame::decode(r#"{"type":"nope","id":"1"}"#).is_err());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(Frame::decode("{not json").is_err());
    }
}
