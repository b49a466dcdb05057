//! Wire envelope and public message types.
//!
//! Stratum predates JSON-RPC 2.0 and bends its conventions: notifications
//! carry `id: null` instead of omitting the field, there is no version
//! field, and error payloads appear either as a `{code, message}` object
//! or as a positional `[code, "message", ...]` array depending on the
//! pool. A small custom envelope fits those quirks exactly; a spec
//! compliant JSON-RPC library would fight them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::Job;
use super::session::{ConnectionState, StatsSnapshot};

/// One newline-delimited JSON-RPC frame.
///
/// Variant order matters for untagged deserialization: `Call` requires a
/// `method` field, so responses (which have none) fall through to
/// `Reply`, while requests never match `Reply` first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Request (id present) or notification (id null or absent).
    Call {
        /// Correlation id; `None` marks a notification
        id: Option<u64>,
        /// Method name, e.g. "mining.notify"
        method: String,
        /// Positional parameters
        params: Value,
    },

    /// Response to a request we issued.
    Reply {
        /// Id of the matching request
        id: u64,
        /// Result value, present on success
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error value, present on failure
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl Envelope {
    /// Create a request frame.
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Envelope::Call {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Create a notification frame (no id).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Envelope::Call {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// The frame's id, if it carries one.
    pub fn id(&self) -> Option<u64> {
        match self {
            Envelope::Call { id, .. } => *id,
            Envelope::Reply { id, .. } => Some(*id),
        }
    }

    /// True for a request without an id.
    pub fn is_notification(&self) -> bool {
        matches!(self, Envelope::Call { id: None, .. })
    }

    /// Method name for calls.
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Call { method, .. } => Some(method),
            Envelope::Reply { .. } => None,
        }
    }
}

/// Error payload from the peer, normalized from either wire shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    /// Numeric error code
    pub code: i64,
    /// Error message
    pub message: String,
}

impl RpcError {
    /// Parse from whatever the pool sent.
    ///
    /// Accepts `{"code": n, "message": s}`, `[n, s, ...]`, or anything
    /// else (stringified with code 0) so a sloppy peer cannot make us
    /// lose the failure reason.
    pub fn from_value(value: &Value) -> Self {
        if let Some(obj) = value.as_object() {
            return Self {
                code: obj.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            };
        }
        if let Some(arr) = value.as_array() {
            return Self {
                code: arr.first().and_then(Value::as_i64).unwrap_or(0),
                message: arr
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            };
        }
        Self {
            code: 0,
            message: value.to_string(),
        }
    }
}

/// A proof candidate ready for `mining.submit`.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Worker name the share is credited to
    pub worker: String,

    /// Job the candidate was found against
    pub job_id: String,

    /// Extranonce2 used while searching
    pub extranonce2: Vec<u8>,

    /// Timestamp used in the header (epoch seconds)
    pub ntime: u32,

    /// Winning nonce
    pub nonce: u32,

    /// Resulting hash
    pub result: [u8; 32],
}

impl Submission {
    /// Positional params for the wire: [worker, job_id, nonce, result].
    pub(crate) fn to_wire_params(&self) -> Value {
        Value::Array(vec![
            Value::String(self.worker.clone()),
            Value::String(self.job_id.clone()),
            Value::String(format!("{:08x}", self.nonce)),
            Value::String(hex::encode(self.result)),
        ])
    }
}

/// Events emitted by the session for the orchestrator.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// Connection state machine moved
    StateChanged(ConnectionState),

    /// Transport established
    Connected {
        /// Pool host
        host: String,
        /// Pool port
        port: u16,
    },

    /// Transport gone; reason present for failures, absent for an
    /// intentional disconnect
    Disconnected(Option<String>),

    /// New work assignment
    NewJob(Job),

    /// Pool changed the share difficulty
    DifficultyChanged(f64),

    /// Outcome of a submitted share
    SubmitResult {
        /// Pool verdict
        accepted: bool,
        /// Job the share was for
        job_id: String,
        /// Nonce that was submitted
        nonce: u32,
    },

    /// Supervisor is about to retry the connection
    Reconnecting {
        /// Consecutive attempt number, starting at 1
        attempt: u32,
        /// Delay before this attempt
        delay: Duration,
    },

    /// Fresh counters
    StatsUpdated(StatsSnapshot),

    /// Non-fatal trouble worth surfacing
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip_preserves_id_method_params() {
        let msg = Envelope::request(7, "mining.submit", json!(["w", "j1", "0000abcd", "00ff"]));

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.id(), Some(7));
        assert_eq!(decoded.method(), Some("mining.submit"));
        match decoded {
            Envelope::Call { params, .. } => {
                let arr = params.as_array().unwrap();
                assert_eq!(arr.len(), 4);
                assert_eq!(arr[1], "j1");
            }
            _ => panic!("expected Call variant"),
        }
    }

    #[test]
    fn notification_with_null_id_parses() {
        let msg: Envelope =
            serde_json::from_str(r#"{"id":null,"method":"mining.set_difficulty","params":[512]}"#)
                .unwrap();
        assert!(msg.is_notification());
        assert_eq!(msg.method(), Some("mining.set_difficulty"));
    }

    #[test]
    fn notification_with_absent_id_parses() {
        let msg: Envelope =
            serde_json::from_str(r#"{"method":"mining.notify","params":[]}"#).unwrap();
        assert!(msg.is_notification());
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn response_parses_with_result() {
        let msg: Envelope = serde_json::from_str(r#"{"id":3,"result":true,"error":null}"#).unwrap();
        match msg {
            Envelope::Reply { id, result, error } => {
                assert_eq!(id, 3);
                assert_eq!(result, Some(json!(true)));
                assert_eq!(error, Some(Value::Null));
            }
            _ => panic!("expected Reply variant"),
        }
    }

    #[test]
    fn request_with_id_is_not_mistaken_for_reply() {
        let msg: Envelope =
            serde_json::from_str(r#"{"id":1,"method":"mining.authorize","params":["w","x"]}"#)
                .unwrap();
        assert_eq!(msg.method(), Some("mining.authorize"));
        assert!(!msg.is_notification());
    }

    #[test]
    fn serialized_notification_carries_null_id() {
        let msg = Envelope::notification("mining.set_difficulty", json!([1024]));
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"id\":null"));
    }

    #[test]
    fn rpc_error_from_object_form() {
        let err = RpcError::from_value(&json!({"code": 23, "message": "Low difficulty share"}));
        assert_eq!(err.code, 23);
        assert_eq!(err.message, "Low difficulty share");
    }

    #[test]
    fn rpc_error_from_array_form() {
        let err = RpcError::from_value(&json!([21, "Job not found", null]));
        assert_eq!(err.code, 21);
        assert_eq!(err.message, "Job not found");
    }

    #[test]
    fn rpc_error_from_garbage_keeps_something() {
        let err = RpcError::from_value(&json!("broken"));
        assert_eq!(err.code, 0);
        assert!(err.message.contains("broken"));
    }

    #[test]
    fn submission_wire_params_are_positional_hex() {
        let sub = Submission {
            worker: "rig1".to_string(),
            job_id: "job42".to_string(),
            extranonce2: vec![0xaa, 0xbb],
            ntime: 0x5f000000,
            nonce: 0xdeadbeef,
            result: [0x11; 32],
        };

        let params = sub.to_wire_params();
        let arr = params.as_array().unwrap();
        assert_eq!(arr.len(), 4);
        assert_eq!(arr[0], "rig1");
        assert_eq!(arr[1], "job42");
        assert_eq!(arr[2], "deadbeef");
        assert_eq!(arr[3].as_str().unwrap(), "11".repeat(32));
    }
}
