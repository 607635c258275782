//! JSON-RPC message shapes spoken between a bridge host and a served queue.
//!
//! The host may call exactly two methods: [`POLL`] and [`RELEASE`]. Posting
//! events is not reachable over the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::{ContractViolation, QueueError};

pub const POLL: &str = "poll";
pub const RELEASE: &str = "release";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// The poll broke the single-consumer contract; `data` names the violation.
pub const CONTRACT_VIOLATION: i64 = -32001;
/// The queue has been released; nothing is left to poll or release.
pub const TARGET_GONE: i64 = -32002;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollParams {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorBody {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// The violation carried in `data`, if this is a contract-violation error.
    #[must_use]
    pub fn contract_violation(&self) -> Option<ContractViolation> {
        if self.code != CONTRACT_VIOLATION {
            return None;
        }
        self.data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok())
    }
}

impl From<QueueError> for ErrorBody {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Released => Self::new(TARGET_GONE, err.to_string()),
            QueueError::Contract(violation) => Self {
                code: CONTRACT_VIOLATION,
                message: err.to_string(),
                data: serde_json::to_value(violation).ok(),
            },
        }
    }
}

/// A response frame. `result` is `null` both for "no events in the window"
/// and for acknowledgements, so it is only meaningful when `error` is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error: None,
        }
    }

    pub fn err(id: u64, error: ErrorBody) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Value::Null,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, ErrorBody> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}
