//! Typed request/response/notify RPC over one multiplexed stream.
//!
//! Every message is a length-prefixed JSON envelope. Both peers may act as
//! caller and callee over the same stream; correlation is by `id`, which
//! only ever appears on requests and responses.

pub mod router;
pub mod session;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use router::{Router, RpcHandler};
pub use session::{attach, CallError, RpcClient, RpcConfig, RpcStreamHandler};

/// Structured error carried inside a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Error codes produced by the session itself (handlers add their own).
pub const CODE_UNKNOWN_TYPE_ID: &str = "unknown_type_id";
pub const CODE_INTERNAL_ERROR: &str = "internal_error";
pub const CODE_CANCELED: &str = "canceled";

/// The wire envelope. `t` selects the shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Envelope {
    #[serde(rename = "req")]
    Request {
        id: u32,
        type_id: u32,
        payload: Value,
    },
    #[serde(rename = "res")]
    Response {
        id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    #[serde(rename = "note")]
    Note { type_id: u32, payload: Value },
}
