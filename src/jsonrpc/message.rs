//! JSON-RPC 2.0 message structures
//!
//! This module defines the wire envelope the daemon exchanges with its
//! clients, plus the strongly-typed views derived from it once its shape
//! is known.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// The only protocol version we accept on the wire
pub const JSONRPC_VERSION: &str = "2.0";

/// Numeric identifier correlating a request with its response
pub type Id = i64;

// JSON-RPC error codes (standard codes)
pub mod error_codes {
    /// Parse error - Invalid JSON was received
    pub const PARSE_ERROR: i64 = -32700;
    /// Invalid Request - The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i64 = -32600;
    /// Method not found - The requested method doesn't exist
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid parameters - Method exists but parameters are wrong
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error - Internal JSON-RPC error
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// The wire envelope
///
/// Every frame on every transport decodes into one of these. Which optional
/// fields are present decides whether it is a request, a notification or a
/// response, see [`Message::kind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Must be "2.0"; left empty when the peer omitted it so we can reject it
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<Value>,
    /// A present `null` is a valid result, so it decodes to `Some(Value::Null)`
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Distinguishes "field absent" from "field is null"
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Shape of a decoded message
#[derive(Debug)]
pub enum MessageKind {
    Request(Request),
    Notification(Notification),
    Response { id: Id, outcome: Result<Value, RpcError> },
    /// A response carrying neither `result` nor `error`
    InvalidResponse { id: Id },
    /// Neither method nor id: nothing we can do with it
    Unroutable,
}

impl Message {
    /// Build a request envelope
    pub fn request(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: Some(method.into()),
            params,
            ..Self::default()
        }
    }

    /// Build a notification envelope
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Some(method.into()),
            params,
            ..Self::default()
        }
    }

    /// Build a successful response
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Build an error response
    pub fn failure(id: Id, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Whether the peer set the mandatory version marker
    pub fn has_valid_version(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
    }

    /// Whether this envelope answers a call (has a result or an error)
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// Consume the envelope into its typed view
    pub fn kind(self) -> MessageKind {
        match (self.method, self.id) {
            (Some(method), Some(id)) => MessageKind::Request(Request {
                id,
                method,
                params: self.params,
            }),
            (Some(method), None) => MessageKind::Notification(Notification {
                method,
                params: self.params,
            }),
            (None, Some(id)) => match (self.error, self.result) {
                // A non-nil error takes priority over a result
                (Some(error), _) => MessageKind::Response {
                    id,
                    outcome: Err(error),
                },
                (None, Some(result)) => MessageKind::Response {
                    id,
                    outcome: Ok(result),
                },
                (None, None) => MessageKind::InvalidResponse { id },
            },
            (None, None) => MessageKind::Unroutable,
        }
    }

    /// Serialize to a single-line JSON frame (no separator)
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a single frame
    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

/// A request: expects exactly one reply carrying the same id
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Id,
    pub method: String,
    pub params: Option<Value>,
}

/// A notification: one-way, never replied to
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Stable numeric code a client can branch on
    pub code: i64,
    /// Short human-readable message
    pub message: String,
    /// Free-form diagnostic payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a data payload
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method '{}' not found", method),
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "json-rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
