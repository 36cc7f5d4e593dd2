//! Toolgate wire protocol
//!
//! JSON-RPC 2.0 shaped records exchanged with the tool worker over its
//! stdin/stdout pipes. Every record is a single line of JSON; the newline
//! terminator is added by the writer and stripped by the reader, so nothing
//! in this crate deals with framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version carried in every request
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names understood by the worker
pub mod method {
    pub const LIST_TOOLS: &str = "listTools";
    pub const CALL_TOOL: &str = "callTool";
}

/// A request record written to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub id: String,
}

impl RpcRequest {
    /// Build a request for an arbitrary method
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.into(),
        }
    }

    /// `listTools` with empty params
    pub fn list_tools(id: impl Into<String>) -> Self {
        Self::new(id, method::LIST_TOOLS, Value::Object(Default::default()))
    }

    /// `callTool` for the named tool
    pub fn call_tool(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let params = serde_json::json!({
            "name": name.into(),
            "arguments": arguments,
        });
        Self::new(id, method::CALL_TOOL, params)
    }

    /// Serialize to a single record (no trailing newline)
    pub fn to_record(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Error object carried by a failed reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Reasons a worker output record is not a usable reply
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reply carries neither a result nor an error")]
    MissingOutcome,
}

/// A reply record read from the worker
///
/// The worker is not required to echo `id` or `jsonrpc`; both are optional so
/// that a bare `{"result": ...}` line is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Parse one output record as a reply
    ///
    /// The record is taken as raw bytes; invalid UTF-8 is a JSON error.
    pub fn parse(record: impl AsRef<[u8]>) -> Result<Self, ReplyError> {
        let response: RpcResponse = serde_json::from_slice(record.as_ref())?;
        if response.result.is_none() && response.error.is_none() {
            return Err(ReplyError::MissingOutcome);
        }
        Ok(response)
    }

    /// Correlation id as text, if the worker sent one
    ///
    /// `null` counts as absent. Numeric ids are rendered in decimal.
    pub fn correlation_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Split into the worker's result or its error object
    pub fn into_outcome(self) -> Result<Value, RpcError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}
