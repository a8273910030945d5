//! Gateway error taxonomy with stable JSON-RPC codes.
//!
//! Every client-visible error carries its kind, a correlation id that also
//! appears in the server logs, and (for backend failures) enough context
//! for an operator to act on.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::protocol::RpcError;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed JSON, missing method, bad envelope types.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method '{0}' not found")]
    MethodNotFound(String),

    /// Policy rejections: argument size/shape limits, quota exhaustion.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("caller '{caller}' is not permitted to call tool '{tool}'")]
    Forbidden { caller: String, tool: String },

    #[error("tool '{0}' not found in the catalog")]
    ToolNotFound(String),

    #[error("tool name '{0}' is ambiguous; use the backend-prefixed name")]
    Ambiguous(String),

    #[error("backend '{backend}' is unhealthy: {last_error}")]
    BackendUnhealthy { backend: String, last_error: String },

    #[error("transport to backend '{backend}' failed: {reason}")]
    Transport { backend: String, reason: String },

    #[error("call deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("call was cancelled")]
    Cancelled,

    #[error("internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable JSON-RPC error code. The standard range covers envelope
    /// problems; gateway-specific conditions live in −32030…−32036.
    pub fn code(&self) -> i64 {
        match self {
            GatewayError::InvalidRequest(_) => -32600,
            GatewayError::MethodNotFound(_) => -32601,
            GatewayError::InvalidParams(_) => -32602,
            GatewayError::Internal(_) => -32603,
            GatewayError::Forbidden { .. } => -32030,
            GatewayError::ToolNotFound(_) => -32031,
            GatewayError::Ambiguous(_) => -32032,
            GatewayError::BackendUnhealthy { .. } => -32033,
            GatewayError::Transport { .. } => -32034,
            GatewayError::DeadlineExceeded(_) => -32035,
            GatewayError::Cancelled => -32036,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::MethodNotFound(_) => "method_not_found",
            GatewayError::InvalidParams(_) => "invalid_params",
            GatewayError::Forbidden { .. } => "forbidden",
            GatewayError::ToolNotFound(_) => "not_found",
            GatewayError::Ambiguous(_) => "ambiguous",
            GatewayError::BackendUnhealthy { .. } => "backend_unhealthy",
            GatewayError::Transport { .. } => "transport_error",
            GatewayError::DeadlineExceeded(_) => "deadline_exceeded",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Render as a JSON-RPC error object. The correlation id matches the
    /// log line emitted where the error was raised.
    pub fn to_rpc_error(&self, correlation_id: &str) -> RpcError {
        let mut data = json!({
            "kind": self.kind(),
            "correlation_id": correlation_id,
        });
        if let GatewayError::BackendUnhealthy { backend, last_error } = self {
            data["backend_id"] = json!(backend);
            data["last_error"] = json!(last_error);
        }
        if let GatewayError::Transport { backend, .. } = self {
            data["backend_id"] = json!(backend);
        }
        RpcError {
            code: self.code(),
            message: self.to_string(),
            data: Some(data),
        }
    }
}
