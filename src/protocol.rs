//! JSON-RPC 2.0 envelope types and MCP wire constants.
//!
//! The gateway transports result/error payloads as opaque `serde_json::Value`
//! so backend replies reach the client byte-for-byte (modulo key ordering).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version the gateway speaks. Treated as opaque and echoed; the
/// gateway does not negotiate down.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_PROTOCOL_VERSION: &str = "Mcp-Protocol-Version";

pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
pub const JSON_MIME_TYPE: &str = "application/json";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const LIST_SERVERS: &str = "management/list_servers";
}

/// JSON-RPC request id. Both strings and integers appear in the wild; the
/// gateway accepts either from clients and emits string ids (`g-NNN`) toward
/// backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.to_string(),
            params: Some(params),
        }
    }

    /// A request without an id, fire-and-forget per JSON-RPC 2.0.
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A tool definition as returned by a backend's `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

/// An inbound frame from a backend, after JSON parsing.
#[derive(Debug)]
pub enum BackendFrame {
    /// Carries `result` or `error`; routed to a pending sink by id.
    Response(JsonRpcResponse),
    /// Carries `method`: an unsolicited server notification or request.
    Notification(JsonRpcRequest),
}

/// Classify a parsed JSON value as a response or a notification. Returns
/// `None` for frames that are neither (logged and dropped by the caller).
pub fn classify_frame(value: Value) -> Option<BackendFrame> {
    let obj = value.as_object()?;
    if obj.contains_key("method") {
        serde_json::from_value(value).ok().map(BackendFrame::Notification)
    } else if obj.contains_key("result") || obj.contains_key("error") {
        serde_json::from_value(value).ok().map(BackendFrame::Response)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_untagged() {
        let n: RequestId = serde_json::from_str("42").unwrap();
        assert_eq!(n, RequestId::Number(42));

        let s: RequestId = serde_json::from_str("\"g-001\"").unwrap();
        assert_eq!(s, RequestId::String("g-001".to_string()));

        assert_eq!(serde_json::to_string(&n).unwrap(), "42");
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"g-001\"");
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcRequest::notification(methods::INITIALIZED, None);
        assert!(note.is_notification());
        let json = serde_json::to_value(&note).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_classify_response() {
        let frame = classify_frame(json!({
            "jsonrpc": "2.0", "id": "g-001", "result": {"hits": []}
        }));
        match frame {
            Some(BackendFrame::Response(resp)) => {
                assert_eq!(resp.id, Some(RequestId::String("g-001".into())));
                assert_eq!(resp.result, Some(json!({"hits": []})));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification() {
        let frame = classify_frame(json!({
            "jsonrpc": "2.0", "method": "notifications/tools/list_changed"
        }));
        match frame {
            Some(BackendFrame::Notification(note)) => {
                assert_eq!(note.method, "notifications/tools/list_changed");
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_garbage() {
        assert!(classify_frame(json!({"jsonrpc": "2.0"})).is_none());
        assert!(classify_frame(json!("just a string")).is_none());
    }

    #[test]
    fn test_error_response_roundtrip() {
        let resp = JsonRpcResponse::err(
            Some(7.into()),
            RpcError {
                code: -32034,
                message: "transport failed".to_string(),
                data: None,
            },
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"]["code"], -32034);
        assert!(json.get("result").is_none());

        let back: JsonRpcResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back.error.unwrap().code, -32034);
    }
}
