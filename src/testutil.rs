//! Test utilities: controllable mock MCP backends.
//!
//! Each mock is a real axum server bound to 127.0.0.1:0, speaking either the
//! SSE transport (GET /sse + POST /messages) or the streamable-HTTP
//! transport (POST /mcp). Tests drive failures by flipping flags: drop the
//! live stream, fail every request, swallow calls, add latency.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::protocol::{HEADER_SESSION_ID, JsonRpcRequest, JsonRpcResponse, methods};
use crate::registry::{BackendDescriptor, TransportKind};

pub struct MockState {
    tools: Vec<Value>,
    pub init_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub call_calls: AtomicUsize,
    /// Added latency before a tools/call response, in milliseconds.
    pub call_delay_ms: AtomicU64,
    /// Swallow tools/call requests (no reply ever), for deadline tests.
    pub never_reply: AtomicBool,
    /// Fail every HTTP request with 500, for health-flip tests.
    pub fail_all: AtomicBool,
    /// Canned tools/call results per tool name.
    canned_results: Mutex<HashMap<String, Value>>,
    /// Canned tools/call errors per tool name (forwarded-verbatim tests).
    canned_errors: Mutex<HashMap<String, crate::protocol::RpcError>>,
    /// Live SSE streams (SSE transport only).
    sse_streams: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
}

impl MockState {
    fn new(tools: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            tools,
            init_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            call_calls: AtomicUsize::new(0),
            call_delay_ms: AtomicU64::new(0),
            never_reply: AtomicBool::new(false),
            fail_all: AtomicBool::new(false),
            canned_results: Mutex::new(HashMap::new()),
            canned_errors: Mutex::new(HashMap::new()),
            sse_streams: Mutex::new(Vec::new()),
        })
    }

    pub fn set_canned_result(&self, tool: &str, result: Value) {
        self.canned_results
            .lock()
            .unwrap()
            .insert(tool.to_string(), result);
    }

    pub fn set_canned_error(&self, tool: &str, code: i64, message: &str) {
        self.canned_errors.lock().unwrap().insert(
            tool.to_string(),
            crate::protocol::RpcError {
                code,
                message: message.to_string(),
                data: None,
            },
        );
    }

    /// Compute the JSON-RPC reply for a request. Notifications yield None.
    fn respond_to(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone()?;
        let response = match request.method.as_str() {
            methods::INITIALIZE => {
                self.init_calls.fetch_add(1, Ordering::SeqCst);
                JsonRpcResponse::ok(
                    Some(id),
                    json!({
                        "protocolVersion": "2025-06-18",
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": "mock-backend", "version": "0.0.0" },
                    }),
                )
            }
            methods::TOOLS_LIST => {
                self.list_calls.fetch_add(1, Ordering::SeqCst);
                JsonRpcResponse::ok(Some(id), json!({ "tools": self.tools }))
            }
            methods::TOOLS_CALL => {
                self.call_calls.fetch_add(1, Ordering::SeqCst);
                if self.never_reply.load(Ordering::SeqCst) {
                    return None;
                }
                let name = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .cloned()
                    .unwrap_or(Value::Null);
                if let Some(error) = self.canned_errors.lock().unwrap().get(&name).cloned() {
                    return Some(JsonRpcResponse::err(Some(id), error));
                }
                let canned = self.canned_results.lock().unwrap().get(&name).cloned();
                let result = canned
                    .unwrap_or_else(|| json!({ "tool": name, "arguments": arguments }));
                JsonRpcResponse::ok(Some(id), result)
            }
            other => JsonRpcResponse::err(
                Some(id),
                crate::protocol::RpcError {
                    code: -32601,
                    message: format!("method '{other}' not found"),
                    data: None,
                },
            ),
        };
        Some(response)
    }

    /// Push a frame to every live SSE stream.
    fn push_frame(&self, response: &JsonRpcResponse) {
        let data = serde_json::to_string(response).unwrap();
        let frame = Bytes::from(format!("event: message\ndata: {data}\n\n"));
        self.sse_streams
            .lock()
            .unwrap()
            .retain(|tx| tx.send(frame.clone()).is_ok());
    }
}

pub struct MockBackendServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    transport: TransportKind,
    server: tokio::task::JoinHandle<()>,
}

impl MockBackendServer {
    pub async fn spawn_sse(tools: Vec<Value>) -> Self {
        let state = MockState::new(tools);
        let app = Router::new()
            .route("/sse", get(sse_get))
            .route("/messages", post(messages_post))
            .with_state(Arc::clone(&state));
        let (addr, server) = serve(app).await;
        Self {
            addr,
            state,
            transport: TransportKind::Sse,
            server,
        }
    }

    pub async fn spawn_http(tools: Vec<Value>) -> Self {
        let state = MockState::new(tools);
        let app = Router::new()
            .route("/mcp", post(mcp_post))
            .with_state(Arc::clone(&state));
        let (addr, server) = serve(app).await;
        Self {
            addr,
            state,
            transport: TransportKind::StreamableHttp,
            server,
        }
    }

    pub fn sse_url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport
    }

    pub fn url(&self) -> String {
        match self.transport {
            TransportKind::Sse => self.sse_url(),
            TransportKind::StreamableHttp => format!("http://{}/mcp", self.addr),
        }
    }

    pub fn descriptor(&self, id: &str) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            url: self.url(),
            transport: self.transport,
            display_name: None,
            tags: Vec::new(),
            registered_at: chrono::Utc::now(),
        }
    }

    /// Kill all live SSE streams. The client sees a server EOF, as if the
    /// backend restarted.
    pub fn drop_sse_stream(&self) {
        self.state.sse_streams.lock().unwrap().clear();
    }

    pub fn shutdown(&self) {
        self.server.abort();
    }
}

async fn serve(app: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock server addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, server)
}

/// Build a tool definition the way backends publish them.
pub fn tool_json(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": { "type": "object", "properties": {} },
    })
}

// --- SSE transport handlers ---

async fn sse_get(State(state): State<Arc<MockState>>) -> Response {
    if state.fail_all.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    let session = Uuid::new_v4().simple().to_string();
    let _ = tx.send(Bytes::from(format!(
        "event: endpoint\ndata: /messages?session_id={session}\n\n"
    )));
    state.sse_streams.lock().unwrap().push(tx);

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn messages_post(State(state): State<Arc<MockState>>, body: Bytes) -> Response {
    if state.fail_all.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let Ok(request) = serde_json::from_slice::<JsonRpcRequest>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if let Some(response) = state.respond_to(&request) {
        let delay = state.call_delay_ms.load(Ordering::SeqCst);
        let is_call = request.method == methods::TOOLS_CALL;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if is_call && delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            state.push_frame(&response);
        });
    }
    StatusCode::ACCEPTED.into_response()
}

// --- Streamable-HTTP transport handler ---

async fn mcp_post(
    State(state): State<Arc<MockState>>,
    _headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.fail_all.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let Ok(request) = serde_json::from_slice::<JsonRpcRequest>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if request.is_notification() {
        // Deliberately no Content-Type, exercising the lenient path.
        return StatusCode::ACCEPTED.into_response();
    }

    let Some(response) = state.respond_to(&request) else {
        // Swallowed call: hold the connection open well past any deadline.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        return StatusCode::ACCEPTED.into_response();
    };

    if request.method == methods::TOOLS_CALL {
        let delay = state.call_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(HEADER_SESSION_ID, "mock-session-1")
        .body(Body::from(serde_json::to_vec(&response).unwrap()))
        .unwrap()
}
