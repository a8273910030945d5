//! Router: accepts client JSON-RPC on `/mcp` (and `/management`), answers
//! the per-client MCP handshake locally, serves `tools/list` from the
//! catalog, and forwards `tools/call` to the owning backend session.
//!
//! Responses are framed as JSON or as a single SSE `message` event,
//! depending on what the client accepts. The SSE path writes through a
//! bounded per-call channel, so one slow client only backpressures its own
//! call.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{self, AccessControl, Identity};
use crate::catalog::{Resolution, ToolCatalog};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::protocol::{
    self, EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, JSON_MIME_TYPE, JsonRpcRequest,
    JsonRpcResponse, methods,
};
use crate::registry::BackendRegistry;
use crate::session::SessionError;
use crate::tracker::CallTracker;

/// Minimal per-client state: the negotiated protocol version, the in-flight
/// quota, and cancellation handles for outstanding calls. No application
/// state lives here.
pub struct ClientSession {
    pub id: String,
    pub protocol_version: String,
    inflight: Arc<Semaphore>,
    calls: DashMap<String, CancellationToken>,
}

impl ClientSession {
    fn new(id: String, protocol_version: String, quota: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            protocol_version,
            inflight: Arc::new(Semaphore::new(quota)),
            calls: DashMap::new(),
        })
    }
}

/// Removes a call's cancellation handle when the request future finishes,
/// including when the client connection goes away mid-call.
struct CallRegistration<'a> {
    client: &'a ClientSession,
    key: &'a str,
    cancel: &'a CancellationToken,
}

impl Drop for CallRegistration<'_> {
    fn drop(&mut self) {
        self.client.calls.remove(self.key);
        // A dropped request future (client disconnect) cancels the call.
        self.cancel.cancel();
    }
}

/// Shared gateway state wired through every handler.
pub struct Gateway {
    pub config: GatewayConfig,
    pub registry: Arc<BackendRegistry>,
    pub catalog: Arc<ToolCatalog>,
    pub acl: Arc<AccessControl>,
    pub tracker: Arc<CallTracker>,
    pub shutdown: Arc<Notify>,
    clients: DashMap<String, Arc<ClientSession>>,
    /// Shared context for clients that skip the handshake (plain curl, the
    /// original deployment's scripts).
    anonymous: Arc<ClientSession>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<BackendRegistry>,
        catalog: Arc<ToolCatalog>,
        acl: Arc<AccessControl>,
        tracker: Arc<CallTracker>,
        shutdown: Arc<Notify>,
    ) -> Arc<Self> {
        let anonymous = ClientSession::new(
            "anonymous".to_string(),
            protocol::PROTOCOL_VERSION.to_string(),
            config.max_inflight_per_client,
        );
        Arc::new(Self {
            config,
            registry,
            catalog,
            acl,
            tracker,
            shutdown,
            clients: DashMap::new(),
            anonymous,
        })
    }

    fn client_for(&self, headers: &HeaderMap) -> Arc<ClientSession> {
        headers
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .and_then(|sid| self.clients.get(sid).map(|e| Arc::clone(e.value())))
            .unwrap_or_else(|| Arc::clone(&self.anonymous))
    }

    fn identity_for(&self, headers: &HeaderMap) -> Identity {
        self.acl
            .identify(headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()))
    }
}

/// Build the full HTTP surface: MCP endpoint, management endpoint, admin API.
pub fn app(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/mcp", post(handle_rpc))
        .route("/management", post(handle_rpc))
        .merge(crate::admin::routes())
        .with_state(gateway)
}

/// A dispatched reply: produced locally or forwarded verbatim from a backend.
enum Reply {
    Local(Value),
    Backend(JsonRpcResponse),
    /// Local reply that must also set the client session header.
    Handshake { result: Value, session_id: String },
}

async fn handle_rpc(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let correlation_id = Uuid::new_v4().to_string();
            warn!(correlation_id = %correlation_id, error = %e, "malformed request body");
            let error = GatewayError::InvalidRequest(e.to_string());
            let envelope = JsonRpcResponse::err(None, error.to_rpc_error(&correlation_id));
            return json_response(StatusCode::BAD_REQUEST, &envelope, None);
        }
    };

    if request.is_notification() {
        handle_notification(&gateway, &headers, request);
        return StatusCode::ACCEPTED.into_response();
    }

    let client_id = request.id.clone();
    let client = gateway.client_for(&headers);
    let identity = gateway.identity_for(&headers);
    let correlation_id = Uuid::new_v4().to_string();

    let outcome = dispatch(&gateway, &client, &identity, &request).await;

    let mut session_header = None;
    let envelope = match outcome {
        Ok(Reply::Local(result)) => JsonRpcResponse::ok(client_id, result),
        Ok(Reply::Handshake { result, session_id }) => {
            session_header = Some(session_id);
            JsonRpcResponse::ok(client_id, result)
        }
        // Backend result/error pass through untouched, re-keyed to the
        // client's request id.
        Ok(Reply::Backend(backend)) => JsonRpcResponse {
            jsonrpc: protocol::JSONRPC_VERSION.to_string(),
            id: client_id,
            result: backend.result,
            error: backend.error,
        },
        Err(error) => {
            info!(
                correlation_id = %correlation_id,
                caller = %identity.label(),
                method = %request.method,
                kind = error.kind(),
                error = %error,
                "request failed"
            );
            JsonRpcResponse::err(client_id, error.to_rpc_error(&correlation_id))
        }
    };

    let mut response = respond(&headers, &envelope, session_header);
    // Echo the client's negotiated protocol version on every response.
    if let Ok(name) = header::HeaderName::try_from(protocol::HEADER_PROTOCOL_VERSION)
        && let Ok(value) = client.protocol_version.parse::<header::HeaderValue>()
    {
        response.headers_mut().insert(name, value);
    }
    response
}

fn handle_notification(gateway: &Arc<Gateway>, headers: &HeaderMap, request: JsonRpcRequest) {
    match request.method.as_str() {
        methods::INITIALIZED => {
            debug!("client session initialized");
        }
        methods::CANCELLED => {
            let client = gateway.client_for(headers);
            cancel_call(&client, request.params.as_ref());
        }
        other => {
            debug!(method = %other, "ignoring client notification");
        }
    }
}

/// `notifications/cancelled`: look up the in-flight call by the client's
/// request id and trip its cancellation token.
fn cancel_call(client: &ClientSession, params: Option<&Value>) {
    let key = params
        .and_then(|p| p.get("requestId").or_else(|| p.get("id")))
        .map(value_as_id_key);
    let Some(key) = key else {
        debug!("cancellation without a request id, ignoring");
        return;
    };
    if let Some((_, token)) = client.calls.remove(&key) {
        info!(client_session = %client.id, request_id = %key, "client cancelled in-flight call");
        token.cancel();
    } else {
        debug!(request_id = %key, "cancellation for unknown call, ignoring");
    }
}

fn value_as_id_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn dispatch(
    gateway: &Arc<Gateway>,
    client: &Arc<ClientSession>,
    identity: &Identity,
    request: &JsonRpcRequest,
) -> Result<Reply, GatewayError> {
    match request.method.as_str() {
        methods::INITIALIZE => Ok(handle_initialize(gateway, request.params.as_ref())),
        methods::TOOLS_LIST => Ok(Reply::Local(handle_tools_list(gateway, identity).await)),
        methods::TOOLS_CALL => {
            handle_tools_call(gateway, client, identity, request).await.map(Reply::Backend)
        }
        methods::LIST_SERVERS => Ok(Reply::Local(handle_list_servers(gateway))),
        other => Err(GatewayError::MethodNotFound(other.to_string())),
    }
}

/// Local handshake: synthesize a client session id and echo the offered
/// protocol version (opaque, no down-negotiation).
fn handle_initialize(gateway: &Arc<Gateway>, params: Option<&Value>) -> Reply {
    let version = negotiate_version(params);
    let session_id = Uuid::new_v4().to_string();
    let client = ClientSession::new(
        session_id.clone(),
        version.clone(),
        gateway.config.max_inflight_per_client,
    );
    gateway.clients.insert(session_id.clone(), client);
    info!(client_session = %session_id, protocol_version = %version, "client session created");

    Reply::Handshake {
        result: json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": {
                "name": "toolgate",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
        session_id,
    }
}

/// Echo the client's offered version when present; this is the single
/// insertion point if capability negotiation ever becomes real.
fn negotiate_version(params: Option<&Value>) -> String {
    params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or(protocol::PROTOCOL_VERSION)
        .to_string()
}

async fn handle_tools_list(gateway: &Arc<Gateway>, identity: &Identity) -> Value {
    let snapshot = gateway.catalog.get().await;
    let policy = gateway.acl.policy_for(identity);

    let tools: Vec<Value> = snapshot
        .entries
        .iter()
        .filter(|entry| policy.tool_allowed(&entry.name))
        .map(|entry| {
            let mut tool = json!({
                "name": entry.name,
                "description": entry.description,
                "inputSchema": entry.input_schema,
            });
            if let Some(annotations) = &entry.annotations {
                tool["annotations"] = annotations.clone();
            }
            tool
        })
        .collect();

    json!({ "tools": tools, "partial": snapshot.partial })
}

async fn handle_tools_call(
    gateway: &Arc<Gateway>,
    client: &Arc<ClientSession>,
    identity: &Identity,
    request: &JsonRpcRequest,
) -> Result<JsonRpcResponse, GatewayError> {
    let params = request
        .params
        .as_ref()
        .ok_or_else(|| GatewayError::InvalidParams("missing params".to_string()))?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidParams("missing tool name".to_string()))?;
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    gateway.acl.authorize_call(identity, name)?;
    let policy = gateway.acl.policy_for(identity);
    auth::validate_arguments(&arguments, &policy.limits)?;

    let entry = match gateway.catalog.resolve(name).await {
        Resolution::Found(entry) => entry,
        Resolution::NotFound => return Err(GatewayError::ToolNotFound(name.to_string())),
        Resolution::Ambiguous => return Err(GatewayError::Ambiguous(name.to_string())),
    };

    let handle = gateway.registry.get(&entry.backend_id).ok_or_else(|| {
        GatewayError::BackendUnhealthy {
            backend: entry.backend_id.clone(),
            last_error: "backend no longer registered".to_string(),
        }
    })?;
    let health = handle.health();
    if !health.is_healthy {
        return Err(GatewayError::BackendUnhealthy {
            backend: entry.backend_id.clone(),
            last_error: health
                .last_error
                .unwrap_or_else(|| "unknown failure".to_string()),
        });
    }

    // Per-caller quota: fail fast instead of queueing into `pending`.
    let _permit = client.inflight.clone().try_acquire_owned().map_err(|_| {
        GatewayError::InvalidParams(format!(
            "in-flight call quota of {} exceeded",
            gateway.config.max_inflight_per_client
        ))
    })?;

    let cancel = CancellationToken::new();
    let call_key = request
        .id
        .as_ref()
        .map(|i| i.to_string())
        .unwrap_or_default();
    client.calls.insert(call_key.clone(), cancel.clone());
    let _registration = CallRegistration {
        client: client.as_ref(),
        key: &call_key,
        cancel: &cancel,
    };

    debug!(
        tool = %entry.name,
        backend = %entry.backend_id,
        caller = %identity.label(),
        "forwarding tools/call"
    );

    let started = std::time::Instant::now();
    let result = handle
        .session
        .call_tool(
            &entry.original_name,
            arguments,
            gateway.config.call_deadline,
            &cancel,
        )
        .await;
    let success = matches!(&result, Ok(response) if response.error.is_none());
    gateway
        .tracker
        .record(&entry.name, &entry.backend_id, started.elapsed(), success);

    match result {
        Ok(response) => Ok(response),
        Err(SessionError::Deadline) => {
            Err(GatewayError::DeadlineExceeded(gateway.config.call_deadline))
        }
        Err(SessionError::Cancelled) => Err(GatewayError::Cancelled),
        Err(SessionError::InitFailed(message)) => Err(GatewayError::BackendUnhealthy {
            backend: entry.backend_id,
            last_error: message,
        }),
        Err(SessionError::Closed) => Err(GatewayError::Transport {
            backend: entry.backend_id,
            reason: "session closed".to_string(),
        }),
        Err(SessionError::Transport(reason)) => Err(GatewayError::Transport {
            backend: entry.backend_id,
            reason,
        }),
    }
}

/// `management/list_servers`: descriptor + health cards, keyed by id.
fn handle_list_servers(gateway: &Arc<Gateway>) -> Value {
    let mut cards = serde_json::Map::new();
    for snapshot in gateway.registry.snapshot() {
        let descriptor = &snapshot.descriptor;
        let session_id = gateway
            .registry
            .get(&descriptor.id)
            .and_then(|h| h.session.session_id());
        cards.insert(
            descriptor.id.clone(),
            json!({
                "id": descriptor.id,
                "name": descriptor.display_name.clone().unwrap_or_else(|| descriptor.id.clone()),
                "url": descriptor.url,
                "transport": descriptor.transport,
                "tags": descriptor.tags,
                "status": if snapshot.health.is_healthy { "healthy" } else { "unhealthy" },
                "consecutive_failures": snapshot.health.consecutive_failures,
                "last_error": snapshot.health.last_error,
                "session_id": session_id,
            }),
        );
    }
    json!({ "server_cards": cards })
}

// --- Response framing ---

/// Stream-mode only when the client accepts SSE and not JSON; a client that
/// accepts both gets the JSON body (what the original deployment expected).
fn wants_stream(headers: &HeaderMap) -> bool {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    accept.contains(EVENT_STREAM_MIME_TYPE) && !accept.contains(JSON_MIME_TYPE)
}

fn respond(
    request_headers: &HeaderMap,
    envelope: &JsonRpcResponse,
    session_header: Option<String>,
) -> Response {
    if wants_stream(request_headers) {
        sse_response(envelope, session_header)
    } else {
        json_response(StatusCode::OK, envelope, session_header)
    }
}

fn json_response(
    status: StatusCode,
    envelope: &JsonRpcResponse,
    session_header: Option<String>,
) -> Response {
    let body = serde_json::to_vec(envelope).unwrap_or_default();
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, JSON_MIME_TYPE);
    if let Some(sid) = session_header {
        builder = builder.header(HEADER_SESSION_ID, sid);
    }
    builder
        .body(Body::from(body))
        .expect("static response parts are valid")
}

/// Frame the envelope as a single `event: message` SSE frame. The body goes
/// through a bounded channel: a slow reader backpressures only this call.
fn sse_response(envelope: &JsonRpcResponse, session_header: Option<String>) -> Response {
    let data = serde_json::to_string(envelope).unwrap_or_default();
    let frame = Bytes::from(format!("event: message\ndata: {data}\n\n"));

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
    // Single frame today; the channel keeps the shape ready for forwarding
    // multi-frame backend streams.
    let _ = tx.try_send(Ok(frame));
    drop(tx);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM_MIME_TYPE)
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(sid) = session_header {
        builder = builder.header(HEADER_SESSION_ID, sid);
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("static response parts are valid")
}
