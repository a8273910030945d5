//! MCP session: one per backend. Owns the handshake, the outstanding-request
//! table, and the demultiplexing of transport frames back to waiting callers.

pub mod http_transport;
pub mod sse_transport;


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::protocol::{
    self, BackendFrame, JsonRpcRequest, JsonRpcResponse, RequestId, ToolDefinition, methods,
};
use crate::registry::TransportKind;
use crate::sse::BackoffConfig;

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("deadline exceeded")]
    Deadline,

    #[error("cancelled")]
    Cancelled,

    #[error("initialize failed: {0}")]
    InitFailed(String),
}

/// Frames and state changes pushed by a transport into the session demux.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    /// A parsed JSON-RPC frame from the backend.
    Message(Value),
    Disconnected { reason: String },
}

/// Passive signals the session reports upward. The supervisor owns what
/// happens next; the session holds no pointer back (one-way channel).
#[derive(Debug, Clone)]
pub enum SessionSignal {
    TransportFailed { backend_id: String, error: String },
    ToolListChanged { backend_id: String },
}

/// The transport seam: SSE (GET stream + companion messages URL) or
/// streamable HTTP (single URL, inline JSON or SSE response bodies).
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Establish the transport. Idempotent; for SSE this dials the stream
    /// and waits for the endpoint frame.
    async fn open(&self) -> Result<(), SessionError>;

    /// Write one JSON-RPC message toward the backend.
    async fn send(&self, message: &JsonRpcRequest) -> Result<(), SessionError>;

    /// Tear the transport down. Idempotent.
    async fn close(&self);

    /// Backend-assigned session id, when the transport has one.
    fn session_id(&self) -> Option<String>;
}

type ResponseSink = oneshot::Sender<Result<JsonRpcResponse, SessionError>>;

/// Removes the pending entry when the caller's future is dropped (client
/// disconnect, deadline, cancel) so no path leaks a sink.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, ResponseSink>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

pub struct McpSession {
    backend_id: String,
    transport: Arc<dyn SessionTransport>,
    pending: DashMap<String, ResponseSink>,
    next_request_id: AtomicU64,
    initialized: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
    config: SessionConfig,
    signals: mpsc::UnboundedSender<SessionSignal>,
}

impl McpSession {
    pub fn new(
        backend_id: String,
        url: String,
        kind: TransportKind,
        http: reqwest::Client,
        config: SessionConfig,
        backoff: BackoffConfig,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let transport: Arc<dyn SessionTransport> = match kind {
            TransportKind::Sse => Arc::new(sse_transport::SseTransport::new(
                url,
                http,
                backoff,
                config.subscriber_queue,
                config.dial_timeout,
                event_tx,
            )),
            TransportKind::StreamableHttp => Arc::new(http_transport::HttpTransport::new(
                url, http, event_tx,
            )),
        };

        let session = Arc::new(Self {
            backend_id,
            transport,
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            config,
            signals,
        });
        session.spawn_demux(event_rx);
        session
    }

    /// The demux task: routes inbound frames to sinks by id. Holds the
    /// session only weakly so a deregistered backend's session can drop.
    fn spawn_demux(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.handle_event(event);
            }
        });
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                debug!(backend = %self.backend_id, "transport connected");
            }
            TransportEvent::Message(value) => self.route_frame(value),
            TransportEvent::Disconnected { reason } => self.on_transport_failure(&reason),
        }
    }

    fn route_frame(&self, value: Value) {
        match protocol::classify_frame(value) {
            Some(BackendFrame::Response(response)) => {
                let Some(id) = response.id.as_ref().map(|i| i.to_string()) else {
                    warn!(backend = %self.backend_id, "response frame without id, dropping");
                    return;
                };
                // remove-then-send: each sink completes at most once, and a
                // late or duplicate reply finds no sink.
                match self.pending.remove(&id) {
                    Some((_, sink)) => {
                        let _ = sink.send(Ok(response));
                    }
                    None => {
                        warn!(
                            backend = %self.backend_id,
                            id = %id,
                            "reply for unknown or already-completed request, dropping"
                        );
                    }
                }
            }
            Some(BackendFrame::Notification(note)) => {
                if note.method.ends_with("list_changed") {
                    info!(backend = %self.backend_id, method = %note.method, "backend reports catalog change");
                    let _ = self.signals.send(SessionSignal::ToolListChanged {
                        backend_id: self.backend_id.clone(),
                    });
                } else {
                    debug!(
                        backend = %self.backend_id,
                        method = %note.method,
                        "unsolicited backend notification, dropping"
                    );
                }
            }
            None => {
                warn!(backend = %self.backend_id, "unclassifiable frame from backend");
            }
        }
    }

    /// Transport-level failure: fail every pending call, drop initialized
    /// state, and report upward. The supervisor decides when to restart.
    fn on_transport_failure(&self, reason: &str) {
        self.initialized.store(false, Ordering::SeqCst);
        self.fail_all_pending(SessionError::Transport(reason.to_string()));
        let _ = self.signals.send(SessionSignal::TransportFailed {
            backend_id: self.backend_id.clone(),
            error: reason.to_string(),
        });
    }

    fn fail_all_pending(&self, error: SessionError) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            warn!(
                backend = %self.backend_id,
                pending = ids.len(),
                "failing all pending calls"
            );
        }
        for id in ids {
            if let Some((_, sink)) = self.pending.remove(&id) {
                let _ = sink.send(Err(error.clone()));
            }
        }
    }

    /// Fresh request id, unique within the session (monotonic counter).
    fn next_id(&self) -> RequestId {
        let n = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId::String(format!("g-{n:03}"))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<String> {
        self.transport.session_id()
    }

    /// Number of outstanding requests. Test and introspection hook.
    #[allow(dead_code)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drive the MCP handshake if it has not happened yet. Concurrent
    /// callers coalesce on one in-flight init.
    pub async fn ensure_initialized(&self) -> Result<(), SessionError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            // Another caller finished the handshake while we waited.
            return Ok(());
        }

        self.transport.open().await?;

        let init = JsonRpcRequest::new(
            self.next_id(),
            methods::INITIALIZE,
            json!({
                "protocolVersion": protocol::PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "toolgate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        );
        let response = self
            .request(init, self.config.init_timeout, &CancellationToken::new())
            .await?;
        if let Some(error) = response.error {
            return Err(SessionError::InitFailed(error.message));
        }

        let note = JsonRpcRequest::notification(methods::INITIALIZED, None);
        self.transport.send(&note).await?;

        self.initialized.store(true, Ordering::SeqCst);
        info!(backend = %self.backend_id, "mcp session initialized");
        Ok(())
    }

    /// Fetch the backend's tool list. Used both for catalog builds and as
    /// the lightweight health probe.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, SessionError> {
        self.ensure_initialized().await?;
        let request = JsonRpcRequest::new(self.next_id(), methods::TOOLS_LIST, json!({}));
        let response = self
            .request(request, self.config.list_tools_timeout, &CancellationToken::new())
            .await?;
        if let Some(error) = response.error {
            return Err(SessionError::Transport(format!(
                "tools/list failed: {}",
                error.message
            )));
        }
        let tools = response
            .result
            .as_ref()
            .and_then(|r| r.get("tools"))
            .cloned()
            .unwrap_or_else(|| json!([]));
        serde_json::from_value(tools)
            .map_err(|e| SessionError::Transport(format!("malformed tools/list result: {e}")))
    }

    /// Forward a tools/call and wait for its correlated reply, the deadline,
    /// or cancellation, whichever comes first. The returned envelope still
    /// carries the backend's verbatim result or error.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse, SessionError> {
        self.ensure_initialized().await?;
        let request = JsonRpcRequest::new(
            self.next_id(),
            methods::TOOLS_CALL,
            json!({ "name": name, "arguments": arguments }),
        );
        self.request(request, deadline, cancel).await
    }

    /// Send a correlated request. The sink is registered *before* the write
    /// goes out so a reply cannot race past registration; a failed write
    /// removes the sink and fails locally.
    async fn request(
        &self,
        request: JsonRpcRequest,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse, SessionError> {
        let id = request
            .id
            .as_ref()
            .map(|i| i.to_string())
            .unwrap_or_default();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        // The write itself is inside the race: a backend that accepts the
        // connection but never answers the POST must still hit the deadline.
        let send_and_wait = async {
            self.transport.send(&request).await?;
            match rx.await {
                Ok(outcome) => outcome,
                // Sink dropped without completion: the session was torn down
                // between removal and send. Surface as closed.
                Err(_) => Err(SessionError::Closed),
            }
        };

        tokio::select! {
            outcome = send_and_wait => outcome,
            _ = tokio::time::sleep(deadline) => {
                debug!(backend = %self.backend_id, id = %id, "request deadline expired");
                Err(SessionError::Deadline)
            }
            _ = cancel.cancelled() => {
                // Best-effort upstream cancel; correctness does not depend
                // on it arriving.
                let note = JsonRpcRequest::notification(
                    methods::CANCELLED,
                    Some(json!({ "requestId": id.clone() })),
                );
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    let _ = transport.send(&note).await;
                });
                Err(SessionError::Cancelled)
            }
        }
    }

    /// Fail all pending with `session_closed`, stop the transport, clear
    /// handshake state. Safe to call repeatedly.
    pub async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.fail_all_pending(SessionError::Closed);
        self.transport.close().await;
        debug!(backend = %self.backend_id, "session closed");
    }
}
