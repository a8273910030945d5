//! SSE transport: requests go out as POSTs to a companion messages URL
//! learned from the stream's first `endpoint` frame; replies arrive as
//! `message` frames on the long-lived GET stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::protocol::{JSON_MIME_TYPE, JsonRpcRequest};
use crate::session::{SessionError, SessionTransport, TransportEvent};
use crate::sse::{BackoffConfig, SseClient, SseEvent};

pub struct SseTransport {
    http: reqwest::Client,
    sse: Arc<SseClient>,
    dial_timeout: Duration,
    /// Companion URL for outgoing POSTs. None until the endpoint frame
    /// arrives; cleared on every disconnect because reconnects mint a new
    /// backend-side session.
    endpoint_tx: Arc<watch::Sender<Option<String>>>,
    endpoint_rx: watch::Receiver<Option<String>>,
}

impl SseTransport {
    pub fn new(
        url: String,
        http: reqwest::Client,
        backoff: BackoffConfig,
        queue_capacity: usize,
        dial_timeout: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let sse = SseClient::new(url.clone(), http.clone(), backoff, queue_capacity);
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let endpoint_tx = Arc::new(endpoint_tx);

        Self::spawn_forwarder(url, sse.subscribe(), Arc::clone(&endpoint_tx), events);

        Self {
            http,
            sse,
            dial_timeout,
            endpoint_tx,
            endpoint_rx,
        }
    }

    /// Bridge SSE client events into the session demux. The endpoint frame
    /// is consumed here; everything else is parsed and forwarded.
    fn spawn_forwarder(
        base_url: String,
        mut rx: mpsc::Receiver<SseEvent>,
        endpoint_tx: Arc<watch::Sender<Option<String>>>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SseEvent::Connected => {
                        let _ = events.send(TransportEvent::Connected);
                    }
                    SseEvent::Disconnected { reason } => {
                        let _ = endpoint_tx.send(None);
                        if events
                            .send(TransportEvent::Disconnected { reason })
                            .is_err()
                        {
                            break;
                        }
                    }
                    SseEvent::Frame { event, data } if event == "endpoint" => {
                        match resolve_endpoint(&base_url, data.trim()) {
                            Ok(url) => {
                                debug!(messages_url = %url, "learned messages endpoint");
                                let _ = endpoint_tx.send(Some(url));
                            }
                            Err(e) => {
                                warn!(data = %data, error = %e, "unusable endpoint frame");
                                let _ = events.send(TransportEvent::Disconnected {
                                    reason: format!("bad endpoint frame: {e}"),
                                });
                            }
                        }
                    }
                    SseEvent::Frame { data, .. } => {
                        if data.trim().is_empty() {
                            continue; // keep-alive
                        }
                        match serde_json::from_str(&data) {
                            Ok(value) => {
                                if events.send(TransportEvent::Message(value)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                // A parse error at the transport breaks the
                                // session; the stream itself keeps running
                                // until the supervisor restarts us.
                                let _ = events.send(TransportEvent::Disconnected {
                                    reason: format!("unparseable frame: {e}"),
                                });
                            }
                        }
                    }
                    SseEvent::ParseError { detail } => {
                        let _ = events.send(TransportEvent::Disconnected {
                            reason: format!("sse parse error: {detail}"),
                        });
                    }
                }
            }
        });
    }

    fn messages_url(&self) -> Option<String> {
        self.endpoint_rx.borrow().clone()
    }
}

/// Resolve the endpoint frame's (usually relative) URL against the stream URL.
fn resolve_endpoint(base_url: &str, endpoint: &str) -> Result<String, String> {
    if endpoint.is_empty() {
        return Err("empty endpoint".to_string());
    }
    let base = url::Url::parse(base_url).map_err(|e| e.to_string())?;
    base.join(endpoint)
        .map(|u| u.to_string())
        .map_err(|e| e.to_string())
}

#[async_trait]
impl SessionTransport for SseTransport {
    async fn open(&self) -> Result<(), SessionError> {
        if self.messages_url().is_some() {
            return Ok(());
        }
        self.sse.start();

        let mut rx = self.endpoint_rx.clone();
        let wait = async {
            loop {
                if rx.borrow().is_some() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(SessionError::Closed);
                }
            }
        };
        tokio::time::timeout(self.dial_timeout, wait)
            .await
            .map_err(|_| {
                SessionError::Transport("timed out waiting for endpoint frame".to_string())
            })?
    }

    async fn send(&self, message: &JsonRpcRequest) -> Result<(), SessionError> {
        let url = self
            .messages_url()
            .ok_or_else(|| SessionError::Transport("messages endpoint not learned".to_string()))?;

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, JSON_MIME_TYPE)
            .json(message)
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("post failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Transport(format!(
                "messages endpoint returned {status}"
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        self.sse.stop();
        let _ = self.endpoint_tx.send(None);
    }

    fn session_id(&self) -> Option<String> {
        // The backend encodes its session in the messages URL query string.
        let url = self.messages_url()?;
        let parsed = url::Url::parse(&url).ok()?;
        parsed
            .query_pairs()
            .find(|(k, _)| k == "session_id")
            .map(|(_, v)| v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_endpoint() {
        let url = resolve_endpoint(
            "http://localhost:8003/sse",
            "/messages?session_id=abc123",
        )
        .unwrap();
        assert_eq!(url, "http://localhost:8003/messages?session_id=abc123");
    }

    #[test]
    fn test_resolve_absolute_endpoint() {
        let url = resolve_endpoint(
            "http://localhost:8003/sse",
            "http://other:9000/messages",
        )
        .unwrap();
        assert_eq!(url, "http://other:9000/messages");
    }

    #[test]
    fn test_resolve_empty_endpoint_rejected() {
        assert!(resolve_endpoint("http://localhost:8003/sse", "").is_err());
    }
}
