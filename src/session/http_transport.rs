//! Streamable HTTP transport: both directions go through one URL. The
//! server answers a POST inline as JSON, upgrades the response body to an
//! SSE stream, or acknowledges with 202/204. Missing or unexpected
//! Content-Type on a 2xx is tolerated; some servers omit it on
//! notification acknowledgements.

use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE};
use sse_stream::SseStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{
    EVENT_STREAM_MIME_TYPE, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, JSON_MIME_TYPE,
    JsonRpcRequest, PROTOCOL_VERSION,
};
use crate::session::{SessionError, SessionTransport, TransportEvent};

pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl HttpTransport {
    pub fn new(
        url: String,
        http: reqwest::Client,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            url,
            http,
            session_id: Mutex::new(None),
            events,
        }
    }

    fn current_session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn store_session_id(&self, sid: Option<String>) {
        if let Some(sid) = sid {
            let mut guard = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
            if guard.as_deref() != Some(sid.as_str()) {
                debug!(url = %self.url, "captured backend session id");
                *guard = Some(sid);
            }
        }
    }

    fn clear_session_id(&self) {
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Drain an SSE response body in the background, pushing each data frame
    /// into the demux. Stream end is normal (the server closes it once the
    /// correlated response has been sent).
    fn spawn_body_reader(&self, response: reqwest::Response) {
        let events = self.events.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let mut frames = SseStream::from_byte_stream(response.bytes_stream());
            while let Some(item) = frames.next().await {
                match item {
                    Ok(frame) => {
                        let data = frame.data.unwrap_or_default();
                        if data.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str(&data) {
                            Ok(value) => {
                                if events.send(TransportEvent::Message(value)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                let _ = events.send(TransportEvent::Disconnected {
                                    reason: format!("unparseable frame: {e}"),
                                });
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "response stream error");
                        let _ = events.send(TransportEvent::Disconnected {
                            reason: format!("response stream error: {e}"),
                        });
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl SessionTransport for HttpTransport {
    async fn open(&self) -> Result<(), SessionError> {
        // Connectionless: the first POST establishes everything.
        Ok(())
    }

    async fn send(&self, message: &JsonRpcRequest) -> Result<(), SessionError> {
        let mut request = self
            .http
            .post(&self.url)
            .header(
                ACCEPT,
                format!("{JSON_MIME_TYPE}, {EVENT_STREAM_MIME_TYPE}"),
            )
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION);
        if let Some(sid) = self.current_session_id() {
            request = request.header(HEADER_SESSION_ID, sid);
        }

        let response = request
            .json(message)
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("post failed: {e}")))?;

        let status = response.status();

        // A 404 while a session is active means the backend dropped it.
        if status == reqwest::StatusCode::NOT_FOUND && self.current_session_id().is_some() {
            self.clear_session_id();
            return Err(SessionError::Transport("backend session expired".to_string()));
        }
        if !status.is_success() {
            return Err(SessionError::Transport(format!("backend returned {status}")));
        }

        let sid = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.store_session_id(sid);

        if matches!(
            status,
            reqwest::StatusCode::ACCEPTED | reqwest::StatusCode::NO_CONTENT
        ) {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .map(|ct| ct.as_bytes().to_vec());

        match content_type.as_deref() {
            Some(ct) if ct.starts_with(EVENT_STREAM_MIME_TYPE.as_bytes()) => {
                self.spawn_body_reader(response);
                Ok(())
            }
            Some(ct) if ct.starts_with(JSON_MIME_TYPE.as_bytes()) => {
                let value: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| SessionError::Transport(format!("bad json body: {e}")))?;
                let _ = self.events.send(TransportEvent::Message(value));
                Ok(())
            }
            _ => {
                // Lenient path: try JSON anyway, else treat as accepted.
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| SessionError::Transport(format!("body read failed: {e}")))?;
                if !bytes.is_empty()
                    && let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes)
                {
                    let _ = self.events.send(TransportEvent::Message(value));
                    return Ok(());
                }
                debug!(url = %self.url, status = %status, "no content-type, treating as accepted");
                Ok(())
            }
        }
    }

    async fn close(&self) {
        // Best-effort session termination.
        if let Some(sid) = self.current_session_id() {
            let request = self.http.delete(&self.url).header(HEADER_SESSION_ID, sid);
            if let Err(e) = request.send().await {
                debug!(url = %self.url, error = %e, "session delete failed");
            }
        }
        self.clear_session_id();
    }

    fn session_id(&self) -> Option<String> {
        self.current_session_id()
    }
}
