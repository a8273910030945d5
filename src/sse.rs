//! SSE client: one long-lived event-stream reader per backend.
//!
//! The reader cycles Idle → Dialing → Reading, and on any unclean exit from
//! Reading goes through a jittered exponential backoff before redialing.
//! Subscribers receive parsed frames over bounded queues; a subscriber that
//! cannot keep up is disconnected rather than allowed to stall the reader.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use reqwest::header::ACCEPT;
use sse_stream::SseStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::EVENT_STREAM_MIME_TYPE;

/// Events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum SseEvent {
    Connected,
    Disconnected { reason: String },
    Frame { event: String, data: String },
    ParseError { detail: String },
}

/// Exponential backoff with a cap and uniform jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
}

impl BackoffConfig {
    /// Delay for the given attempt: `min * 2^attempt`, capped at `max`,
    /// scaled by a jitter factor in [0.5, 1.5).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .min
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max);
        let jitter: f64 = rand::rng().random_range(0.5..1.5);
        base.mul_f64(jitter).min(self.max)
    }
}

pub struct SseClient {
    url: String,
    http: reqwest::Client,
    backoff: BackoffConfig,
    queue_capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<SseEvent>>>,
    connected: AtomicBool,
    last_frame_at: Mutex<Option<Instant>>,
    /// Some while a reader task is running. `start` CASes this in, `stop`
    /// takes it out, so concurrent starts yield one reader and concurrent
    /// stops yield one cancel.
    reader: Mutex<Option<CancellationToken>>,
}

impl SseClient {
    pub fn new(
        url: String,
        http: reqwest::Client,
        backoff: BackoffConfig,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            url,
            http,
            backoff,
            queue_capacity,
            subscribers: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            last_frame_at: Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    /// Subscribe to client events. The returned receiver is backed by a
    /// bounded queue; if it fills up, the subscription is dropped.
    /// Handlers must not block; consume promptly or hand off.
    pub fn subscribe(&self) -> mpsc::Receiver<SseEvent> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Spawn the reader task. Idempotent: a second start while a reader is
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        if reader.is_some() {
            debug!(url = %self.url, "sse reader already running");
            return;
        }
        let cancel = CancellationToken::new();
        *reader = Some(cancel.clone());
        drop(reader);

        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.run(cancel).await;
        });
    }

    /// Cancel the reader and forbid further dials until the next `start`.
    pub fn stop(&self) {
        let token = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        self.connected.store(false, Ordering::Release);
    }

    #[allow(dead_code)]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[allow(dead_code)]
    pub fn last_frame_at(&self) -> Option<Instant> {
        *self.last_frame_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.dial().await {
                Ok(response) => {
                    self.connected.store(true, Ordering::Release);
                    debug!(url = %self.url, "sse stream connected");
                    self.deliver(SseEvent::Connected);

                    let reason = self.read_stream(response, &cancel, &mut attempt).await;
                    self.connected.store(false, Ordering::Release);
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(url = %self.url, reason = %reason, "sse stream lost");
                    self.deliver(SseEvent::Disconnected { reason });
                }
                Err(reason) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    debug!(url = %self.url, reason = %reason, "sse dial failed");
                    self.deliver(SseEvent::Disconnected { reason });
                }
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(
                url = %self.url,
                delay_ms = delay.as_millis() as u64,
                attempt,
                "sse reconnect backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
        debug!(url = %self.url, "sse reader stopped");
    }

    async fn dial(&self) -> Result<reqwest::Response, String> {
        let response = self
            .http
            .get(&self.url)
            .header(ACCEPT, EVENT_STREAM_MIME_TYPE)
            .send()
            .await
            .map_err(|e| format!("dial failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("backend returned {status}"));
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .map(|ct| ct.as_bytes().starts_with(EVENT_STREAM_MIME_TYPE.as_bytes()))
            .unwrap_or(false);
        if !is_event_stream {
            return Err("backend did not return text/event-stream".to_string());
        }

        Ok(response)
    }

    /// Read frames until the stream ends or the client is stopped.
    /// Returns the disconnect reason.
    async fn read_stream(
        &self,
        response: reqwest::Response,
        cancel: &CancellationToken,
        attempt: &mut u32,
    ) -> String {
        let mut frames = SseStream::from_byte_stream(response.bytes_stream());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return "stopped".to_string(),
                next = frames.next() => match next {
                    Some(Ok(frame)) => {
                        // A clean frame after a reconnect resets the backoff.
                        *attempt = 0;
                        *self.last_frame_at.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(Instant::now());

                        let event = frame.event.clone().unwrap_or_else(|| "message".to_string());
                        let data = frame.data.clone().unwrap_or_default();
                        self.deliver(SseEvent::Frame { event, data });
                    }
                    Some(Err(e)) => {
                        self.deliver(SseEvent::ParseError { detail: e.to_string() });
                        return format!("stream error: {e}");
                    }
                    None => return "server closed stream".to_string(),
                }
            }
        }
    }

    /// Fan an event out to all subscribers. A full queue disconnects that
    /// subscriber; the reader never waits on a consumer.
    fn deliver(&self, event: SseEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(url = %self.url, "sse subscriber queue full, disconnecting subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockBackendServer;

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            min: Duration::from_millis(10),
            max: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let b = BackoffConfig {
            min: Duration::from_millis(500),
            max: Duration::from_millis(30_000),
        };
        for attempt in 0..40 {
            assert!(b.delay(attempt) <= b.max, "attempt {attempt} exceeded cap");
        }
        // First attempt is at least min/2 (jitter floor).
        assert!(b.delay(0) >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_connects_and_receives_frames() {
        let server = MockBackendServer::spawn_sse(Vec::new()).await;
        let client = SseClient::new(
            server.sse_url(),
            reqwest::Client::new(),
            backoff(),
            64,
        );
        let mut rx = client.subscribe();
        client.start();

        // Connected, then the endpoint frame the mock emits on connect.
        let mut saw_connected = false;
        let mut saw_endpoint = false;
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event before timeout")
                .expect("subscription alive")
            {
                SseEvent::Connected => saw_connected = true,
                SseEvent::Frame { event, .. } if event == "endpoint" => saw_endpoint = true,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_connected && saw_endpoint);
        assert!(client.is_connected());

        client.stop();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_reconnects_after_stream_drop() {
        let server = MockBackendServer::spawn_sse(Vec::new()).await;
        let client = SseClient::new(
            server.sse_url(),
            reqwest::Client::new(),
            backoff(),
            64,
        );
        let mut rx = client.subscribe();
        client.start();

        // Wait for the first connect.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                SseEvent::Connected => break,
                _ => {}
            }
        }

        // Kill the live stream; the client must emit Disconnected and then
        // dial again on its own.
        server.drop_sse_stream();
        let mut saw_disconnect = false;
        let mut reconnected = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline && !(saw_disconnect && reconnected) {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                SseEvent::Disconnected { .. } => saw_disconnect = true,
                SseEvent::Connected => {
                    if saw_disconnect {
                        reconnected = true;
                    }
                }
                _ => {}
            }
        }
        assert!(saw_disconnect, "no disconnect observed");
        assert!(reconnected, "no reconnect observed");

        client.stop();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_final() {
        let server = MockBackendServer::spawn_sse(Vec::new()).await;
        let client = SseClient::new(
            server.sse_url(),
            reqwest::Client::new(),
            backoff(),
            64,
        );
        let mut rx = client.subscribe();

        // Multiple starts → at most one reader → exactly one Connected event.
        client.start();
        client.start();
        client.start();

        let mut connected_count = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(SseEvent::Connected)) => connected_count += 1,
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert_eq!(connected_count, 1, "multiple readers dialed");

        // Concurrent stops: exactly one close, no panic.
        client.stop();
        client.stop();
        assert!(!client.is_connected());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_disconnected() {
        let server = MockBackendServer::spawn_sse(Vec::new()).await;
        // Queue of 1: the Connected event fills it, the endpoint frame
        // overflows it.
        let client = SseClient::new(
            server.sse_url(),
            reqwest::Client::new(),
            backoff(),
            1,
        );
        let mut rx = client.subscribe();
        client.start();

        // Never drain rx until the overflow has happened.
        tokio::time::sleep(Duration::from_millis(500)).await;

        // First event is still there, then the channel reports closure.
        let first = rx.recv().await;
        assert!(first.is_some());
        let second = rx.recv().await;
        assert!(second.is_none(), "slow subscriber should have been dropped");

        client.stop();
        server.shutdown();
    }
}
