//! Backend descriptor registry: the set of registered backends, their
//! transport/URL descriptors, and their health state.
//!
//! The registry is the only place health fields are stored; the supervisor
//! (and sessions, via passive signals routed through the supervisor) are the
//! only writers. State changes fan out over a broadcast channel so the
//! catalog and supervisor react without holding pointers into each other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::session::{McpSession, SessionSignal};
use crate::sse::BackoffConfig;

/// Transport variant a backend speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    Sse,
    StreamableHttp,
}

/// Immutable backend descriptor. Identity is `id`; updating a live backend
/// means deregister + register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl BackendDescriptor {
    /// Spec equality, ignoring `registered_at`. Used by the seed-file diff.
    pub fn same_spec(&self, other: &Self) -> bool {
        self.id == other.id
            && self.url == other.url
            && self.transport == other.transport
            && self.display_name == other.display_name
            && self.tags == other.tags
    }
}

/// Per-backend health, mutated only through the registry's record_* methods.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl BackendHealth {
    fn new() -> Self {
        Self {
            is_healthy: false,
            consecutive_failures: 0,
            last_error: Some("not yet probed".to_string()),
            last_success_at: None,
            last_probe_at: None,
        }
    }

    fn record_success(&mut self) {
        self.is_healthy = true;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_success_at = Some(Utc::now());
        self.last_probe_at = Some(Utc::now());
    }

    fn record_failure(&mut self, error: &str, threshold: u32) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.last_probe_at = Some(Utc::now());
        if self.consecutive_failures >= threshold {
            self.is_healthy = false;
        }
    }
}

/// A registered backend: descriptor, health, and its exclusively-owned
/// session (which in turn owns its transport).
pub struct BackendHandle {
    pub descriptor: BackendDescriptor,
    health: Mutex<BackendHealth>,
    pub session: Arc<McpSession>,
}

impl BackendHandle {
    pub fn health(&self) -> BackendHealth {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).is_healthy
    }
}

/// Registry state changes, broadcast to the catalog and the supervisor.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    BackendAdded { id: String },
    BackendRemoved { id: String },
    HealthChanged { id: String, healthy: bool },
}

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("backend '{0}' is already registered")]
    Conflict(String),
    #[error("backend '{0}' is not registered")]
    NotFound(String),
}

/// A coherent point-in-time view of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub descriptor: BackendDescriptor,
    pub health: BackendHealth,
}

/// Versioned on-disk store for runtime-registered backends.
const STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct BackendStore {
    version: u32,
    backends: Vec<BackendDescriptor>,
}

pub struct BackendRegistry {
    backends: DashMap<String, Arc<BackendHandle>>,
    /// Backends registered at runtime via the admin API (persisted), as
    /// opposed to seed-file backends (re-created from the file).
    dynamic: Mutex<std::collections::HashSet<String>>,
    events: broadcast::Sender<RegistryEvent>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    session_config: SessionConfig,
    backoff: BackoffConfig,
    http: reqwest::Client,
    store_path: Option<PathBuf>,
}

impl BackendRegistry {
    pub fn new(
        session_config: SessionConfig,
        backoff: BackoffConfig,
        signals: mpsc::UnboundedSender<SessionSignal>,
        store_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            backends: DashMap::new(),
            dynamic: Mutex::new(std::collections::HashSet::new()),
            events,
            signals,
            session_config,
            backoff,
            http: reqwest::Client::new(),
            store_path,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn make_handle(&self, descriptor: BackendDescriptor) -> Arc<BackendHandle> {
        let session = McpSession::new(
            descriptor.id.clone(),
            descriptor.url.clone(),
            descriptor.transport,
            self.http.clone(),
            self.session_config.clone(),
            self.backoff,
            self.signals.clone(),
        );
        Arc::new(BackendHandle {
            descriptor,
            health: Mutex::new(BackendHealth::new()),
            session,
        })
    }

    /// Register a backend. Rejects duplicate ids; fires `backend_added`.
    pub async fn register(&self, descriptor: BackendDescriptor) -> Result<(), RegistryError> {
        let id = descriptor.id.clone();
        match self.backends.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::Conflict(id)),
            Entry::Vacant(slot) => {
                info!(backend = %id, url = %descriptor.url, "backend registered");
                slot.insert(self.make_handle(descriptor));
            }
        }
        let _ = self.events.send(RegistryEvent::BackendAdded { id });
        Ok(())
    }

    /// Deregister a backend, closing its session. Idempotent resource
    /// release: a second call reports NotFound without side effects.
    pub async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let Some((_, handle)) = self.backends.remove(id) else {
            return Err(RegistryError::NotFound(id.to_string()));
        };
        handle.session.close().await;
        self.dynamic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        info!(backend = %id, "backend deregistered");
        let _ = self.events.send(RegistryEvent::BackendRemoved {
            id: id.to_string(),
        });
        self.save_store().await;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<BackendHandle>> {
        self.backends.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn handles(&self) -> Vec<Arc<BackendHandle>> {
        self.backends.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn healthy_handles(&self) -> Vec<Arc<BackendHandle>> {
        self.backends
            .iter()
            .filter(|e| e.value().is_healthy())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Coherent snapshot of all descriptors with their current health.
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let mut snapshots: Vec<BackendSnapshot> = self
            .backends
            .iter()
            .map(|e| BackendSnapshot {
                descriptor: e.value().descriptor.clone(),
                health: e.value().health(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Record a successful probe. Returns true on an unhealthy → healthy
    /// flip, which also fires `HealthChanged`.
    pub fn record_probe_success(&self, id: &str) -> bool {
        let Some(handle) = self.get(id) else { return false };
        let flipped = {
            let mut health = handle.health.lock().unwrap_or_else(|e| e.into_inner());
            let was_healthy = health.is_healthy;
            health.record_success();
            !was_healthy
        };
        if flipped {
            info!(backend = %id, "backend healthy");
            let _ = self.events.send(RegistryEvent::HealthChanged {
                id: id.to_string(),
                healthy: true,
            });
        }
        flipped
    }

    /// Record a failed probe (active or passive). Returns true on a
    /// healthy → unhealthy flip, which also fires `HealthChanged`.
    pub fn record_probe_failure(&self, id: &str, error: &str, threshold: u32) -> bool {
        let Some(handle) = self.get(id) else { return false };
        let (flipped, failures) = {
            let mut health = handle.health.lock().unwrap_or_else(|e| e.into_inner());
            let was_healthy = health.is_healthy;
            health.record_failure(error, threshold);
            (was_healthy && !health.is_healthy, health.consecutive_failures)
        };
        if flipped {
            warn!(
                backend = %id,
                failures,
                error = %error,
                "backend unhealthy"
            );
            let _ = self.events.send(RegistryEvent::HealthChanged {
                id: id.to_string(),
                healthy: false,
            });
        }
        flipped
    }

    /// Mark a backend as runtime-registered and persist the store.
    pub async fn mark_dynamic(&self, id: &str) {
        self.dynamic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
        self.save_store().await;
    }

    /// Close every session. Used at shutdown.
    pub async fn close_all(&self) {
        for handle in self.handles() {
            handle.session.close().await;
        }
    }

    // --- Seed file application ---

    /// Apply a freshly loaded seed: add new backends, drop seed backends no
    /// longer present, re-register changed ones. Dynamic backends are left
    /// alone.
    pub async fn apply_seed(&self, seed: Vec<BackendDescriptor>) {
        let dynamic: std::collections::HashSet<String> = self
            .dynamic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let desired: HashMap<String, BackendDescriptor> =
            seed.into_iter().map(|d| (d.id.clone(), d)).collect();

        // Remove seed-managed backends that disappeared or changed.
        let current: Vec<Arc<BackendHandle>> = self.handles();
        for handle in current {
            let id = &handle.descriptor.id;
            if dynamic.contains(id) {
                continue;
            }
            match desired.get(id) {
                Some(new) if new.same_spec(&handle.descriptor) => {}
                Some(_) | None => {
                    if let Err(e) = self.deregister(id).await {
                        warn!(backend = %id, error = %e, "seed reload: deregister failed");
                    }
                }
            }
        }

        // Add everything not currently registered.
        for (id, descriptor) in desired {
            if self.get(&id).is_none()
                && let Err(e) = self.register(descriptor).await
            {
                warn!(backend = %id, error = %e, "seed reload: register failed");
            }
        }
    }

    // --- Store persistence (runtime-registered backends only) ---

    /// Load the store and register its backends. Returns the count loaded.
    pub async fn load_store(&self) -> usize {
        let Some(path) = &self.store_path else { return 0 };
        let data = match tokio::fs::read_to_string(path).await {
            Ok(d) => d,
            Err(_) => return 0, // no store yet
        };

        let store: BackendStore = match serde_json::from_str::<BackendStore>(&data) {
            Ok(s) if s.version == STORE_VERSION => s,
            Ok(s) => {
                warn!(version = s.version, "incompatible backend store version, skipping");
                return 0;
            }
            Err(e) => {
                warn!(error = %e, "invalid backend store, skipping");
                return 0;
            }
        };

        let mut loaded = 0;
        for descriptor in store.backends {
            let id = descriptor.id.clone();
            if self.register(descriptor).await.is_ok() {
                self.dynamic
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id);
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!(backends = loaded, path = %path.display(), "restored backends from store");
        }
        loaded
    }

    /// Persist dynamic backends (atomic write via temp + rename).
    pub async fn save_store(&self) {
        let Some(path) = &self.store_path else { return };

        let dynamic: std::collections::HashSet<String> = self
            .dynamic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let backends: Vec<BackendDescriptor> = self
            .backends
            .iter()
            .filter(|e| dynamic.contains(e.key()))
            .map(|e| e.value().descriptor.clone())
            .collect();

        let store = BackendStore {
            version: STORE_VERSION,
            backends,
        };
        let json = match serde_json::to_string_pretty(&store) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize backend store");
                return;
            }
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(error = %e, "failed to create store directory");
            return;
        }

        let tmp = path.with_extension("store.tmp");
        if let Err(e) = tokio::fs::write(&tmp, &json).await {
            warn!(error = %e, "failed to write backend store temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!(error = %e, "failed to rename backend store file");
            return;
        }
        debug!(path = %path.display(), "backend store saved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, url: &str) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            url: url.to_string(),
            transport: TransportKind::Sse,
            display_name: None,
            tags: Vec::new(),
            registered_at: Utc::now(),
        }
    }

    fn registry(store: Option<PathBuf>) -> Arc<BackendRegistry> {
        let (signals, _rx) = mpsc::unbounded_channel();
        BackendRegistry::new(
            SessionConfig::default(),
            BackoffConfig {
                min: std::time::Duration::from_millis(10),
                max: std::time::Duration::from_millis(50),
            },
            signals,
            store,
        )
    }

    #[tokio::test]
    async fn test_register_and_conflict() {
        let reg = registry(None);
        reg.register(descriptor("b1", "http://localhost:1/sse"))
            .await
            .unwrap();
        let err = reg
            .register(descriptor("b1", "http://localhost:2/sse"))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::Conflict("b1".to_string()));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_deregister_not_found_is_idempotent() {
        let reg = registry(None);
        reg.register(descriptor("b1", "http://localhost:1/sse"))
            .await
            .unwrap();
        reg.deregister("b1").await.unwrap();
        let err = reg.deregister("b1").await.unwrap_err();
        assert_eq!(err, RegistryError::NotFound("b1".to_string()));
    }

    #[tokio::test]
    async fn test_events_fire_on_register_and_deregister() {
        let reg = registry(None);
        let mut events = reg.subscribe();

        reg.register(descriptor("b1", "http://localhost:1/sse"))
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            RegistryEvent::BackendAdded { id } => assert_eq!(id, "b1"),
            other => panic!("unexpected event {other:?}"),
        }

        reg.deregister("b1").await.unwrap();
        match events.recv().await.unwrap() {
            RegistryEvent::BackendRemoved { id } => assert_eq!(id, "b1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_health_flip_semantics() {
        let reg = registry(None);
        reg.register(descriptor("b1", "http://localhost:1/sse"))
            .await
            .unwrap();
        // New backends start unprobed/unhealthy; first success flips once.
        assert!(!reg.get("b1").unwrap().is_healthy());
        assert!(reg.record_probe_success("b1"));
        assert!(!reg.record_probe_success("b1")); // already healthy, no flip

        // Threshold failures flip exactly once.
        assert!(!reg.record_probe_failure("b1", "refused", 3));
        assert!(!reg.record_probe_failure("b1", "refused", 3));
        assert!(reg.record_probe_failure("b1", "refused", 3));
        assert!(!reg.record_probe_failure("b1", "refused", 3)); // stays down, no flip

        let health = reg.get("b1").unwrap().health();
        assert!(!health.is_healthy);
        assert_eq!(health.consecutive_failures, 4);
        assert_eq!(health.last_error.as_deref(), Some("refused"));

        // One success resets the counter and flips back.
        assert!(reg.record_probe_success("b1"));
        let health = reg.get("b1").unwrap().health();
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_error.is_none());
        assert!(health.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_store_roundtrip_only_persists_dynamic() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("backends.json");

        let reg = registry(Some(store_path.clone()));
        reg.register(descriptor("seeded", "http://localhost:1/sse"))
            .await
            .unwrap();
        reg.register(descriptor("runtime", "http://localhost:2/sse"))
            .await
            .unwrap();
        reg.mark_dynamic("runtime").await;

        let reg2 = registry(Some(store_path));
        let loaded = reg2.load_store().await;
        assert_eq!(loaded, 1);
        assert!(reg2.get("runtime").is_some());
        assert!(reg2.get("seeded").is_none());
    }

    #[tokio::test]
    async fn test_store_wrong_version_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("backends.json");
        tokio::fs::write(
            &store_path,
            serde_json::json!({"version": 99, "backends": []}).to_string(),
        )
        .await
        .unwrap();

        let reg = registry(Some(store_path));
        assert_eq!(reg.load_store().await, 0);
    }

    #[tokio::test]
    async fn test_apply_seed_diff() {
        let reg = registry(None);
        reg.register(descriptor("a", "http://localhost:1/sse"))
            .await
            .unwrap();
        reg.register(descriptor("b", "http://localhost:2/sse"))
            .await
            .unwrap();
        reg.register(descriptor("dyn", "http://localhost:3/sse"))
            .await
            .unwrap();
        reg.mark_dynamic("dyn").await;

        // New seed: "a" changes URL, "b" is gone, "c" is new.
        reg.apply_seed(vec![
            descriptor("a", "http://localhost:10/sse"),
            descriptor("c", "http://localhost:4/sse"),
        ])
        .await;

        assert_eq!(
            reg.get("a").unwrap().descriptor.url,
            "http://localhost:10/sse"
        );
        assert!(reg.get("b").is_none());
        assert!(reg.get("c").is_some());
        // Dynamic backends survive seed reloads.
        assert!(reg.get("dyn").is_some());
    }

    #[test]
    fn test_descriptor_same_spec_ignores_registered_at() {
        let mut a = descriptor("x", "http://localhost:1/sse");
        let mut b = descriptor("x", "http://localhost:1/sse");
        b.registered_at = Utc::now();
        assert!(a.same_spec(&b));
        a.tags = vec!["analytics".to_string()];
        assert!(!a.same_spec(&b));
    }
}
