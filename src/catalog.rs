//! Tool catalog: the aggregated, cached view of tools across all healthy
//! backends.
//!
//! Builds are single-flighted and the result is held in an `ArcSwapOption`
//! snapshot: readers never block a rebuild, and invalidation is a pointer
//! store. A partial catalog (some backends skipped or failing) is still
//! served; one dead backend must not blank the gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CollisionPolicy;
use crate::protocol::ToolDefinition;
use crate::registry::{BackendRegistry, RegistryEvent};

/// One tool in the aggregated catalog.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    /// Name as exposed by the gateway (possibly backend-prefixed).
    pub name: String,
    /// Name at the owning backend.
    pub original_name: String,
    pub backend_id: String,
    pub description: String,
    pub input_schema: Value,
    pub annotations: Option<Value>,
}

#[derive(Debug)]
pub struct CatalogSnapshot {
    /// Tools of currently-healthy backends; what tools/list serves.
    pub entries: Vec<ToolEntry>,
    pub partial: bool,
    pub built_at: DateTime<Utc>,
    expires: Instant,
    by_name: HashMap<String, usize>,
    ambiguous: std::collections::HashSet<String>,
    /// Last-known tools of backends that are currently down. Hidden from
    /// listings, but still resolvable so a call can fail with
    /// backend_unhealthy instead of not_found.
    stale: HashMap<String, ToolEntry>,
}

impl CatalogSnapshot {
    pub fn resolve(&self, name: &str) -> Resolution {
        if self.ambiguous.contains(name) {
            return Resolution::Ambiguous;
        }
        if let Some(&idx) = self.by_name.get(name) {
            return Resolution::Found(self.entries[idx].clone());
        }
        match self.stale.get(name) {
            Some(entry) => Resolution::Found(entry.clone()),
            None => Resolution::NotFound,
        }
    }
}

#[derive(Debug)]
pub enum Resolution {
    Found(ToolEntry),
    NotFound,
    Ambiguous,
}

pub struct ToolCatalog {
    registry: Arc<BackendRegistry>,
    snapshot: ArcSwapOption<CatalogSnapshot>,
    /// Last snapshot ever built, surviving invalidation. Source of the
    /// stale carry-over for unhealthy backends.
    previous: ArcSwapOption<CatalogSnapshot>,
    build_lock: tokio::sync::Mutex<()>,
    ttl: Duration,
    policy: CollisionPolicy,
}

impl ToolCatalog {
    pub fn new(
        registry: Arc<BackendRegistry>,
        ttl: Duration,
        policy: CollisionPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            snapshot: ArcSwapOption::empty(),
            previous: ArcSwapOption::empty(),
            build_lock: tokio::sync::Mutex::new(()),
            ttl,
            policy,
        })
    }

    /// React to registry changes: any add/remove/health flip drops the
    /// cached snapshot.
    pub fn spawn_invalidation_task(self: &Arc<Self>) {
        let mut events = self.registry.subscribe();
        let catalog = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        match &event {
                            RegistryEvent::HealthChanged { id, healthy } => {
                                debug!(backend = %id, healthy, "invalidating catalog on health change");
                            }
                            RegistryEvent::BackendAdded { id }
                            | RegistryEvent::BackendRemoved { id } => {
                                debug!(backend = %id, "invalidating catalog on backend change");
                            }
                        }
                        catalog.invalidate();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        catalog.invalidate();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn invalidate(&self) {
        self.snapshot.store(None);
    }

    /// Build time of the currently cached snapshot, if one is live.
    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.current().map(|s| s.built_at)
    }

    fn current(&self) -> Option<Arc<CatalogSnapshot>> {
        self.snapshot
            .load_full()
            .filter(|s| Instant::now() < s.expires)
    }

    /// Return the cached snapshot, or build one. Concurrent callers during a
    /// cold build share the same in-flight fan-out.
    pub async fn get(&self) -> Arc<CatalogSnapshot> {
        if let Some(snapshot) = self.current() {
            return snapshot;
        }
        let _flight = self.build_lock.lock().await;
        // A builder that held the lock before us may have filled the cache.
        if let Some(snapshot) = self.current() {
            return snapshot;
        }
        let snapshot = Arc::new(self.build().await);
        self.snapshot.store(Some(Arc::clone(&snapshot)));
        self.previous.store(Some(Arc::clone(&snapshot)));
        snapshot
    }

    pub async fn resolve(&self, name: &str) -> Resolution {
        self.get().await.resolve(name)
    }

    /// Fan out tools/list to every healthy backend; unhealthy backends are
    /// skipped and flagged rather than blocking the build.
    async fn build(&self) -> CatalogSnapshot {
        let total = self.registry.len();
        let healthy = self.registry.healthy_handles();
        let mut partial = healthy.len() < total;

        let fetches = healthy.into_iter().map(|handle| async move {
            let id = handle.descriptor.id.clone();
            let result = handle.session.list_tools().await;
            (id, result)
        });
        let results = futures::future::join_all(fetches).await;

        let mut raw: Vec<(String, ToolDefinition)> = Vec::new();
        for (backend_id, result) in results {
            match result {
                Ok(tools) => {
                    for tool in tools {
                        raw.push((backend_id.clone(), tool));
                    }
                }
                Err(e) => {
                    warn!(backend = %backend_id, error = %e, "tools/list failed during catalog build");
                    partial = true;
                }
            }
        }

        let entries = resolve_collisions(raw, self.policy);

        let mut by_name = HashMap::with_capacity(entries.len());
        let mut ambiguous = std::collections::HashSet::new();
        for (idx, entry) in entries.iter().enumerate() {
            if by_name.insert(entry.name.clone(), idx).is_some() {
                ambiguous.insert(entry.name.clone());
            }
        }

        // Carry forward last-known tools of backends that are down, so
        // calls to them can fail with backend_unhealthy rather than
        // not_found. Dropped once the backend is deregistered.
        let mut stale: HashMap<String, ToolEntry> = HashMap::new();
        if let Some(last) = self.previous.load_full() {
            for entry in last.entries.iter().chain(last.stale.values()) {
                let still_registered = self.registry.get(&entry.backend_id).is_some();
                if still_registered && !by_name.contains_key(&entry.name) {
                    stale.insert(entry.name.clone(), entry.clone());
                }
            }
        }

        info!(
            tools = entries.len(),
            stale = stale.len(),
            partial,
            "tool catalog built"
        );

        CatalogSnapshot {
            entries,
            partial,
            built_at: Utc::now(),
            expires: Instant::now() + self.ttl,
            by_name,
            ambiguous,
            stale,
        }
    }
}

/// Apply the collision policy. Deterministic: input is sorted by
/// (backend id, tool name) first, so rebuilds expose identical names.
pub fn resolve_collisions(
    mut raw: Vec<(String, ToolDefinition)>,
    policy: CollisionPolicy,
) -> Vec<ToolEntry> {
    raw.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));

    let mut owners: HashMap<&str, u32> = HashMap::new();
    for (_, tool) in &raw {
        *owners.entry(tool.name.as_str()).or_default() += 1;
    }
    // Under winner policy the lexicographically smallest backend id keeps
    // the bare name; the sort above makes "first seen" exactly that backend.
    let mut claimed: std::collections::HashSet<String> = std::collections::HashSet::new();

    let owners: HashMap<String, u32> = owners
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

    raw.into_iter()
        .map(|(backend_id, tool)| {
            let collides = owners.get(&tool.name).copied().unwrap_or(0) > 1;
            let exposed = if !collides {
                tool.name.clone()
            } else {
                match policy {
                    CollisionPolicy::Prefix => format!("{backend_id}.{}", tool.name),
                    CollisionPolicy::Winner => {
                        if claimed.insert(tool.name.clone()) {
                            tool.name.clone()
                        } else {
                            format!("{backend_id}.{}", tool.name)
                        }
                    }
                }
            };
            ToolEntry {
                name: exposed,
                original_name: tool.name,
                backend_id,
                description: tool.description.unwrap_or_default(),
                input_schema: tool.input_schema,
                annotations: tool.annotations,
            }
        })
        .collect()
}
