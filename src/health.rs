//! Health supervisor: periodic probes, failure accounting, and reconnect
//! scheduling for every registered backend.
//!
//! The supervisor is the only component that mutates health state (via the
//! registry's record_* methods) and the only one that restarts sessions.
//! Sessions report transport failures over a one-way channel; a reported
//! failure counts as a failed probe and can flip a backend unhealthy before
//! the next scheduled tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::catalog::ToolCatalog;
use crate::registry::{BackendHandle, BackendRegistry, RegistryEvent};
use crate::session::SessionSignal;
use crate::sse::BackoffConfig;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub fail_threshold: u32,
    pub backoff: BackoffConfig,
}

impl SupervisorConfig {
    pub fn from_gateway(config: &crate::config::GatewayConfig) -> Self {
        Self {
            interval: config.probe_interval,
            probe_timeout: config.probe_timeout,
            fail_threshold: config.fail_threshold,
            backoff: BackoffConfig {
                min: config.reconnect_backoff_min,
                max: config.reconnect_backoff_max,
            },
        }
    }
}

/// Per-backend reconnect bookkeeping. Attempts are sequential within the
/// supervisor task, so there is at most one in flight per backend.
#[derive(Debug, Default)]
pub(crate) struct ReconnectState {
    attempt: u32,
    last_attempt: Option<Instant>,
}

pub async fn run_supervisor(
    registry: Arc<BackendRegistry>,
    catalog: Arc<ToolCatalog>,
    config: SupervisorConfig,
    mut signals: mpsc::UnboundedReceiver<SessionSignal>,
    shutdown: Arc<Notify>,
) {
    info!(
        interval_secs = config.interval.as_secs(),
        fail_threshold = config.fail_threshold,
        "health supervisor started"
    );

    let mut reconnect: HashMap<String, ReconnectState> = HashMap::new();
    let mut events = registry.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {
                probe_pass(&registry, &config, &mut reconnect).await;
            }
            Some(signal) = signals.recv() => {
                handle_signal(&registry, &catalog, &config, &mut reconnect, signal).await;
            }
            event = events.recv() => {
                match event {
                    Ok(RegistryEvent::BackendAdded { id }) => {
                        // Probe new backends immediately rather than waiting
                        // out a full tick.
                        if let Some(handle) = registry.get(&id) {
                            attempt_probe(&registry, &config, &mut reconnect, &handle).await;
                        }
                    }
                    Ok(RegistryEvent::BackendRemoved { id }) => {
                        reconnect.remove(&id);
                    }
                    Ok(RegistryEvent::HealthChanged { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                }
            }
            _ = shutdown.notified() => {
                info!("health supervisor shutting down");
                return;
            }
        }
    }
}

async fn handle_signal(
    registry: &Arc<BackendRegistry>,
    catalog: &Arc<ToolCatalog>,
    config: &SupervisorConfig,
    reconnect: &mut HashMap<String, ReconnectState>,
    signal: SessionSignal,
) {
    match signal {
        SessionSignal::TransportFailed { backend_id, error } => {
            warn!(backend = %backend_id, error = %error, "transport failure reported");
            let flipped = registry.record_probe_failure(&backend_id, &error, config.fail_threshold);
            if flipped {
                if let Some(handle) = registry.get(&backend_id) {
                    handle.session.close().await;
                }
                reconnect.entry(backend_id).or_default();
            }
        }
        SessionSignal::ToolListChanged { backend_id } => {
            info!(backend = %backend_id, "tool list change notification, invalidating catalog");
            catalog.invalidate();
        }
    }
}

/// One probe tick: concurrent staggered probes of healthy backends, then
/// sequential reconnect attempts (with backoff) for unhealthy ones.
/// Exposed to tests so they can drive ticks deterministically.
pub(crate) async fn probe_pass(
    registry: &Arc<BackendRegistry>,
    config: &SupervisorConfig,
    reconnect: &mut HashMap<String, ReconnectState>,
) {
    let healthy: Vec<Arc<BackendHandle>> = registry
        .handles()
        .into_iter()
        .filter(|h| h.is_healthy())
        .collect();

    if !healthy.is_empty() {
        // Stagger probes across 80% of the interval to avoid a thundering
        // herd against the backends.
        let stagger = if healthy.len() > 1 {
            config.interval.mul_f64(0.8) / healthy.len() as u32
        } else {
            Duration::ZERO
        };

        let probes: Vec<_> = healthy
            .iter()
            .enumerate()
            .map(|(i, handle)| {
                let handle = Arc::clone(handle);
                let probe_timeout = config.probe_timeout;
                let delay = stagger * i as u32;
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let result = probe_backend(&handle, probe_timeout).await;
                    (handle.descriptor.id.clone(), result)
                }
            })
            .collect();

        for (id, result) in futures::future::join_all(probes).await {
            match result {
                Ok(()) => {
                    registry.record_probe_success(&id);
                    reconnect.remove(&id);
                }
                Err(error) => {
                    let flipped =
                        registry.record_probe_failure(&id, &error, config.fail_threshold);
                    if flipped {
                        if let Some(handle) = registry.get(&id) {
                            handle.session.close().await;
                        }
                        reconnect.entry(id).or_default();
                    }
                }
            }
        }
    }

    // Reconnect phase: unhealthy (and never-initialized) backends, honoring
    // the jittered exponential backoff.
    let down: Vec<Arc<BackendHandle>> = registry
        .handles()
        .into_iter()
        .filter(|h| !h.is_healthy())
        .collect();

    for handle in down {
        attempt_probe(registry, config, reconnect, &handle).await;
    }
}

/// Try to (re)initialize one backend if its backoff window has elapsed.
async fn attempt_probe(
    registry: &Arc<BackendRegistry>,
    config: &SupervisorConfig,
    reconnect: &mut HashMap<String, ReconnectState>,
    handle: &Arc<BackendHandle>,
) {
    let id = handle.descriptor.id.clone();

    {
        let state = reconnect.entry(id.clone()).or_default();
        let due = state
            .last_attempt
            .map(|t| t.elapsed() >= config.backoff.delay(state.attempt))
            .unwrap_or(true);
        if !due {
            debug!(backend = %id, attempt = state.attempt, "waiting out reconnect backoff");
            return;
        }
        state.last_attempt = Some(Instant::now());
    }

    match probe_backend(handle, config.probe_timeout).await {
        Ok(()) => {
            registry.record_probe_success(&id);
            reconnect.remove(&id);
        }
        Err(error) => {
            debug!(backend = %id, error = %error, "reconnect attempt failed");
            registry.record_probe_failure(&id, &error, config.fail_threshold);
            if let Some(state) = reconnect.get_mut(&id) {
                state.attempt = state.attempt.saturating_add(1);
            }
        }
    }
}

/// Cheap liveness probe. An uninitialized session just attempts the
/// handshake; an initialized one verifies the connection with a tools/list.
async fn probe_backend(handle: &Arc<BackendHandle>, budget: Duration) -> Result<(), String> {
    let session = &handle.session;
    let probe = async {
        if !session.is_initialized() {
            session.ensure_initialized().await.map_err(|e| e.to_string())
        } else {
            session.list_tools().await.map(|_| ()).map_err(|e| e.to_string())
        }
    };
    match timeout(budget, probe).await {
        Ok(result) => result,
        Err(_) => Err(format!("probe timed out after {budget:?}")),
    }
}
