//! Typed gateway configuration, derived from CLI flags / environment
//! variables, plus the YAML backends seed file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::registry::BackendDescriptor;

/// How the catalog exposes two backends that publish the same tool name.
/// Chosen at startup; stable across rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// All colliding entries are exposed as `{backend_id}.{name}`.
    Prefix,
    /// The lexicographically smallest backend id keeps the bare name;
    /// losers are exposed under the prefixed name.
    Winner,
}

impl std::str::FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "prefix" => Ok(CollisionPolicy::Prefix),
            "winner" => Ok(CollisionPolicy::Winner),
            other => Err(format!(
                "unknown collision policy '{other}' (expected 'prefix' or 'winner')"
            )),
        }
    }
}

/// Timeouts for individual MCP session operations. Not part of the public
/// environment surface.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Budget for the initialize + initialized handshake.
    pub init_timeout: Duration,
    /// Per-backend budget for a tools/list, used by catalog builds and probes.
    pub list_tools_timeout: Duration,
    /// Budget for opening a transport (dial + endpoint frame for SSE).
    pub dial_timeout: Duration,
    /// Capacity of each SSE subscriber queue; overflow drops the subscriber.
    pub subscriber_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            list_tools_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            subscriber_queue: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub fail_threshold: u32,
    pub call_deadline: Duration,
    pub reconnect_backoff_min: Duration,
    pub reconnect_backoff_max: Duration,
    pub catalog_ttl: Duration,
    pub max_inflight_per_client: usize,
    pub collision_policy: CollisionPolicy,
    pub backends_file: Option<PathBuf>,
    pub store_path: PathBuf,
    pub acl_file: Option<PathBuf>,
    pub admin_token: Option<String>,
    pub log_level: String,
    pub session: SessionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".parse().expect("valid literal addr"),
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            fail_threshold: 3,
            call_deadline: Duration::from_secs(120),
            reconnect_backoff_min: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_millis(30_000),
            catalog_ttl: Duration::from_secs(300),
            max_inflight_per_client: 32,
            collision_policy: CollisionPolicy::Prefix,
            backends_file: None,
            store_path: default_store_path(),
            acl_file: None,
            admin_token: None,
            log_level: "info".to_string(),
            session: SessionConfig::default(),
        }
    }
}

/// Default store location: ~/.toolgate/backends.json, falling back to the
/// working directory when no home dir exists (containers).
pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".toolgate").join("backends.json"))
        .unwrap_or_else(|| PathBuf::from("toolgate-backends.json"))
}

impl GatewayConfig {
    /// Build and validate the runtime configuration. Any failure here is a
    /// configuration error (process exit code 2).
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let bind: SocketAddr = cli
            .bind
            .parse()
            .with_context(|| format!("invalid GATEWAY_BIND '{}'", cli.bind))?;

        let collision_policy: CollisionPolicy = cli
            .collision_policy
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let config = Self {
            bind,
            probe_interval: Duration::from_secs(cli.probe_interval_seconds),
            probe_timeout: Duration::from_secs(5),
            fail_threshold: cli.fail_threshold,
            call_deadline: Duration::from_secs(cli.call_deadline_seconds),
            reconnect_backoff_min: Duration::from_millis(cli.reconnect_backoff_min_ms),
            reconnect_backoff_max: Duration::from_millis(cli.reconnect_backoff_max_ms),
            catalog_ttl: Duration::from_secs(cli.tool_catalog_ttl_seconds),
            max_inflight_per_client: cli.max_inflight_per_client,
            collision_policy,
            backends_file: cli.backends,
            store_path: cli.store.unwrap_or_else(default_store_path),
            acl_file: cli.acl,
            admin_token: cli.admin_token,
            log_level: cli.log_level,
            session: SessionConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.fail_threshold == 0 {
            bail!("FAIL_THRESHOLD must be >= 1");
        }
        if self.probe_interval.is_zero() {
            bail!("PROBE_INTERVAL_SECONDS must be >= 1");
        }
        if self.reconnect_backoff_min > self.reconnect_backoff_max {
            bail!(
                "RECONNECT_BACKOFF_MIN_MS ({:?}) exceeds RECONNECT_BACKOFF_MAX_MS ({:?})",
                self.reconnect_backoff_min,
                self.reconnect_backoff_max
            );
        }
        if self.reconnect_backoff_min.is_zero() {
            bail!("RECONNECT_BACKOFF_MIN_MS must be >= 1");
        }
        if self.max_inflight_per_client == 0 {
            bail!("MAX_INFLIGHT_PER_CLIENT must be >= 1 (0 would reject every call)");
        }
        Ok(())
    }
}

/// The backends seed file: a static backend set registered at startup and
/// re-applied on file change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendsSeed {
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
}

/// Load the seed file. Pipeline: read file → expand ${VAR} from the process
/// environment → deserialize YAML → validate.
pub fn load_backends_seed(path: &Path) -> Result<Vec<BackendDescriptor>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read backends file: {}", path.display()))?;

    let expanded = shellexpand::env(&raw)
        .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;

    let seed: BackendsSeed = serde_yaml_ng::from_str(&expanded)
        .with_context(|| format!("failed to parse backends file: {}", path.display()))?;

    let mut seen = std::collections::HashSet::new();
    for backend in &seed.backends {
        if backend.id.is_empty() {
            bail!("backends file: backend with empty id");
        }
        if !seen.insert(backend.id.clone()) {
            bail!("backends file: duplicate backend id '{}'", backend.id);
        }
        url::Url::parse(&backend.url)
            .with_context(|| format!("backend '{}': invalid url '{}'", backend.id, backend.url))?;
    }

    Ok(seed.backends)
}

/// Watch the backends seed file and re-apply it on change. Runs until the
/// shutdown notify fires. A file that fails to parse keeps the current set.
pub async fn watch_backends_file(
    path: PathBuf,
    registry: std::sync::Arc<crate::registry::BackendRegistry>,
    shutdown: std::sync::Arc<tokio::sync::Notify>,
) {
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{error, info};

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create backends file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
        error!(path = %path.display(), error = %e, "failed to watch backends file");
        return;
    }

    info!(path = %path.display(), "backends file watcher started");

    // Debounce rapid-fire editor events.
    let debounce = Duration::from_millis(500);

    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}

                info!("backends file changed, reloading");
                match load_backends_seed(&path) {
                    Ok(seed) => {
                        let count = seed.len();
                        registry.apply_seed(seed).await;
                        info!(backends = count, "backends file re-applied");
                    }
                    Err(e) => {
                        error!(error = %e, "failed to parse backends file, keeping current set");
                    }
                }
            }
            _ = shutdown.notified() => {
                info!("backends file watcher shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["toolgate"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn test_defaults_match_published_surface() {
        let config = GatewayConfig::from_cli(cli(&[])).unwrap();
        assert_eq!(config.bind.port(), 8021);
        assert_eq!(config.probe_interval, Duration::from_secs(15));
        assert_eq!(config.fail_threshold, 3);
        assert_eq!(config.call_deadline, Duration::from_secs(120));
        assert_eq!(config.reconnect_backoff_min, Duration::from_millis(500));
        assert_eq!(config.reconnect_backoff_max, Duration::from_millis(30_000));
        assert_eq!(config.catalog_ttl, Duration::from_secs(300));
        assert_eq!(config.max_inflight_per_client, 32);
        assert_eq!(config.collision_policy, CollisionPolicy::Prefix);
    }

    #[test]
    fn test_invalid_bind_rejected() {
        assert!(GatewayConfig::from_cli(cli(&["--bind", "not-an-addr"])).is_err());
    }

    #[test]
    fn test_invalid_collision_policy_rejected() {
        assert!(GatewayConfig::from_cli(cli(&["--collision-policy", "merge"])).is_err());
    }

    #[test]
    fn test_backoff_ordering_enforced() {
        let result = GatewayConfig::from_cli(cli(&[
            "--reconnect-backoff-min-ms",
            "5000",
            "--reconnect-backoff-max-ms",
            "1000",
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_inflight_rejected() {
        assert!(GatewayConfig::from_cli(cli(&["--max-inflight-per-client", "0"])).is_err());
    }

    #[test]
    fn test_winner_policy_parses() {
        let config = GatewayConfig::from_cli(cli(&["--collision-policy", "winner"])).unwrap();
        assert_eq!(config.collision_policy, CollisionPolicy::Winner);
    }

    #[test]
    fn test_seed_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backends.yaml");
        std::fs::write(
            &path,
            r#"
backends:
  - id: events-search
    url: http://localhost:8003/sse
    transport: sse
    display_name: Events search
    tags: [analytics]
  - id: charts
    url: http://localhost:8004/mcp
    transport: streamable-http
"#,
        )
        .unwrap();

        let backends = load_backends_seed(&path).unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].id, "events-search");
        assert_eq!(backends[0].display_name.as_deref(), Some("Events search"));
        assert_eq!(backends[1].url, "http://localhost:8004/mcp");
    }

    #[test]
    fn test_seed_duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backends.yaml");
        std::fs::write(
            &path,
            r#"
backends:
  - id: a
    url: http://localhost:1/sse
  - id: a
    url: http://localhost:2/sse
"#,
        )
        .unwrap();
        assert!(load_backends_seed(&path).is_err());
    }

    #[test]
    fn test_seed_bad_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backends.yaml");
        std::fs::write(&path, "backends:\n  - id: a\n    url: \"not a url\"\n").unwrap();
        assert!(load_backends_seed(&path).is_err());
    }
}
