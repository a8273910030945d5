//! Command-line interface. Every gateway setting is also an environment
//! variable so containerized deployments need no flags at all.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "toolgate", version, about = "MCP gateway multiplexing backend MCP servers")]
pub struct Cli {
    /// Listen address for the MCP endpoint and admin API.
    #[arg(long, env = "GATEWAY_BIND", default_value = "0.0.0.0:8021")]
    pub bind: String,

    /// Seconds between health probes of each backend.
    #[arg(long, env = "PROBE_INTERVAL_SECONDS", default_value_t = 15)]
    pub probe_interval_seconds: u64,

    /// Consecutive probe failures before a backend is marked unhealthy.
    #[arg(long, env = "FAIL_THRESHOLD", default_value_t = 3)]
    pub fail_threshold: u32,

    /// Default deadline for a single tools/call, in seconds.
    #[arg(long, env = "CALL_DEADLINE_SECONDS", default_value_t = 120)]
    pub call_deadline_seconds: u64,

    /// Minimum reconnect backoff, in milliseconds.
    #[arg(long, env = "RECONNECT_BACKOFF_MIN_MS", default_value_t = 500)]
    pub reconnect_backoff_min_ms: u64,

    /// Maximum reconnect backoff, in milliseconds.
    #[arg(long, env = "RECONNECT_BACKOFF_MAX_MS", default_value_t = 30_000)]
    pub reconnect_backoff_max_ms: u64,

    /// Ceiling on tool catalog age before a rebuild, in seconds.
    #[arg(long, env = "TOOL_CATALOG_TTL_SECONDS", default_value_t = 300)]
    pub tool_catalog_ttl_seconds: u64,

    /// In-flight tools/call quota per client.
    #[arg(long, env = "MAX_INFLIGHT_PER_CLIENT", default_value_t = 32)]
    pub max_inflight_per_client: usize,

    /// Tool-name collision policy: "prefix" or "winner".
    #[arg(long, env = "COLLISION_POLICY", default_value = "prefix")]
    pub collision_policy: String,

    /// YAML file seeding the backend set at startup (hot-reloaded).
    #[arg(long, env = "TOOLGATE_BACKENDS")]
    pub backends: Option<PathBuf>,

    /// JSON store for backends registered at runtime via the admin API.
    /// Default: platform data dir, e.g. ~/.local/share/toolgate/backends.json.
    #[arg(long, env = "TOOLGATE_STORE")]
    pub store: Option<PathBuf>,

    /// YAML file with caller tool allow-lists and argument limits.
    #[arg(long, env = "TOOLGATE_ACL")]
    pub acl: Option<PathBuf>,

    /// Bearer token for the mutating admin endpoints. Unset disables them.
    #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Log filter, e.g. "info" or "toolgate=debug".
    #[arg(long, env = "TOOLGATE_LOG", default_value = "info")]
    pub log_level: String,
}
