//! Caller identity and per-tool access policy.
//!
//! Policies are declarative data loaded from a YAML file: tool allow-lists
//! and argument shape limits per caller, with a default block for everyone
//! else. The gateway never grows per-tool code paths; limits are applied
//! to the opaque argument JSON before dispatch.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayError;

/// Who is calling. Unknown bearer tokens degrade to anonymous rather than
/// being rejected outright; rejection happens per tool via the allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    Caller(String),
}

impl Identity {
    pub fn label(&self) -> &str {
        match self {
            Identity::Anonymous => "anonymous",
            Identity::Caller(name) => name,
        }
    }
}

fn default_max_argument_bytes() -> usize {
    256 * 1024
}

fn default_max_string_length() -> usize {
    64 * 1024
}

fn default_max_depth() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArgumentLimits {
    /// Cap on the serialized size of the whole arguments object.
    #[serde(default = "default_max_argument_bytes")]
    pub max_argument_bytes: usize,

    /// Cap on any single string value.
    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,

    /// Cap on container nesting.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for ArgumentLimits {
    fn default() -> Self {
        Self {
            max_argument_bytes: default_max_argument_bytes(),
            max_string_length: default_max_string_length(),
            max_depth: default_max_depth(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallerPolicy {
    /// Bearer token identifying this caller.
    #[serde(default)]
    pub token: Option<String>,

    /// Visible/callable tools. `None` = all. Entries are exact names or
    /// prefix globs like `events-search.*`.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,

    #[serde(default)]
    pub limits: ArgumentLimits,
}

impl CallerPolicy {
    pub fn tool_allowed(&self, tool_name: &str) -> bool {
        match &self.allowed_tools {
            None => true,
            Some(patterns) => patterns.iter().any(|p| {
                if let Some(prefix) = p.strip_suffix('*') {
                    tool_name.starts_with(prefix)
                } else {
                    p == tool_name
                }
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AclConfig {
    /// Policy applied to anonymous and unrecognized callers.
    #[serde(default)]
    pub default: CallerPolicy,

    /// Named callers, matched by bearer token.
    #[serde(default)]
    pub callers: HashMap<String, CallerPolicy>,
}

pub struct AccessControl {
    config: AclConfig,
}

impl AccessControl {
    pub fn new(config: AclConfig) -> Self {
        Self { config }
    }

    /// Load the policy file (with ${VAR} interpolation, so tokens can live
    /// in the environment). A missing path yields the permissive default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::new(AclConfig::default()));
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ACL file: {}", path.display()))?;
        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;
        let config: AclConfig = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse ACL file: {}", path.display()))?;
        Ok(Self::new(config))
    }

    /// Resolve the caller from an Authorization header value.
    pub fn identify(&self, authorization: Option<&str>) -> Identity {
        let Some(value) = authorization else {
            return Identity::Anonymous;
        };
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if token.is_empty() {
            return Identity::Anonymous;
        }
        for (name, policy) in &self.config.callers {
            if policy.token.as_deref() == Some(token) {
                return Identity::Caller(name.clone());
            }
        }
        Identity::Anonymous
    }

    pub fn policy_for(&self, identity: &Identity) -> &CallerPolicy {
        match identity {
            Identity::Anonymous => &self.config.default,
            Identity::Caller(name) => self
                .config
                .callers
                .get(name)
                .unwrap_or(&self.config.default),
        }
    }

    /// Reject a tools/call whose target is outside the caller's allow-list.
    pub fn authorize_call(&self, identity: &Identity, tool_name: &str) -> Result<(), GatewayError> {
        if self.policy_for(identity).tool_allowed(tool_name) {
            Ok(())
        } else {
            Err(GatewayError::Forbidden {
                caller: identity.label().to_string(),
                tool: tool_name.to_string(),
            })
        }
    }
}

/// Enforce argument shape limits pre-dispatch. Violations map to
/// `invalid_params`; the payload itself is never interpreted.
pub fn validate_arguments(arguments: &Value, limits: &ArgumentLimits) -> Result<(), GatewayError> {
    let serialized = serde_json::to_string(arguments)
        .map_err(|e| GatewayError::Internal(format!("argument serialization failed: {e}")))?;
    if serialized.len() > limits.max_argument_bytes {
        return Err(GatewayError::InvalidParams(format!(
            "arguments exceed {} bytes",
            limits.max_argument_bytes
        )));
    }
    check_value(arguments, limits, 0)
}

fn check_value(value: &Value, limits: &ArgumentLimits, depth: usize) -> Result<(), GatewayError> {
    if depth > limits.max_depth {
        return Err(GatewayError::InvalidParams(format!(
            "arguments exceed nesting depth {}",
            limits.max_depth
        )));
    }
    match value {
        Value::String(s) if s.len() > limits.max_string_length => {
            Err(GatewayError::InvalidParams(format!(
                "string value exceeds {} characters",
                limits.max_string_length
            )))
        }
        Value::Array(items) => {
            for item in items {
                check_value(item, limits, depth + 1)?;
            }
            Ok(())
        }
        Value::Object(fields) => {
            for (key, item) in fields {
                if key.len() > limits.max_string_length {
                    return Err(GatewayError::InvalidParams(format!(
                        "object key exceeds {} characters",
                        limits.max_string_length
                    )));
                }
                check_value(item, limits, depth + 1)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn acl() -> AccessControl {
        let yaml = r#"
default:
  allowed_tools: ["search", "events-search.*"]
callers:
  dashboard:
    token: dash-token
    allowed_tools: null
  restricted:
    token: restricted-token
    allowed_tools: ["chart"]
    limits:
      max_argument_bytes: 64
      max_string_length: 16
      max_depth: 3
"#;
        AccessControl::new(serde_yaml_ng::from_str(yaml).unwrap())
    }

    #[test]
    fn test_identify_by_token() {
        let acl = acl();
        assert_eq!(
            acl.identify(Some("Bearer dash-token")),
            Identity::Caller("dashboard".to_string())
        );
        // Raw token without the Bearer scheme also resolves.
        assert_eq!(
            acl.identify(Some("restricted-token")),
            Identity::Caller("restricted".to_string())
        );
        assert_eq!(acl.identify(Some("Bearer bogus")), Identity::Anonymous);
        assert_eq!(acl.identify(None), Identity::Anonymous);
    }

    #[test]
    fn test_allow_list_with_prefix_glob() {
        let acl = acl();
        let anon = Identity::Anonymous;
        assert!(acl.authorize_call(&anon, "search").is_ok());
        assert!(acl.authorize_call(&anon, "events-search.analyze").is_ok());
        let err = acl.authorize_call(&anon, "chart").unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden { .. }));
    }

    #[test]
    fn test_unrestricted_caller_sees_everything() {
        let acl = acl();
        let dash = Identity::Caller("dashboard".to_string());
        assert!(acl.authorize_call(&dash, "anything_at_all").is_ok());
    }

    #[test]
    fn test_argument_size_limit() {
        let acl = acl();
        let restricted = Identity::Caller("restricted".to_string());
        let limits = &acl.policy_for(&restricted).limits;

        assert!(validate_arguments(&json!({"q": "ok"}), limits).is_ok());

        let big = json!({"q": "x".repeat(200)});
        assert!(matches!(
            validate_arguments(&big, limits),
            Err(GatewayError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_string_length_limit() {
        let limits = ArgumentLimits {
            max_argument_bytes: 10_000,
            max_string_length: 8,
            max_depth: 10,
        };
        assert!(validate_arguments(&json!({"q": "short"}), &limits).is_ok());
        assert!(validate_arguments(&json!({"q": "muchtoolongvalue"}), &limits).is_err());
    }

    #[test]
    fn test_nesting_depth_limit() {
        let limits = ArgumentLimits {
            max_argument_bytes: 10_000,
            max_string_length: 100,
            max_depth: 3,
        };
        let shallow = json!({"a": {"b": 1}});
        assert!(validate_arguments(&shallow, &limits).is_ok());

        let deep = json!({"a": {"b": {"c": {"d": {"e": 1}}}}});
        assert!(validate_arguments(&deep, &limits).is_err());
    }

    #[test]
    fn test_default_limits_are_permissive() {
        let limits = ArgumentLimits::default();
        let args = json!({"query": "x".repeat(1000), "filters": [{"field": "ts"}]});
        assert!(validate_arguments(&args, &limits).is_ok());
    }
}
