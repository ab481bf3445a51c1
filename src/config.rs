//! Gateway configuration: process env, CLI overrides, and the JSON
//! server-definition file. Mirrors the split the teacher uses for its
//! own MCP config (one struct for gateway-wide settings, one per
//! declared server) but adds the security/limits knobs this gateway
//! needs that the teacher's `McpConfig` never had to.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Host env vars passed through to every child unconditionally (spec
/// §4.2 spawn protocol step 1), merged with `ServerConfig.allowlisted_env`.
pub const HOST_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "TZ", "NODE_ENV", "LOG_LEVEL"];

fn default_max_instances() -> usize {
    1
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// One declared upstream MCP server (spec §3 `ServerConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Explicit allowlist of env vars to set on the child, merged with
    /// `HOST_ENV_ALLOWLIST`. Never a place to put secrets (spec §3).
    #[serde(default)]
    pub allowlisted_env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

impl ServerConfig {
    /// `minInstances = max(1, floor(maxInstances/2))` (spec §4.2). This is
    /// derived, never independently configured.
    pub fn min_instances(&self) -> usize {
        std::cmp::max(1, self.max_instances / 2)
    }
}

/// Cross-cutting security knobs (spec §3 `SecurityConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_true")]
    pub require_api_key_in_production: bool,
    #[serde(default = "default_body_limit_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_handshake_timeout_ms")]
    pub mcp_handshake_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

/// Hard upper bound on any single request body, independent of the
/// configured `maxRequestBytes` (spec §6.1).
pub const HARD_BODY_LIMIT_BYTES: usize = 1024 * 1024;

fn default_body_limit_bytes() -> usize {
    HARD_BODY_LIMIT_BYTES
}
fn default_rate_limit_per_minute() -> u32 {
    120
}
fn default_handshake_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            require_api_key_in_production: true,
            max_body_bytes: default_body_limit_bytes(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            mcp_handshake_timeout_ms: default_handshake_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl SecurityConfig {
    /// Effective body limit: the smaller of the configured limit and the
    /// hard 1 MiB ceiling (spec §6.1).
    pub fn effective_max_body_bytes(&self) -> usize {
        self.max_body_bytes.min(HARD_BODY_LIMIT_BYTES)
    }
}

/// Process-wide aggregate root, built once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub production: bool,
    pub security: SecurityConfig,
    pub servers: HashMap<String, ServerConfig>,
}

/// On-disk server-definition file shape: `{"servers": [ ... ], "security": {...}}`.
#[derive(Debug, Deserialize)]
struct ServerFile {
    #[serde(default)]
    servers: Vec<ServerConfig>,
    #[serde(default)]
    security: Option<SecurityConfig>,
}

impl GatewayConfig {
    /// Resolve the server-definition file path: CLI arg, then
    /// `$MCP_GATEWAY_CONFIG`, then `./gateway.config.json` (spec §6.3).
    pub fn resolve_config_path(cli_arg: Option<&str>) -> PathBuf {
        if let Some(p) = cli_arg {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("MCP_GATEWAY_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("./gateway.config.json")
    }

    pub fn load(config_path: &Path, cli_port: Option<u16>) -> Result<Self> {
        let raw = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading config file {}", config_path.display()))?;
        let file: ServerFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", config_path.display()))?;

        let mut servers = HashMap::with_capacity(file.servers.len());
        for server in file.servers {
            if servers.insert(server.id.clone(), server).is_some() {
                anyhow::bail!("duplicate server id in config file");
            }
        }

        let host = std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = cli_port
            .or_else(|| std::env::var("GATEWAY_PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(8787);
        let production = std::env::var("NODE_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);

        let mut security = file.security.unwrap_or_default();
        if let Ok(keys) = std::env::var("MCP_API_KEY") {
            security.api_keys = keys.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("MCP_HANDSHAKE_TIMEOUT") {
            if let Ok(ms) = v.parse() {
                security.mcp_handshake_timeout_ms = ms;
            }
        }

        Ok(Self {
            host,
            port,
            production,
            security,
            servers,
        })
    }

    /// The env-var substring check the manager uses to reject secrets
    /// from being echoed into child env allowlists (spec §4.2). A plain
    /// uppercase substring scan is sufficient here; pulling in `regex`
    /// for a three-literal case-insensitive match would be overkill.
    pub fn looks_like_secret_key(name: &str) -> bool {
        let upper = name.to_uppercase();
        upper.contains("KEY") || upper.contains("SECRET") || upper.contains("PASSWORD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_key_detection_is_case_insensitive() {
        assert!(GatewayConfig::looks_like_secret_key("API_KEY"));
        assert!(GatewayConfig::looks_like_secret_key("db_password"));
        assert!(GatewayConfig::looks_like_secret_key("Secret_Token"));
        assert!(!GatewayConfig::looks_like_secret_key("PATH"));
        assert!(!GatewayConfig::looks_like_secret_key("HOME"));
    }

    #[test]
    fn min_instances_is_floor_half_max_with_floor_one() {
        let cfg = ServerConfig {
            id: "s".into(),
            command: "true".into(),
            args: vec![],
            allowlisted_env: HashMap::new(),
            working_dir: None,
            max_instances: 5,
            request_timeout_ms: 1000,
            health_check_interval_ms: 10_000,
        };
        assert_eq!(cfg.min_instances(), 2);

        let single = ServerConfig {
            max_instances: 1,
            ..cfg
        };
        assert_eq!(single.min_instances(), 1);
    }

    #[test]
    fn effective_body_limit_never_exceeds_hard_ceiling() {
        let mut security = SecurityConfig::default();
        security.max_body_bytes = 10 * 1024 * 1024;
        assert_eq!(security.effective_max_body_bytes(), HARD_BODY_LIMIT_BYTES);
    }

    #[test]
    fn resolve_config_path_prefers_cli_arg() {
        let path = GatewayConfig::resolve_config_path(Some("/tmp/custom.json"));
        assert_eq!(path, PathBuf::from("/tmp/custom.json"));
    }

    #[test]
    fn load_rejects_duplicate_server_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.config.json");
        std::fs::write(
            &path,
            r#"{"servers":[{"id":"a","command":"true"},{"id":"a","command":"true"}]}"#,
        )
        .unwrap();
        let result = GatewayConfig::load(&path, None);
        assert!(result.is_err());
    }
}
