//! Server manager: owns the pool of running instances per declared
//! server, maintains min/max instance invariants, health-checks, and
//! hands out instances to the router via least-connections selection
//! (spec §4.2).

use crate::config::{GatewayConfig, ServerConfig, HOST_ENV_ALLOWLIST};
use crate::error::{GatewayError, TransportError};
use crate::jsonrpc::JsonRpcRequest;
use crate::mcp::instance::{InstanceStatus, ServerInstance};
use crate::mcp::transport::StdioTransport;
use anyhow::{bail, Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Resolve a config-declared env entry for a child process. Values of the
/// form `${VAR}` are substituted from the gateway's own process
/// environment (an explicit, auditable allowlist); plain literal values
/// matching the secret-ish name patterns are refused rather than written
/// into the child's environment, since a literal secret sitting in the
/// server-definition file is almost always a config mistake.
fn resolve_env_entry(key: &str, value: &str) -> Option<String> {
    if let Some(var_name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        return std::env::var(var_name).ok();
    }
    if GatewayConfig::looks_like_secret_key(key) {
        tracing::warn!(env_key = key, "refusing literal secret value in server config env");
        return None;
    }
    Some(value.to_string())
}

/// Build a child's full environment: the fixed host allowlist
/// (`PATH`/`HOME`/`USER`/`TZ`/`NODE_ENV`/`LOG_LEVEL`) passed through
/// verbatim, merged with `ServerConfig.allowlisted_env`, with any key
/// matching `/KEY|SECRET|PASSWORD/i` rejected regardless of source
/// (spec §4.2 spawn protocol step 1).
fn build_child_env(config: &ServerConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for &name in HOST_ENV_ALLOWLIST {
        if GatewayConfig::looks_like_secret_key(name) {
            continue;
        }
        if let Ok(value) = std::env::var(name) {
            env.insert(name.to_string(), value);
        }
    }
    for (k, v) in &config.allowlisted_env {
        if let Some(resolved) = resolve_env_entry(k, v) {
            env.insert(k.clone(), resolved);
        } else {
            env.remove(k);
        }
    }
    env
}

pub struct ServerManager {
    configs: HashMap<String, ServerConfig>,
    instances: RwLock<HashMap<String, Vec<Arc<ServerInstance>>>>,
    handshake_timeout: Duration,
}

impl ServerManager {
    pub fn new(configs: HashMap<String, ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            configs,
            instances: RwLock::new(HashMap::new()),
            handshake_timeout,
        }
    }

    pub fn server_ids(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn config_for(&self, server_id: &str) -> Option<&ServerConfig> {
        self.configs.get(server_id)
    }

    /// Spawn `min_instances` for every declared server, all in parallel
    /// (spec §4.2 `initialize()`: "create up to `minInstances` instances in
    /// parallel"). Fails fast if any instance fails to start and handshake,
    /// matching the "fail fast on duplicate/invalid config" posture at
    /// startup.
    pub async fn start_all(&self) -> Result<()> {
        let spawns = self.configs.values().flat_map(|config| {
            let min = config.min_instances();
            std::iter::repeat_with(|| self.spawn_instance(&config.id)).take(min)
        });
        futures::future::try_join_all(spawns).await?;
        Ok(())
    }

    /// Spawn one new instance of `server_id`, perform the MCP handshake,
    /// and register it in the pool once ready.
    pub async fn spawn_instance(&self, server_id: &str) -> Result<Arc<ServerInstance>> {
        let config = self
            .configs
            .get(server_id)
            .with_context(|| format!("unknown server id: {server_id}"))?;

        let env = build_child_env(config);
        let transport = StdioTransport::spawn(
            &config.command,
            &config.args,
            &env,
            config.working_dir.as_deref(),
            Duration::from_millis(config.request_timeout_ms),
        )
        .with_context(|| format!("spawning server '{server_id}'"))?;

        let instance_id = format!("{server_id}-{}", Uuid::new_v4());
        let instance = Arc::new(ServerInstance::new(
            instance_id.clone(),
            server_id.to_string(),
            transport,
        ));

        match self.handshake(&instance).await {
            Ok(()) => {
                instance.set_status(InstanceStatus::Ready);
            }
            Err(e) => {
                instance.set_status(InstanceStatus::Dead);
                instance.transport.shutdown(Duration::from_millis(500)).await;
                return Err(e).with_context(|| format!("handshake with '{instance_id}' failed"));
            }
        }

        self.instances
            .write()
            .await
            .entry(server_id.to_string())
            .or_default()
            .push(instance.clone());

        tracing::info!(server_id, instance_id, "MCP server instance ready");
        Ok(instance)
    }

    async fn handshake(&self, instance: &ServerInstance) -> Result<()> {
        let init_req = JsonRpcRequest::new(
            instance.transport.next_instance_id(),
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") }
            })),
        );

        let resp = tokio::time::timeout(self.handshake_timeout, instance.transport.send(&init_req))
            .await
            .map_err(|_| TransportError::Timeout)??;

        if let Some(err) = resp.error {
            bail!(TransportError::HandshakeFailed(err.to_string()));
        }

        let notif = JsonRpcRequest::notification("notifications/initialized", Some(json!({})));
        instance.transport.notify(&notif).await.ok();
        Ok(())
    }

    /// Least-connections selection among ready instances of `server_id`,
    /// with the deterministic tie-break from §4.2. On a miss, triggers a
    /// replacement spawn attempt (spec §4.2: "If none are healthy, trigger
    /// `ensureMin()` and return null") and returns `NoHealthyInstance`
    /// immediately — there is no wait queue (spec §5); the caller
    /// translates the miss into `ServiceUnavailable` without blocking on
    /// the new instance coming up.
    pub async fn acquire(self: Arc<Self>, server_id: &str) -> Result<Arc<ServerInstance>, GatewayError> {
        if let Some(inst) = self.try_acquire_ready(server_id).await {
            return Ok(inst);
        }
        self.spawn_ensure_min(server_id.to_string());
        Err(GatewayError::NoHealthyInstance(server_id.to_string()))
    }

    async fn try_acquire_ready(&self, server_id: &str) -> Option<Arc<ServerInstance>> {
        let instances = self.instances.read().await;
        let candidates = instances.get(server_id);
        let chosen = candidates
            .into_iter()
            .flatten()
            .filter(|inst| inst.is_ready())
            .min_by_key(|inst| {
                let (conns, spawned_at, id) = inst.selection_key();
                (conns, spawned_at, id.to_string())
            })
            .cloned();

        if let Some(inst) = &chosen {
            inst.begin_call();
        }
        chosen
    }

    /// Fire-and-forget top-up to `minInstances`, run in the background so
    /// `acquire()` never blocks the caller on a fresh spawn+handshake.
    fn spawn_ensure_min(self: &Arc<Self>, server_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.ensure_min(&server_id).await;
        });
    }

    async fn ensure_min(&self, server_id: &str) {
        let Some(config) = self.configs.get(server_id) else {
            return;
        };
        let current = self.instance_count(server_id).await;
        let min = config.min_instances();
        for _ in current..min {
            if let Err(e) = self.spawn_instance(server_id).await {
                tracing::warn!(server_id, error = %e, "ensureMin spawn attempt after acquire miss failed");
            }
        }
    }

    pub fn release(&self, instance: &ServerInstance) {
        instance.end_call();
    }

    /// Cheap liveness sweep for one `serverId`: check only that each
    /// instance's process is still alive (spec §4.2 "a dead pid is the
    /// only reliable liveness signal"), remove the dead ones, and top the
    /// pool back up to `minInstances`. Crashed instances are never
    /// resurrected in place — only replaced.
    pub async fn health_check_tick(&self, server_id: &str) {
        let had_removals = {
            let mut instances = self.instances.write().await;
            let Some(pool) = instances.get_mut(server_id) else {
                return;
            };
            let before = pool.len();
            pool.retain(|inst| inst.is_ready() || inst.status() == InstanceStatus::Starting);
            pool.len() < before
        };
        if !had_removals {
            return;
        }
        self.ensure_min(server_id).await;
    }

    /// `(serverId, healthCheckIntervalMs)` for every declared server, so
    /// the caller can run one ticker per server at its own cadence.
    pub fn health_check_intervals(&self) -> Vec<(String, Duration)> {
        self.configs
            .values()
            .map(|c| (c.id.clone(), Duration::from_millis(c.health_check_interval_ms)))
            .collect()
    }

    pub async fn shutdown_all(&self, grace: Duration) {
        let instances = self.instances.write().await;
        for pool in instances.values() {
            for inst in pool {
                inst.transport.shutdown(grace).await;
            }
        }
    }

    pub async fn instance_count(&self, server_id: &str) -> usize {
        self.instances
            .read()
            .await
            .get(server_id)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    pub async fn healthy_count(&self, server_id: &str) -> usize {
        self.instances
            .read()
            .await
            .get(server_id)
            .map(|p| p.iter().filter(|inst| inst.is_ready()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_indirection_resolves_from_process_env() {
        std::env::set_var("MCP_GATEWAY_TEST_TOKEN", "abc123");
        let resolved = resolve_env_entry("API_KEY", "${MCP_GATEWAY_TEST_TOKEN}");
        assert_eq!(resolved, Some("abc123".to_string()));
        std::env::remove_var("MCP_GATEWAY_TEST_TOKEN");
    }

    #[test]
    fn literal_secret_like_value_is_refused() {
        let resolved = resolve_env_entry("DB_PASSWORD", "hunter2");
        assert_eq!(resolved, None);
    }

    #[test]
    fn literal_non_secret_value_passes_through() {
        let resolved = resolve_env_entry("LOG_FORMAT", "json");
        assert_eq!(resolved, Some("json".to_string()));
    }

    #[test]
    fn missing_indirected_var_resolves_to_none() {
        let resolved = resolve_env_entry("API_KEY", "${MCP_GATEWAY_TEST_DOES_NOT_EXIST}");
        assert_eq!(resolved, None);
    }

    #[tokio::test]
    async fn acquire_on_empty_pool_returns_no_healthy_instance() {
        let manager = Arc::new(ServerManager::new(HashMap::new(), Duration::from_secs(1)));
        let err = manager.acquire("nope").await.unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstance(_)));
    }

    #[test]
    fn build_child_env_never_contains_a_secret_like_key() {
        let mut allowlisted_env = HashMap::new();
        allowlisted_env.insert("DB_PASSWORD".to_string(), "hunter2".to_string());
        allowlisted_env.insert("LOG_FORMAT".to_string(), "json".to_string());

        let config = ServerConfig {
            id: "s".into(),
            command: "true".into(),
            args: vec![],
            allowlisted_env,
            working_dir: None,
            max_instances: 1,
            request_timeout_ms: 1000,
            health_check_interval_ms: 10_000,
        };

        let env = build_child_env(&config);
        assert!(!env.contains_key("DB_PASSWORD"));
        assert_eq!(env.get("LOG_FORMAT"), Some(&"json".to_string()));
    }
}
