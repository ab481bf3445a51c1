//! `mcp_gateway`: a protocol gateway that multiplexes HTTP/JSON-RPC and
//! WebSocket clients onto a pool of stdio-based MCP subprocess servers.

pub mod config;
pub mod config_loader;
pub mod error;
pub mod http;
pub mod jsonrpc;
pub mod mcp;

use crate::config::GatewayConfig;
use crate::config_loader::{ConfigLoader, NoopConfigLoader};
use crate::http::middleware::SecurityState;
use crate::mcp::capability::CapabilityIndex;
use crate::mcp::{Router as McpRouter, ServerManager};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Build the capability index by listing tools/resources/prompts from
/// every started instance. Run once at startup, after `ServerManager`
/// has brought up each server's minimum instance count.
async fn build_capability_index(manager: &Arc<ServerManager>) -> Result<CapabilityIndex> {
    let mut builder = CapabilityIndex::builder();

    let mut server_ids: Vec<String> = manager.server_ids().map(str::to_string).collect();
    server_ids.sort();

    for server_id in &server_ids {
        let instance = manager
            .clone()
            .acquire(server_id)
            .await
            .with_context(|| format!("no ready instance for '{server_id}' during startup capability scan"))?;

        let req = crate::jsonrpc::JsonRpcRequest::new(
            instance.transport.next_instance_id(),
            "tools/list",
            None,
        );
        if let Ok(resp) = instance.transport.send(&req).await {
            if let Some(result) = resp.result {
                if let Some(tools) = result.get("tools").and_then(serde_json::Value::as_array) {
                    for tool in tools {
                        if let Some(name) = tool.get("name").and_then(serde_json::Value::as_str) {
                            builder
                                .add_tool(name, server_id)
                                .with_context(|| format!("duplicate tool '{name}'"))?;
                        }
                    }
                }
            }
        }

        let res_req = crate::jsonrpc::JsonRpcRequest::new(
            instance.transport.next_instance_id(),
            "resources/list",
            None,
        );
        if let Ok(resp) = instance.transport.send(&res_req).await {
            if let Some(result) = resp.result {
                if let Some(resources) = result.get("resources").and_then(serde_json::Value::as_array) {
                    for resource in resources {
                        if let Some(uri) = resource.get("uri").and_then(serde_json::Value::as_str) {
                            builder
                                .add_resource(uri, server_id)
                                .with_context(|| format!("duplicate resource '{uri}'"))?;
                        }
                    }
                }
            }
        }

        let prompt_req = crate::jsonrpc::JsonRpcRequest::new(
            instance.transport.next_instance_id(),
            "prompts/list",
            None,
        );
        if let Ok(resp) = instance.transport.send(&prompt_req).await {
            if let Some(result) = resp.result {
                if let Some(prompts) = result.get("prompts").and_then(serde_json::Value::as_array) {
                    for prompt in prompts {
                        if let Some(name) = prompt.get("name").and_then(serde_json::Value::as_str) {
                            builder
                                .add_prompt(name, server_id)
                                .with_context(|| format!("duplicate prompt '{name}'"))?;
                        }
                    }
                }
            }
        }

        manager.release(&instance);
    }

    Ok(builder.build())
}

/// Spawn one background health-check ticker per declared server, each at
/// its own `healthCheckIntervalMs` cadence (spec §4.2: "per serverId,
/// every healthCheckIntervalMs").
fn spawn_health_check_loops(manager: Arc<ServerManager>) {
    for (server_id, interval) in manager.health_check_intervals() {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.health_check_tick(&server_id).await;
            }
        });
    }
}

/// Which signal triggered shutdown, for the process exit code (spec §6.4:
/// `0` normal, `1` startup failure, `130` SIGINT by convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// SIGINT (Ctrl-C) — conventionally reported as exit code 130.
    Signal,
    /// SIGTERM or a graceful stop request — exit code 0.
    Terminate,
}

/// Wait for either Ctrl-C or SIGTERM, reporting which one fired.
async fn wait_for_shutdown_signal() -> ShutdownCause {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sig.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
            ShutdownCause::Signal
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
            ShutdownCause::Terminate
        }
    }
}

/// Start every configured server, build the capability index, bind the
/// HTTP listener, and serve until a shutdown signal arrives.
pub async fn run_gateway(
    config: GatewayConfig,
    config_loader: Arc<dyn ConfigLoader>,
) -> Result<ShutdownCause> {
    let handshake_timeout = Duration::from_millis(config.security.mcp_handshake_timeout_ms);
    let manager = Arc::new(ServerManager::new(config.servers.clone(), handshake_timeout));

    manager.start_all().await.context("starting MCP servers")?;

    let capabilities = Arc::new(build_capability_index(&manager).await?);
    tracing::info!(
        tools = capabilities.tool_names().count(),
        resources = capabilities.resource_uris().count(),
        prompts = capabilities.prompt_names().count(),
        "capability index built"
    );

    spawn_health_check_loops(manager.clone());

    let router = Arc::new(McpRouter::new(manager.clone(), capabilities.clone(), config_loader));
    let security = SecurityState::new(config.security.clone(), config.production);

    let state = crate::http::AppState {
        manager: manager.clone(),
        capabilities,
        router,
        security,
    };

    let app = crate::http::build_router(state, &config);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;

    tracing::info!(%addr, "mcp-gateway listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    let cause_slot: Arc<parking_lot::Mutex<Option<ShutdownCause>>> = Arc::new(parking_lot::Mutex::new(None));
    let signal_slot = cause_slot.clone();

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let cause = wait_for_shutdown_signal().await;
        *signal_slot.lock() = Some(cause);
    })
    .await
    .context("HTTP server error")?;

    tracing::info!("draining MCP server instances");
    manager
        .shutdown_all(Duration::from_millis(config.security.shutdown_grace_ms))
        .await;

    Ok((*cause_slot.lock()).unwrap_or(ShutdownCause::Terminate))
}

/// Convenience wrapper for deployments with no external prompt store.
pub fn default_config_loader() -> Arc<dyn ConfigLoader> {
    Arc::new(NoopConfigLoader)
}
