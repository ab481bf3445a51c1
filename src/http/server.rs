//! HTTP/WebSocket front door (spec §4.4). Exposes `GET /health` (no auth),
//! `POST /mcp` (JSON-RPC over HTTP), `GET /mcp/ws` (JSON-RPC over
//! WebSocket), and a catch-all `OPTIONS` responder for CORS preflight.

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::http::context::RequestContext;
use crate::http::middleware::{self, SecurityState};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION};
use crate::mcp::{CapabilityIndex, Router as McpRouter, ServerManager};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ServerManager>,
    pub capabilities: Arc<CapabilityIndex>,
    pub router: Arc<McpRouter>,
    pub security: Arc<SecurityState>,
}

pub fn build_router(state: AppState, config: &GatewayConfig) -> axum::Router {
    let authenticated = axum::Router::new()
        .route("/mcp", post(handle_rpc_post))
        .route("/mcp/ws", get(handle_ws_upgrade))
        .layer(axum::middleware::from_fn(middleware::attach_org_context))
        .route_layer(axum::middleware::from_fn_with_state(
            state.security.clone(),
            middleware::require_api_key,
        ))
        .route_layer(axum::middleware::from_fn_with_state(
            state.security.clone(),
            middleware::rate_limit,
        ));

    axum::Router::new()
        .route("/health", get(handle_health))
        .merge(authenticated)
        .fallback(handle_options_fallback)
        .layer(RequestBodyLimitLayer::new(config.security.effective_max_body_bytes()))
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(middleware::cors_layer(&config.security))
        .with_state(state)
}

/// Per-server instance counts, health, and declared capabilities (spec §4.4).
/// Overall status is "degraded" if any declared server has zero healthy
/// instances.
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let mut servers = serde_json::Map::new();
    let mut degraded = false;

    let mut server_ids: Vec<&str> = state.manager.server_ids().collect();
    server_ids.sort();

    for server_id in server_ids {
        let instances = state.manager.instance_count(server_id).await;
        let healthy = state.manager.healthy_count(server_id).await;
        if healthy == 0 {
            degraded = true;
        }
        let capabilities = state.capabilities.capabilities_for_server(server_id);

        servers.insert(
            server_id.to_string(),
            json!({
                "instances": instances,
                "healthy": healthy,
                "capabilities": capabilities,
            }),
        );
    }

    let body = json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "servers": servers,
    });

    (StatusCode::OK, Json(body))
}

async fn handle_options_fallback(method: axum::http::Method) -> impl IntoResponse {
    if method == axum::http::Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Raw-body extraction (not axum's `Json<Value>` extractor) so a malformed
/// body still reaches `dispatch` and gets a proper JSON-RPC `-32700`
/// response instead of axum's default plain-text `JsonRejection`.
async fn handle_rpc_post(
    State(state): State<AppState>,
    axum::Extension(ctx): axum::Extension<RequestContext>,
    body: Bytes,
) -> impl IntoResponse {
    let (status, response) = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => dispatch(&state, &ctx, value).await,
        Err(_) => (StatusCode::OK, parse_error_response(None)),
    };
    (status, Json(response))
}

async fn handle_ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_session(socket, state))
}

async fn handle_ws_session(mut socket: WebSocket, state: AppState) {
    let ctx = RequestContext::default();
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else { continue };
        let parsed: Result<Value, _> = serde_json::from_str(&text);
        let (_, response) = match parsed {
            Ok(value) => dispatch(&state, &ctx, value).await,
            Err(_) => (StatusCode::OK, parse_error_response(None)),
        };
        let Ok(text) = serde_json::to_string(&response) else {
            break;
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

fn parse_error_response(id: Option<RequestId>) -> Value {
    serde_json::to_value(JsonRpcResponse::error(
        id,
        crate::jsonrpc::JsonRpcErrorObject::new(crate::jsonrpc::PARSE_ERROR, "invalid JSON"),
    ))
    .unwrap_or(Value::Null)
}

/// Validate a JSON-RPC envelope, route it, and build the response, paired
/// with the HTTP status the caller should actually return (spec §7: e.g. a
/// `NoHealthyInstance` error must surface as 503, not a blanket 200).
/// Shared by both the HTTP and WebSocket entry points; the WS side ignores
/// the status since a socket frame has no status code of its own.
async fn dispatch(state: &AppState, ctx: &RequestContext, raw: Value) -> (StatusCode, Value) {
    let request: JsonRpcRequest = match serde_json::from_value(raw) {
        Ok(req) => req,
        Err(e) => {
            let err = GatewayError::InvalidJsonRpc(e.to_string());
            return (
                err.http_status(),
                serde_json::to_value(JsonRpcResponse::error(None, err.to_json_rpc_error())).unwrap_or(Value::Null),
            );
        }
    };

    if request.jsonrpc != JSONRPC_VERSION {
        let err = GatewayError::InvalidJsonRpc(format!("unsupported jsonrpc version '{}'", request.jsonrpc));
        return (
            err.http_status(),
            serde_json::to_value(JsonRpcResponse::error(request.id.clone(), err.to_json_rpc_error()))
                .unwrap_or(Value::Null),
        );
    }

    let id = request.id.clone();
    let params = request.params.clone().unwrap_or(Value::Null);

    tracing::debug!(method = %request.method, org = ?ctx.organization_id(), "dispatching request");

    match state.router.route(id.clone(), &request.method, params, ctx).await {
        Ok(result) => (
            StatusCode::OK,
            serde_json::to_value(JsonRpcResponse::success(id, result)).unwrap_or(Value::Null),
        ),
        Err(err) => {
            let status = err.http_status();
            (
                status,
                serde_json::to_value(JsonRpcResponse::error(id, err.to_json_rpc_error())).unwrap_or(Value::Null),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_response_carries_dash32700() {
        let value = parse_error_response(None);
        assert_eq!(value["error"]["code"], crate::jsonrpc::PARSE_ERROR);
    }
}
