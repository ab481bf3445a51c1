//! Gateway error taxonomy (spec §7) and its mapping onto JSON-RPC error
//! codes / HTTP status codes. One implementation site for the mapping
//! table, so the HTTP layer and the router never have to re-derive it.

use crate::jsonrpc::{self, JsonRpcErrorObject};
use axum::http::StatusCode;
use thiserror::Error;

/// Transport-level failures talking to a child MCP server (spec §4.1, §7).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out waiting for upstream response")]
    Timeout,
    #[error("failed to decode upstream JSON-RPC message: {0}")]
    DecodeError(String),
    #[error("child process exited")]
    ChildExited,
    #[error("MCP handshake failed: {0}")]
    HandshakeFailed(String),
}

/// The full gateway error taxonomy (spec §7).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Method not found: {0}")]
    UnknownCapability(String),

    #[error("Method not found: {0}")]
    UnknownMethod(String),

    #[error("invalid JSON-RPC request: {0}")]
    InvalidJsonRpc(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("API key required")]
    MissingKey,

    #[error("invalid API key")]
    InvalidKey,

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("request body exceeds configured limit")]
    BodyTooLarge,

    #[error("no healthy instance available for server '{0}'")]
    NoHealthyInstance(String),

    /// A real JSON-RPC `error` object returned by an upstream child, passed
    /// through verbatim rather than collapsed into `Unexpected` (spec §7:
    /// only transport/internal failures become gateway errors; a tool-level
    /// error from the child is not the gateway's failure).
    #[error("upstream error: {0}")]
    Upstream(JsonRpcErrorObject),

    #[error("internal error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

impl GatewayError {
    /// JSON-RPC error code for errors that are reported inside a JSON-RPC
    /// response body. `None` for errors that are HTTP-only (auth, limits)
    /// per spec §7.
    pub fn json_rpc_code(&self) -> Option<i64> {
        match self {
            GatewayError::Transport(_) => Some(jsonrpc::GATEWAY_UPSTREAM_ERROR),
            GatewayError::UnknownCapability(_) | GatewayError::UnknownMethod(_) => {
                Some(jsonrpc::METHOD_NOT_FOUND)
            }
            GatewayError::InvalidJsonRpc(_) => Some(jsonrpc::INVALID_REQUEST),
            GatewayError::InvalidParams(_) => Some(jsonrpc::INVALID_PARAMS),
            GatewayError::NoHealthyInstance(_) => Some(jsonrpc::NO_HEALTHY_INSTANCE),
            GatewayError::Upstream(obj) => Some(obj.code),
            GatewayError::Unexpected(_) => Some(jsonrpc::INTERNAL_ERROR),
            GatewayError::MissingKey
            | GatewayError::InvalidKey
            | GatewayError::RateLimited { .. }
            | GatewayError::BodyTooLarge => None,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::MissingKey | GatewayError::InvalidKey => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::NoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidJsonRpc(_) => StatusCode::BAD_REQUEST,
            // Everything else that reaches the client as a JSON-RPC error
            // body is still carried over a 200 response per JSON-RPC
            // convention (the protocol error lives in the body).
            _ => StatusCode::OK,
        }
    }

    /// Build the JSON-RPC error object for responses that carry one.
    pub fn to_json_rpc_error(&self) -> JsonRpcErrorObject {
        if let GatewayError::Upstream(obj) = self {
            return obj.clone();
        }
        let code = self.json_rpc_code().unwrap_or(jsonrpc::INTERNAL_ERROR);
        JsonRpcErrorObject::new(code, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_capability_maps_to_method_not_found() {
        let err = GatewayError::UnknownCapability("nope".into());
        assert_eq!(err.json_rpc_code(), Some(jsonrpc::METHOD_NOT_FOUND));
    }

    #[test]
    fn auth_errors_have_no_json_rpc_code() {
        assert_eq!(GatewayError::MissingKey.json_rpc_code(), None);
        assert_eq!(GatewayError::InvalidKey.json_rpc_code(), None);
        assert_eq!(GatewayError::MissingKey.http_status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn capacity_error_is_503_with_dash32001() {
        let err = GatewayError::NoHealthyInstance("linear".into());
        assert_eq!(err.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.json_rpc_code(), Some(jsonrpc::NO_HEALTHY_INSTANCE));
    }

    #[test]
    fn transport_child_exited_maps_to_gateway_upstream_error() {
        let err: GatewayError = TransportError::ChildExited.into();
        assert_eq!(err.json_rpc_code(), Some(jsonrpc::GATEWAY_UPSTREAM_ERROR));
    }

    #[test]
    fn upstream_error_passes_through_the_childs_own_code_and_message() {
        let obj = JsonRpcErrorObject::new(-32001, "tool exploded");
        let err = GatewayError::Upstream(obj);
        assert_eq!(err.json_rpc_code(), Some(-32001));
        assert_eq!(err.to_json_rpc_error().message, "tool exploded");
        assert_eq!(err.http_status(), StatusCode::OK);
    }
}
