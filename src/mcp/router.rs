//! Method routing: resolves an inbound JSON-RPC method to one or more
//! target servers, forwards the call, and for `*/list` methods fans out
//! to every server and merges the results with first-wins-by-lexical-id
//! dedup (spec §4.3).

use crate::config_loader::{render_prompt, render_resource, ConfigLoader};
use crate::error::GatewayError;
use crate::http::context::RequestContext;
use crate::jsonrpc::{JsonRpcRequest, RequestId};
use crate::mcp::capability::CapabilityIndex;
use crate::mcp::manager::ServerManager;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

const PROTOCOL_VERSION: &str = "2024-11-05";

pub struct Router {
    manager: Arc<ServerManager>,
    capabilities: Arc<CapabilityIndex>,
    config_loader: Arc<dyn ConfigLoader>,
}

/// Single-target methods resolve a capability name out of `params` to
/// decide which server gets the call.
enum Target<'a> {
    Single(&'a str),
    FanOut,
}

impl Router {
    pub fn new(manager: Arc<ServerManager>, capabilities: Arc<CapabilityIndex>, config_loader: Arc<dyn ConfigLoader>) -> Self {
        Self {
            manager,
            capabilities,
            config_loader,
        }
    }

    fn resolve_target<'a>(&'a self, method: &str, params: &Value) -> Result<Target<'a>, GatewayError> {
        match method {
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::InvalidParams("missing 'name'".into()))?;
                self.capabilities
                    .resolve_tool(name)
                    .map(Target::Single)
                    .ok_or_else(|| GatewayError::UnknownCapability(name.to_string()))
            }
            "resources/read" => {
                let uri = params
                    .get("uri")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::InvalidParams("missing 'uri'".into()))?;
                self.capabilities
                    .resolve_resource_uri(uri)
                    .map(Target::Single)
                    .ok_or_else(|| GatewayError::UnknownCapability(uri.to_string()))
            }
            "prompts/get" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::InvalidParams("missing 'name'".into()))?;
                self.capabilities
                    .resolve_prompt(name)
                    .map(Target::Single)
                    .ok_or_else(|| GatewayError::UnknownCapability(name.to_string()))
            }
            "tools/list" | "resources/list" | "prompts/list" => Ok(Target::FanOut),
            other => Err(GatewayError::UnknownMethod(other.to_string())),
        }
    }

    pub async fn route(
        &self,
        client_id: Option<RequestId>,
        method: &str,
        params: Value,
        ctx: &RequestContext,
    ) -> Result<Value, GatewayError> {
        if method == "initialize" {
            return Ok(self.handle_initialize());
        }

        // Org-scoped overrides take precedence over the upstream child
        // (spec §4.6): the router consults the ConfigLoader before falling
        // through to the capability index.
        if method == "prompts/get" {
            if let Some(result) = self.prompt_override(ctx, &params).await? {
                return Ok(result);
            }
        }
        if method == "resources/read" {
            if let Some(result) = self.resource_override(ctx, &params).await? {
                return Ok(result);
            }
        }

        match self.resolve_target(method, &params)? {
            Target::Single(server_id) => self.forward_single(server_id, method, params).await,
            Target::FanOut => self.fan_out(method, ctx).await,
        }
        .map_err(|e| {
            tracing::warn!(method, ?client_id, error = %e, "routing failed");
            e
        })
    }

    async fn prompt_override(&self, ctx: &RequestContext, params: &Value) -> Result<Option<Value>, GatewayError> {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return Ok(None);
        };
        let template = self
            .config_loader
            .get_prompt(ctx, name)
            .await
            .map_err(GatewayError::Unexpected)?;
        let Some(template) = template else {
            return Ok(None);
        };

        let args: HashMap<String, String> = params
            .get("arguments")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(render_prompt(&template, &args)))
    }

    async fn resource_override(&self, ctx: &RequestContext, params: &Value) -> Result<Option<Value>, GatewayError> {
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return Ok(None);
        };
        let entry = self
            .config_loader
            .get_resource(ctx, uri)
            .await
            .map_err(GatewayError::Unexpected)?;
        Ok(entry.as_ref().map(render_resource))
    }

    /// Answered directly by the gateway itself, never forwarded to a child
    /// (spec §4.3: "served by the gateway itself, not forwarded"). Clients
    /// see one MCP peer; the pool of upstream servers behind it is not
    /// their concern.
    fn handle_initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
            "serverInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") }
        })
    }

    async fn forward_single(
        &self,
        server_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, GatewayError> {
        let instance = self.manager.clone().acquire(server_id).await?;
        let instance_req_id = instance.transport.next_instance_id();
        let req = JsonRpcRequest::new(instance_req_id, method, Some(params));

        let result = instance.transport.send(&req).await;
        self.manager.release(&instance);

        let resp = result?;
        if let Some(err) = resp.error {
            return Err(GatewayError::Upstream(err));
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    /// Fan out a `*/list` call to every server that contributes to the
    /// given capability kind, merging by lexical `serverId` — the first
    /// server (in sorted order) to declare a given name wins on conflict.
    /// Org-scoped entries from the `ConfigLoader` are merged in ahead of
    /// the upstream servers, so they win any name collision (spec §4.6).
    async fn fan_out(&self, method: &str, ctx: &RequestContext) -> Result<Value, GatewayError> {
        let key = match method {
            "tools/list" => "tools",
            "resources/list" => "resources",
            "prompts/list" => "prompts",
            other => return Err(GatewayError::UnknownMethod(other.to_string())),
        };

        let mut seen_names = std::collections::HashSet::new();
        let mut merged: Vec<Value> = Vec::new();

        match method {
            "prompts/list" => {
                if let Ok(templates) = self.config_loader.list_prompts(ctx).await {
                    for t in templates {
                        if seen_names.insert(t.name.clone()) {
                            merged.push(json!({ "name": t.name }));
                        }
                    }
                }
            }
            "resources/list" => {
                if let Ok(entries) = self.config_loader.list_resources(ctx).await {
                    for e in entries {
                        if seen_names.insert(e.uri.clone()) {
                            merged.push(json!({ "uri": e.uri }));
                        }
                    }
                }
            }
            _ => {}
        }

        let mut server_ids = self.manager.server_ids().map(str::to_string).collect::<Vec<_>>();
        server_ids.sort();

        for server_id in &server_ids {
            let instance = match self.manager.clone().acquire(server_id).await {
                Ok(inst) => inst,
                Err(_) => continue,
            };
            let instance_req_id = instance.transport.next_instance_id();
            let req = JsonRpcRequest::new(instance_req_id, method, None);
            let result = instance.transport.send(&req).await;
            self.manager.release(&instance);

            let Ok(resp) = result else { continue };
            let Some(result) = resp.result else { continue };
            let Some(items) = result.get(key).and_then(Value::as_array) else {
                continue;
            };

            for item in items {
                let name = item
                    .get("name")
                    .or_else(|| item.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if seen_names.insert(name) {
                    merged.push(item.clone());
                }
            }
        }

        Ok(json!({ key: merged }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::config_loader::{NoopConfigLoader, PromptTemplate};
    use std::collections::HashMap;
    use std::time::Duration;

    fn empty_router() -> Router {
        let manager = Arc::new(ServerManager::new(HashMap::<String, ServerConfig>::new(), Duration::from_secs(1)));
        let capabilities = Arc::new(CapabilityIndex::builder().build());
        Router::new(manager, capabilities, Arc::new(NoopConfigLoader))
    }

    struct FixedPromptLoader(PromptTemplate);

    #[async_trait::async_trait]
    impl ConfigLoader for FixedPromptLoader {
        async fn get_prompt(
            &self,
            _ctx: &RequestContext,
            name: &str,
        ) -> anyhow::Result<Option<PromptTemplate>> {
            Ok((name == self.0.name).then(|| self.0.clone()))
        }
        async fn get_resource(
            &self,
            _ctx: &RequestContext,
            _uri: &str,
        ) -> anyhow::Result<Option<crate::config_loader::ResourceEntry>> {
            Ok(None)
        }
        async fn list_prompts(&self, _ctx: &RequestContext) -> anyhow::Result<Vec<PromptTemplate>> {
            Ok(vec![self.0.clone()])
        }
        async fn list_resources(&self, _ctx: &RequestContext) -> anyhow::Result<Vec<crate::config_loader::ResourceEntry>> {
            Ok(Vec::new())
        }
        async fn invalidate(&self, _ctx: &RequestContext) {}
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let router = empty_router();
        let err = router
            .route(None, "bogus/method", Value::Null, &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownMethod(_)));
    }

    #[tokio::test]
    async fn tools_call_without_name_param_is_invalid_params() {
        let router = empty_router();
        let err = router
            .route(None, "tools/call", json!({}), &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn tools_call_for_unknown_tool_is_unknown_capability() {
        let router = empty_router();
        let err = router
            .route(None, "tools/call", json!({"name": "nope"}), &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownCapability(_)));
    }

    #[tokio::test]
    async fn prompts_get_is_served_by_the_config_loader_when_it_has_an_override() {
        let manager = Arc::new(ServerManager::new(HashMap::<String, ServerConfig>::new(), Duration::from_secs(1)));
        let capabilities = Arc::new(CapabilityIndex::builder().build());
        let template = PromptTemplate {
            name: "greeting".into(),
            description: None,
            messages: vec![crate::config_loader::PromptMessage {
                role: "system".into(),
                content: "Hi {{ name }}".into(),
            }],
        };
        let router = Router::new(manager, capabilities, Arc::new(FixedPromptLoader(template)));

        let result = router
            .route(
                None,
                "prompts/get",
                json!({"name": "greeting", "arguments": {"name": "Ada"}}),
                &RequestContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(result["messages"][0]["role"], "user");
        assert_eq!(result["messages"][0]["content"]["text"], "Hi Ada");
    }

    #[tokio::test]
    async fn initialize_is_answered_by_the_gateway_without_a_target_server() {
        let router = empty_router();
        let result = router
            .route(None, "initialize", Value::Null, &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(result["protocolVersion"], json!(PROTOCOL_VERSION));
        assert_eq!(result["serverInfo"]["name"], json!("mcp-gateway"));
    }

    #[tokio::test]
    async fn fan_out_on_empty_manager_returns_empty_list() {
        let router = empty_router();
        let result = router
            .route(None, "tools/list", Value::Null, &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(result, json!({"tools": []}));
    }
}
