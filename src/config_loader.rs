//! Config loader contract (spec §4.6): an external collaborator the
//! gateway calls out to for prompt templates, resources, and per-organization
//! overrides. The admin UI / prompts database that backs a real
//! implementation is out of scope here, so this crate only ships the
//! trait and a no-op default.

use crate::http::context::RequestContext;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

/// One message in a prompt template, mirroring the MCP `prompts/get`
/// result shape (`{role, content}`).
#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// A named prompt template, as handed back by a `ConfigLoader`.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// A named resource body, as handed back by a `ConfigLoader`.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub uri: String,
    pub body: String,
}

/// External, per-organization prompt/resource store. Every method is
/// scoped by `RequestContext` so a loader backed by a real database can
/// apply org-level overrides; `invalidate` drops any cached state for one
/// organization (e.g. after the admin UI edits a prompt).
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn get_prompt(&self, ctx: &RequestContext, name: &str) -> anyhow::Result<Option<PromptTemplate>>;
    async fn get_resource(&self, ctx: &RequestContext, uri: &str) -> anyhow::Result<Option<ResourceEntry>>;
    async fn list_prompts(&self, ctx: &RequestContext) -> anyhow::Result<Vec<PromptTemplate>>;
    async fn list_resources(&self, ctx: &RequestContext) -> anyhow::Result<Vec<ResourceEntry>>;
    async fn invalidate(&self, ctx: &RequestContext);
}

/// Default `ConfigLoader` for deployments with no external prompt store.
pub struct NoopConfigLoader;

#[async_trait]
impl ConfigLoader for NoopConfigLoader {
    async fn get_prompt(&self, _ctx: &RequestContext, _name: &str) -> anyhow::Result<Option<PromptTemplate>> {
        Ok(None)
    }

    async fn get_resource(&self, _ctx: &RequestContext, _uri: &str) -> anyhow::Result<Option<ResourceEntry>> {
        Ok(None)
    }

    async fn list_prompts(&self, _ctx: &RequestContext) -> anyhow::Result<Vec<PromptTemplate>> {
        Ok(Vec::new())
    }

    async fn list_resources(&self, _ctx: &RequestContext) -> anyhow::Result<Vec<ResourceEntry>> {
        Ok(Vec::new())
    }

    async fn invalidate(&self, _ctx: &RequestContext) {}
}

/// Substitute `{{ name }}` placeholders in a prompt template body.
/// Whitespace inside the braces is tolerated (`{{name}}`, `{{ name }}`).
/// Placeholders with no matching key are left untouched.
pub fn substitute_template(body: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = after[..end].trim();
        match values.get(key) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(&after[..end]);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Render a `PromptTemplate` into an MCP `prompts/get` result: substitute
/// `{{ name }}` placeholders in every message's content from `args`, and
/// remap a `system` role to `user` (MCP prompt responses may not carry a
/// `system`-role message).
pub fn render_prompt(template: &PromptTemplate, args: &HashMap<String, String>) -> Value {
    let messages: Vec<Value> = template
        .messages
        .iter()
        .map(|m| {
            let role = if m.role == "system" { "user" } else { m.role.as_str() };
            let text = substitute_template(&m.content, args);
            json!({ "role": role, "content": { "type": "text", "text": text } })
        })
        .collect();

    json!({
        "description": template.description.clone().unwrap_or_else(|| template.name.clone()),
        "messages": messages,
    })
}

/// Render a `ResourceEntry` into an MCP `resources/read` result.
pub fn render_resource(entry: &ResourceEntry) -> Value {
    json!({ "contents": [{ "uri": entry.uri, "text": entry.body }] })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholder() {
        let mut values = HashMap::new();
        values.insert("name".to_string(), "Ada".to_string());
        assert_eq!(substitute_template("Hello {{ name }}!", &values), "Hello Ada!");
    }

    #[test]
    fn tolerates_missing_whitespace() {
        let mut values = HashMap::new();
        values.insert("name".to_string(), "Ada".to_string());
        assert_eq!(substitute_template("Hi {{name}}", &values), "Hi Ada");
    }

    #[test]
    fn leaves_unknown_placeholder_untouched() {
        let values = HashMap::new();
        assert_eq!(substitute_template("Hi {{ name }}", &values), "Hi {{ name }}");
    }

    #[test]
    fn render_prompt_substitutes_and_remaps_system_role() {
        let template = PromptTemplate {
            name: "greeting".into(),
            description: None,
            messages: vec![
                PromptMessage { role: "system".into(), content: "You are {{ persona }}.".into() },
                PromptMessage { role: "user".into(), content: "Hi {{ name }}".into() },
            ],
        };
        let mut args = HashMap::new();
        args.insert("persona".to_string(), "terse".to_string());
        args.insert("name".to_string(), "Ada".to_string());

        let rendered = render_prompt(&template, &args);
        let messages = rendered["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"]["text"], "You are terse.");
        assert_eq!(messages[1]["content"]["text"], "Hi Ada");
    }

    #[test]
    fn render_resource_wraps_body_as_text_content() {
        let entry = ResourceEntry { uri: "org://notes".into(), body: "hello".into() };
        let rendered = render_resource(&entry);
        assert_eq!(rendered["contents"][0]["uri"], "org://notes");
        assert_eq!(rendered["contents"][0]["text"], "hello");
    }

    #[tokio::test]
    async fn noop_loader_returns_empty() {
        let loader = NoopConfigLoader;
        let ctx = RequestContext::default();
        assert!(loader.get_prompt(&ctx, "anything").await.unwrap().is_none());
        assert!(loader.get_resource(&ctx, "r://anything").await.unwrap().is_none());
        assert!(loader.list_prompts(&ctx).await.unwrap().is_empty());
        assert!(loader.list_resources(&ctx).await.unwrap().is_empty());
        loader.invalidate(&ctx).await;
    }
}
