//! Capability index: a global, immutable mapping of tool/resource/prompt
//! name to the `serverId` that serves it, built once at startup (spec §3
//! `CapabilityIndex`, §4.3). Duplicate capability names across servers are
//! a startup configuration error, not a runtime routing decision.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

#[derive(Debug, thiserror::Error)]
#[error("capability '{name}' ({kind:?}) is declared by both '{first_server}' and '{second_server}'")]
pub struct DuplicateCapabilityError {
    pub kind: CapabilityKind,
    pub name: String,
    pub first_server: String,
    pub second_server: String,
}

/// Built once at startup from each server's `tools/list`, `resources/list`,
/// `prompts/list` results and never mutated afterward.
#[derive(Debug, Default)]
pub struct CapabilityIndex {
    tools: HashMap<String, String>,
    resources: HashMap<String, String>,
    prompts: HashMap<String, String>,
}

impl CapabilityIndex {
    pub fn builder() -> CapabilityIndexBuilder {
        CapabilityIndexBuilder::default()
    }

    pub fn resolve_tool(&self, name: &str) -> Option<&str> {
        self.tools.get(name).map(String::as_str)
    }

    pub fn resolve_resource_uri(&self, uri: &str) -> Option<&str> {
        self.resources.get(uri).map(String::as_str)
    }

    pub fn resolve_prompt(&self, name: &str) -> Option<&str> {
        self.prompts.get(name).map(String::as_str)
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn resource_uris(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn prompt_names(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    /// Inverse lookup for `/health`: every capability name declared by
    /// `server_id`, across tools/resources/prompts.
    pub fn capabilities_for_server<'a>(&'a self, server_id: &str) -> Vec<&'a str> {
        self.tools
            .iter()
            .chain(self.resources.iter())
            .chain(self.prompts.iter())
            .filter(|(_, sid)| sid.as_str() == server_id)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// All distinct `serverId`s contributing to a `*/list` fan-out, in
    /// lexicographic order (spec §4.3: first-wins by lexical `serverId`
    /// on duplicate names across the fan-out).
    pub fn server_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .tools
            .values()
            .chain(self.resources.values())
            .chain(self.prompts.values())
            .map(String::as_str)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[derive(Default)]
pub struct CapabilityIndexBuilder {
    tools: HashMap<String, String>,
    resources: HashMap<String, String>,
    prompts: HashMap<String, String>,
}

impl CapabilityIndexBuilder {
    pub fn add_tool(&mut self, name: &str, server_id: &str) -> Result<(), DuplicateCapabilityError> {
        Self::insert_unique(&mut self.tools, CapabilityKind::Tool, name, server_id)
    }

    pub fn add_resource(&mut self, uri: &str, server_id: &str) -> Result<(), DuplicateCapabilityError> {
        Self::insert_unique(&mut self.resources, CapabilityKind::Resource, uri, server_id)
    }

    pub fn add_prompt(&mut self, name: &str, server_id: &str) -> Result<(), DuplicateCapabilityError> {
        Self::insert_unique(&mut self.prompts, CapabilityKind::Prompt, name, server_id)
    }

    fn insert_unique(
        map: &mut HashMap<String, String>,
        kind: CapabilityKind,
        name: &str,
        server_id: &str,
    ) -> Result<(), DuplicateCapabilityError> {
        if let Some(existing) = map.get(name) {
            return Err(DuplicateCapabilityError {
                kind,
                name: name.to_string(),
                first_server: existing.clone(),
                second_server: server_id.to_string(),
            });
        }
        map.insert(name.to_string(), server_id.to_string());
        Ok(())
    }

    pub fn build(self) -> CapabilityIndex {
        CapabilityIndex {
            tools: self.tools,
            resources: self.resources,
            prompts: self.prompts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_tool_to_its_declaring_server() {
        let mut b = CapabilityIndex::builder();
        b.add_tool("search", "srv-a").unwrap();
        let idx = b.build();
        assert_eq!(idx.resolve_tool("search"), Some("srv-a"));
        assert_eq!(idx.resolve_tool("missing"), None);
    }

    #[test]
    fn duplicate_tool_name_across_servers_fails_fast() {
        let mut b = CapabilityIndex::builder();
        b.add_tool("search", "srv-a").unwrap();
        let err = b.add_tool("search", "srv-b").unwrap_err();
        assert_eq!(err.first_server, "srv-a");
        assert_eq!(err.second_server, "srv-b");
    }

    #[test]
    fn server_ids_are_sorted_and_deduplicated() {
        let mut b = CapabilityIndex::builder();
        b.add_tool("a", "zzz").unwrap();
        b.add_tool("b", "aaa").unwrap();
        b.add_resource("r://1", "zzz").unwrap();
        let idx = b.build();
        assert_eq!(idx.server_ids(), vec!["aaa", "zzz"]);
    }
}
