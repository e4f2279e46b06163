//! Immutable snapshots of resolved profiles.

use crate::connector::Connector;
use crate::error::{GatewayError, Result};
use indexmap::IndexMap;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult, Prompt, Tool,
};
use std::sync::Arc;

/// One exported tool: where it came from and what the upstream calls it.
#[derive(Clone)]
pub struct ToolEntry {
    pub connector: Arc<dyn Connector>,
    /// Upstream descriptor with `name` rewritten to the exported name.
    pub descriptor: Tool,
    pub original_name: String,
}

#[derive(Clone)]
pub struct PromptEntry {
    pub connector: Arc<dyn Connector>,
    pub descriptor: Prompt,
    pub original_name: String,
}

/// The flat namespace a client sees for one profile. Immutable after the
/// resolver builds it; map order is resolution order (first-wins).
pub struct ResolvedProfile {
    name: String,
    tools: IndexMap<String, ToolEntry>,
    prompts: IndexMap<String, PromptEntry>,
}

impl ResolvedProfile {
    pub(crate) fn new(
        name: String,
        tools: IndexMap<String, ToolEntry>,
        prompts: IndexMap<String, PromptEntry>,
    ) -> Self {
        Self {
            name,
            tools,
            prompts,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exported tool descriptors, as copies the caller may mutate freely.
    pub fn list_tools(&self) -> Vec<Tool> {
        self.tools
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub fn list_prompts(&self) -> Vec<Prompt> {
        self.prompts
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub(crate) fn tool_entries(&self) -> impl Iterator<Item = (&String, &ToolEntry)> {
        self.tools.iter()
    }

    pub(crate) fn prompt_entries(&self) -> impl Iterator<Item = (&String, &PromptEntry)> {
        self.prompts.iter()
    }

    #[cfg(test)]
    pub(crate) fn tool_entry(&self, exported: &str) -> Option<&ToolEntry> {
        self.tools.get(exported)
    }

    /// Dispatch a tool call, translating the exported name back to the name
    /// the upstream knows.
    pub async fn call_tool(&self, mut params: CallToolRequestParam) -> Result<CallToolResult> {
        let Some(entry) = self.tools.get(params.name.as_ref()) else {
            return Err(GatewayError::MethodNotFound(format!(
                "unknown tool: {}",
                params.name
            )));
        };
        params.name = entry.original_name.clone().into();
        entry.connector.call_tool(params).await
    }

    pub async fn get_prompt(&self, mut params: GetPromptRequestParam) -> Result<GetPromptResult> {
        let Some(entry) = self.prompts.get(params.name.as_str()) else {
            return Err(GatewayError::MethodNotFound(format!(
                "unknown prompt: {}",
                params.name
            )));
        };
        params.name = entry.original_name.clone();
        entry.connector.get_prompt(params).await
    }
}
