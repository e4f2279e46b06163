//! The ephemeral MCP server bound to one resolved profile.
//!
//! One instance is built per inbound request; every handler answers from (or
//! dispatches through) the profile snapshot bound at construction.

use crate::profile::ResolvedProfile;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::{
        CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
        Implementation, ListPromptsResult, ListToolsResult, PaginatedRequestParam,
        ProtocolVersion, ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct ProfileMcpServer {
    profile: Arc<ResolvedProfile>,
}

impl ProfileMcpServer {
    pub fn new(profile: Arc<ResolvedProfile>) -> Self {
        Self { profile }
    }
}

impl ServerHandler for ProfileMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_prompts()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: None,
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = self.profile.list_tools();
        tracing::debug!(
            profile = %self.profile.name(),
            request_id = %context.id,
            tool_count = tools.len(),
            "tools/list"
        );
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
            ..Default::default()
        })
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let prompts = self.profile.list_prompts();
        tracing::debug!(
            profile = %self.profile.name(),
            request_id = %context.id,
            prompt_count = prompts.len(),
            "prompts/list"
        );
        Ok(ListPromptsResult {
            prompts,
            next_cursor: None,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool = request.name.to_string();
        match self.profile.call_tool(request).await {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::debug!(
                    profile = %self.profile.name(),
                    request_id = %context.id,
                    tool = %tool,
                    error = %err,
                    "tools/call failed"
                );
                Err(McpError::from(err))
            }
        }
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let prompt = request.name.clone();
        match self.profile.get_prompt(request).await {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::debug!(
                    profile = %self.profile.name(),
                    request_id = %context.id,
                    prompt = %prompt,
                    error = %err,
                    "prompts/get failed"
                );
                Err(McpError::from(err))
            }
        }
    }
}
