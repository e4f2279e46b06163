//! Recursive profile composition.
//!
//! A resolver walks a profile definition depth-first, pulling tool/prompt
//! listings from connectors and flattening nested profiles into a single
//! namespace with allow-listing, prefixing, first-wins conflict handling and
//! cycle detection. One resolver (and cache) per inbound request.

use crate::config::{GatewayConfig, ProfileSelection};
use crate::connector::Connector;
use crate::error::{GatewayError, Result};
use crate::profile::{PromptEntry, ResolvedProfile, ToolEntry};
use crate::registry::ConnectorRegistry;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use rmcp::model::{Prompt, Tool};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ProfileResolver<'a> {
    config: &'a GatewayConfig,
    registry: &'a ConnectorRegistry,
    cache: HashMap<String, Arc<ResolvedProfile>>,
}

impl<'a> ProfileResolver<'a> {
    pub fn new(config: &'a GatewayConfig, registry: &'a ConnectorRegistry) -> Self {
        Self {
            config,
            registry,
            cache: HashMap::new(),
        }
    }

    pub async fn resolve(&mut self, name: &str) -> Result<Arc<ResolvedProfile>> {
        let mut stack = Vec::new();
        self.resolve_with_stack(name.to_string(), &mut stack).await
    }

    fn resolve_with_stack<'b>(
        &'b mut self,
        name: String,
        stack: &'b mut Vec<String>,
    ) -> BoxFuture<'b, Result<Arc<ResolvedProfile>>> {
        Box::pin(async move {
            if let Some(cached) = self.cache.get(&name) {
                return Ok(cached.clone());
            }
            if stack.contains(&name) {
                let mut chain = stack.clone();
                chain.push(name);
                return Err(GatewayError::InvalidRequest(format!(
                    "circular profile reference: {}",
                    chain.join(" -> ")
                )));
            }

            stack.push(name.clone());
            let Some(definition) = self.config.profiles.get(&name).cloned() else {
                return Err(GatewayError::InvalidRequest(format!(
                    "unknown profile: {name}"
                )));
            };

            let mut tools: IndexMap<String, ToolEntry> = IndexMap::new();
            let mut prompts: IndexMap<String, PromptEntry> = IndexMap::new();

            for (entry_name, selection) in &definition {
                if self.registry.contains(entry_name) {
                    self.resolve_server_entry(&name, entry_name, selection, &mut tools, &mut prompts)
                        .await?;
                } else if self.config.profiles.contains_key(entry_name) {
                    let nested = self.resolve_with_stack(entry_name.clone(), stack).await?;
                    merge_nested(&nested, selection, &mut tools, &mut prompts);
                } else {
                    return Err(GatewayError::InvalidRequest(format!(
                        "unknown server or profile: {entry_name}"
                    )));
                }
            }

            stack.pop();
            let resolved = Arc::new(ResolvedProfile::new(name.clone(), tools, prompts));
            self.cache.insert(name, resolved.clone());
            Ok(resolved)
        })
    }

    async fn resolve_server_entry(
        &self,
        profile: &str,
        server_id: &str,
        selection: &ProfileSelection,
        tools: &mut IndexMap<String, ToolEntry>,
        prompts: &mut IndexMap<String, PromptEntry>,
    ) -> Result<()> {
        let connector = self.registry.get(server_id)?;
        if let Err(err) = connector.ensure_ready().await {
            tracing::warn!(
                error = %err,
                server_id = %server_id,
                profile = %profile,
                "upstream failed to initialize; profile omits its tools and prompts"
            );
            return Ok(());
        }

        let prefix = selection.server_prefix(server_id);

        for tool in self
            .list_tools_or_empty(profile, server_id, connector.as_ref())
            .await
        {
            if !selection.allows_tool(tool.name.as_ref()) {
                continue;
            }
            let exported = format!("{prefix}{}", tool.name);
            if tools.contains_key(&exported) {
                continue;
            }
            let original_name = tool.name.to_string();
            let mut descriptor = tool;
            descriptor.name = exported.clone().into();
            tools.insert(
                exported,
                ToolEntry {
                    connector: connector.clone(),
                    descriptor,
                    original_name,
                },
            );
        }

        for prompt in self
            .list_prompts_or_empty(profile, server_id, connector.as_ref())
            .await
        {
            if !selection.allows_prompt(&prompt.name) {
                continue;
            }
            let exported = format!("{prefix}{}", prompt.name);
            if prompts.contains_key(&exported) {
                continue;
            }
            let original_name = prompt.name.clone();
            let mut descriptor = prompt;
            descriptor.name = exported.clone();
            prompts.insert(
                exported,
                PromptEntry {
                    connector: connector.clone(),
                    descriptor,
                    original_name,
                },
            );
        }

        Ok(())
    }

    async fn list_tools_or_empty(
        &self,
        profile: &str,
        server_id: &str,
        connector: &dyn Connector,
    ) -> Vec<Tool> {
        match connector.list_tools().await {
            Ok(tools) => tools,
            // An upstream without the tools capability simply contributes none.
            Err(err) if err.is_method_not_found() => Vec::new(),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    server_id = %server_id,
                    profile = %profile,
                    "listing tools failed; treating as empty"
                );
                Vec::new()
            }
        }
    }

    async fn list_prompts_or_empty(
        &self,
        profile: &str,
        server_id: &str,
        connector: &dyn Connector,
    ) -> Vec<Prompt> {
        match connector.list_prompts().await {
            Ok(prompts) => prompts,
            Err(err) if err.is_method_not_found() => Vec::new(),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    server_id = %server_id,
                    profile = %profile,
                    "listing prompts failed; treating as empty"
                );
                Vec::new()
            }
        }
    }
}

/// Fold an already-resolved nested profile into the parent maps. Allow-lists
/// apply to the nested *exported* names; the connector and original name on
/// each entry are preserved so dispatch still reaches the upstream with the
/// name it knows.
fn merge_nested(
    nested: &ResolvedProfile,
    selection: &ProfileSelection,
    tools: &mut IndexMap<String, ToolEntry>,
    prompts: &mut IndexMap<String, PromptEntry>,
) {
    let prefix = selection.nested_prefix();

    for (nested_name, entry) in nested.tool_entries() {
        if !selection.allows_tool(nested_name) {
            continue;
        }
        let exported = format!("{prefix}{nested_name}");
        if tools.contains_key(&exported) {
            continue;
        }
        let mut entry = entry.clone();
        entry.descriptor.name = exported.clone().into();
        tools.insert(exported, entry);
    }

    for (nested_name, entry) in nested.prompt_entries() {
        if !selection.allows_prompt(nested_name) {
            continue;
        }
        let exported = format!("{prefix}{nested_name}");
        if prompts.contains_key(&exported) {
            continue;
        }
        let mut entry = entry.clone();
        entry.descriptor.name = exported.clone();
        prompts.insert(exported, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rmcp::model::{
        CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tool(name: &str) -> Tool {
        Tool::new(
            name.to_string(),
            format!("{name} tool"),
            Arc::new(serde_json::Map::new()),
        )
    }

    fn prompt(name: &str) -> Prompt {
        Prompt {
            name: name.to_string(),
            title: None,
            description: Some(format!("{name} prompt")),
            arguments: None,
            icons: None,
        }
    }

    #[derive(Default)]
    struct StaticConnector {
        id: String,
        tools: Vec<Tool>,
        prompts: Vec<Prompt>,
        fail_init: bool,
        listing_unsupported: bool,
        listing_broken: bool,
        init_count: AtomicUsize,
        calls: Mutex<Vec<CallToolRequestParam>>,
    }

    impl StaticConnector {
        fn new(id: &str, tools: &[&str], prompts: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                tools: tools.iter().map(|name| tool(name)).collect(),
                prompts: prompts.iter().map(|name| prompt(name)).collect(),
                ..Self::default()
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail_init: true,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl Connector for StaticConnector {
        fn id(&self) -> &str {
            &self.id
        }

        async fn ensure_ready(&self) -> crate::error::Result<()> {
            self.init_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                Err(GatewayError::Upstream {
                    server_id: self.id.clone(),
                    message: "connection refused".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn list_tools(&self) -> crate::error::Result<Vec<Tool>> {
            if self.listing_unsupported {
                return Err(GatewayError::MethodNotFound(
                    "tools/list is not supported".to_string(),
                ));
            }
            if self.listing_broken {
                return Err(GatewayError::Upstream {
                    server_id: self.id.clone(),
                    message: "listing exploded".to_string(),
                });
            }
            Ok(self.tools.clone())
        }

        async fn list_prompts(&self) -> crate::error::Result<Vec<Prompt>> {
            if self.listing_unsupported {
                return Err(GatewayError::MethodNotFound(
                    "prompts/list is not supported".to_string(),
                ));
            }
            Ok(self.prompts.clone())
        }

        async fn call_tool(
            &self,
            params: CallToolRequestParam,
        ) -> crate::error::Result<CallToolResult> {
            self.calls.lock().push(params);
            Ok(CallToolResult::success(vec![]))
        }

        async fn get_prompt(
            &self,
            _params: GetPromptRequestParam,
        ) -> crate::error::Result<GetPromptResult> {
            Ok(GetPromptResult {
                description: None,
                messages: Vec::new(),
            })
        }

        async fn dispose(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn config(yaml: &str) -> GatewayConfig {
        serde_yaml::from_str(yaml).expect("parse test config")
    }

    fn registry(connectors: Vec<Arc<StaticConnector>>) -> ConnectorRegistry {
        ConnectorRegistry::with_connectors(
            connectors
                .into_iter()
                .map(|connector| connector as Arc<dyn Connector>),
        )
    }

    fn tool_names(profile: &ResolvedProfile) -> Vec<String> {
        profile
            .list_tools()
            .iter()
            .map(|tool| tool.name.to_string())
            .collect()
    }

    fn prompt_names(profile: &ResolvedProfile) -> Vec<String> {
        profile
            .list_prompts()
            .iter()
            .map(|prompt| prompt.name.clone())
            .collect()
    }

    #[tokio::test]
    async fn default_prefix_and_allow_list() {
        let alpha = StaticConnector::new("alpha", &["time", "date"], &["timezone", "format"]);
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha:
      tools: [time]
      prompts: [timezone]
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");

        assert_eq!(tool_names(&profile), vec!["alpha__time"]);
        assert_eq!(prompt_names(&profile), vec!["alpha__timezone"]);

        let entry = profile.tool_entry("alpha__time").expect("exported tool");
        assert_eq!(entry.descriptor.name, "alpha__time");
        assert_eq!(entry.original_name, "time");
    }

    #[tokio::test]
    async fn explicit_empty_prefix() {
        let alpha = StaticConnector::new("alpha", &["search", "summarize"], &[]);
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha:
      prefix: false
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");
        assert_eq!(tool_names(&profile), vec!["search", "summarize"]);
    }

    #[tokio::test]
    async fn nested_profile_with_prefix_and_allow_list() {
        let alpha = StaticConnector::new("alpha", &["search", "summarize"], &[]);
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  base:
    alpha: {}
  nested:
    base:
      prefix: "nested__"
      tools: [alpha__search]
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("nested").await.expect("resolve");
        assert_eq!(tool_names(&profile), vec!["nested__alpha__search"]);

        // Dispatch still reaches the upstream with the original name.
        let entry = profile
            .tool_entry("nested__alpha__search")
            .expect("exported tool");
        assert_eq!(entry.original_name, "search");
    }

    #[tokio::test]
    async fn two_level_prefix_stacking() {
        let github = StaticConnector::new("github", &["list_commits"], &[]);
        let registry = registry(vec![github]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  github-readonly:
    github:
      prefix: "github__"
      tools: [list_commits]
  default:
    "github-readonly":
      prefix: "gh__"
      tools: [github__list_commits]
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");
        assert_eq!(tool_names(&profile), vec!["gh__github__list_commits"]);
        let entry = profile
            .tool_entry("gh__github__list_commits")
            .expect("exported tool");
        assert_eq!(entry.original_name, "list_commits");
    }

    #[tokio::test]
    async fn failed_upstream_contributes_nothing() {
        let alpha = StaticConnector::failing("alpha");
        let registry = registry(vec![alpha.clone()]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve succeeds");
        assert!(tool_names(&profile).is_empty());
        assert!(prompt_names(&profile).is_empty());
        assert_eq!(alpha.init_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cycle_is_reported_with_the_full_chain() {
        let registry = registry(Vec::new());
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  loopA:
    loopB: {}
  loopB:
    loopA: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let err = resolver.resolve("loopA").await.expect_err("cycle");
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert!(err.to_string().contains("loopA -> loopB -> loopA"));
    }

    #[tokio::test]
    async fn dispatch_translates_exported_names() {
        let alpha = StaticConnector::new("alpha", &["search"], &[]);
        let registry = registry(vec![alpha.clone()]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");

        profile
            .call_tool(CallToolRequestParam {
                name: "alpha__search".to_string().into(),
                arguments: None,
            })
            .await
            .expect("dispatch");

        let calls = alpha.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name.as_ref(), "search");
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found() {
        let alpha = StaticConnector::new("alpha", &["search"], &[]);
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");

        let err = profile
            .call_tool(CallToolRequestParam {
                name: "nope".to_string().into(),
                arguments: None,
            })
            .await
            .expect_err("unknown tool");
        assert!(matches!(err, GatewayError::MethodNotFound(_)));
        assert!(err.to_string().contains("unknown tool: nope"));
    }

    #[tokio::test]
    async fn first_wins_across_servers() {
        let first = StaticConnector::new("first", &["echo"], &[]);
        let second = StaticConnector::new("second", &["echo"], &[]);
        let registry = registry(vec![first.clone(), second.clone()]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    first:
      prefix: false
    second:
      prefix: false
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");
        assert_eq!(tool_names(&profile), vec!["echo"]);

        profile
            .call_tool(CallToolRequestParam {
                name: "echo".to_string().into(),
                arguments: None,
            })
            .await
            .expect("dispatch");
        assert_eq!(first.calls.lock().len(), 1);
        assert!(second.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn empty_allow_list_exports_nothing() {
        let alpha = StaticConnector::new("alpha", &["time"], &["timezone"]);
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha:
      tools: []
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");
        assert!(tool_names(&profile).is_empty());
        // Prompts had no allow-list, so everything is exported.
        assert_eq!(prompt_names(&profile), vec!["alpha__timezone"]);
    }

    #[tokio::test]
    async fn listing_without_capability_is_empty() {
        let alpha = Arc::new(StaticConnector {
            id: "alpha".to_string(),
            listing_unsupported: true,
            ..StaticConnector::default()
        });
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");
        assert!(tool_names(&profile).is_empty());
        assert!(prompt_names(&profile).is_empty());
    }

    #[tokio::test]
    async fn broken_listing_degrades_to_empty() {
        let alpha = Arc::new(StaticConnector {
            id: "alpha".to_string(),
            tools: vec![tool("time")],
            listing_broken: true,
            ..StaticConnector::default()
        });
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");
        assert!(tool_names(&profile).is_empty());
    }

    #[tokio::test]
    async fn resolution_is_deterministic_and_cached() {
        let alpha = StaticConnector::new("alpha", &["time", "date"], &[]);
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let first = resolver.resolve("default").await.expect("resolve");
        let second = resolver.resolve("default").await.expect("resolve again");
        assert!(
            Arc::ptr_eq(&first, &second),
            "same resolver returns the cached snapshot"
        );

        let mut fresh = ProfileResolver::new(&config, &registry);
        let third = fresh.resolve("default").await.expect("fresh resolver");
        assert_eq!(tool_names(&first), tool_names(&third));
    }

    #[tokio::test]
    async fn exported_names_are_unique() {
        // Upstream reports a duplicate tool name; only the first survives.
        let alpha = Arc::new(StaticConnector {
            id: "alpha".to_string(),
            tools: vec![tool("echo"), tool("echo")],
            ..StaticConnector::default()
        });
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");
        assert_eq!(tool_names(&profile), vec!["alpha__echo"]);
    }

    #[tokio::test]
    async fn unknown_entry_name_fails_resolution() {
        let registry = registry(Vec::new());
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    ghost: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let err = resolver.resolve("default").await.expect_err("ghost entry");
        assert!(err.to_string().contains("unknown server or profile: ghost"));
    }

    #[tokio::test]
    async fn unknown_profile_fails_resolution() {
        let registry = registry(Vec::new());
        let config = config("listen: \"127.0.0.1:9315\"\n");

        let mut resolver = ProfileResolver::new(&config, &registry);
        let err = resolver.resolve("missing").await.expect_err("no profile");
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert!(err.to_string().contains("unknown profile: missing"));
    }

    #[tokio::test]
    async fn listing_matches_profile_enumeration() {
        // Round-trip law: resolve + enumerate equals the profile's own lists.
        let alpha = StaticConnector::new("alpha", &["time", "date"], &["timezone"]);
        let registry = registry(vec![alpha]);
        let config = config(
            r#"
listen: "127.0.0.1:9315"
profiles:
  default:
    alpha: {}
"#,
        );

        let mut resolver = ProfileResolver::new(&config, &registry);
        let profile = resolver.resolve("default").await.expect("resolve");

        let from_entries: Vec<String> = profile
            .tool_entries()
            .map(|(name, _)| name.clone())
            .collect();
        assert_eq!(tool_names(&profile), from_entries);
        assert_eq!(
            tool_names(&profile),
            vec!["alpha__time", "alpha__date"],
            "enumeration follows resolution order"
        );
    }
}
