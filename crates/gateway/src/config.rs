//! Configuration parsing and validation.
//!
//! The config file is JSON or YAML (chosen by extension). `${VAR}` substrings
//! in string values are expanded from the process environment before
//! validation; missing variables warn and become empty.

use anyhow::{Context as _, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
    /// Bind address for the MCP endpoint, `host:port`.
    #[serde(default)]
    pub listen: String,

    /// Upstream server descriptors, keyed by server id.
    #[serde(default)]
    pub mcp_servers: IndexMap<String, ServerDescriptor>,

    /// Profile definitions, keyed by profile name. Entry order inside a
    /// profile is resolution order (first-wins).
    #[serde(default)]
    pub profiles: IndexMap<String, ProfileDefinition>,
}

/// A profile maps entry names (server ids or other profile names) to
/// selections.
pub type ProfileDefinition = IndexMap<String, ProfileSelection>;

/// How to reach one upstream MCP server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ServerDescriptor {
    /// Streaming-HTTP upstream with optional static headers.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        headers: IndexMap<String, String>,
    },
    /// Child process speaking MCP over stdio. `env` entries override the
    /// inherited parent environment.
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        env: IndexMap<String, String>,
    },
}

/// What one profile entry takes from a server or nested profile.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileSelection {
    /// Allow-list of names. Absent means everything; `[]` means nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<String>>,

    /// `prefix: false` is an explicit empty prefix, distinct from absent
    /// (which takes a context-dependent default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<Prefix>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Prefix {
    Literal(String),
    /// Only `false` is meaningful; `true` is rejected at validation.
    Sentinel(bool),
}

impl Prefix {
    fn resolved(&self) -> String {
        match self {
            Prefix::Literal(s) => s.clone(),
            Prefix::Sentinel(_) => String::new(),
        }
    }
}

impl ProfileSelection {
    /// Prefix for a server entry; defaults to `"<server-id>__"`.
    pub fn server_prefix(&self, server_id: &str) -> String {
        match &self.prefix {
            None => format!("{server_id}__"),
            Some(prefix) => prefix.resolved(),
        }
    }

    /// Prefix for a nested-profile entry; defaults to no extra prefix since
    /// the nested profile has already been prefixed at its own level.
    pub fn nested_prefix(&self) -> String {
        match &self.prefix {
            None => String::new(),
            Some(prefix) => prefix.resolved(),
        }
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        allowed(self.tools.as_deref(), name)
    }

    pub fn allows_prompt(&self, name: &str) -> bool {
        allowed(self.prompts.as_deref(), name)
    }
}

fn allowed(list: Option<&[String]>, name: &str) -> bool {
    list.is_none_or(|names| names.iter().any(|n| n == name))
}

impl GatewayConfig {
    /// Read, expand and validate a config file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("read config: {}", path.display()))?;
        let mut config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parse JSON config: {}", path.display()))?
        } else {
            serde_yaml::from_slice(&bytes)
                .with_context(|| format!("parse YAML config: {}", path.display()))?
        };
        config.expand_env();
        config
            .validate()
            .with_context(|| format!("validate config: {}", path.display()))?;
        Ok(config)
    }

    /// Expand `${VAR}` in every string value.
    fn expand_env(&mut self) {
        let expand = switchboard_env::expand_vars;
        self.listen = expand(&self.listen);

        for descriptor in self.mcp_servers.values_mut() {
            match descriptor {
                ServerDescriptor::Http { url, headers } => {
                    *url = expand(url);
                    for value in headers.values_mut() {
                        *value = expand(value);
                    }
                }
                ServerDescriptor::Stdio { command, args, env } => {
                    *command = expand(command);
                    for arg in args.iter_mut() {
                        *arg = expand(arg);
                    }
                    for value in env.values_mut() {
                        *value = expand(value);
                    }
                }
            }
        }

        for definition in self.profiles.values_mut() {
            for selection in definition.values_mut() {
                if let Some(Prefix::Literal(prefix)) = &mut selection.prefix {
                    *prefix = expand(prefix);
                }
                for list in [&mut selection.tools, &mut selection.prompts] {
                    if let Some(names) = list {
                        for name in names.iter_mut() {
                            *name = expand(name);
                        }
                    }
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_listen(&self.listen)?;

        for (server_id, descriptor) in &self.mcp_servers {
            match descriptor {
                ServerDescriptor::Http { url, headers } => {
                    let parsed = url::Url::parse(url)
                        .with_context(|| format!("mcpServers.{server_id}: invalid url '{url}'"))?;
                    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                        bail!("mcpServers.{server_id}: url '{url}' must be http(s) with a host");
                    }
                    for (name, value) in headers {
                        reqwest::header::HeaderName::from_bytes(name.as_bytes()).with_context(
                            || format!("mcpServers.{server_id}: invalid header name '{name}'"),
                        )?;
                        reqwest::header::HeaderValue::from_str(value).with_context(|| {
                            format!("mcpServers.{server_id}: invalid value for header '{name}'")
                        })?;
                    }
                }
                ServerDescriptor::Stdio { command, .. } => {
                    if command.trim().is_empty() {
                        bail!("mcpServers.{server_id}: command must be non-empty");
                    }
                }
            }
        }

        for (profile_name, definition) in &self.profiles {
            for (entry_name, selection) in definition {
                if !self.mcp_servers.contains_key(entry_name)
                    && !self.profiles.contains_key(entry_name)
                {
                    bail!(
                        "profiles.{profile_name}: '{entry_name}' is neither a server id nor a profile"
                    );
                }
                if matches!(selection.prefix, Some(Prefix::Sentinel(true))) {
                    bail!(
                        "profiles.{profile_name}.{entry_name}: prefix must be a string or false"
                    );
                }
            }
        }

        Ok(())
    }
}

/// `listen` must match `host:port` where host is `[\w.-]+` and port is digits.
fn validate_listen(listen: &str) -> anyhow::Result<()> {
    let valid = listen.split_once(':').is_some_and(|(host, port)| {
        !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            && !port.is_empty()
            && port.chars().all(|c| c.is_ascii_digit())
    });
    if !valid {
        bail!("listen must be '<host>:<port>', got '{listen}'");
    }
    Ok(())
}
