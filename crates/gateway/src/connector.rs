//! Upstream connectors: one long-lived MCP client per configured server.
//!
//! A connector is created with the registry, initialised lazily on first use
//! and disposed exactly once at shutdown. Listings are cached after the first
//! successful call; tool calls and prompt fetches are forwarded verbatim.

use crate::config::ServerDescriptor;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use rmcp::{
    ClientHandler, ServiceExt,
    model::{
        CallToolRequestParam, CallToolResult, ClientInfo, GetPromptRequestParam,
        GetPromptResult, Implementation, Prompt, Tool,
    },
    service::{Peer, RoleClient, RunningService},
    transport::{
        StreamableHttpClientTransport, TokioChildProcess,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use std::process::Stdio;
use tokio::io::AsyncBufReadExt as _;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Gateway-side handle for one upstream MCP server.
///
/// `call_tool`/`get_prompt` take the upstream's original name; translation
/// from exported names happens in the profile layer.
#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;

    /// Idempotent. The first caller performs the MCP handshake; concurrent
    /// callers wait for that same attempt. A failed attempt leaves the
    /// connector uninitialised so the next caller may retry.
    async fn ensure_ready(&self) -> Result<()>;

    /// Cached after the first successful listing; returns a defensive copy.
    async fn list_tools(&self) -> Result<Vec<Tool>>;
    async fn list_prompts(&self) -> Result<Vec<Prompt>>;

    async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult>;
    async fn get_prompt(&self, params: GetPromptRequestParam) -> Result<GetPromptResult>;

    /// Idempotent. Closes the client transport on a best-effort basis;
    /// subsequent operations fail with a disposed error.
    async fn dispose(&self) -> Result<()>;
}

#[derive(Clone, Default)]
struct GatewayClientHandler;

impl ClientHandler for GatewayClientHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            client_info: Implementation::from_build_env(),
            ..ClientInfo::default()
        }
    }
}

type McpClient = RunningService<RoleClient, GatewayClientHandler>;

struct ReadyState {
    client: McpClient,
    /// Stderr consumer for stdio upstreams; torn down before the transport.
    stderr_task: Option<JoinHandle<()>>,
    tools: Option<Vec<Tool>>,
    prompts: Option<Vec<Prompt>>,
}

enum ConnectorState {
    Idle,
    Ready(ReadyState),
    Disposed,
}

/// The production connector. The HTTP and stdio variants differ only in how
/// [`UpstreamConnector::connect`] builds the client transport.
pub struct UpstreamConnector {
    id: String,
    descriptor: ServerDescriptor,
    /// Held across the handshake, which is what serialises concurrent
    /// initialisation attempts per connector.
    state: Mutex<ConnectorState>,
}

impl UpstreamConnector {
    pub fn new(id: String, descriptor: ServerDescriptor) -> Self {
        Self {
            id,
            descriptor,
            state: Mutex::new(ConnectorState::Idle),
        }
    }

    async fn connect(&self) -> Result<ReadyState> {
        match &self.descriptor {
            ServerDescriptor::Http { url, headers } => {
                let http = build_http_client(&self.id, headers)?;
                let transport = StreamableHttpClientTransport::with_client(
                    http,
                    StreamableHttpClientTransportConfig::with_uri(url.clone()),
                );
                let client = GatewayClientHandler
                    .serve(transport)
                    .await
                    .map_err(|e| self.init_error(format!("initialize '{url}': {e}")))?;
                Ok(ReadyState {
                    client,
                    stderr_task: None,
                    tools: None,
                    prompts: None,
                })
            }
            ServerDescriptor::Stdio { command, args, env } => {
                let mut cmd = Command::new(command);
                cmd.args(args);
                // Overrides win over the inherited parent environment.
                for (key, value) in env {
                    cmd.env(key, value);
                }
                let (transport, stderr) = TokioChildProcess::builder(cmd)
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|e| self.init_error(format!("spawn '{command}': {e}")))?;
                let stderr_task =
                    stderr.map(|stderr| spawn_stderr_forwarder(self.id.clone(), stderr));
                let client = match GatewayClientHandler.serve(transport).await {
                    Ok(client) => client,
                    Err(e) => {
                        if let Some(task) = stderr_task {
                            task.abort();
                        }
                        return Err(self.init_error(format!("initialize '{command}': {e}")));
                    }
                };
                Ok(ReadyState {
                    client,
                    stderr_task,
                    tools: None,
                    prompts: None,
                })
            }
        }
    }

    fn init_error(&self, message: String) -> GatewayError {
        GatewayError::Upstream {
            server_id: self.id.clone(),
            message,
        }
    }

    /// Resolve the state to `Ready`, connecting if necessary. Callers hold
    /// the state lock.
    async fn ready_state<'a>(&self, state: &'a mut ConnectorState) -> Result<&'a mut ReadyState> {
        if matches!(state, ConnectorState::Disposed) {
            return Err(GatewayError::Disposed(self.id.clone()));
        }
        if matches!(state, ConnectorState::Idle) {
            let ready = self.connect().await?;
            *state = ConnectorState::Ready(ready);
        }
        match state {
            ConnectorState::Ready(ready) => Ok(ready),
            _ => Err(GatewayError::Disposed(self.id.clone())),
        }
    }

    async fn peer(&self) -> Result<Peer<RoleClient>> {
        let mut state = self.state.lock().await;
        let ready = self.ready_state(&mut state).await?;
        Ok(ready.client.peer().clone())
    }
}

#[async_trait]
impl Connector for UpstreamConnector {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_ready(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ready_state(&mut state).await.map(|_| ())
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut state = self.state.lock().await;
        let ready = self.ready_state(&mut state).await?;
        if let Some(tools) = &ready.tools {
            return Ok(tools.clone());
        }
        let tools = ready
            .client
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| GatewayError::from_service_error(&self.id, e))?;
        ready.tools = Some(tools.clone());
        Ok(tools)
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let mut state = self.state.lock().await;
        let ready = self.ready_state(&mut state).await?;
        if let Some(prompts) = &ready.prompts {
            return Ok(prompts.clone());
        }
        let prompts = ready
            .client
            .peer()
            .list_all_prompts()
            .await
            .map_err(|e| GatewayError::from_service_error(&self.id, e))?;
        ready.prompts = Some(prompts.clone());
        Ok(prompts)
    }

    async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult> {
        // Clone the peer out so concurrent calls multiplex instead of
        // queueing on the state lock.
        let peer = self.peer().await?;
        peer.call_tool(params)
            .await
            .map_err(|e| GatewayError::from_service_error(&self.id, e))
    }

    async fn get_prompt(&self, params: GetPromptRequestParam) -> Result<GetPromptResult> {
        let peer = self.peer().await?;
        peer.get_prompt(params)
            .await
            .map_err(|e| GatewayError::from_service_error(&self.id, e))
    }

    async fn dispose(&self) -> Result<()> {
        let previous = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, ConnectorState::Disposed)
        };
        let ConnectorState::Ready(ready) = previous else {
            return Ok(());
        };
        // Stop the stderr consumer before the transport goes away so the
        // reader never observes a half-closed pipe.
        if let Some(task) = ready.stderr_task {
            task.abort();
        }
        if let Err(e) = ready.client.cancel().await {
            return Err(GatewayError::Internal(format!(
                "close connector '{}': {e}",
                self.id
            )));
        }
        Ok(())
    }
}

/// Re-emit child stderr lines on the gateway log stream. A single reader
/// task per connector keeps line order FIFO.
fn spawn_stderr_forwarder(
    server_id: String,
    stderr: tokio::process::ChildStderr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "switchboard::upstream_stderr", server_id = %server_id, "{line}");
        }
    })
}

fn build_http_client(
    server_id: &str,
    headers: &IndexMap<String, String>,
) -> Result<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("header '{name}': {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| GatewayError::Internal(format!("value for header '{name:?}': {e}")))?;
        header_map.insert(name, value);
    }
    // Redirects are disabled; upstream endpoints are configured with their
    // final URL.
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .default_headers(header_map)
        .build()
        .map_err(|e| {
            GatewayError::Internal(format!("build HTTP client for '{server_id}': {e}"))
        })
}
