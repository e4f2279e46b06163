//! Inbound HTTP surface: the `/mcp` endpoint and its JSON-RPC error
//! envelopes.
//!
//! Each accepted request gets a freshly resolved profile, a fresh ephemeral
//! MCP server, and a cleanup manager armed on the response body, so resources
//! are released exactly once whether the stream finishes, errors, or the
//! client walks away.

use crate::cleanup::{CleanupGuard, CleanupManager};
use crate::config::GatewayConfig;
use crate::profile::ResolvedProfile;
use crate::registry::ConnectorRegistry;
use crate::resolver::ProfileResolver;
use crate::server::ProfileMcpServer;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Request, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use futures::Stream;
use rmcp::model::ErrorCode;
use rmcp::transport::streamable_http_server::session::never::NeverSessionManager;
use rmcp::transport::{StreamableHttpServerConfig, StreamableHttpService};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _;
use tracing::Instrument as _;

/// Hard cap to protect the process from unbounded request bodies.
const MAX_POST_BODY_BYTES: usize = 4 * 1024 * 1024;
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);
const BODY_SNIPPET_BYTES: usize = 4096;

pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ConnectorRegistry>,
    pub shutdown: CancellationToken,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/mcp", any(handle_mcp))
        .route("/health", get(health))
        .fallback(unknown_path)
        .layer(DefaultBodyLimit::max(MAX_POST_BODY_BYTES))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn unknown_path() -> Response {
    jsonrpc_error_response(StatusCode::NOT_FOUND, ErrorCode::INVALID_REQUEST, "Not found")
}

async fn handle_mcp(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    if !matches!(*request.method(), Method::POST | Method::GET | Method::DELETE) {
        return jsonrpc_error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::INVALID_REQUEST,
            "Method not allowed",
        );
    }

    let Some(profile_name) = profile_query_param(request.uri().query()) else {
        return jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::INVALID_REQUEST,
            "Missing profile query parameter",
        );
    };

    // Fresh resolver (and cache) per request; config and registry are the
    // shared, read-only parts.
    let mut resolver = ProfileResolver::new(&state.config, &state.registry);
    let profile = match resolver.resolve(&profile_name).await {
        Ok(profile) => profile,
        Err(err) => {
            return jsonrpc_error_response(StatusCode::BAD_REQUEST, err.error_code(), err.to_string());
        }
    };

    let span = tracing::info_span!(
        "gateway.mcp",
        profile = %profile_name,
        method = %request.method()
    );
    dispatch(&state, profile, request).instrument(span).await
}

async fn dispatch(
    state: &GatewayState,
    profile: Arc<ResolvedProfile>,
    request: Request,
) -> Response {
    let transport_ct = state.shutdown.child_token();
    let cleanup = CleanupManager::new(profile.name().to_string());

    // Transport first, then the server token: both resolve to cancelling the
    // per-request token tree, which tears the streamable transport down.
    {
        let ct = transport_ct.clone();
        cleanup.register(async move {
            ct.cancel();
            Ok(())
        });
    }
    cleanup.watch(state.shutdown.clone());

    let request = match peek_post_body(request).await {
        Ok(request) => request,
        Err(response) => {
            tracing::error!("request body could not be buffered; aborting dispatch");
            cleanup
                .run(Some("request body could not be buffered".to_string()))
                .await;
            return response;
        }
    };

    // Sessionless: no session-id generator is configured; every request is
    // independent and gets its own server bound to the resolved profile.
    let service = StreamableHttpService::new(
        move || Ok(ProfileMcpServer::new(profile.clone())),
        Arc::new(NeverSessionManager::default()),
        StreamableHttpServerConfig {
            stateful_mode: false,
            sse_keep_alive: Some(SSE_KEEP_ALIVE),
            sse_retry: None,
            cancellation_token: transport_ct.child_token(),
        },
    );

    let response = match service.oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    };

    // Arm cleanup on the outgoing stream: finish, error and client close all
    // end with the body being dropped.
    let (parts, body) = response.map(Body::new).into_parts();
    let guard = CleanupGuard::new(cleanup);
    let body = Body::from_stream(GuardedStream {
        inner: body.into_data_stream(),
        guard,
    });
    Response::from_parts(parts, body)
}

/// Buffer a POST body so malformed JSON can be logged before the transport
/// interprets it; the bytes are passed through unchanged either way.
async fn peek_post_body(request: Request) -> Result<Request, Response> {
    if request.method() != Method::POST {
        return Ok(request);
    }
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_POST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "failed to buffer POST body");
            return Err(jsonrpc_error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorCode::INVALID_REQUEST,
                "request body too large",
            ));
        }
    };
    if let Err(err) = serde_json::from_slice::<serde_json::Value>(&bytes) {
        let (snippet, truncated) = truncate_bytes_lossy(&bytes, BODY_SNIPPET_BYTES);
        tracing::warn!(
            error = %err,
            body = %snippet,
            truncated,
            "POST body is not valid JSON; leaving interpretation to the transport"
        );
    }
    Ok(Request::from_parts(parts, Body::from(bytes)))
}

fn profile_query_param(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "profile")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn truncate_bytes_lossy(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    let truncated = bytes.len() > max_bytes;
    let slice = if truncated { &bytes[..max_bytes] } else { bytes };
    (String::from_utf8_lossy(slice).to_string(), truncated)
}

/// JSON-RPC error envelope for failures that happen before the transport
/// takes over.
fn jsonrpc_error_response(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<String>,
) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "error": { "code": code.0, "message": message.into() },
        "id": null,
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body.to_string(),
    )
        .into_response()
}

struct GuardedStream<S> {
    inner: S,
    guard: CleanupGuard,
}

impl<S, E> Stream for GuardedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Err(err))) = &poll {
            self.guard.fail(err.to_string());
        }
        poll
    }
}
