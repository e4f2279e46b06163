//! Gateway error kinds and their mapping onto MCP error codes.

use rmcp::model::{ErrorCode, ErrorData};
use rmcp::service::ServiceError;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Unknown profile or server, circular profile reference, bad request.
    #[error("{0}")]
    InvalidRequest(String),

    /// Tool/prompt not present in a resolved profile, or an upstream that
    /// does not implement a listing capability.
    #[error("{0}")]
    MethodNotFound(String),

    /// Operation attempted on a connector that has already been disposed.
    #[error("connector '{0}' is disposed")]
    Disposed(String),

    /// An MCP error frame produced by the upstream; passed through unchanged.
    #[error("upstream error: {}", .0.message)]
    Mcp(ErrorData),

    /// Transport-level upstream failure (connect, handshake, broken pipe).
    #[error("upstream '{server_id}': {message}")]
    Upstream { server_id: String, message: String },

    /// Unexpected failure during request dispatch.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::INVALID_REQUEST,
            Self::MethodNotFound(_) => ErrorCode::METHOD_NOT_FOUND,
            Self::Mcp(data) => data.code,
            Self::Disposed(_) | Self::Upstream { .. } | Self::Internal(_) => {
                ErrorCode::INTERNAL_ERROR
            }
        }
    }

    /// Classify an rmcp client-side failure from one upstream.
    ///
    /// Upstream `method not found` stays distinguishable because the profile
    /// resolver treats it as "this server exposes no tools/prompts".
    pub fn from_service_error(server_id: &str, err: ServiceError) -> Self {
        match err {
            ServiceError::McpError(data) if data.code == ErrorCode::METHOD_NOT_FOUND => {
                Self::MethodNotFound(data.message.to_string())
            }
            ServiceError::McpError(data) => Self::Mcp(data),
            other => Self::Upstream {
                server_id: server_id.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::MethodNotFound(_))
    }
}

impl From<GatewayError> for ErrorData {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Mcp(data) => data,
            other => ErrorData::new(other.error_code(), other.to_string(), None),
        }
    }
}
