//! Error taxonomy for the hub data plane.
//!
//! Upstream-originated JSON-RPC errors are forwarded with their original
//! code/message; the hub overlays its own code only when it short-circuits
//! before contacting the upstream.

use rmcp::model::{ErrorCode, ErrorData};
use thiserror::Error;

/// Hub JSON-RPC server error codes (-32000..-32099 range).
pub const ERROR_CODE_TIMEOUT: ErrorCode = ErrorCode(-32000);
pub const ERROR_CODE_UPSTREAM_UNAVAILABLE: ErrorCode = ErrorCode(-32001);
pub const ERROR_CODE_AUTH_REQUIRED: ErrorCode = ErrorCode(-32002);

#[derive(Debug, Error)]
pub enum HubError {
    /// Settings file malformed or invalid. Fatal at startup; surfaced as a
    /// save result during runtime.
    #[error("configuration error: {0}")]
    Config(String),

    /// Target upstream exists but is not connected.
    #[error("upstream '{server}' is not available: {reason}")]
    UpstreamUnavailable { server: String, reason: String },

    /// Target upstream is waiting on an OAuth authorization.
    #[error("upstream '{server}' requires authorization")]
    AuthRequired {
        server: String,
        authorization_url: Option<String>,
    },

    /// Unknown server, group, tool, prompt, or resource.
    #[error("{0}")]
    NotFound(String),

    /// Malformed request arguments.
    #[error("{0}")]
    InvalidParams(String),

    /// Deadline exceeded on a dispatched call.
    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Client disconnect or explicit cancel.
    #[error("request cancelled")]
    Cancelled,

    /// An upstream answered with a JSON-RPC error; forwarded verbatim.
    #[error("upstream error: {}", .0.message)]
    Upstream(ErrorData),

    /// Unexpected internal failure. The cause is logged, not returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn upstream_unavailable(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Map this error onto the wire-level `ErrorData` sent downstream.
    #[must_use]
    pub fn to_error_data(&self) -> ErrorData {
        match self {
            Self::Config(msg) => ErrorData::new(ErrorCode::INTERNAL_ERROR, msg.clone(), None),
            Self::UpstreamUnavailable { server, reason } => ErrorData::new(
                ERROR_CODE_UPSTREAM_UNAVAILABLE,
                format!("upstream '{server}' is not available: {reason}"),
                None,
            ),
            Self::AuthRequired {
                server,
                authorization_url,
            } => ErrorData::new(
                ERROR_CODE_AUTH_REQUIRED,
                format!("upstream '{server}' requires authorization"),
                authorization_url
                    .as_ref()
                    .map(|url| serde_json::json!({ "authorizationUrl": url })),
            ),
            Self::NotFound(msg) => ErrorData::new(ErrorCode::METHOD_NOT_FOUND, msg.clone(), None),
            Self::InvalidParams(msg) => {
                ErrorData::new(ErrorCode::INVALID_PARAMS, msg.clone(), None)
            }
            Self::Timeout { elapsed_ms } => ErrorData::new(
                ERROR_CODE_TIMEOUT,
                format!("request timed out after {elapsed_ms}ms"),
                Some(serde_json::json!({ "kind": "timeout" })),
            ),
            Self::Cancelled => {
                ErrorData::new(ErrorCode::INTERNAL_ERROR, "request cancelled".to_string(), None)
            }
            Self::Upstream(data) => data.clone(),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal dispatch error");
                ErrorData::new(
                    ErrorCode::INTERNAL_ERROR,
                    "internal error".to_string(),
                    None,
                )
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_32000_with_kind() {
        let data = HubError::Timeout { elapsed_ms: 1500 }.to_error_data();
        assert_eq!(data.code, ERROR_CODE_TIMEOUT);
        assert_eq!(
            data.data.as_ref().and_then(|d| d.get("kind")),
            Some(&serde_json::json!("timeout"))
        );
    }

    #[test]
    fn auth_required_carries_authorization_url_hint() {
        let data = HubError::AuthRequired {
            server: "vercel".to_string(),
            authorization_url: Some("https://auth.example.com/authorize?x=1".to_string()),
        }
        .to_error_data();
        assert_eq!(data.code, ERROR_CODE_AUTH_REQUIRED);
        assert_eq!(
            data.data.as_ref().and_then(|d| d.get("authorizationUrl")),
            Some(&serde_json::json!("https://auth.example.com/authorize?x=1"))
        );
    }

    #[test]
    fn upstream_errors_are_forwarded_verbatim() {
        let original = ErrorData::new(ErrorCode(-32050), "custom upstream failure".to_string(), None);
        let data = HubError::Upstream(original.clone()).to_error_data();
        assert_eq!(data.code, original.code);
        assert_eq!(data.message, original.message);
    }

    #[test]
    fn internal_errors_hide_the_cause() {
        let data = HubError::Internal("stack trace here".to_string()).to_error_data();
        assert_eq!(data.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(data.message, "internal error");
    }
}
