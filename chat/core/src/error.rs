//! Chat Error Taxonomy
//!
//! Every failure the core can report to a UI surface. Cancellation is not an
//! error and has no variant here: a stopped stream simply ends.
//!
//! Transport failures (`Network`, `Http`, `Protocol`) are delivered through the
//! stream channel and converted by the client into a fallback message body plus
//! a last-error value. The remaining variants are returned synchronously from
//! the client operation that was refused.

use serde::Deserialize;
use thiserror::Error;

use crate::messages::ConversationId;

/// Default error code for a rejected streaming request without a server code
pub const STREAM_ERROR_CODE: &str = "STREAM_ERROR";

/// Errors surfaced by the chat core
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ChatError {
    /// The request never reached the server, or the connection dropped
    #[error("Network error - {message}")]
    Network {
        /// Description of the underlying failure
        message: String,
    },

    /// The server rejected the request with a non-success status
    #[error("{message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Machine-readable error code
        code: String,
        /// Human-readable message
        message: String,
        /// Extra detail object supplied by the server
        details: Option<serde_json::Value>,
    },

    /// The response body was present but unusable
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A send was attempted while the conversation already has a live stream
    #[error("A response is already streaming for conversation {0}")]
    StreamAlreadyActive(ConversationId),

    /// Nothing to target and no conversation could be created
    #[error("No active conversation")]
    NoActiveConversation,

    /// An explicit conversation id did not match any conversation
    #[error("Conversation {0} not found")]
    ConversationNotFound(ConversationId),

    /// Blank text was submitted
    #[error("Message is empty")]
    EmptyMessage,
}

/// Shape of the JSON error body returned by the gateway
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
    code: Option<String>,
    details: Option<serde_json::Value>,
}

impl ChatError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Build an HTTP error from a status and a raw response body
    ///
    /// The body is parsed leniently: a missing or unparseable body yields
    /// `"HTTP error {status}"` with the `STREAM_ERROR` code.
    #[must_use]
    pub fn from_response_body(status: u16, body: &[u8]) -> Self {
        let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
        Self::Http {
            status,
            code: parsed.code.unwrap_or_else(|| STREAM_ERROR_CODE.to_string()),
            message: parsed
                .message
                .or(parsed.error)
                .unwrap_or_else(|| format!("HTTP error {status}")),
            details: parsed.details,
        }
    }

    /// Build an HTTP error using the descriptive defaults for well-known statuses
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        Self::Http {
            status,
            code: status_error_code(status).to_string(),
            message: status_message(status),
            details: None,
        }
    }

    /// Machine-readable error code
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Network { .. } => "NETWORK_ERROR",
            Self::Http { code, .. } => code,
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::StreamAlreadyActive(_) => "STREAM_ALREADY_ACTIVE",
            Self::NoActiveConversation => "NO_ACTIVE_CONVERSATION",
            Self::ConversationNotFound(_) => "CONVERSATION_NOT_FOUND",
            Self::EmptyMessage => "EMPTY_MESSAGE",
        }
    }

    /// HTTP status, when the server answered
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 401 Unauthorized
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// 403 Forbidden
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(403)
    }

    /// 404 Not Found
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// 5xx
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| s >= 500)
    }

    /// The request never reached the server or the connection dropped
    #[must_use]
    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Whether a manual retry has a reasonable chance of succeeding
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_network_error() || self.is_server_error() || self.status() == Some(429)
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::network(err.to_string())
        }
    }
}

/// Error code for a well-known HTTP status
#[must_use]
pub fn status_error_code(status: u16) -> &'static str {
    match status {
        400 => "BAD_REQUEST",
        401 => "UNAUTHORIZED",
        403 => "FORBIDDEN",
        404 => "NOT_FOUND",
        409 => "CONFLICT",
        422 => "VALIDATION_ERROR",
        429 => "RATE_LIMITED",
        500 => "SERVER_ERROR",
        502 => "BAD_GATEWAY",
        503 => "SERVICE_UNAVAILABLE",
        504 => "GATEWAY_TIMEOUT",
        _ => "HTTP_ERROR",
    }
}

/// Human-readable message for a well-known HTTP status
#[must_use]
pub fn status_message(status: u16) -> String {
    let known = match status {
        400 => "Bad request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not found",
        409 => "Conflict",
        422 => "Validation error",
        429 => "Too many requests",
        500 => "Internal server error",
        502 => "Bad gateway",
        503 => "Service unavailable",
        504 => "Gateway timeout",
        _ => return format!("HTTP error {status}"),
    };
    known.to_string()
}
