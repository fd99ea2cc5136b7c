use crate::transport::TransportError;
use crate::types::ErrorResponse;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "request.timeout", "transfer_cache.origin_map")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "xhr_backend", "client_builder")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the HTTP pipeline.
///
/// `Http` is the terminal error event of a request's event stream; everything else is
/// raised while setting up a client or a request.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("{}", .0.message)]
    Http(Box<ErrorResponse>),

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a configuration error without context.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::configuration_with_context(msg, ErrorContext::new())
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// The error response carried by a terminal error event, if this is one.
    pub fn as_http(&self) -> Option<&ErrorResponse> {
        match self {
            Error::Http(resp) => Some(resp),
            _ => None,
        }
    }

    /// HTTP status of a terminal error event (`0` when no response was received).
    pub fn status(&self) -> Option<u16> {
        self.as_http().map(|r| r.status)
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<ErrorResponse> for Error {
    fn from(resp: ErrorResponse) -> Self {
        Error::Http(Box::new(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_renders_context() {
        let err = Error::configuration_with_context(
            "timeout must be a positive duration",
            ErrorContext::new()
                .with_field_path("request.timeout")
                .with_source("request_builder"),
        );
        assert_eq!(
            err.to_string(),
            "Configuration error: timeout must be a positive duration (field: request.timeout, source: request_builder)"
        );
        assert!(err.context().is_some());
        assert!(err.status().is_none());
    }
}
