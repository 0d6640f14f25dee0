//! Error taxonomy for dispatch and retry orchestration
//!
//! Registration-time errors are fatal at startup; per-delivery errors are
//! coerced into `CompleteFailure` outcomes and follow the normal classifier
//! path. Error text that leaves the process (error-queue records) is
//! sanitized first.

use crate::protocol::EntityKey;
use thiserror::Error;

/// Main error type for dispatch operations
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Entity already registered: {0}")]
    DuplicateRegistration(EntityKey),

    #[error("No handler registered for entity: {0}")]
    UnknownEntity(EntityKey),

    #[error("Unable to pick a payload parameter: {first} and {second} both failed collaborator resolution")]
    AmbiguousPayloadParameter { first: String, second: String },

    #[error("Failed to deserialize the message body into parameter '{param}' ({type_name}): {message}")]
    PayloadDeserializationFailed {
        param: String,
        type_name: String,
        message: String,
    },

    #[error("The maximum number of retries ({max_retries}) has been exhausted")]
    MaxRetriesExhausted { max_retries: u32 },

    #[error("Handler invocation failed: {message}")]
    HandlerInvocationFailed { message: String },

    #[error("Transport failure during {operation}: {message}")]
    TransportFailure { operation: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl DispatchError {
    /// Create a handler invocation error
    pub fn invocation_failed<S: Into<String>>(message: S) -> Self {
        Self::HandlerInvocationFailed {
            message: message.into(),
        }
    }

    /// Create a transport failure for a named broker operation
    pub fn transport<S: Into<String>>(operation: &str, message: S) -> Self {
        Self::TransportFailure {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError(message.into())
    }

    /// The error's type name as published in error-queue records
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::DuplicateRegistration(_) => "DuplicateRegistration",
            Self::UnknownEntity(_) => "UnknownEntity",
            Self::AmbiguousPayloadParameter { .. } => "AmbiguousPayloadParameter",
            Self::PayloadDeserializationFailed { .. } => "PayloadDeserializationFailed",
            Self::MaxRetriesExhausted { .. } => "MaxRetriesExhausted",
            Self::HandlerInvocationFailed { .. } => "HandlerInvocationFailed",
            Self::TransportFailure { .. } => "TransportFailure",
            Self::ConfigurationError(_) => "ConfigurationError",
        }
    }
}

/// Sanitize error messages so secrets never reach the error queue
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    // Remove common secret patterns
    sanitized = regex::Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+")
        .unwrap()
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    // Remove file paths that might contain sensitive info
    sanitized =
        regex::Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
            .unwrap()
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();

    // Cap total length at 500, never splitting a multibyte character
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;
