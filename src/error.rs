use crate::error_code::ErrorClass;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Component that raised the error (e.g., "lease_pool", "tier:fast")
    pub source: Option<String>,
    /// Free-form details (config key, upstream status, item reference)
    pub details: Option<String>,
    /// Submitter the failing work belonged to, if any
    pub submitter: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }
}

/// Unified error type for the capture pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    /// A failure reported by a collaborator (downloader, extractor, store, notifier)
    /// or by a pooled handle, already classified.
    #[error("{class} failure: {message}{}", format_context(.context))]
    Upstream {
        class: ErrorClass,
        message: String,
        context: ErrorContext,
    },

    #[error("Timed out after {}ms{}", .elapsed.as_millis(), format_context(.context))]
    Timeout {
        elapsed: Duration,
        context: ErrorContext,
    },

    #[error("No pooled handle available after {}ms (key: {key})", .waited.as_millis())]
    PoolExhausted { key: String, waited: Duration },

    #[error("Internal error: {message}{}", format_context(.context))]
    Internal {
        message: String,
        context: ErrorContext,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref submitter) = ctx.submitter {
        parts.push(format!("submitter: {}", submitter));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn upstream(class: ErrorClass, msg: impl Into<String>) -> Self {
        Error::Upstream {
            class,
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::upstream(ErrorClass::Transient, msg)
    }

    pub fn quota_exhausted(msg: impl Into<String>) -> Self {
        Self::upstream(ErrorClass::QuotaExhausted, msg)
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::upstream(ErrorClass::InvalidInput, msg)
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::upstream(ErrorClass::Corrupted, msg)
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Error::Timeout {
            elapsed,
            context: ErrorContext::new(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    /// Attach context to variants that carry one; other variants are returned unchanged.
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        match &mut self {
            Error::Configuration { context, .. }
            | Error::Upstream { context, .. }
            | Error::Timeout { context, .. }
            | Error::Internal { context, .. } => *context = ctx,
            _ => {}
        }
        self
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Upstream { context, .. }
            | Error::Timeout { context, .. }
            | Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// The class that drives retry and fallback for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Upstream { class, .. } => *class,
            Error::Timeout { .. } => ErrorClass::Timeout,
            Error::PoolExhausted { .. } => ErrorClass::Transient,
            Error::Internal { .. } => ErrorClass::Internal,
            Error::Configuration { .. } => ErrorClass::Internal,
            Error::Http(e) => classify_reqwest(e),
            Error::Io(_) => ErrorClass::Transient,
            Error::Yaml(_) => ErrorClass::InvalidInput,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().retryable()
    }

    pub fn is_fallbackable(&self) -> bool {
        self.class().fallbackable()
    }

    /// Short message without the variant prefix, suitable for user-facing summaries.
    pub fn message(&self) -> String {
        match self {
            Error::Configuration { message, .. }
            | Error::Upstream { message, .. }
            | Error::Internal { message, .. } => message.clone(),
            Error::Timeout { elapsed, .. } => format!("timeout after {}ms", elapsed.as_millis()),
            other => other.to_string(),
        }
    }
}

fn classify_reqwest(e: &reqwest::Error) -> ErrorClass {
    if e.is_timeout() {
        return ErrorClass::Timeout;
    }
    if let Some(status) = e.status() {
        return ErrorClass::from_http_status(status.as_u16());
    }
    if e.is_connect() || e.is_request() || e.is_body() {
        return ErrorClass::Transient;
    }
    if e.is_builder() {
        return ErrorClass::Corrupted;
    }
    if e.is_decode() {
        return ErrorClass::InvalidInput;
    }
    ErrorClass::Unknown
}
