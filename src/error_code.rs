//! Error classes: the closed taxonomy that drives retry and fallback decisions.
//!
//! Every failure produced inside the pipeline, or reported by a collaborator,
//! carries one [`ErrorClass`]. The class decides:
//!
//! | Class            | Pool retry        | Tier fallback |
//! |------------------|-------------------|---------------|
//! | `Transient`      | yes               | yes           |
//! | `RateLimited`    | yes               | yes           |
//! | `QuotaExhausted` | bounded           | yes           |
//! | `Corrupted`      | yes (new handle)  | yes           |
//! | `Timeout`        | no                | yes           |
//! | `InvalidInput`   | no                | no            |
//! | `Authentication` | no                | no            |
//! | `Cancelled`      | no                | no            |
//! | `Internal`       | no                | no            |
//! | `Unknown`        | no                | no            |
//!
//! ## Example
//!
//! ```rust
//! use capture_batch::error_code::ErrorClass;
//!
//! let class = ErrorClass::from_http_status(503);
//! assert_eq!(class, ErrorClass::Transient);
//! assert!(class.retryable());
//! assert_eq!(class.code(), "E3001");
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// E1001: Malformed payload or data the extractor can never accept
    InvalidInput,
    /// E1002: Invalid or expired credentials
    Authentication,
    /// E2001: Upstream rate limit hit
    RateLimited,
    /// E2002: Usage quota or billing limit reached
    QuotaExhausted,
    /// E3001: Network blip or 5xx-equivalent upstream failure
    Transient,
    /// E3002: Handle is no longer usable (broken connection pool, poisoned client)
    Corrupted,
    /// E3003: An attempt ran out of time
    Timeout,
    /// E4001: Work cancelled before completion
    Cancelled,
    /// E4002: Failure inside the orchestration itself
    Internal,
    /// E9999: Could not be classified
    Unknown,
}

impl ErrorClass {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput => "E1001",
            Self::Authentication => "E1002",
            Self::RateLimited => "E2001",
            Self::QuotaExhausted => "E2002",
            Self::Transient => "E3001",
            Self::Corrupted => "E3002",
            Self::Timeout => "E3003",
            Self::Cancelled => "E4001",
            Self::Internal => "E4002",
            Self::Unknown => "E9999",
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Authentication => "authentication",
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Transient => "transient",
            Self::Corrupted => "corrupted",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal_error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the resource layer may retry the same operation.
    ///
    /// `QuotaExhausted` is retryable only up to the pool's quota bound.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient | Self::RateLimited | Self::QuotaExhausted | Self::Corrupted
        )
    }

    /// Whether a slower tier is worth trying after this failure.
    #[inline]
    pub fn fallbackable(&self) -> bool {
        matches!(
            self,
            Self::Transient
                | Self::RateLimited
                | Self::QuotaExhausted
                | Self::Corrupted
                | Self::Timeout
        )
    }

    /// Maps an HTTP status to a class.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 413 | 415 | 422 => Self::InvalidInput,
            401 | 403 => Self::Authentication,
            404 => Self::InvalidInput,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            402 => Self::QuotaExhausted,
            500..=599 => Self::Transient,
            _ => Self::Unknown,
        }
    }

    /// Maps a class name (as produced by [`ErrorClass::name`]) back to the class.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "invalid_input" => Self::InvalidInput,
            "authentication" => Self::Authentication,
            "rate_limited" => Self::RateLimited,
            "quota_exhausted" => Self::QuotaExhausted,
            "transient" => Self::Transient,
            "corrupted" => Self::Corrupted,
            "timeout" => Self::Timeout,
            "cancelled" => Self::Cancelled,
            "internal_error" => Self::Internal,
            "unknown" => Self::Unknown,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}
