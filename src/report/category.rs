use crate::error_code::ErrorClass;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// User-facing failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Quality,
    Quota,
    Network,
    Format,
    Timeout,
    /// Produced only by the processor for orchestration failures.
    #[serde(rename = "internal_error")]
    Internal,
    Unknown,
}

impl FailureCategory {
    pub fn name(&self) -> &'static str {
        match self {
            FailureCategory::Quality => "quality",
            FailureCategory::Quota => "quota",
            FailureCategory::Network => "network",
            FailureCategory::Format => "format",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Internal => "internal_error",
            FailureCategory::Unknown => "unknown",
        }
    }

    /// Category for a classified error, falling back to message heuristics
    /// when the class alone says nothing user-relevant.
    pub fn from_error(err: &Error) -> Self {
        match err.class() {
            ErrorClass::QuotaExhausted | ErrorClass::RateLimited => FailureCategory::Quota,
            ErrorClass::Timeout => FailureCategory::Timeout,
            ErrorClass::Transient => FailureCategory::Network,
            ErrorClass::Internal => FailureCategory::Internal,
            _ => classify_error(&err.message()),
        }
    }

    /// Short non-technical advice, if the category has any.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            FailureCategory::Quality => {
                Some("Retake blurry or dark photos in good light with the card in focus")
            }
            FailureCategory::Quota => Some("AI capacity is used up for now, please try again later"),
            FailureCategory::Network => Some("Check your connection and try again in a minute"),
            FailureCategory::Format => Some("Send JPEG or PNG photos under 5 MB"),
            FailureCategory::Timeout => Some("Wait a few minutes and resend, smaller photos help"),
            FailureCategory::Internal => Some("Something went wrong on our side, please resend these photos"),
            FailureCategory::Unknown => None,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Map a raw failure message to a category using keyword heuristics.
///
/// Never returns [`FailureCategory::Internal`].
pub fn classify_error(message: &str) -> FailureCategory {
    let lower = message.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has(&["quota", "limit", "exhausted"]) {
        FailureCategory::Quota
    } else if has(&["timeout", "timed out"]) {
        FailureCategory::Timeout
    } else if has(&["network", "connection", "dns"]) {
        FailureCategory::Network
    } else if has(&[
        "blur",
        "模糊",
        "dark",
        "暗",
        "quality",
        "glare",
        "no card",
        "非名片",
        "low confidence",
    ]) {
        FailureCategory::Quality
    } else if has(&["format", "size", "large", "unsupported", "decode"]) {
        FailureCategory::Format
    } else {
        FailureCategory::Unknown
    }
}

/// One-phrase summary of a failure for a report line.
pub fn failure_summary(category: FailureCategory, message: &str) -> String {
    let lower = message.to_lowercase();
    match category {
        FailureCategory::Quota => "AI quota used up".into(),
        FailureCategory::Timeout => "processing timed out".into(),
        FailureCategory::Network => "network problem".into(),
        FailureCategory::Internal => "internal error".into(),
        FailureCategory::Quality if lower.contains("blur") || lower.contains("模糊") => {
            "photo too blurry".into()
        }
        FailureCategory::Quality if lower.contains("dark") || lower.contains("暗") => {
            "photo too dark".into()
        }
        FailureCategory::Quality if lower.contains("no card") || lower.contains("非名片") => {
            "not a business card".into()
        }
        FailureCategory::Quality if lower.contains("low confidence") => {
            "recognition confidence too low".into()
        }
        FailureCategory::Quality => "photo quality too low".into(),
        FailureCategory::Format if lower.contains("size") || lower.contains("large") => {
            "file too large".into()
        }
        FailureCategory::Format => "unsupported format".into(),
        FailureCategory::Unknown if message.is_empty() => "processing failed".into(),
        FailureCategory::Unknown => truncate(message, 30),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}...")
    }
}
