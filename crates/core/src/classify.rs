#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Permission,
    Business,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Permission => "permission",
            Self::Business => "business",
            Self::Unknown => "unknown",
        }
    }

    /// Transient failures are worth another attempt; permission and business
    /// failures will fail the same way again.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Unknown)
    }
}

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline exceeded", "etimedout"];

const NETWORK_MARKERS: &[&str] = &[
    "network",
    "failed to fetch",
    "fetch failed",
    "connection",
    "offline",
    "econnrefused",
    "econnreset",
    "socket",
    "dns",
    "unreachable",
];

const PERMISSION_MARKERS: &[&str] = &[
    "permission",
    "unauthorized",
    "forbidden",
    "not allowed",
    "access denied",
    "row-level security",
    "jwt",
    "401",
    "403",
];

const BUSINESS_MARKERS: &[&str] = &[
    "violates",
    "constraint",
    "invalid",
    "duplicate",
    "conflict",
    "not found",
    "validation",
    "400",
    "404",
    "409",
    "422",
];

/// Maps a free-text failure reason to a category. Total: every input lands in
/// exactly one category, the empty string in `Unknown`.
pub fn classify_error(message: &str) -> ErrorCategory {
    let lowered = message.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return ErrorCategory::Unknown;
    }
    let contains_any = |markers: &[&str]| markers.iter().any(|marker| lowered.contains(marker));
    if contains_any(TIMEOUT_MARKERS) {
        ErrorCategory::Timeout
    } else if contains_any(NETWORK_MARKERS) {
        ErrorCategory::Network
    } else if contains_any(PERMISSION_MARKERS) {
        ErrorCategory::Permission
    } else if contains_any(BUSINESS_MARKERS) {
        ErrorCategory::Business
    } else {
        ErrorCategory::Unknown
    }
}
