//! Classified error taxonomy.
//!
//! The two-tier failure model lives here: a [`ProviderError`] is either a
//! *provider failure* (the backend itself could not be used; never spends
//! attempt budget) or an *execution failure* (the backend ran and the work
//! is unusable; spends one attempt). Adapters return structured variants so
//! the orchestrator can classify without inspecting backend-native error
//! text, and each adapter's `detect_rate_limit` resolves the cases that
//! remain ambiguous.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure raised by a provider adapter during `generate`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<DateTime<Utc>>,
    },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("backend call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("backend process exited with status {status}: {stderr}")]
    ProcessFailed { status: i32, stderr: String },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("execution failed: {detail}")]
    ExecutionFailed {
        detail: String,
        logs: Option<String>,
    },
}

impl ProviderError {
    /// Variants that are unambiguously a provider-level fault regardless of
    /// the adapter's rate-limit strategy.
    pub fn is_definitely_provider_fault(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Unavailable(_)
                | ProviderError::Timeout { .. }
                | ProviderError::Http(_)
        )
    }
}

/// Why a candidate was rejected during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    Disabled,
    AlreadyTried,
    Unavailable,
    /// Sitting out a rate-limit cooldown.
    CoolingDown,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectionReason::Disabled => "disabled",
            RejectionReason::AlreadyTried => "already-tried",
            RejectionReason::Unavailable => "unavailable",
            RejectionReason::CoolingDown => "cooling-down",
        };
        f.write_str(s)
    }
}

/// A candidate considered and rejected, kept for diagnosability.
#[derive(Debug, Clone)]
pub struct RejectedCandidate {
    pub name: String,
    pub reason: RejectionReason,
}

/// Fatal configuration problems; the orchestrator refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("provider registry is empty: no enabled providers configured")]
    EmptyRegistry,

    #[error("duplicate provider name '{0}'")]
    DuplicateProvider(String),

    #[error("invalid provider '{name}': {reason}")]
    InvalidProvider { name: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failures while talking to the telemetry source. Never fatal; the
/// aggregator degrades to its last known hints.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telemetry response malformed: {0}")]
    Malformed(String),
}
