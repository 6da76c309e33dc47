//! Provider descriptors and adapters.
//!
//! A provider is an interchangeable execution backend behind the
//! [`ProviderAdapter`] capability contract. Descriptors carry the static
//! routing metadata (priority, kind, rate-limit strategy, confidence);
//! adapters wrap the actual backend mechanics.

pub mod adapter;
pub mod cli;
pub mod http;

pub use adapter::{ProviderAdapter, build_adapter};
pub use cli::CliAdapter;
pub use http::HttpAdapter;

use serde::{Deserialize, Serialize};

/// What sort of backend a provider fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Remote API with real rate limits.
    Api,
    /// Local executable driven through a subprocess.
    Cli,
    /// Fully local backend with no rate limiting; preferred under high load.
    Local,
}

/// How the adapter tells a rate-limit failure from a real one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Structured status codes (429/503, Retry-After).
    StatusCode,
    /// Text-pattern scan over captured output.
    Pattern,
    /// Backend never rate limits; classification is always negative.
    None,
}

/// Static routing metadata for one provider, loaded from configuration.
///
/// `name` is the unique registry key. `priority` and `confidence_weight`
/// are ranking inputs only; correctness never depends on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Static priority; lower wins ties.
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub kind: ProviderKind,
    #[serde(default = "default_strategy")]
    pub rate_limit_strategy: RateLimitStrategy,
    /// Static quality prior, higher is better.
    #[serde(default = "default_confidence")]
    pub confidence_weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: ProviderSettings,
}

fn default_priority() -> i32 {
    99
}

fn default_strategy() -> RateLimitStrategy {
    RateLimitStrategy::None
}

fn default_confidence() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

/// Backend-specific knobs. One fixed field set shared across adapter kinds;
/// each adapter validates the fields it needs at construction time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    /// Executable for `Cli` providers.
    pub executable: Option<String>,
    /// Extra leading arguments before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    /// Endpoint for `Api`/`Local` providers.
    pub endpoint: Option<String>,
    /// Relative health-probe path for HTTP backends.
    pub health_path: Option<String>,
    pub model: Option<String>,
    /// Per-call timeout; bounds a single `generate`.
    pub timeout_secs: Option<u64>,
    /// Case-insensitive substrings/regexes marking rate-limited output.
    #[serde(default)]
    pub rate_limit_patterns: Vec<String>,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            priority: default_priority(),
            kind,
            rate_limit_strategy: default_strategy(),
            confidence_weight: default_confidence(),
            enabled: true,
            settings: ProviderSettings::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.rate_limit_strategy = strategy;
        self
    }

    pub fn with_confidence(mut self, weight: f64) -> Self {
        self.confidence_weight = weight;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
