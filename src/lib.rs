//! # Foreman
//!
//! Routes discrete units of work ("task packets") to one of several
//! interchangeable execution backends ("providers"), selecting a backend
//! from live availability, historical performance and current system load,
//! and transparently failing over when a backend itself breaks, as
//! opposed to when the work it produced is judged wrong.
//!
//! ## Architecture Overview
//!
//! - **[`provider`]**: the adapter capability contract (execute, probe
//!   availability, classify rate limits) plus the CLI and HTTP backends
//! - **[`registry`]**: owns provider descriptors and runtime stats,
//!   accepts live priority adjustments and rate-limit cooldowns
//! - **[`retry`]**: per-task bookkeeping separating provider failures
//!   (free) from execution failures (spend attempt budget)
//! - **[`telemetry`]**: external queue-state snapshots turned into a load
//!   mode and expiring priority nudges
//! - **[`selection`]**: the pure, deterministic ranking function
//! - **[`orchestrator`]**: the per-task state machine with same-cycle
//!   failover and the downstream artifact sink
//!
//! ## Failure model
//!
//! A *provider failure* means the backend could not be used at all (rate
//! limit, outage, timeout); the task never ran, so it is reselected in the
//! same cycle with the failed provider excluded and the attempt counter
//! untouched. An *execution failure* means the backend ran and the work is
//! unusable; it spends one attempt and is surfaced downstream. Exhaustion
//! of providers or of attempts is always surfaced, never dropped.

/// TOML configuration: runtime knobs, selection tuning, provider list.
pub mod config;

/// Classified error taxonomy for the two-tier failure model.
pub mod error;

/// The orchestration loop and the downstream sink boundary.
pub mod orchestrator;

/// Task packet and artifact bundle value types.
pub mod packet;

/// Provider descriptors, the adapter contract, and concrete backends.
pub mod provider;

/// Provider registry: descriptors, adapters, runtime stats.
pub mod registry;

/// Per-task retry context tracking.
pub mod retry;

/// The pure provider-selection algorithm.
pub mod selection;

/// System-awareness telemetry and routing hints.
pub mod telemetry;

/// Command-line argument parsing.
pub mod cli;

pub use config::ForemanConfig;
pub use error::{ConfigError, ProviderError, RejectedCandidate, RejectionReason};
pub use orchestrator::{
    ArtifactSink, FailureKind, FailureRecord, Orchestrator, OrchestratorConfig, TaskOutcome,
    TaskReport,
};
pub use packet::{ArtifactBundle, TaskPacket};
pub use provider::{
    ProviderAdapter, ProviderDescriptor, ProviderKind, RateLimitStrategy, build_adapter,
};
pub use registry::{Outcome, ProviderRegistry};
pub use retry::{RetryContext, RetryContextTracker};
pub use selection::{CandidateView, LoadMode, SchedulingDecision, select};
pub use telemetry::{TelemetryAggregator, TelemetrySnapshot, TelemetrySource};
