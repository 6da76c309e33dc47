//! System-awareness telemetry.
//!
//! Pulls point-in-time snapshots from the external queue service and turns
//! them into routing hints: a coarse load mode and temporary priority
//! nudges written into the registry. This module never talks to providers
//! directly.

use crate::error::TelemetryError;
use crate::registry::ProviderRegistry;
use crate::selection::LoadMode;
use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Per-provider performance as observed by the downstream queue.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalProviderStats {
    #[serde(default)]
    pub total_runs: u64,
    #[serde(default)]
    pub failures: u64,
    #[serde(default)]
    pub success_rate: f64,
}

/// Point-in-time read of external system state. A value type; copied into
/// the aggregator and never mutated after capture.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
    pub queued: u64,
    pub running: u64,
    pub provider_stats: HashMap<String, ExternalProviderStats>,
    /// Providers that failed on items currently sitting in retry.
    pub retrying_providers: Vec<String>,
}

/// Where snapshots come from. The HTTP implementation talks to the queue
/// service; tests inject a static source.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn snapshot(&self) -> Result<TelemetrySnapshot, TelemetryError>;
}

#[derive(Debug, Deserialize)]
struct QueueStatsBody {
    #[serde(default)]
    queued: u64,
    #[serde(default)]
    running: u64,
    #[serde(default)]
    retrying_providers: Vec<String>,
}

/// Telemetry pulled from the queue service's stats endpoints.
pub struct HttpTelemetrySource {
    client: reqwest::Client,
    stats_url: Url,
    provider_stats_url: Url,
}

impl HttpTelemetrySource {
    pub fn new(api_url: &str) -> Result<Self, TelemetryError> {
        let base = Url::parse(api_url)
            .map_err(|e| TelemetryError::Malformed(format!("invalid api url: {}", e)))?;
        let stats_url = base
            .join("queue/stats")
            .map_err(|e| TelemetryError::Malformed(e.to_string()))?;
        let provider_stats_url = base
            .join("queue/provider-stats")
            .map_err(|e| TelemetryError::Malformed(e.to_string()))?;

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(TelemetryError::Http)?,
            stats_url,
            provider_stats_url,
        })
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn snapshot(&self) -> Result<TelemetrySnapshot, TelemetryError> {
        let stats: QueueStatsBody = self
            .client
            .get(self.stats_url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let provider_stats: HashMap<String, ExternalProviderStats> = self
            .client
            .get(self.provider_stats_url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(TelemetrySnapshot {
            queued: stats.queued,
            running: stats.running,
            provider_stats,
            retrying_providers: stats.retrying_providers,
        })
    }
}

/// Fixed snapshot source for tests and offline operation.
#[derive(Default)]
pub struct StaticTelemetrySource {
    snapshot: std::sync::Mutex<TelemetrySnapshot>,
}

impl StaticTelemetrySource {
    pub fn new(snapshot: TelemetrySnapshot) -> Self {
        Self {
            snapshot: std::sync::Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: TelemetrySnapshot) {
        *self.snapshot.lock().expect("snapshot lock poisoned") = snapshot;
    }
}

#[async_trait]
impl TelemetrySource for StaticTelemetrySource {
    async fn snapshot(&self) -> Result<TelemetrySnapshot, TelemetryError> {
        Ok(self.snapshot.lock().expect("snapshot lock poisoned").clone())
    }
}

/// Tuning knobs for deriving routing hints.
#[derive(Debug, Clone)]
pub struct TelemetryThresholds {
    /// Queued + running above this flips the load mode to high.
    pub high_load_threshold: u64,
    /// Externally observed success rate below this demotes a provider.
    pub success_rate_floor: f64,
    /// Magnitude of the demotion nudge (applied as a negative delta).
    pub demote_delta: i32,
    /// Magnitude of the peer-promotion nudge.
    pub promote_delta: i32,
    /// How long a nudge lives before a recovering provider is re-trusted.
    pub nudge_ttl: Duration,
}

impl Default for TelemetryThresholds {
    fn default() -> Self {
        Self {
            high_load_threshold: 50,
            success_rate_floor: 0.3,
            demote_delta: 10,
            promote_delta: 2,
            nudge_ttl: Duration::seconds(300),
        }
    }
}

const LOAD_NORMAL: u8 = 0;
const LOAD_HIGH: u8 = 1;

/// Consumes snapshots and writes routing hints: the load-mode flag read by
/// selection and expiring priority nudges written into the registry.
pub struct TelemetryAggregator {
    source: Arc<dyn TelemetrySource>,
    registry: Arc<ProviderRegistry>,
    thresholds: TelemetryThresholds,
    load_mode: AtomicU8,
}

impl TelemetryAggregator {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        registry: Arc<ProviderRegistry>,
        thresholds: TelemetryThresholds,
    ) -> Self {
        Self {
            source,
            registry,
            thresholds,
            load_mode: AtomicU8::new(LOAD_NORMAL),
        }
    }

    /// Current load mode as derived from the latest successful refresh.
    pub fn load_mode(&self) -> LoadMode {
        match self.load_mode.load(Ordering::Relaxed) {
            LOAD_HIGH => LoadMode::High,
            _ => LoadMode::Normal,
        }
    }

    /// Pull one snapshot and fold it into routing state. Source failures
    /// are logged and leave the previous hints standing; telemetry is a
    /// heuristic, never a hard dependency.
    pub async fn refresh(&self) {
        let snapshot = match self.source.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "telemetry refresh failed, keeping previous hints");
                return;
            }
        };
        self.apply(&snapshot);
    }

    fn apply(&self, snapshot: &TelemetrySnapshot) {
        let active = snapshot.queued + snapshot.running;
        let mode = if active > self.thresholds.high_load_threshold {
            LOAD_HIGH
        } else {
            LOAD_NORMAL
        };
        let previous = self.load_mode.swap(mode, Ordering::Relaxed);
        if previous != mode {
            info!(
                queued = snapshot.queued,
                running = snapshot.running,
                high = mode == LOAD_HIGH,
                "load mode changed"
            );
        }

        let enabled = self.registry.enabled_providers();

        // Providers the queue has watched struggle.
        let struggling: Vec<&str> = enabled
            .iter()
            .filter_map(|d| {
                let stats = snapshot.provider_stats.get(&d.name)?;
                (stats.total_runs > 0 && stats.success_rate < self.thresholds.success_rate_floor)
                    .then_some(d.name.as_str())
            })
            .collect();

        if struggling.is_empty() || struggling.len() == enabled.len() {
            // Nothing to rebalance: either everyone is fine or everyone is
            // struggling and a nudge would change no relative order.
            return;
        }

        for descriptor in &enabled {
            if struggling.contains(&descriptor.name.as_str()) {
                self.registry.apply_priority_adjustment(
                    &descriptor.name,
                    -self.thresholds.demote_delta,
                    self.thresholds.nudge_ttl,
                );
                debug!(provider = %descriptor.name, "demoted on external success rate");
            } else {
                self.registry.apply_priority_adjustment(
                    &descriptor.name,
                    self.thresholds.promote_delta,
                    self.thresholds.nudge_ttl,
                );
            }
        }
    }

    /// Periodic refresh loop; exits when the shutdown flag flips.
    pub async fn run(&self, cadence: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("telemetry loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
