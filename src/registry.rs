//! Provider registry: descriptors, adapters, and runtime stats.
//!
//! Single owner of all per-provider mutable state. Entries live in a
//! [`DashMap`] so updates to one provider never contend with another; the
//! ranking reads snapshots and tolerates slight staleness.

use crate::error::ConfigError;
use crate::provider::{ProviderAdapter, ProviderDescriptor, build_adapter};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bounded window of recent dispatch outcomes per provider.
const OUTCOME_WINDOW: usize = 50;

const DEFAULT_COOLDOWN_SECS: i64 = 300;

/// Classified result of one dispatch, as recorded against a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The backend itself could not be used; `rate_limited` starts a
    /// cooldown so the provider sits out until it expires.
    ProviderFailure { rate_limited: bool },
    /// The backend ran but the work is unusable.
    ExecutionFailure,
}

/// A temporary signed offset layered onto a provider's static priority.
#[derive(Debug, Clone)]
struct PriorityNudge {
    delta: i32,
    expires_at: DateTime<Utc>,
}

/// Mutable per-provider state, updated after every dispatch.
#[derive(Debug, Default)]
pub struct ProviderRuntimeStats {
    /// Recent outcomes, true = success. Provider failures count against
    /// the rate: a backend that keeps falling over earns less trust.
    window: VecDeque<bool>,
    pub consecutive_failures: u32,
    pub last_available: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    rate_limited_until: Option<DateTime<Utc>>,
    nudges: Vec<PriorityNudge>,
}

impl ProviderRuntimeStats {
    fn record(&mut self, success: bool) {
        if self.window.len() == OUTCOME_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    /// Rolling success rate over the bounded window; 0.5 neutral prior for
    /// providers with no history yet.
    pub fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.5;
        }
        let successes = self.window.iter().filter(|s| **s).count();
        successes as f64 / self.window.len() as f64
    }

    fn prune_nudges(&mut self, now: DateTime<Utc>) {
        self.nudges.retain(|n| n.expires_at > now);
    }

    fn adjustment(&self, now: DateTime<Utc>) -> i32 {
        self.nudges
            .iter()
            .filter(|n| n.expires_at > now)
            .map(|n| n.delta)
            .sum()
    }
}

struct ProviderEntry {
    descriptor: ProviderDescriptor,
    stats: ProviderRuntimeStats,
    adapter: Arc<dyn ProviderAdapter>,
}

/// Owns the full provider set. Construction fails on an empty or
/// inconsistent configuration; the orchestrator must not start without a
/// usable registry.
pub struct ProviderRegistry {
    entries: DashMap<String, ProviderEntry>,
    cooldown: Duration,
}

impl ProviderRegistry {
    /// Build from configuration descriptors, instantiating the matching
    /// adapter for each.
    pub fn from_descriptors(descriptors: Vec<ProviderDescriptor>) -> Result<Self, ConfigError> {
        let pairs = descriptors
            .into_iter()
            .map(|d| {
                let adapter = build_adapter(&d)?;
                Ok((d, adapter))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Self::with_adapters(pairs)
    }

    /// Build with pre-constructed adapters. The seam used by tests and by
    /// embedders that bring their own backends.
    pub fn with_adapters(
        pairs: Vec<(ProviderDescriptor, Arc<dyn ProviderAdapter>)>,
    ) -> Result<Self, ConfigError> {
        let entries = DashMap::new();
        for (descriptor, adapter) in pairs {
            let name = descriptor.name.clone();
            if entries.contains_key(&name) {
                return Err(ConfigError::DuplicateProvider(name));
            }
            entries.insert(
                name.clone(),
                ProviderEntry {
                    descriptor,
                    stats: ProviderRuntimeStats::default(),
                    adapter,
                },
            );
            info!(provider = %name, "provider registered");
        }

        let registry = Self {
            entries,
            cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECS),
        };
        if registry.enabled_providers().is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        Ok(registry)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Snapshot of all enabled descriptors, sorted by effective priority.
    /// Consistent per entry; cross-entry staleness is tolerated by design.
    pub fn enabled_providers(&self) -> Vec<ProviderDescriptor> {
        let now = Utc::now();
        let mut enabled: Vec<(i32, ProviderDescriptor)> = self
            .entries
            .iter()
            .filter(|e| e.descriptor.enabled)
            .map(|e| {
                let effective = e.descriptor.priority - e.stats.adjustment(now);
                (effective, e.descriptor.clone())
            })
            .collect();
        enabled.sort_by_key(|(effective, _)| *effective);
        enabled.into_iter().map(|(_, d)| d).collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<ProviderDescriptor> {
        self.entries.get(name).map(|e| e.descriptor.clone())
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.entries.get(name).map(|e| e.adapter.clone())
    }

    /// Record a classified dispatch outcome. Serialized per provider by the
    /// map shard lock; different providers never contend.
    pub fn record_outcome(&self, name: &str, outcome: Outcome) {
        let Some(mut entry) = self.entries.get_mut(name) else {
            warn!(provider = %name, "outcome recorded for unknown provider");
            return;
        };
        let now = Utc::now();
        let stats = &mut entry.stats;

        match outcome {
            Outcome::Success => {
                stats.record(true);
                stats.consecutive_failures = 0;
                stats.last_success = Some(now);
                stats.rate_limited_until = None;
            }
            Outcome::ProviderFailure { rate_limited } => {
                stats.record(false);
                stats.consecutive_failures += 1;
                stats.last_failure = Some(now);
                if rate_limited {
                    stats.rate_limited_until = Some(now + self.cooldown);
                    debug!(provider = %name, cooldown_secs = self.cooldown.num_seconds(),
                           "provider entering rate-limit cooldown");
                }
            }
            Outcome::ExecutionFailure => {
                stats.record(false);
                stats.consecutive_failures += 1;
                stats.last_failure = Some(now);
            }
        }
    }

    /// Note a positive availability probe. Probes never touch the outcome
    /// window or rankings.
    pub fn mark_available(&self, name: &str) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.stats.last_available = Some(Utc::now());
        }
    }

    /// Layer a temporary dynamic offset on a provider's priority. Positive
    /// deltas promote (lower the effective number), negative demote.
    pub fn apply_priority_adjustment(&self, name: &str, delta: i32, ttl: Duration) {
        let Some(mut entry) = self.entries.get_mut(name) else {
            return;
        };
        let now = Utc::now();
        entry.stats.prune_nudges(now);
        entry.stats.nudges.push(PriorityNudge {
            delta,
            expires_at: now + ttl,
        });
        debug!(provider = %name, delta, ttl_secs = ttl.num_seconds(), "priority nudge applied");
    }

    pub fn clear_priority_adjustments(&self, name: &str) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.stats.nudges.clear();
        }
    }

    /// Static priority minus the sum of unexpired nudge deltas. Lower wins.
    pub fn effective_priority(&self, name: &str) -> Option<i32> {
        let now = Utc::now();
        self.entries
            .get(name)
            .map(|e| e.descriptor.priority - e.stats.adjustment(now))
    }

    pub fn success_rate(&self, name: &str) -> Option<f64> {
        self.entries.get(name).map(|e| e.stats.success_rate())
    }

    /// Whether the provider is sitting out a rate-limit cooldown.
    pub fn is_cooling_down(&self, name: &str) -> bool {
        let now = Utc::now();
        self.entries
            .get(name)
            .and_then(|e| e.stats.rate_limited_until)
            .is_some_and(|until| until > now)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.entries.get_mut(name) {
            Some(mut entry) => {
                entry.descriptor.enabled = enabled;
                info!(provider = %name, enabled, "provider toggled");
                true
            }
            None => false,
        }
    }

    pub fn reset_cooldowns(&self) {
        for mut entry in self.entries.iter_mut() {
            entry.stats.rate_limited_until = None;
            entry.stats.consecutive_failures = 0;
        }
    }

    /// Apply a reloaded descriptor list: add new providers, drop removed
    /// ones, and update descriptors in place. Runtime stats of surviving
    /// providers are kept untouched.
    pub fn reload(&self, descriptors: Vec<ProviderDescriptor>) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.name.clone()) {
                return Err(ConfigError::DuplicateProvider(descriptor.name.clone()));
            }
        }
        if !descriptors.iter().any(|d| d.enabled) {
            return Err(ConfigError::EmptyRegistry);
        }

        // Build adapters for genuinely new providers before mutating.
        let mut additions = Vec::new();
        for descriptor in &descriptors {
            if !self.entries.contains_key(&descriptor.name) {
                additions.push((descriptor.clone(), build_adapter(descriptor)?));
            }
        }

        self.entries
            .retain(|name, _| descriptors.iter().any(|d| &d.name == name));

        for descriptor in descriptors {
            match self.entries.get_mut(&descriptor.name) {
                Some(mut entry) => {
                    entry.descriptor = descriptor;
                }
                None => {
                    let (descriptor, adapter) = additions
                        .iter()
                        .find(|(d, _)| d.name == descriptor.name)
                        .cloned()
                        .expect("adapter prebuilt for new provider");
                    let name = descriptor.name.clone();
                    self.entries.insert(
                        name.clone(),
                        ProviderEntry {
                            descriptor,
                            stats: ProviderRuntimeStats::default(),
                            adapter,
                        },
                    );
                    info!(provider = %name, "provider added on reload");
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
