//! Per-task retry bookkeeping.
//!
//! The load-bearing distinction of the whole core lives here: a provider
//! failure appends to the tried-set but never touches the attempt counter,
//! because the task never actually ran. Only execution failures spend
//! attempt budget.

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// Retry state attached to one task in flight.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// Execution-failure count. Provider failures never increment it.
    pub attempt: u32,
    /// Providers that already failed this specific task, in order of
    /// failure. Never retried for this task.
    pub tried_providers: Vec<String>,
    /// Guidance accumulated from judged rejections, fed into later prompts.
    pub guidance: Vec<String>,
}

impl RetryContext {
    pub fn has_tried(&self, provider: &str) -> bool {
        self.tried_providers.iter().any(|p| p == provider)
    }
}

/// Maps task id to [`RetryContext`]. Contexts for distinct tasks never
/// contend; same-task mutation is serialized by the map entry lock even
/// though a correct caller owns one task per cycle.
#[derive(Default)]
pub struct RetryContextTracker {
    contexts: DashMap<Uuid, RetryContext>,
}

impl RetryContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, task_id: Uuid) -> RetryContext {
        self.contexts.entry(task_id).or_default().clone()
    }

    /// The provider itself failed; exclude it from further selection for
    /// this task. Does NOT increment the attempt counter.
    pub fn record_provider_failure(&self, task_id: Uuid, provider: &str) {
        let mut context = self.contexts.entry(task_id).or_default();
        if !context.has_tried(provider) {
            context.tried_providers.push(provider.to_string());
        }
        debug!(task_id = %task_id, provider = %provider,
               tried = context.tried_providers.len(),
               "provider failure recorded, attempt counter untouched");
    }

    /// The work itself failed; spend one attempt. Providers already proven
    /// not to work for this task stay excluded.
    pub fn record_execution_failure(&self, task_id: Uuid) -> u32 {
        let mut context = self.contexts.entry(task_id).or_default();
        context.attempt += 1;
        debug!(task_id = %task_id, attempt = context.attempt, "execution failure recorded");
        context.attempt
    }

    /// Attach judged-rejection feedback for the next attempt's prompt.
    pub fn push_guidance(&self, task_id: Uuid, guidance: impl Into<String>) {
        self.contexts
            .entry(task_id)
            .or_default()
            .guidance
            .push(guidance.into());
    }

    pub fn snapshot(&self, task_id: Uuid) -> Option<RetryContext> {
        self.contexts.get(&task_id).map(|c| c.clone())
    }

    /// Drop the context on terminal success or permanent exhaustion.
    pub fn clear(&self, task_id: Uuid) {
        self.contexts.remove(&task_id);
    }

    pub fn in_flight(&self) -> usize {
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_failures_never_spend_attempts() {
        let tracker = RetryContextTracker::new();
        let task_id = Uuid::new_v4();

        for name in ["p1", "p2", "p3", "p1"] {
            tracker.record_provider_failure(task_id, name);
        }

        let context = tracker.snapshot(task_id).unwrap();
        assert_eq!(context.attempt, 0);
        // Deduped, order preserved.
        assert_eq!(context.tried_providers, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn execution_failures_spend_attempts_and_keep_tried_set() {
        let tracker = RetryContextTracker::new();
        let task_id = Uuid::new_v4();

        tracker.record_provider_failure(task_id, "p1");
        let attempt = tracker.record_execution_failure(task_id);
        assert_eq!(attempt, 1);

        let context = tracker.snapshot(task_id).unwrap();
        assert_eq!(context.attempt, 1);
        assert_eq!(context.tried_providers, vec!["p1"]);
    }

    #[test]
    fn clear_removes_context() {
        let tracker = RetryContextTracker::new();
        let task_id = Uuid::new_v4();

        tracker.record_execution_failure(task_id);
        assert_eq!(tracker.in_flight(), 1);

        tracker.clear(task_id);
        assert_eq!(tracker.in_flight(), 0);
        assert!(tracker.snapshot(task_id).is_none());

        // A fresh cycle starts from zero.
        assert_eq!(tracker.get_or_create(task_id).attempt, 0);
    }

    #[test]
    fn guidance_accumulates_in_order() {
        let tracker = RetryContextTracker::new();
        let task_id = Uuid::new_v4();

        tracker.push_guidance(task_id, "cover the empty case");
        tracker.push_guidance(task_id, "fix the off-by-one");

        let context = tracker.snapshot(task_id).unwrap();
        assert_eq!(
            context.guidance,
            vec!["cover the empty case", "fix the off-by-one"]
        );
    }

    #[test]
    fn distinct_tasks_are_independent() {
        let tracker = RetryContextTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        tracker.record_provider_failure(a, "p1");
        tracker.record_execution_failure(b);

        assert_eq!(tracker.snapshot(a).unwrap().attempt, 0);
        assert!(tracker.snapshot(b).unwrap().tried_providers.is_empty());
    }
}
