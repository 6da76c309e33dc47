//! The orchestration loop.
//!
//! Drives each task through `PENDING → SELECTING → DISPATCHED` and on to a
//! terminal state. Provider failures are recovered locally with a
//! same-cycle reselection that never spends attempt budget; execution
//! failures spend budget and are surfaced downstream. Exhaustion is always
//! surfaced, never dropped.

use crate::packet::{ArtifactBundle, TaskPacket};
use crate::registry::{Outcome, ProviderRegistry};
use crate::retry::RetryContextTracker;
use crate::selection::{CandidateView, LoadMode, SchedulingDecision, select};
use crate::telemetry::TelemetryAggregator;
use crate::error::{ProviderError, RejectedCandidate};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Terminal (or cycle-terminal) outcome of driving one task.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Artifact delivered to the sink; the task is done here.
    Succeeded,
    /// The backend ran and the work failed; one attempt spent, budget
    /// remains. The caller's retry policy decides what happens next.
    ExecutionFailed { attempt: u32 },
    /// Execution failures spent the whole budget. Terminal.
    AttemptsExhausted { attempts: u32 },
    /// Every enabled provider was rejected. Terminal.
    ProvidersExhausted { rejected: Vec<RejectedCandidate> },
    /// Shutdown arrived between dispatch attempts.
    Cancelled,
}

/// What the orchestrator reports per cycle.
#[derive(Debug)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub outcome: TaskOutcome,
    pub providers_tried: Vec<String>,
    pub attempts: u32,
}

/// Structured failure handed to the sink on a terminal failure.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub task_id: Uuid,
    pub kind: FailureKind,
    pub detail: String,
    pub providers_tried: Vec<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AllProvidersExhausted,
    AttemptsExhausted,
}

/// Downstream consumer boundary: artifacts go to the judging stage,
/// terminal failures go wherever escalations live.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn deliver(&self, artifact: ArtifactBundle);
    async fn reject(&self, failure: FailureRecord);
}

/// Default sink: structured log lines only. Useful for drain runs without
/// a downstream queue attached.
pub struct LoggingSink;

#[async_trait]
impl ArtifactSink for LoggingSink {
    async fn deliver(&self, artifact: ArtifactBundle) {
        info!(
            task_id = %artifact.task_id,
            provider = %artifact.provider,
            duration_ms = artifact.duration_ms,
            files = artifact.files_modified.len(),
            "artifact delivered"
        );
    }

    async fn reject(&self, failure: FailureRecord) {
        error!(
            task_id = %failure.task_id,
            kind = ?failure.kind,
            attempts = failure.attempts,
            tried = ?failure.providers_tried,
            detail = %failure.detail,
            "task failed terminally"
        );
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_tasks: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
        }
    }
}

/// Coordinates registry, retry tracking, telemetry hints and the sink for
/// a pool of concurrently executing task cycles.
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    tracker: Arc<RetryContextTracker>,
    aggregator: Option<Arc<TelemetryAggregator>>,
    sink: Arc<dyn ArtifactSink>,
    config: OrchestratorConfig,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        tracker: Arc<RetryContextTracker>,
        aggregator: Option<Arc<TelemetryAggregator>>,
        sink: Arc<dyn ArtifactSink>,
        config: OrchestratorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            tracker,
            aggregator,
            sink,
            config,
            shutdown,
        }
    }

    pub fn tracker(&self) -> Arc<RetryContextTracker> {
        self.tracker.clone()
    }

    fn load_mode(&self) -> LoadMode {
        self.aggregator
            .as_ref()
            .map(|a| a.load_mode())
            .unwrap_or_default()
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Probe availability and assemble the candidate snapshot the pure
    /// selection function ranks over. Probes are side-effect free with
    /// respect to routing state.
    async fn candidate_snapshot(&self) -> Vec<CandidateView> {
        let mut candidates = Vec::new();
        for descriptor in self.registry.enabled_providers() {
            let name = descriptor.name.clone();
            let cooling_down = self.registry.is_cooling_down(&name);
            let available = if cooling_down {
                // Skip the probe for a provider that is excluded anyway.
                false
            } else {
                match self.registry.adapter(&name) {
                    Some(adapter) => {
                        let up = adapter.is_available().await;
                        if up {
                            self.registry.mark_available(&name);
                        }
                        up
                    }
                    None => false,
                }
            };

            candidates.push(CandidateView {
                available,
                cooling_down,
                effective_priority: self.registry.effective_priority(&name).unwrap_or(0),
                success_rate: self.registry.success_rate(&name).unwrap_or(0.5),
                descriptor,
            });
        }
        candidates
    }

    /// Run one cycle of the per-task state machine. Provider failures loop
    /// back into selection inside this call; everything else returns.
    pub async fn run_cycle(&self, packet: &TaskPacket) -> TaskReport {
        let task_id = packet.id;

        loop {
            if self.cancelled() {
                warn!(task_id = %task_id, "cycle cancelled before selection");
                return self.report(task_id, TaskOutcome::Cancelled);
            }

            if let Some(aggregator) = &self.aggregator {
                aggregator.refresh().await;
            }

            let retry = self.tracker.get_or_create(task_id);
            let candidates = self.candidate_snapshot().await;
            let decision = select(task_id, &retry, &candidates, self.load_mode());

            let descriptor = match decision {
                SchedulingDecision::Selected(descriptor) => descriptor,
                SchedulingDecision::Exhausted(rejected) => {
                    let record = FailureRecord {
                        task_id,
                        kind: FailureKind::AllProvidersExhausted,
                        detail: rejected
                            .iter()
                            .map(|r| format!("{}: {}", r.name, r.reason))
                            .collect::<Vec<_>>()
                            .join(", "),
                        providers_tried: retry.tried_providers.clone(),
                        attempts: retry.attempt,
                    };
                    error!(task_id = %task_id, tried = ?record.providers_tried,
                           "all providers exhausted");
                    self.sink.reject(record).await;
                    let report = self.report(task_id, TaskOutcome::ProvidersExhausted { rejected });
                    self.tracker.clear(task_id);
                    return report;
                }
            };

            let Some(adapter) = self.registry.adapter(&descriptor.name) else {
                // Descriptor without adapter can only appear transiently
                // around a reload; treat as a provider failure.
                self.tracker.record_provider_failure(task_id, &descriptor.name);
                continue;
            };

            if self.cancelled() {
                warn!(task_id = %task_id, "cycle cancelled before dispatch");
                return self.report(task_id, TaskOutcome::Cancelled);
            }

            info!(
                task_id = %task_id,
                provider = %descriptor.name,
                attempt = retry.attempt,
                "dispatching task"
            );

            // Suspends for the duration of backend execution. If shutdown
            // arrives meanwhile the call runs to completion and the result
            // is classified anyway; the next loop iteration observes the
            // flag.
            match adapter.generate(packet, &retry.guidance).await {
                Ok(artifact) => {
                    self.registry.record_outcome(&descriptor.name, Outcome::Success);
                    self.tracker.clear(task_id);
                    info!(task_id = %task_id, provider = %descriptor.name, "task succeeded");
                    self.sink.deliver(artifact).await;
                    return TaskReport {
                        task_id,
                        outcome: TaskOutcome::Succeeded,
                        providers_tried: retry.tried_providers,
                        attempts: retry.attempt,
                    };
                }
                Err(err) if adapter.detect_rate_limit(&err) => {
                    // Provider failure: the task never ran. Exclude the
                    // provider and reselect in the same cycle.
                    let rate_limited = matches!(err, ProviderError::RateLimited { .. });
                    warn!(
                        task_id = %task_id,
                        provider = %descriptor.name,
                        rate_limited,
                        error = %err,
                        "provider failure, failing over"
                    );
                    self.registry
                        .record_outcome(&descriptor.name, Outcome::ProviderFailure { rate_limited });
                    self.tracker.record_provider_failure(task_id, &descriptor.name);
                    continue;
                }
                Err(err) => {
                    // Execution failure: the backend ran, the work is bad.
                    warn!(
                        task_id = %task_id,
                        provider = %descriptor.name,
                        error = %err,
                        "execution failure"
                    );
                    self.registry
                        .record_outcome(&descriptor.name, Outcome::ExecutionFailure);
                    let attempt = self.tracker.record_execution_failure(task_id);
                    self.tracker
                        .push_guidance(task_id, format!("previous attempt failed: {}", err));

                    if attempt >= packet.max_attempts {
                        let record = FailureRecord {
                            task_id,
                            kind: FailureKind::AttemptsExhausted,
                            detail: err.to_string(),
                            providers_tried: self
                                .tracker
                                .snapshot(task_id)
                                .map(|c| c.tried_providers)
                                .unwrap_or_default(),
                            attempts: attempt,
                        };
                        error!(task_id = %task_id, attempts = attempt, "attempt budget spent");
                        self.sink.reject(record).await;
                        let report =
                            self.report(task_id, TaskOutcome::AttemptsExhausted { attempts: attempt });
                        self.tracker.clear(task_id);
                        return report;
                    }

                    return self.report(task_id, TaskOutcome::ExecutionFailed { attempt });
                }
            }
        }
    }

    /// Drive one task all the way to a terminal state, re-entering the
    /// cycle after survivable execution failures. This is the built-in
    /// retry policy for standalone operation; embedders with an external
    /// judge call [`run_cycle`](Self::run_cycle) directly.
    pub async fn run_task(&self, packet: &TaskPacket) -> TaskReport {
        loop {
            let report = self.run_cycle(packet).await;
            match report.outcome {
                TaskOutcome::ExecutionFailed { .. } => continue,
                _ => return report,
            }
        }
    }

    /// Run-once mode: drain a backlog with bounded concurrency, then stop.
    pub async fn drain(self: Arc<Self>, packets: Vec<TaskPacket>) -> Vec<TaskReport> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));
        let mut join_set = JoinSet::new();

        for packet in packets {
            let orchestrator = self.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("semaphore never closed while draining");
                orchestrator.run_task(&packet).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "task cycle panicked"),
            }
        }
        reports
    }

    fn report(&self, task_id: Uuid, outcome: TaskOutcome) -> TaskReport {
        let context = self.tracker.snapshot(task_id).unwrap_or_default();
        TaskReport {
            task_id,
            outcome,
            providers_tried: context.tried_providers,
            attempts: context.attempt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderAdapter, ProviderDescriptor, ProviderKind, RateLimitStrategy};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adapter that replays a script of outcomes.
    struct ScriptedAdapter {
        name: String,
        script: Mutex<Vec<Result<(), ProviderError>>>,
        calls: AtomicUsize,
        available: bool,
    }

    impl ScriptedAdapter {
        fn new(name: &str, script: Vec<Result<(), ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                available: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn generate(
            &self,
            packet: &TaskPacket,
            _guidance: &[String],
        ) -> Result<ArtifactBundle, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let next = if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            };
            next.map(|_| ArtifactBundle::new(packet.id, &self.name, 1))
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        fn detect_rate_limit(&self, err: &ProviderError) -> bool {
            err.is_definitely_provider_fault()
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[derive(Default)]
    struct MemorySink {
        delivered: Mutex<Vec<ArtifactBundle>>,
        rejected: Mutex<Vec<FailureRecord>>,
    }

    #[async_trait]
    impl ArtifactSink for MemorySink {
        async fn deliver(&self, artifact: ArtifactBundle) {
            self.delivered.lock().unwrap().push(artifact);
        }

        async fn reject(&self, failure: FailureRecord) {
            self.rejected.lock().unwrap().push(failure);
        }
    }

    fn rate_limit_err() -> ProviderError {
        ProviderError::RateLimited {
            message: "429".to_string(),
            retry_after: None,
        }
    }

    fn orchestrator(
        adapters: Vec<(i32, Arc<ScriptedAdapter>)>,
        sink: Arc<MemorySink>,
    ) -> Orchestrator {
        let pairs = adapters
            .into_iter()
            .map(|(priority, adapter)| {
                let descriptor = ProviderDescriptor::new(adapter.name(), ProviderKind::Api)
                    .with_priority(priority)
                    .with_strategy(RateLimitStrategy::StatusCode);
                (descriptor, adapter as Arc<dyn ProviderAdapter>)
            })
            .collect();
        let registry = Arc::new(ProviderRegistry::with_adapters(pairs).unwrap());
        // Dropping the sender leaves the flag at false, which is fine for
        // tests that never cancel.
        let (_tx, rx) = watch::channel(false);
        Orchestrator::new(
            registry,
            Arc::new(RetryContextTracker::new()),
            None,
            sink,
            OrchestratorConfig::default(),
            rx,
        )
    }

    #[tokio::test]
    async fn provider_failure_fails_over_within_one_cycle() {
        let p1 = ScriptedAdapter::new("p1", vec![Err(rate_limit_err())]);
        let p2 = ScriptedAdapter::new("p2", vec![Ok(())]);
        let sink = Arc::new(MemorySink::default());
        let orchestrator = orchestrator(vec![(1, p1.clone()), (2, p2.clone())], sink.clone());

        let packet = TaskPacket::new("t", "d");
        let report = orchestrator.run_cycle(&packet).await;

        assert!(matches!(report.outcome, TaskOutcome::Succeeded));
        assert_eq!(report.attempts, 0);
        assert_eq!(report.providers_tried, vec!["p1"]);
        assert_eq!(p1.calls(), 1);
        assert_eq!(p2.calls(), 1);
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_provider_failures_end_in_exhaustion_with_zero_attempts() {
        let adapters: Vec<(i32, Arc<ScriptedAdapter>)> = (1..=3)
            .map(|i| {
                (
                    i,
                    ScriptedAdapter::new(&format!("p{}", i), vec![Err(rate_limit_err())]),
                )
            })
            .collect();
        let sink = Arc::new(MemorySink::default());
        let orchestrator = orchestrator(adapters, sink.clone());

        let packet = TaskPacket::new("t", "d");
        let report = orchestrator.run_cycle(&packet).await;

        assert!(matches!(report.outcome, TaskOutcome::ProvidersExhausted { .. }));
        assert_eq!(report.attempts, 0);
        assert_eq!(report.providers_tried, vec!["p1", "p2", "p3"]);

        let rejected = sink.rejected.lock().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].kind, FailureKind::AllProvidersExhausted);
    }

    #[tokio::test]
    async fn execution_failure_spends_one_attempt_and_keeps_provider_eligible() {
        let p1 = ScriptedAdapter::new(
            "p1",
            vec![Err(ProviderError::ExecutionFailed {
                detail: "bad output".to_string(),
                logs: None,
            })],
        );
        let sink = Arc::new(MemorySink::default());
        let orchestrator = orchestrator(vec![(1, p1.clone())], sink.clone());

        let packet = TaskPacket::new("t", "d").with_max_attempts(3);
        let report = orchestrator.run_cycle(&packet).await;

        match report.outcome {
            TaskOutcome::ExecutionFailed { attempt } => assert_eq!(attempt, 1),
            other => panic!("expected execution failure, got {:?}", other),
        }
        // p1 did run the task, so it stays eligible for the next attempt.
        assert!(report.providers_tried.is_empty());
        assert!(sink.rejected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn spent_budget_is_a_distinct_terminal_state() {
        let p1 = ScriptedAdapter::new(
            "p1",
            vec![
                Err(ProviderError::ExecutionFailed {
                    detail: "wrong".to_string(),
                    logs: None,
                }),
                Err(ProviderError::ExecutionFailed {
                    detail: "still wrong".to_string(),
                    logs: None,
                }),
            ],
        );
        let sink = Arc::new(MemorySink::default());
        let orchestrator = orchestrator(vec![(1, p1.clone())], sink.clone());

        let packet = TaskPacket::new("t", "d").with_max_attempts(2);
        let report = orchestrator.run_task(&packet).await;

        assert!(matches!(
            report.outcome,
            TaskOutcome::AttemptsExhausted { attempts: 2 }
        ));
        let rejected = sink.rejected.lock().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].kind, FailureKind::AttemptsExhausted);
        assert_eq!(rejected[0].attempts, 2);
    }

    #[tokio::test]
    async fn drain_reports_every_task() {
        let p1 = ScriptedAdapter::new("p1", vec![]);
        let sink = Arc::new(MemorySink::default());
        let orchestrator = Arc::new(orchestrator(vec![(1, p1.clone())], sink.clone()));

        let packets = (0..5).map(|i| TaskPacket::new(format!("t{}", i), "d")).collect();
        let reports = orchestrator.drain(packets).await;

        assert_eq!(reports.len(), 5);
        assert!(reports
            .iter()
            .all(|r| matches!(r.outcome, TaskOutcome::Succeeded)));
        assert_eq!(sink.delivered.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn cancellation_aborts_before_dispatch() {
        let p1 = ScriptedAdapter::new("p1", vec![]);
        let sink = Arc::new(MemorySink::default());

        let pairs = vec![(
            ProviderDescriptor::new("p1", ProviderKind::Api).with_priority(1),
            p1.clone() as Arc<dyn ProviderAdapter>,
        )];
        let registry = Arc::new(ProviderRegistry::with_adapters(pairs).unwrap());
        let (tx, rx) = watch::channel(false);
        let orchestrator = Orchestrator::new(
            registry,
            Arc::new(RetryContextTracker::new()),
            None,
            sink,
            OrchestratorConfig::default(),
            rx,
        );

        tx.send(true).unwrap();
        let packet = TaskPacket::new("t", "d");
        let report = orchestrator.run_cycle(&packet).await;

        assert!(matches!(report.outcome, TaskOutcome::Cancelled));
        assert_eq!(p1.calls(), 0);
    }
}
