//! Provider selection.
//!
//! A pure, deterministic function of the task's retry context, a candidate
//! snapshot, and the current load mode. Rankings are recomputed on every
//! call; nothing here caches an ordering, since availability and telemetry
//! shift continuously.

use crate::error::{RejectedCandidate, RejectionReason};
use crate::provider::{ProviderDescriptor, RateLimitStrategy};
use crate::retry::RetryContext;
use std::cmp::Ordering;
use tracing::debug;
use uuid::Uuid;

/// Coarse system pressure flag derived from queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    #[default]
    Normal,
    /// Queue is backed up; rate-limit-free local backends rank first.
    High,
}

/// One enabled provider as seen at selection time. Assembled by the
/// orchestrator from the registry plus availability probes so this module
/// stays free of I/O.
#[derive(Debug, Clone)]
pub struct CandidateView {
    pub descriptor: ProviderDescriptor,
    pub available: bool,
    pub cooling_down: bool,
    pub effective_priority: i32,
    pub success_rate: f64,
}

/// Outcome of one selection round.
#[derive(Debug)]
pub enum SchedulingDecision {
    Selected(ProviderDescriptor),
    /// No eligible provider remains; carries why each candidate was
    /// rejected.
    Exhausted(Vec<RejectedCandidate>),
}

/// Pick the best provider for a task, or report exhaustion.
///
/// Ranking, most-preferred first: availability is a hard filter, then in
/// high load rate-limit-free providers outrank everything, then higher
/// rolling success rate, lower effective priority, higher confidence
/// weight. Provider name is the final tie-break to keep the ordering
/// total.
pub fn select(
    task_id: Uuid,
    retry: &RetryContext,
    candidates: &[CandidateView],
    load: LoadMode,
) -> SchedulingDecision {
    let mut rejected = Vec::new();
    let mut eligible: Vec<&CandidateView> = Vec::new();

    for candidate in candidates {
        let name = &candidate.descriptor.name;
        if !candidate.descriptor.enabled {
            rejected.push(RejectedCandidate {
                name: name.clone(),
                reason: RejectionReason::Disabled,
            });
        } else if retry.has_tried(name) {
            rejected.push(RejectedCandidate {
                name: name.clone(),
                reason: RejectionReason::AlreadyTried,
            });
        } else if candidate.cooling_down {
            rejected.push(RejectedCandidate {
                name: name.clone(),
                reason: RejectionReason::CoolingDown,
            });
        } else if !candidate.available {
            rejected.push(RejectedCandidate {
                name: name.clone(),
                reason: RejectionReason::Unavailable,
            });
        } else {
            eligible.push(candidate);
        }
    }

    if eligible.is_empty() {
        debug!(task_id = %task_id, considered = candidates.len(), "selection exhausted");
        return SchedulingDecision::Exhausted(rejected);
    }

    eligible.sort_by(|a, b| rank(a, b, load));
    let chosen = eligible[0];

    debug!(
        task_id = %task_id,
        provider = %chosen.descriptor.name,
        effective_priority = chosen.effective_priority,
        success_rate = chosen.success_rate,
        candidates = eligible.len(),
        "provider selected"
    );

    SchedulingDecision::Selected(chosen.descriptor.clone())
}

fn rank(a: &CandidateView, b: &CandidateView, load: LoadMode) -> Ordering {
    if load == LoadMode::High {
        let a_local = a.descriptor.rate_limit_strategy == RateLimitStrategy::None;
        let b_local = b.descriptor.rate_limit_strategy == RateLimitStrategy::None;
        // Rate-limit-free providers jump the queue under pressure.
        match (a_local, b_local) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
    }

    b.success_rate
        .partial_cmp(&a.success_rate)
        .unwrap_or(Ordering::Equal)
        .then(a.effective_priority.cmp(&b.effective_priority))
        .then(
            b.descriptor
                .confidence_weight
                .partial_cmp(&a.descriptor.confidence_weight)
                .unwrap_or(Ordering::Equal),
        )
        .then(a.descriptor.name.cmp(&b.descriptor.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;

    fn candidate(name: &str, priority: i32) -> CandidateView {
        CandidateView {
            descriptor: ProviderDescriptor::new(name, ProviderKind::Api)
                .with_priority(priority)
                .with_strategy(RateLimitStrategy::StatusCode),
            available: true,
            cooling_down: false,
            effective_priority: priority,
            success_rate: 0.5,
        }
    }

    fn selected_name(decision: SchedulingDecision) -> String {
        match decision {
            SchedulingDecision::Selected(d) => d.name,
            SchedulingDecision::Exhausted(rejected) => {
                panic!("expected selection, got exhaustion: {:?}", rejected)
            }
        }
    }

    #[test]
    fn lowest_effective_priority_wins_at_equal_rates() {
        let candidates = vec![candidate("p2", 2), candidate("p1", 1), candidate("p3", 3)];
        let decision = select(
            Uuid::new_v4(),
            &RetryContext::default(),
            &candidates,
            LoadMode::Normal,
        );
        assert_eq!(selected_name(decision), "p1");
    }

    #[test]
    fn higher_success_rate_beats_priority() {
        let mut candidates = vec![candidate("p1", 1), candidate("p2", 2)];
        candidates[1].success_rate = 0.9;
        let decision = select(
            Uuid::new_v4(),
            &RetryContext::default(),
            &candidates,
            LoadMode::Normal,
        );
        assert_eq!(selected_name(decision), "p2");
    }

    #[test]
    fn confidence_breaks_remaining_ties() {
        let mut candidates = vec![candidate("p1", 1), candidate("p2", 1)];
        candidates[1].descriptor.confidence_weight = 2.0;
        let decision = select(
            Uuid::new_v4(),
            &RetryContext::default(),
            &candidates,
            LoadMode::Normal,
        );
        assert_eq!(selected_name(decision), "p2");
    }

    #[test]
    fn tried_providers_are_never_reselected() {
        let candidates = vec![candidate("p1", 1), candidate("p2", 2)];
        let retry = RetryContext {
            tried_providers: vec!["p1".to_string()],
            ..Default::default()
        };
        let decision = select(Uuid::new_v4(), &retry, &candidates, LoadMode::Normal);
        assert_eq!(selected_name(decision), "p2");
    }

    #[test]
    fn unavailable_providers_are_skipped_not_deprioritized() {
        let mut candidates = vec![candidate("p1", 1), candidate("p2", 2)];
        candidates[0].available = false;
        let decision = select(
            Uuid::new_v4(),
            &RetryContext::default(),
            &candidates,
            LoadMode::Normal,
        );
        assert_eq!(selected_name(decision), "p2");
    }

    #[test]
    fn all_excluded_yields_exhaustion_with_reasons() {
        let mut candidates = vec![
            candidate("disabled", 1),
            candidate("tried", 2),
            candidate("down", 3),
            candidate("cooling", 4),
        ];
        candidates[0].descriptor.enabled = false;
        candidates[2].available = false;
        candidates[3].cooling_down = true;

        let retry = RetryContext {
            tried_providers: vec!["tried".to_string()],
            ..Default::default()
        };
        let decision = select(Uuid::new_v4(), &retry, &candidates, LoadMode::Normal);

        let rejected = match decision {
            SchedulingDecision::Exhausted(rejected) => rejected,
            SchedulingDecision::Selected(d) => panic!("unexpected selection: {}", d.name),
        };
        assert_eq!(rejected.len(), 4);
        let reason_for = |name: &str| {
            rejected
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.reason)
                .unwrap()
        };
        assert_eq!(reason_for("disabled"), RejectionReason::Disabled);
        assert_eq!(reason_for("tried"), RejectionReason::AlreadyTried);
        assert_eq!(reason_for("down"), RejectionReason::Unavailable);
        assert_eq!(reason_for("cooling"), RejectionReason::CoolingDown);
    }

    #[test]
    fn empty_candidate_list_is_exhaustion() {
        let decision = select(
            Uuid::new_v4(),
            &RetryContext::default(),
            &[],
            LoadMode::Normal,
        );
        assert!(matches!(decision, SchedulingDecision::Exhausted(r) if r.is_empty()));
    }

    #[test]
    fn high_load_prefers_rate_limit_free_providers() {
        let mut candidates = vec![candidate("api", 1), candidate("local", 9)];
        candidates[1].descriptor.rate_limit_strategy = RateLimitStrategy::None;
        candidates[1].descriptor.kind = ProviderKind::Local;

        // Normal load: priority rules.
        let decision = select(
            Uuid::new_v4(),
            &RetryContext::default(),
            &candidates,
            LoadMode::Normal,
        );
        assert_eq!(selected_name(decision), "api");

        // High load: the local backend jumps ahead despite worse priority.
        let decision = select(
            Uuid::new_v4(),
            &RetryContext::default(),
            &candidates,
            LoadMode::High,
        );
        assert_eq!(selected_name(decision), "local");
    }

    #[test]
    fn ranking_is_deterministic_across_calls() {
        let candidates = vec![candidate("b", 1), candidate("a", 1)];
        let retry = RetryContext::default();
        let first = selected_name(select(Uuid::new_v4(), &retry, &candidates, LoadMode::Normal));
        for _ in 0..10 {
            let next =
                selected_name(select(Uuid::new_v4(), &retry, &candidates, LoadMode::Normal));
            assert_eq!(first, next);
        }
        assert_eq!(first, "a");
    }
}
