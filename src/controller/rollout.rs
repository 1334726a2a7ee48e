//! Rollout engine
//!
//! Computes the next candidate weight for one reconcile pass and decides
//! when an experiment is over. Everything here is pure except `evaluate`,
//! which may call the analytics service.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::controller::analytics::{
    AnalyticsClient, AnalyticsError, AnalyticsRequest, AnalyticsResponse, SuccessCriterionRequest,
    TrafficControlRequest, VersionDescriptor,
};
use crate::controller::clock::remaining_wait;
use crate::controller::routing::Winner;
use crate::controller::targets::{Backend, Targets};
use crate::crd::experiment::{
    empty_analysis_state, AssessmentSummary, Experiment, ExperimentStatus, OnSuccess, Strategy,
    TrafficSplit,
};

/// Traffic-control settings after validation
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutPolicy {
    pub strategy: Strategy,
    pub step_size: i32,
    pub interval: Duration,
    pub max_iterations: i32,
    pub max_traffic_percent: i32,
    pub on_success: OnSuccess,
}

/// What a pass should do before any weight is computed
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Experiment is over, collapse traffic
    Complete,
    /// Interval not elapsed yet
    Wait(Duration),
    /// Iteration due
    Due,
}

/// Analytics results to be written back into status
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsOutcome {
    pub summary: AssessmentSummary,
    /// Blob for the next call, `{}` when the service returned none
    pub last_state: Value,
}

impl From<&AnalyticsResponse> for AnalyticsOutcome {
    fn from(response: &AnalyticsResponse) -> Self {
        AnalyticsOutcome {
            summary: AssessmentSummary::from(&response.assessment.summary),
            last_state: match &response.last_state {
                None | Some(Value::Null) => empty_analysis_state(),
                Some(v) => v.clone(),
            },
        }
    }
}

/// Engine decision for one pass
#[derive(Debug)]
pub enum Verdict {
    /// Terminal: route to `winner` and complete
    Complete { success: bool, winner: Winner },
    /// Nothing to do until the interval elapses
    Wait(Duration),
    /// Shift the candidate to `weight`.
    /// `completes` is set when this update reached the ceiling.
    Advance {
        weight: i32,
        completes: bool,
        analytics: Option<AnalyticsOutcome>,
    },
    /// Analytics asked to abort: candidate goes to 0 immediately
    Abort { analytics: AnalyticsOutcome },
    /// Analytics call failed, weight unchanged
    AnalyticsFailed(AnalyticsError),
}

/// Analytics call parameters, only needed for `check_and_increment`
pub struct AnalyticsQuery<'a> {
    pub client: &'a dyn AnalyticsClient,
    pub endpoint: &'a str,
    pub request: AnalyticsRequest,
}

/// Decide whether this pass completes, waits or runs an iteration
///
/// An experiment aborted by analytics on an earlier pass completes as a
/// failure on the next one.
pub fn plan(policy: &RolloutPolicy, status: &ExperimentStatus, now: DateTime<Utc>) -> Plan {
    let aborted = status
        .assessment
        .as_ref()
        .map(|a| a.abort_experiment)
        .unwrap_or(false);

    if status.current_iteration >= policy.max_iterations || aborted {
        return Plan::Complete;
    }

    match remaining_wait(status.last_increment_time.as_deref(), policy.interval, now) {
        Some(wait) => Plan::Wait(wait),
        None => Plan::Due,
    }
}

/// Fixed-step increment for strategies without analytics
///
/// Clamped to `[0, max_traffic_percent]` and never below `current`.
pub fn increment(policy: &RolloutPolicy, current: i32) -> i32 {
    let next = current
        .saturating_add(policy.step_size)
        .clamp(0, policy.max_traffic_percent);
    next.max(current)
}

/// Weight dictated by the analytics service
///
/// The service decides, but the result never drops below `current` and
/// never exceeds the ceiling. An abort verdict forces 0.
pub fn apply_analytics(policy: &RolloutPolicy, current: i32, response: &AnalyticsResponse) -> i32 {
    if response.assessment.summary.abort_experiment {
        return 0;
    }
    let proposed = response.candidate.percent();
    proposed.min(policy.max_traffic_percent).max(current)
}

/// Whether the experiment counts as a success
///
/// Strategies without analytics always succeed; otherwise the last
/// assessment decides.
pub fn succeeded(policy: &RolloutPolicy, status: &ExperimentStatus) -> bool {
    if !policy.strategy.uses_analytics() {
        return true;
    }
    status
        .assessment
        .as_ref()
        .map(|a| a.all_success_criteria_met && !a.abort_experiment)
        .unwrap_or(false)
}

/// Which backend keeps traffic once the experiment is over
pub fn winner(policy: &RolloutPolicy, success: bool) -> Winner {
    if success {
        Winner::from(policy.on_success)
    } else {
        Winner::Baseline
    }
}

/// Final split for a winner, given the split in place now
pub fn final_split(winner: Winner, current: i32) -> TrafficSplit {
    match winner {
        Winner::Baseline => TrafficSplit::from_candidate(0),
        Winner::Candidate => TrafficSplit::from_candidate(100),
        Winner::Both => TrafficSplit::from_candidate(current),
    }
}

/// Run the engine for one pass
///
/// # Arguments
/// * `policy` - validated traffic control
/// * `status` - experiment status as read at the start of the pass
/// * `current` - candidate weight currently in the routing layer
/// * `now` - pass timestamp
/// * `query` - analytics parameters, required for `check_and_increment`
///
/// # Returns
/// The verdict; the caller applies it to routing and status.
pub async fn evaluate(
    policy: &RolloutPolicy,
    status: &ExperimentStatus,
    current: i32,
    now: DateTime<Utc>,
    query: Option<AnalyticsQuery<'_>>,
) -> Verdict {
    match plan(policy, status, now) {
        Plan::Complete => {
            let success = succeeded(policy, status);
            let winner = winner(policy, success);
            info!(success, winner = ?winner, "Experiment reached a terminal state");
            return Verdict::Complete { success, winner };
        }
        Plan::Wait(wait) => {
            debug!(wait_secs = wait.as_secs(), "Iteration not due yet");
            return Verdict::Wait(wait);
        }
        Plan::Due => {}
    }

    if !policy.strategy.uses_analytics() {
        let weight = increment(policy, current);
        return Verdict::Advance {
            weight,
            completes: reaches_ceiling(policy, current, weight),
            analytics: None,
        };
    }

    let Some(query) = query else {
        return Verdict::AnalyticsFailed(AnalyticsError::Unreachable(
            "no analytics service configured".to_string(),
        ));
    };

    let response = match query
        .client
        .check_and_increment(query.endpoint, &query.request)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(endpoint = %query.endpoint, error = %e, "Analytics call failed");
            return Verdict::AnalyticsFailed(e);
        }
    };

    let outcome = AnalyticsOutcome::from(&response);
    if outcome.summary.abort_experiment {
        info!(
            proposed = response.candidate.percent(),
            "Analytics requested abort, routing everything to baseline"
        );
        return Verdict::Abort { analytics: outcome };
    }

    let weight = apply_analytics(policy, current, &response);
    Verdict::Advance {
        weight,
        completes: reaches_ceiling(policy, current, weight),
        analytics: Some(outcome),
    }
}

/// Ceiling reached by a genuine update (not a no-op)
fn reaches_ceiling(policy: &RolloutPolicy, current: i32, weight: i32) -> bool {
    weight != current && weight >= policy.max_traffic_percent
}

fn descriptor(backend: &Backend) -> VersionDescriptor {
    let mut tags = backend.labels.clone();
    tags.insert("destination_workload".to_string(), backend.name.clone());
    if let Some(service) = &backend.service {
        tags.insert("destination_service_name".to_string(), service.clone());
    }
    VersionDescriptor {
        id: backend.name.clone(),
        tags,
    }
}

/// Build the check-and-increment request for this pass
///
/// The observation window runs from the experiment start to `now`.
pub fn analytics_request(
    experiment: &Experiment,
    targets: &Targets,
    policy: &RolloutPolicy,
    status: &ExperimentStatus,
    now: DateTime<Utc>,
) -> AnalyticsRequest {
    let end_time = now.to_rfc3339();
    let criteria = experiment
        .spec
        .analysis
        .as_ref()
        .map(|a| a.success_criteria.iter().map(SuccessCriterionRequest::from).collect())
        .unwrap_or_default();

    AnalyticsRequest {
        name: experiment.metadata.name.clone().unwrap_or_default(),
        namespace: targets.namespace.clone(),
        start_time: status
            .start_timestamp
            .clone()
            .unwrap_or_else(|| end_time.clone()),
        end_time,
        service_name: targets.service_name.clone(),
        baseline: descriptor(&targets.baseline),
        candidate: descriptor(&targets.candidate),
        traffic_control: TrafficControlRequest {
            success_criteria: criteria,
            step_size: policy.step_size,
            max_traffic_percent: policy.max_traffic_percent,
        },
        last_state: status.analysis_state.clone(),
    }
}

#[cfg(test)]
#[path = "rollout_test.rs"]
mod tests;
