//! Experiment conditions
//!
//! Conditions are a small ordered list keyed by type (at most one entry per
//! type). Marking a condition reports whether anything actually changed; only
//! a real change moves `lastTransitionTime`, so re-applying the same verdict
//! on every pass leaves the persisted status untouched.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::experiment::{empty_analysis_state, ExperimentStatus, Phase, TrafficSplit};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    /// Success criteria were resolved into metrics the analytics service understands
    MetricsSynced,
    /// Service and both backends exist and belong to this experiment
    TargetsProvided,
    ExperimentCompleted,
    AnalyticsServiceNormal,
    RoutingRulesReady,
}

/// Every condition an experiment carries, in display order
pub const CONDITION_TYPES: [ConditionType; 5] = [
    ConditionType::MetricsSynced,
    ConditionType::TargetsProvided,
    ConditionType::ExperimentCompleted,
    ConditionType::AnalyticsServiceNormal,
    ConditionType::RoutingRulesReady,
];

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Reason codes written to conditions and to `status.message`
pub mod reason {
    pub const SYNC_METRICS_SUCCEEDED: &str = "SyncMetricsSucceeded";
    pub const SYNC_METRICS_ERROR: &str = "SyncMetricsError";
    pub const TARGETS_FOUND: &str = "TargetsFound";
    pub const NOT_FOUND: &str = "NotFound";
    pub const MISSING_TEMPLATE: &str = "MissingTemplate";
    pub const MISSING_BASELINE: &str = "MissingBaseline";
    pub const MISSING_CANDIDATE: &str = "MissingCandidate";
    pub const MISSING_TRAFFIC: &str = "MissingTraffic";
    pub const MISSING_BASELINE_REVISION: &str = "MissingBaselineRevision";
    pub const MISSING_CANDIDATE_REVISION: &str = "MissingCandidateRevision";
    pub const MISSING_CORE_SERVICE: &str = "MissingCoreService";
    pub const EXISTING_EXPERIMENT: &str = "ExistingExperiment";
    pub const TARGETS_ERROR: &str = "TargetsError";
    pub const ROUTING_RULES_READY: &str = "RoutingRulesReady";
    pub const ROUTING_RULES_ERROR: &str = "RoutingRulesError";
    pub const ANALYTICS_SERVICE_RUNNING: &str = "AnalyticsServiceRunning";
    pub const ANALYTICS_SERVICE_ERROR: &str = "AnalyticsServiceError";
    pub const EXPERIMENT_COMPLETED: &str = "ExperimentCompleted";
    pub const EXPERIMENT_ABORTED: &str = "ExperimentAborted";
    pub const ITERATION_UPDATE: &str = "IterationUpdate";
    pub const TRAFFIC_UPDATE: &str = "TrafficUpdate";
    pub const PROGRESSING: &str = "Progressing";
    pub const ACTION_PAUSE: &str = "ActionPause";
    pub const ACTION_RESUME: &str = "ActionResume";
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ExperimentCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    pub status: ConditionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl ExperimentCondition {
    pub fn new(condition_type: ConditionType, now: DateTime<Utc>) -> Self {
        ExperimentCondition {
            condition_type,
            status: ConditionStatus::Unknown,
            reason: None,
            message: None,
            last_transition_time: Some(now.to_rfc3339()),
        }
    }

    /// Apply a verdict; returns true if status, reason or message changed
    pub fn mark(
        &mut self,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let updated = self.status != status
            || self.reason.as_deref() != Some(reason)
            || self.message.as_deref() != Some(message);

        if updated {
            self.status = status;
            self.reason = Some(reason.to_string());
            self.message = Some(message.to_string());
            self.last_transition_time = Some(now.to_rfc3339());
        }

        updated
    }
}

/// Format a status message as "reason: detail" (or just "reason")
pub fn compose_message(reason: &str, detail: &str) -> String {
    if detail.is_empty() {
        reason.to_string()
    } else {
        format!("{}: {}", reason, detail)
    }
}

impl ExperimentStatus {
    /// Fresh status for a newly observed experiment
    pub fn initialized(now: DateTime<Utc>) -> Self {
        ExperimentStatus {
            phase: Some(Phase::Initializing),
            message: None,
            conditions: CONDITION_TYPES
                .iter()
                .map(|t| ExperimentCondition::new(*t, now))
                .collect(),
            current_iteration: 0,
            candidate: None,
            start_timestamp: None,
            last_increment_time: None,
            assessment: None,
            traffic_split: TrafficSplit::default(),
            analysis_state: empty_analysis_state(),
        }
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&ExperimentCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn is_condition_true(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    fn condition_mut(
        &mut self,
        condition_type: ConditionType,
        now: DateTime<Utc>,
    ) -> &mut ExperimentCondition {
        let index = match self
            .conditions
            .iter()
            .position(|c| c.condition_type == condition_type)
        {
            Some(index) => index,
            None => {
                self.conditions
                    .push(ExperimentCondition::new(condition_type, now));
                self.conditions.len() - 1
            }
        };
        &mut self.conditions[index]
    }

    /// Mark one condition, adding it if absent
    pub fn mark_condition(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.condition_mut(condition_type, now)
            .mark(status, reason, message, now)
    }

    fn transition(&mut self, phase: Option<Phase>, reason: &str, message: &str) {
        if let Some(phase) = phase {
            self.phase = Some(phase);
        }
        self.message = Some(compose_message(reason, message));
    }

    pub fn mark_metrics_synced(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.mark_condition(
            ConditionType::MetricsSynced,
            ConditionStatus::True,
            reason::SYNC_METRICS_SUCCEEDED,
            message,
            now,
        )
    }

    pub fn mark_metrics_synced_error(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(Some(Phase::Paused), reason::SYNC_METRICS_ERROR, message);
        self.mark_condition(
            ConditionType::MetricsSynced,
            ConditionStatus::False,
            reason::SYNC_METRICS_ERROR,
            message,
            now,
        )
    }

    pub fn mark_targets_found(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.mark_condition(
            ConditionType::TargetsProvided,
            ConditionStatus::True,
            reason::TARGETS_FOUND,
            message,
            now,
        )
    }

    /// Targets missing or owned by someone else; the experiment pauses
    pub fn mark_targets_error(&mut self, reason: &str, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(Some(Phase::Paused), reason, message);
        self.mark_condition(
            ConditionType::TargetsProvided,
            ConditionStatus::False,
            reason,
            message,
            now,
        )
    }

    pub fn mark_routing_rules_ready(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.mark_condition(
            ConditionType::RoutingRulesReady,
            ConditionStatus::True,
            reason::ROUTING_RULES_READY,
            message,
            now,
        )
    }

    pub fn mark_routing_rules_error(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(Some(Phase::Paused), reason::ROUTING_RULES_ERROR, message);
        self.mark_condition(
            ConditionType::RoutingRulesReady,
            ConditionStatus::False,
            reason::ROUTING_RULES_ERROR,
            message,
            now,
        )
    }

    pub fn mark_analytics_service_running(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.mark_condition(
            ConditionType::AnalyticsServiceNormal,
            ConditionStatus::True,
            reason::ANALYTICS_SERVICE_RUNNING,
            message,
            now,
        )
    }

    pub fn mark_analytics_service_error(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(
            Some(Phase::Paused),
            reason::ANALYTICS_SERVICE_ERROR,
            message,
        );
        self.mark_condition(
            ConditionType::AnalyticsServiceNormal,
            ConditionStatus::False,
            reason::ANALYTICS_SERVICE_ERROR,
            message,
            now,
        )
    }

    pub fn mark_experiment_completed(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(
            Some(Phase::Completed),
            reason::EXPERIMENT_COMPLETED,
            message,
        );
        self.mark_condition(
            ConditionType::ExperimentCompleted,
            ConditionStatus::True,
            reason::EXPERIMENT_COMPLETED,
            message,
            now,
        )
    }

    /// Analytics asked to abort; traffic is back on baseline and the experiment holds
    pub fn mark_experiment_aborted(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(Some(Phase::Paused), reason::EXPERIMENT_ABORTED, message);
        self.mark_condition(
            ConditionType::ExperimentCompleted,
            ConditionStatus::False,
            reason::EXPERIMENT_ABORTED,
            message,
            now,
        )
    }

    /// An iteration ran (analytics consulted, counter advanced)
    pub fn mark_iteration_update(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.progressing(reason::ITERATION_UPDATE, message, now)
    }

    /// Candidate weight changed on the routing layer
    pub fn mark_traffic_update(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.progressing(reason::TRAFFIC_UPDATE, message, now)
    }

    /// Waiting for the next iteration
    pub fn mark_progressing(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.progressing(reason::PROGRESSING, message, now)
    }

    fn progressing(&mut self, reason: &str, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(Some(Phase::Progressing), reason, message);
        self.mark_condition(
            ConditionType::ExperimentCompleted,
            ConditionStatus::False,
            reason,
            message,
            now,
        )
    }

    pub fn mark_experiment_pause(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(Some(Phase::Paused), reason::ACTION_PAUSE, message);
        self.mark_condition(
            ConditionType::ExperimentCompleted,
            ConditionStatus::False,
            reason::ACTION_PAUSE,
            message,
            now,
        )
    }

    pub fn mark_experiment_resume(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(Some(Phase::Progressing), reason::ACTION_RESUME, message);
        self.mark_condition(
            ConditionType::ExperimentCompleted,
            ConditionStatus::False,
            reason::ACTION_RESUME,
            message,
            now,
        )
    }

    /// Spec cannot be acted on; left for manual correction
    pub fn mark_spec_error(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.transition(Some(Phase::Paused), reason::INVALID_SPEC, message);
        self.mark_condition(
            ConditionType::ExperimentCompleted,
            ConditionStatus::False,
            reason::INVALID_SPEC,
            message,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::Duration;

    #[test]
    fn test_initialized_status_has_every_condition_unknown() {
        let now = Utc::now();
        let status = ExperimentStatus::initialized(now);

        assert_eq!(status.phase, Some(Phase::Initializing));
        assert_eq!(status.conditions.len(), CONDITION_TYPES.len());
        assert!(status
            .conditions
            .iter()
            .all(|c| c.status == ConditionStatus::Unknown));
        assert_eq!(status.analysis_state, serde_json::json!({}));
        assert_eq!(status.traffic_split, TrafficSplit::from_candidate(0));
    }

    #[test]
    fn test_mark_condition_is_idempotent() {
        let t0 = Utc::now();
        let mut status = ExperimentStatus::initialized(t0);

        let first = status.mark_targets_found("", t0 + Duration::seconds(1));
        assert!(first);
        let stamped = status
            .condition(ConditionType::TargetsProvided)
            .and_then(|c| c.last_transition_time.clone());

        let second = status.mark_targets_found("", t0 + Duration::seconds(30));
        assert!(!second, "same verdict must not report an update");
        assert_eq!(
            status
                .condition(ConditionType::TargetsProvided)
                .and_then(|c| c.last_transition_time.clone()),
            stamped,
            "transition time must not move on re-application"
        );
    }

    #[test]
    fn test_mark_condition_bumps_timestamp_on_message_change() {
        let t0 = Utc::now();
        let mut status = ExperimentStatus::initialized(t0);
        let t1 = t0 + Duration::seconds(5);

        status.mark_analytics_service_error("timeout", t0);
        assert!(status.mark_analytics_service_error("connection refused", t1));

        let condition = status
            .condition(ConditionType::AnalyticsServiceNormal)
            .unwrap();
        assert_eq!(condition.message.as_deref(), Some("connection refused"));
        assert_eq!(condition.last_transition_time, Some(t1.to_rfc3339()));
    }

    #[test]
    fn test_missing_condition_is_added_once() {
        let now = Utc::now();
        let mut status = ExperimentStatus::default();

        status.mark_routing_rules_ready("", now);
        status.mark_routing_rules_ready("", now);

        assert_eq!(status.conditions.len(), 1);
        assert!(status.is_condition_true(ConditionType::RoutingRulesReady));
    }

    #[test]
    fn test_targets_error_pauses_and_composes_message() {
        let now = Utc::now();
        let mut status = ExperimentStatus::initialized(now);

        status.mark_targets_error(reason::MISSING_BASELINE_REVISION, "reviews-v1", now);

        assert_eq!(status.phase, Some(Phase::Paused));
        assert_eq!(
            status.message.as_deref(),
            Some("MissingBaselineRevision: reviews-v1")
        );
        let condition = status.condition(ConditionType::TargetsProvided).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(
            condition.reason.as_deref(),
            Some(reason::MISSING_BASELINE_REVISION)
        );
    }

    #[test]
    fn test_compose_message_without_detail() {
        assert_eq!(compose_message("Progressing", ""), "Progressing");
        assert_eq!(compose_message("NotFound", "svc"), "NotFound: svc");
    }

    #[test]
    fn test_completed_then_resume_phase_transitions() {
        let now = Utc::now();
        let mut status = ExperimentStatus::initialized(now);

        status.mark_experiment_pause("operator", now);
        assert_eq!(status.phase, Some(Phase::Paused));

        status.mark_experiment_resume("operator", now);
        assert_eq!(status.phase, Some(Phase::Progressing));

        status.mark_experiment_completed("done", now);
        assert_eq!(status.phase, Some(Phase::Completed));
        assert!(status.is_condition_true(ConditionType::ExperimentCompleted));
    }
}
