use std::time::Duration;
use thiserror::Error;

use crate::config::ControllerConfig;
use crate::controller::rollout::RolloutPolicy;
use crate::crd::experiment::{Experiment, OnSuccess, Strategy};

/// Why an Experiment cannot be acted on
///
/// None of these are retried: the spec has to change first.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0}")]
    UnknownStrategy(String),

    #[error("{0}")]
    UnknownOnSuccess(String),

    #[error("trafficControl.interval invalid: {0}")]
    InvalidInterval(String),

    #[error("trafficControl.stepSize must be 1-100, got {0}")]
    InvalidStepSize(i32),

    #[error("trafficControl.maxIterations must be > 0, got {0}")]
    InvalidMaxIterations(i32),

    #[error("trafficControl.maxTrafficPercent must be 1-100, got {0}")]
    InvalidMaxTrafficPercent(i32),

    #[error("targetService.{0} cannot be empty")]
    EmptyTarget(&'static str),

    #[error("baseline and candidate are both {0}")]
    SameBackends(String),

    #[error("no analytics service configured for check_and_increment")]
    MissingAnalyticsService,

    #[error("successCriteria[{index}]: {detail}")]
    InvalidSuccessCriterion { index: usize, detail: String },
}

impl ValidationError {
    /// Errors reported on the MetricsSynced condition rather than as a spec error
    pub fn is_metrics(&self) -> bool {
        matches!(
            self,
            ValidationError::MissingAnalyticsService
                | ValidationError::InvalidSuccessCriterion { .. }
        )
    }
}

/// Experiment settings the reconciler acts on
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedExperiment {
    pub policy: RolloutPolicy,
    /// Analytics base URL, set whenever the strategy needs one
    pub analytics_endpoint: Option<String>,
}

/// Validate Experiment specification
///
/// Validates runtime constraints that cannot be enforced via CRD schema.
///
/// # Validation Rules
/// - `strategy` and `onSuccess` must be known values
/// - `interval` must parse (e.g., "30s", "1m")
/// - `stepSize` and `maxTrafficPercent` must be 1-100, `maxIterations` > 0
/// - target names cannot be empty and baseline != candidate
/// - `check_and_increment` needs an analytics endpoint (spec or controller default)
/// - success criteria need a metric name and a non-negative tolerance
///
/// # Arguments
/// * `experiment` - The Experiment resource to validate
/// * `config` - Controller defaults (analytics endpoint)
///
/// # Returns
/// * `Ok(ValidatedExperiment)` - Validation passed
/// * `Err(ValidationError)` - First rule that failed
pub fn validate_experiment(
    experiment: &Experiment,
    config: &ControllerConfig,
) -> Result<ValidatedExperiment, ValidationError> {
    let target = &experiment.spec.target_service;
    if target.name.trim().is_empty() {
        return Err(ValidationError::EmptyTarget("name"));
    }
    if target.baseline.trim().is_empty() {
        return Err(ValidationError::EmptyTarget("baseline"));
    }
    if let Some(candidate) = &target.candidate {
        if candidate.trim().is_empty() {
            return Err(ValidationError::EmptyTarget("candidate"));
        }
        if *candidate == target.baseline {
            return Err(ValidationError::SameBackends(candidate.clone()));
        }
    }

    let traffic = &experiment.spec.traffic_control;

    let strategy = match traffic.strategy.as_deref() {
        None => Strategy::CheckAndIncrement,
        Some(s) => s.parse().map_err(ValidationError::UnknownStrategy)?,
    };
    let on_success = match traffic.on_success.as_deref() {
        None => OnSuccess::Candidate,
        Some(s) => s.parse().map_err(ValidationError::UnknownOnSuccess)?,
    };

    let interval = parse_duration(traffic.interval())
        .ok_or_else(|| ValidationError::InvalidInterval(traffic.interval().to_string()))?;

    let step_size = traffic.step_size();
    if !(1..=100).contains(&step_size) {
        return Err(ValidationError::InvalidStepSize(step_size));
    }
    let max_iterations = traffic.max_iterations();
    if max_iterations <= 0 {
        return Err(ValidationError::InvalidMaxIterations(max_iterations));
    }
    let max_traffic_percent = traffic.max_traffic_percent();
    if !(1..=100).contains(&max_traffic_percent) {
        return Err(ValidationError::InvalidMaxTrafficPercent(max_traffic_percent));
    }

    let analytics_endpoint = experiment
        .spec
        .analysis
        .as_ref()
        .and_then(|a| a.analytics_service.clone())
        .filter(|e| !e.trim().is_empty())
        .or_else(|| config.analytics_endpoint.clone());

    if strategy.uses_analytics() {
        if analytics_endpoint.is_none() {
            return Err(ValidationError::MissingAnalyticsService);
        }
        let criteria = experiment
            .spec
            .analysis
            .as_ref()
            .map(|a| a.success_criteria.as_slice())
            .unwrap_or_default();
        for (index, criterion) in criteria.iter().enumerate() {
            if criterion.metric_name.trim().is_empty() {
                return Err(ValidationError::InvalidSuccessCriterion {
                    index,
                    detail: "metricName cannot be empty".to_string(),
                });
            }
            if !criterion.tolerance.is_finite() || criterion.tolerance < 0.0 {
                return Err(ValidationError::InvalidSuccessCriterion {
                    index,
                    detail: format!("tolerance must be >= 0, got {}", criterion.tolerance),
                });
            }
            if !matches!(criterion.tolerance_type.as_str(), "delta" | "threshold") {
                return Err(ValidationError::InvalidSuccessCriterion {
                    index,
                    detail: format!(
                        "toleranceType must be delta or threshold, got '{}'",
                        criterion.tolerance_type
                    ),
                });
            }
        }
    }

    Ok(ValidatedExperiment {
        policy: RolloutPolicy {
            strategy,
            step_size,
            interval,
            max_iterations,
            max_traffic_percent,
            on_success,
        },
        analytics_endpoint: analytics_endpoint.filter(|_| strategy.uses_analytics()),
    })
}

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Supported formats:
/// - "30s" → 30 seconds (max 24h = 86400s)
/// - "5m" → 5 minutes (max 24h = 1440m)
/// - "2h" → 2 hours (max 1 week = 168h)
///
/// Zero is rejected, as are values past the per-unit limits.
///
/// # Returns
/// Some(Duration) if parse successful and within limits, None if invalid or out of range
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();

    if duration_str.is_empty() {
        return None;
    }

    let unit = duration_str.chars().last()?;
    let number_str = &duration_str[..duration_str.len() - unit.len_utf8()];
    let number: u64 = number_str.parse().ok()?;

    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86400 => Some(Duration::from_secs(number)),
        'm' if number <= 1440 => number.checked_mul(60).map(Duration::from_secs),
        // longer than a week is almost certainly a typo
        'h' if number <= 168 => number.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}
