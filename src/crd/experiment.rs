use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::condition::ExperimentCondition;

/// Experiment drives one service from a baseline to a candidate version
///
/// Traffic is shifted in steps, optionally gated by an external analytics
/// service, until the experiment completes or runs out of iterations.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kokeilu.io",
    version = "v1alpha1",
    kind = "Experiment",
    namespaced,
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Iteration", "type":"integer", "jsonPath":".status.currentIteration"}"#,
    printcolumn = r#"{"name":"Baseline", "type":"integer", "jsonPath":".status.trafficSplit.baseline"}"#,
    printcolumn = r#"{"name":"Candidate", "type":"integer", "jsonPath":".status.trafficSplit.candidate"}"#,
    printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExperimentSpec {
    /// Service under experiment and its two backends
    #[serde(rename = "targetService")]
    pub target_service: TargetService,

    /// How traffic is shifted between baseline and candidate
    #[serde(rename = "trafficControl", default)]
    pub traffic_control: TrafficControl,

    /// Analytics service configuration (used by check_and_increment)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,

    /// What happens to routing rules when the experiment goes away
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupPolicy>,

    /// Operator override (pause / resume)
    #[serde(rename = "manualOverride", skip_serializing_if = "Option::is_none")]
    pub manual_override: Option<ManualOverride>,
}

/// Backend platform a target service lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Core Service + Deployments, routed by Istio rules
    ServiceMesh,
    /// Knative Service, routed by its own traffic block
    Serverless,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct TargetService {
    /// API version of the target: "v1" for a core Service (default),
    /// "serving.knative.dev/v1" for a Knative Service
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Name of the logical service
    pub name: String,

    /// Namespace of the service (defaults to the experiment namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Baseline deployment (or revision) name
    pub baseline: String,

    /// Candidate deployment (or revision) name.
    /// When omitted on the service mesh platform, the newest deployment
    /// behind the service (excluding the baseline) is picked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

impl TargetService {
    pub fn platform(&self) -> Platform {
        match &self.api_version {
            Some(v) if v.starts_with("serving.knative.dev") => Platform::Serverless,
            _ => Platform::ServiceMesh,
        }
    }
}

/// Traffic control policy
///
/// `strategy` and `onSuccess` are kept as strings so that a bad value is
/// reported through a condition instead of failing deserialization.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct TrafficControl {
    /// manual | increment_without_check | check_and_increment (default)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Traffic percentage added per iteration (default 2)
    #[serde(rename = "stepSize", skip_serializing_if = "Option::is_none")]
    pub step_size: Option<i32>,

    /// Time between iterations, e.g. "30s", "1m" (default "1m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Maximum number of iterations (default 100)
    #[serde(rename = "maxIterations", skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<i32>,

    /// Ceiling for candidate traffic (default 50)
    #[serde(rename = "maxTrafficPercent", skip_serializing_if = "Option::is_none")]
    pub max_traffic_percent: Option<i32>,

    /// baseline | candidate (default) | both
    #[serde(rename = "onSuccess", skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
}

pub const DEFAULT_STEP_SIZE: i32 = 2;
pub const DEFAULT_INTERVAL: &str = "1m";
pub const DEFAULT_MAX_ITERATIONS: i32 = 100;
pub const DEFAULT_MAX_TRAFFIC_PERCENT: i32 = 50;

impl TrafficControl {
    pub fn step_size(&self) -> i32 {
        self.step_size.unwrap_or(DEFAULT_STEP_SIZE)
    }

    pub fn interval(&self) -> &str {
        self.interval.as_deref().unwrap_or(DEFAULT_INTERVAL)
    }

    pub fn max_iterations(&self) -> i32 {
        self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    pub fn max_traffic_percent(&self) -> i32 {
        self.max_traffic_percent.unwrap_or(DEFAULT_MAX_TRAFFIC_PERCENT)
    }
}

/// Rollout strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Fixed step increments, no analytics
    Manual,
    /// Same as manual, kept for compatibility with older manifests
    IncrementWithoutCheck,
    /// Analytics service dictates the next weight
    CheckAndIncrement,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Manual => "manual",
            Strategy::IncrementWithoutCheck => "increment_without_check",
            Strategy::CheckAndIncrement => "check_and_increment",
        }
    }

    pub fn uses_analytics(&self) -> bool {
        matches!(self, Strategy::CheckAndIncrement)
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Strategy::Manual),
            "increment_without_check" => Ok(Strategy::IncrementWithoutCheck),
            "check_and_increment" => Ok(Strategy::CheckAndIncrement),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where traffic goes when an experiment succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnSuccess {
    Baseline,
    Candidate,
    /// Leave the split as it is
    Both,
}

impl FromStr for OnSuccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(OnSuccess::Baseline),
            "candidate" => Ok(OnSuccess::Candidate),
            "both" => Ok(OnSuccess::Both),
            other => Err(format!("unknown onSuccess policy '{}'", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct Analysis {
    /// Analytics service base URL (defaults to the controller setting)
    #[serde(rename = "analyticsService", skip_serializing_if = "Option::is_none")]
    pub analytics_service: Option<String>,

    /// Criteria the analytics service assesses the candidate against
    #[serde(rename = "successCriteria", default)]
    pub success_criteria: Vec<SuccessCriterion>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct SuccessCriterion {
    #[serde(rename = "metricName")]
    pub metric_name: String,

    /// delta | threshold
    #[serde(rename = "toleranceType")]
    pub tolerance_type: String,

    pub tolerance: f64,

    #[serde(rename = "sampleSize", skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<i32>,

    #[serde(rename = "stopOnFailure", skip_serializing_if = "Option::is_none")]
    pub stop_on_failure: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum CleanupPolicy {
    /// Delete routing rules the controller created
    #[serde(rename = "delete")]
    Delete,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ManualOverride {
    pub action: OverrideAction,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum OverrideAction {
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
}

/// Phase of an Experiment
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// Targets not confirmed yet
    #[default]
    Initializing,
    /// Traffic is being shifted
    Progressing,
    /// Held because of an error or an operator override
    Paused,
    /// Terminal
    Completed,
}

/// Traffic percentages as last applied
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub struct TrafficSplit {
    pub baseline: i32,
    pub candidate: i32,
}

impl TrafficSplit {
    /// Split for a candidate weight; baseline is always the complement
    pub fn from_candidate(candidate: i32) -> Self {
        TrafficSplit {
            baseline: 100 - candidate,
            candidate,
        }
    }
}

impl Default for TrafficSplit {
    fn default() -> Self {
        TrafficSplit::from_candidate(0)
    }
}

/// Last assessment summary reported by the analytics service
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AssessmentSummary {
    #[serde(rename = "allSuccessCriteriaMet", default)]
    pub all_success_criteria_met: bool,

    #[serde(rename = "abortExperiment", default)]
    pub abort_experiment: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conclusions: Vec<String>,
}

/// Status of the Experiment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ExperimentStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Latest transition, formatted as "reason: detail"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub conditions: Vec<ExperimentCondition>,

    #[serde(rename = "currentIteration", default)]
    pub current_iteration: i32,

    /// Candidate picked when `targetService.candidate` is omitted.
    /// Later passes keep using it instead of picking again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,

    /// When the first iteration started (RFC3339)
    #[serde(rename = "startTimestamp", skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    /// When traffic was last shifted (RFC3339)
    #[serde(rename = "lastIncrementTime", skip_serializing_if = "Option::is_none")]
    pub last_increment_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<AssessmentSummary>,

    #[serde(rename = "trafficSplit", default)]
    pub traffic_split: TrafficSplit,

    /// Opaque analytics state, passed back to the analytics service untouched
    #[serde(
        rename = "analysisState",
        default = "empty_analysis_state",
        deserialize_with = "deserialize_analysis_state"
    )]
    #[schemars(schema_with = "analysis_state_schema")]
    pub analysis_state: Value,
}

impl Default for ExperimentStatus {
    fn default() -> Self {
        ExperimentStatus {
            phase: None,
            message: None,
            conditions: Vec::new(),
            current_iteration: 0,
            candidate: None,
            start_timestamp: None,
            last_increment_time: None,
            assessment: None,
            traffic_split: TrafficSplit::default(),
            analysis_state: empty_analysis_state(),
        }
    }
}

pub fn empty_analysis_state() -> Value {
    Value::Object(serde_json::Map::new())
}

fn deserialize_analysis_state<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => empty_analysis_state(),
        Some(v) => v,
    })
}

fn analysis_state_schema(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

impl Experiment {
    /// Namespace of the target service
    pub fn target_namespace(&self) -> String {
        self.spec
            .target_service
            .namespace
            .clone()
            .or_else(|| self.namespace())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "experiment_test.rs"]
mod tests;
