//! Analytics service client
//!
//! The rollout engine asks an external analytics service how much traffic
//! the candidate should get next. The service owns the decision algorithm;
//! this module only carries the request and the verdict.
//!
//! - `AnalyticsClient` trait for abstraction
//! - `HttpAnalyticsClient` for production (reqwest, bounded by a timeout)
//! - `MockAnalyticsClient` for tests

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::crd::experiment::{AssessmentSummary, SuccessCriterion};

/// Path of the check-and-increment endpoint, relative to the service base URL
pub const CHECK_AND_INCREMENT_PATH: &str = "/api/v1/analytics/canary/check_and_increment";

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("analytics service unreachable: {0}")]
    Unreachable(String),

    #[error("analytics service returned invalid response: {0}")]
    InvalidResponse(String),

    #[error("analytics call timed out after {0:?}")]
    Timeout(Duration),
}

/// Version descriptor sent for baseline and candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionDescriptor {
    pub id: String,
    pub tags: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficControlRequest {
    pub success_criteria: Vec<SuccessCriterionRequest>,
    pub step_size: i32,
    pub max_traffic_percent: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuccessCriterionRequest {
    pub metric_name: String,
    #[serde(rename = "type")]
    pub tolerance_type: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_on_failure: Option<bool>,
}

impl From<&SuccessCriterion> for SuccessCriterionRequest {
    fn from(c: &SuccessCriterion) -> Self {
        SuccessCriterionRequest {
            metric_name: c.metric_name.clone(),
            tolerance_type: c.tolerance_type.clone(),
            value: c.tolerance,
            sample_size: c.sample_size,
            stop_on_failure: c.stop_on_failure,
        }
    }
}

/// Body of a check-and-increment call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsRequest {
    pub name: String,
    pub namespace: String,
    /// RFC3339, start of the observation window
    pub start_time: String,
    /// RFC3339, end of the observation window
    pub end_time: String,
    pub service_name: String,
    pub baseline: VersionDescriptor,
    pub candidate: VersionDescriptor,
    pub traffic_control: TrafficControlRequest,
    /// Whatever the service returned last time, `{}` on the first call
    #[serde(rename = "_last_state")]
    pub last_state: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficVerdict {
    pub traffic_percentage: f64,
}

impl TrafficVerdict {
    /// Nearest integer percentage within 0-100
    pub fn percent(&self) -> i32 {
        if !self.traffic_percentage.is_finite() {
            return 0;
        }
        self.traffic_percentage.round().clamp(0.0, 100.0) as i32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AssessmentVerdict {
    #[serde(default)]
    pub summary: SummaryVerdict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SummaryVerdict {
    #[serde(default)]
    pub all_success_criteria_met: bool,
    #[serde(default)]
    pub abort_experiment: bool,
    #[serde(default)]
    pub conclusions: Vec<String>,
}

impl From<&SummaryVerdict> for AssessmentSummary {
    fn from(s: &SummaryVerdict) -> Self {
        AssessmentSummary {
            all_success_criteria_met: s.all_success_criteria_met,
            abort_experiment: s.abort_experiment,
            conclusions: s.conclusions.clone(),
        }
    }
}

/// Verdict of a check-and-increment call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsResponse {
    pub baseline: TrafficVerdict,
    #[serde(alias = "canary")]
    pub candidate: TrafficVerdict,
    #[serde(default)]
    pub assessment: AssessmentVerdict,
    #[serde(rename = "_last_state", default)]
    pub last_state: Option<Value>,
}

/// Trait for the analytics service
///
/// Production code uses `HttpAnalyticsClient`; tests use `MockAnalyticsClient`.
#[async_trait]
pub trait AnalyticsClient: Send + Sync {
    /// Ask the service for the next traffic split
    ///
    /// # Arguments
    /// * `endpoint` - base URL of the analytics service
    /// * `request` - experiment context and last state
    async fn check_and_increment(
        &self,
        endpoint: &str,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsResponse, AnalyticsError>;
}

/// HTTP client for the analytics service
///
/// One reqwest client is shared by all experiments; the endpoint comes from
/// each call so experiments can point at different services.
pub struct HttpAnalyticsClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpAnalyticsClient {
    pub fn new(timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build analytics HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self { client, timeout }
    }
}

pub fn check_and_increment_url(endpoint: &str) -> String {
    format!(
        "{}{}",
        endpoint.trim_end_matches('/'),
        CHECK_AND_INCREMENT_PATH
    )
}

#[async_trait]
impl AnalyticsClient for HttpAnalyticsClient {
    async fn check_and_increment(
        &self,
        endpoint: &str,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsResponse, AnalyticsError> {
        let response = self
            .client
            .post(check_and_increment_url(endpoint))
            // per request as well, the builder fallback carries no timeout
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalyticsError::Timeout(self.timeout)
                } else {
                    AnalyticsError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyticsError::InvalidResponse(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        response.json().await.map_err(|e| {
            if e.is_timeout() {
                AnalyticsError::Timeout(self.timeout)
            } else {
                AnalyticsError::InvalidResponse(e.to_string())
            }
        })
    }
}

/// Mock analytics client for testing
///
/// Pops queued responses in order; once the queue is empty the last
/// response is repeated. Records every request it receives.
#[cfg(test)]
pub struct MockAnalyticsClient {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<AnalyticsResponse, String>>>,
    last: std::sync::Mutex<Option<Result<AnalyticsResponse, String>>>,
    pub requests: std::sync::Mutex<Vec<AnalyticsRequest>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockAnalyticsClient {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            last: std::sync::Mutex::new(None),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn respond(self, response: AnalyticsResponse) -> Self {
        self.responses.lock().unwrap().push_back(Ok(response));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Canned response with the given candidate percentage
    pub fn verdict(candidate: f64, criteria_met: bool, abort: bool) -> AnalyticsResponse {
        AnalyticsResponse {
            baseline: TrafficVerdict {
                traffic_percentage: 100.0 - candidate,
            },
            candidate: TrafficVerdict {
                traffic_percentage: candidate,
            },
            assessment: AssessmentVerdict {
                summary: SummaryVerdict {
                    all_success_criteria_met: criteria_met,
                    abort_experiment: abort,
                    conclusions: vec![],
                },
            },
            last_state: Some(serde_json::json!({"calls": candidate})),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl AnalyticsClient for MockAnalyticsClient {
    async fn check_and_increment(
        &self,
        _endpoint: &str,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsResponse, AnalyticsError> {
        self.requests.lock().unwrap().push(request.clone());

        let next = self.responses.lock().unwrap().pop_front();
        let outcome = match next {
            Some(outcome) => {
                *self.last.lock().unwrap() = Some(outcome.clone());
                outcome
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err("no response configured".to_string())),
        };

        outcome.map_err(AnalyticsError::Unreachable)
    }
}
