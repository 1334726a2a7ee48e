//! Prometheus metrics for the experiment controller
//!
//! - `kokeilu_reconciliations_total{result}` - reconcile passes by outcome
//! - `kokeilu_reconciliation_duration_seconds{result}` - pass latency
//! - `kokeilu_analytics_failures_total{namespace,experiment}` - failed analytics calls
//! - `kokeilu_candidate_traffic_percent{namespace,experiment}` - current candidate weight
//! - `kokeilu_experiments_completed_total{outcome}` - finished experiments

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics shared between the controller and the `/metrics` handler
pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconciliation_duration: HistogramVec,
    analytics_failures: IntCounterVec,
    traffic_weight: IntGaugeVec,
    completions: IntCounterVec,
}

impl ControllerMetrics {
    /// Create every metric and register it with a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "kokeilu_reconciliations_total",
                "Experiment reconcile passes by result",
            ),
            &["result"],
        )?;
        let reconciliation_duration = HistogramVec::new(
            HistogramOpts::new(
                "kokeilu_reconciliation_duration_seconds",
                "Duration of experiment reconcile passes",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["result"],
        )?;
        let analytics_failures = IntCounterVec::new(
            Opts::new(
                "kokeilu_analytics_failures_total",
                "Failed calls to the analytics service",
            ),
            &["namespace", "experiment"],
        )?;
        let traffic_weight = IntGaugeVec::new(
            Opts::new(
                "kokeilu_candidate_traffic_percent",
                "Share of traffic currently routed to the candidate",
            ),
            &["namespace", "experiment"],
        )?;
        let completions = IntCounterVec::new(
            Opts::new(
                "kokeilu_experiments_completed_total",
                "Completed experiments by outcome",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconciliation_duration.clone()))?;
        registry.register(Box::new(analytics_failures.clone()))?;
        registry.register(Box::new(traffic_weight.clone()))?;
        registry.register(Box::new(completions.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconciliation_duration,
            analytics_failures,
            traffic_weight,
            completions,
        })
    }

    pub fn record_reconciliation_success(&self, duration_secs: f64) {
        self.record_reconciliation("success", duration_secs);
    }

    pub fn record_reconciliation_error(&self, duration_secs: f64) {
        self.record_reconciliation("error", duration_secs);
    }

    fn record_reconciliation(&self, result: &str, duration_secs: f64) {
        self.reconciliations.with_label_values(&[result]).inc();
        self.reconciliation_duration
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_analytics_failure(&self, namespace: &str, experiment: &str) {
        self.analytics_failures
            .with_label_values(&[namespace, experiment])
            .inc();
    }

    pub fn set_traffic_weight(&self, namespace: &str, experiment: &str, weight: i64) {
        self.traffic_weight
            .with_label_values(&[namespace, experiment])
            .set(weight);
    }

    /// Drop the weight series of a deleted experiment
    pub fn remove_traffic_weight(&self, namespace: &str, experiment: &str) {
        // absent series is fine
        let _ = self
            .traffic_weight
            .remove_label_values(&[namespace, experiment]);
    }

    pub fn record_completion(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.completions.with_label_values(&[outcome]).inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Create the shared metrics registry
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
