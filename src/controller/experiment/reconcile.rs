use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::validation::{validate_experiment, ValidatedExperiment};
use crate::config::ControllerConfig;
use crate::controller::analytics::{AnalyticsClient, HttpAnalyticsClient};
use crate::controller::cache::{ExperimentCache, ExperimentKey};
use crate::controller::clock::{seconds_since, Clock, SystemClock};
use crate::controller::platform::{
    BackendPlatform, ExperimentStore, KubeStore, RoutingStore, StoreError, FINALIZER,
};
use crate::controller::rollout::{self, AnalyticsQuery, Verdict};
use crate::controller::routing::{
    apply_transition, delete_rules, ensure_routing_state, load_routing_state, persist,
    RoutingError, RoutingRole, RoutingState, Transition, Winner,
};
use crate::controller::targets::{resolve_targets, TargetError, Targets};
use crate::crd::condition::{reason, ConditionType};
use crate::crd::experiment::{
    empty_analysis_state, CleanupPolicy, Experiment, ExperimentStatus, OverrideAction, Phase,
};
use crate::server::SharedMetrics;

/// Attempts at a routing write before giving up on conflicts for this pass
const MAX_CONFLICT_ATTEMPTS: u32 = 3;

/// Requeue after a conflict that survived the in-pass retries
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Bounds of the target rediscovery backoff, in seconds
const TARGET_BACKOFF_MIN: u64 = 5;
const TARGET_BACKOFF_MAX: u64 = 300;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Experiment missing namespace")]
    MissingNamespace,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("reconcile pass exceeded deadline of {0:?}")]
    Deadline(Duration),
}

impl ReconcileError {
    /// Optimistic-concurrency conflict, worth retrying right away
    pub fn is_conflict(&self) -> bool {
        match self {
            ReconcileError::Store(e) | ReconcileError::Routing(RoutingError::Store(e)) => {
                e.is_conflict()
            }
            _ => false,
        }
    }
}

pub struct Context {
    pub routing: Arc<dyn RoutingStore>,
    pub platform: Arc<dyn BackendPlatform>,
    pub experiments: Arc<dyn ExperimentStore>,
    pub analytics: Arc<dyn AnalyticsClient>,
    pub cache: ExperimentCache,
    pub clock: Arc<dyn Clock>,
    pub config: ControllerConfig,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        client: kube::Client,
        config: ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let store = Arc::new(KubeStore::new(client));
        Context {
            routing: store.clone(),
            platform: store.clone(),
            experiments: store,
            analytics: Arc::new(HttpAnalyticsClient::new(config.analytics_timeout)),
            cache: ExperimentCache::new(),
            clock: Arc::new(SystemClock),
            config,
            metrics,
        }
    }

    /// Context over an in-memory cluster
    #[cfg(test)]
    pub fn new_mock(
        cluster: Arc<crate::controller::testing::FakeCluster>,
        analytics: Arc<dyn AnalyticsClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Context {
            routing: cluster.clone(),
            platform: cluster.clone(),
            experiments: cluster,
            analytics,
            cache: ExperimentCache::new(),
            clock,
            config: ControllerConfig {
                analytics_endpoint: Some("http://analytics.test".to_string()),
                ..ControllerConfig::default()
            },
            metrics: None,
        }
    }
}

/// Reconcile an Experiment resource
///
/// One pass of the experiment state machine:
/// 1. Validates the spec (MetricsSynced, spec errors)
/// 2. Resolves baseline and candidate and claims them in the ownership cache
/// 3. Honors a manual pause/resume
/// 4. Ensures routing rules exist and are owned by this experiment
/// 5. Runs the rollout engine and applies its verdict to routing
/// 6. Writes the status back when it changed
///
/// The pass runs under `config.pass_deadline`.
///
/// # Returns
/// * `Ok(Action)` - Requeue at the interval, a short retry delay, or await change
/// * `Err(ReconcileError)` - Store failure, conflict, or deadline
pub async fn reconcile(
    experiment: Arc<Experiment>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let start_time = std::time::Instant::now();
    let deadline = ctx.config.pass_deadline;

    let result = match tokio::time::timeout(deadline, reconcile_experiment(&experiment, &ctx)).await
    {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Deadline(deadline)),
    };

    if let Some(ref metrics) = ctx.metrics {
        let duration_secs = start_time.elapsed().as_secs_f64();
        match &result {
            Ok(_) => metrics.record_reconciliation_success(duration_secs),
            Err(_) => metrics.record_reconciliation_error(duration_secs),
        }
    }

    result
}

/// Error policy for the controller
///
/// Conflicts come back quickly for a fresh read; everything else waits
/// `config.error_requeue`. Uses `warn!` since these errors trigger retries.
pub fn error_policy(
    experiment: Arc<Experiment>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    warn!(
        experiment = %experiment.name_any(),
        namespace = ?experiment.namespace(),
        error = %error,
        "Reconcile error (will retry)"
    );

    if error.is_conflict() {
        Action::requeue(CONFLICT_REQUEUE)
    } else {
        Action::requeue(ctx.config.error_requeue)
    }
}

async fn reconcile_experiment(
    experiment: &Experiment,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = experiment.name_any();
    let key = ExperimentKey::of(experiment);

    if experiment.metadata.deletion_timestamp.is_some() {
        return finalize(experiment, ctx, &key).await;
    }

    // later writes in this pass are guarded by the version the finalizer write returns
    let with_finalizer: Experiment;
    let experiment = if experiment.finalizers().iter().any(|f| f == FINALIZER) {
        experiment
    } else {
        let mut finalizers = experiment.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        with_finalizer = ctx.experiments.set_finalizers(experiment, finalizers).await?;
        debug!(experiment = %key, "Added cleanup finalizer");
        &with_finalizer
    };

    let now = ctx.clock.now();
    let previous = experiment.status.as_ref();
    let mut status = match previous {
        Some(status) if status.phase.is_some() => status.clone(),
        _ => ExperimentStatus::initialized(now),
    };

    if status.phase == Some(Phase::Completed) {
        ctx.cache.remove(&key);
        return Ok(Action::await_change());
    }

    info!(experiment = %name, namespace = %namespace, phase = ?status.phase, "Reconciling Experiment");

    let outcome = run_pass(experiment, ctx, &key, &mut status, now).await;

    if previous != Some(&status) {
        info!(
            experiment = %name,
            phase = ?status.phase,
            iteration = status.current_iteration,
            weight = status.traffic_split.candidate,
            message = ?status.message,
            "Updating Experiment status"
        );
        if let Err(e) = ctx.experiments.patch_status(experiment, &status).await {
            error!(error = %e, experiment = %name, "Failed to update status");
            // a failed pass reports its own error first
            return match outcome {
                Err(pass_error) => Err(pass_error),
                Ok(_) => Err(e.into()),
            };
        }
    }

    if let Some(ref metrics) = ctx.metrics {
        metrics.set_traffic_weight(&namespace, &name, i64::from(status.traffic_split.candidate));
    }

    outcome
}

async fn run_pass(
    experiment: &Experiment,
    ctx: &Context,
    key: &ExperimentKey,
    status: &mut ExperimentStatus,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    let validated = match validate_experiment(experiment, &ctx.config) {
        Ok(validated) => validated,
        Err(e) => {
            warn!(experiment = %key, error = %e, "Experiment spec rejected");
            if e.is_metrics() {
                status.mark_metrics_synced_error(&e.to_string(), now);
            } else {
                status.mark_spec_error(&e.to_string(), now);
            }
            return Ok(Action::await_change());
        }
    };
    status.mark_metrics_synced("", now);

    let targets = match resolve_targets(
        ctx.platform.as_ref(),
        experiment,
        validated.policy.strategy.uses_analytics(),
    )
    .await
    {
        Ok(targets) => targets,
        Err(TargetError::Store(e)) => return Err(e.into()),
        Err(e) => return Ok(targets_missing(ctx, experiment, status, &e, now)),
    };

    // ownership is settled before any routing write
    let claim = targets.claim();
    if let Some(existing) = ctx.cache.get(key) {
        if !existing.matches(&claim) {
            info!(experiment = %key, "Targets changed, releasing previous claim");
            ctx.cache.remove(key);
        }
    }
    if let Err(owner) = ctx.cache.claim(key, &claim) {
        let e = TargetError::ExistingExperiment(owner.name);
        return Ok(targets_missing(ctx, experiment, status, &e, now));
    }
    if experiment.spec.target_service.candidate.is_none() && status.candidate.is_none() {
        info!(experiment = %key, candidate = %targets.candidate.name, "Candidate picked");
        status.candidate = Some(targets.candidate.name.clone());
    }
    ctx.cache
        .mark_service_found(&targets.service_name, &targets.namespace, true);
    for backend in &claim.backends {
        ctx.cache.mark_backend_found(backend, &targets.namespace, true);
    }
    status.mark_targets_found(
        &format!("baseline {}, candidate {}", targets.baseline.name, targets.candidate.name),
        now,
    );

    match experiment.spec.manual_override.as_ref().map(|o| o.action) {
        Some(OverrideAction::Pause) => {
            if status.mark_experiment_pause("", now) {
                info!(experiment = %key, "Experiment paused by override");
            }
            return Ok(Action::await_change());
        }
        Some(OverrideAction::Resume) if paused_by_override(status) => {
            info!(experiment = %key, "Experiment resumed by override");
            status.mark_experiment_resume("", now);
        }
        _ => {}
    }

    let start = Transition::StartProgressing {
        experiment: key.name.clone(),
        baseline: targets.baseline.labels.clone(),
        candidate: targets.candidate.labels.clone(),
    };
    let state = match transition(ctx, &targets, &start).await {
        Ok(state) => state,
        Err(RoutingError::OwnedBy(owner)) => {
            let e = TargetError::ExistingExperiment(owner);
            return Ok(targets_missing(ctx, experiment, status, &e, now));
        }
        Err(e) => return Err(routing_failed(status, e, now)),
    };
    status.mark_routing_rules_ready("", now);

    if status.start_timestamp.is_none() {
        status.start_timestamp = Some(now.to_rfc3339());
        status.last_increment_time = Some(now.to_rfc3339());
        status.traffic_split = state.weights();
        status.mark_progressing("", now);
        info!(experiment = %key, "Experiment started");
    } else if state.weights().candidate != status.traffic_split.candidate {
        return Ok(adopt_routed_weight(key, &state, status, validated.policy.interval, now));
    }

    run_engine(ctx, experiment, key, &targets, &validated, state, status, now).await
}

/// Routing carries a weight the status never recorded
///
/// Either the status write after a routing write was lost, or this pass read
/// a stale Experiment. Routing wins: the step is counted, the interval starts
/// over, and nothing moves this pass. A stale read then fails on its status
/// write and comes back with a fresh one.
fn adopt_routed_weight(
    key: &ExperimentKey,
    state: &RoutingState,
    status: &mut ExperimentStatus,
    interval: Duration,
    now: DateTime<Utc>,
) -> Action {
    let routed = state.weights();
    warn!(
        experiment = %key,
        recorded = status.traffic_split.candidate,
        routed = routed.candidate,
        "Status behind routing, adopting routed weight"
    );
    status.current_iteration += 1;
    status.last_increment_time = Some(now.to_rfc3339());
    status.mark_traffic_update(&format!("candidate at {}%", routed.candidate), now);
    status.traffic_split = routed;
    Action::requeue(interval)
}

#[allow(clippy::too_many_arguments)]
async fn run_engine(
    ctx: &Context,
    experiment: &Experiment,
    key: &ExperimentKey,
    targets: &Targets,
    validated: &ValidatedExperiment,
    state: RoutingState,
    status: &mut ExperimentStatus,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    let policy = &validated.policy;
    let current = state.weights().candidate;

    let query = validated
        .analytics_endpoint
        .as_deref()
        .map(|endpoint| AnalyticsQuery {
            client: ctx.analytics.as_ref(),
            endpoint,
            request: rollout::analytics_request(experiment, targets, policy, status, now),
        });

    match rollout::evaluate(policy, status, current, now, query).await {
        Verdict::Wait(wait) => {
            status.traffic_split = state.weights();
            if status.phase != Some(Phase::Progressing) {
                status.mark_progressing("", now);
            }
            Ok(Action::requeue(wait))
        }
        Verdict::AnalyticsFailed(e) => {
            status.mark_analytics_service_error(&e.to_string(), now);
            if let Some(ref metrics) = ctx.metrics {
                metrics.record_analytics_failure(&key.namespace, &key.name);
            }
            Ok(Action::requeue(ctx.config.analytics_retry))
        }
        Verdict::Abort { analytics } => {
            let state = match transition(ctx, targets, &Transition::SetWeight(0)).await {
                Ok(state) => state,
                Err(e) => return Err(routing_failed(status, e, now)),
            };
            let conclusions = analytics.summary.conclusions.join("; ");
            status.current_iteration += 1;
            status.last_increment_time = Some(now.to_rfc3339());
            status.assessment = Some(analytics.summary);
            status.analysis_state = analytics.last_state;
            status.traffic_split = state.weights();
            status.mark_analytics_service_running("", now);
            status.mark_experiment_aborted(&conclusions, now);
            warn!(experiment = %key, previous_weight = current, "Experiment aborted by analytics");
            Ok(Action::requeue(policy.interval))
        }
        Verdict::Advance {
            weight,
            completes,
            analytics,
        } => {
            let state = if weight != current {
                match transition(ctx, targets, &Transition::SetWeight(weight)).await {
                    Ok(state) => state,
                    Err(e) => return Err(routing_failed(status, e, now)),
                }
            } else {
                state
            };

            status.current_iteration += 1;
            status.last_increment_time = Some(now.to_rfc3339());
            status.traffic_split = state.weights();
            if let Some(analytics) = analytics {
                status.assessment = Some(analytics.summary);
                status.analysis_state = analytics.last_state;
                status.mark_analytics_service_running("", now);
            }
            if weight != current {
                status.mark_traffic_update(&format!("candidate at {}%", weight), now);
            } else {
                status.mark_iteration_update(
                    &format!("iteration {}", status.current_iteration),
                    now,
                );
            }
            info!(
                experiment = %key,
                iteration = status.current_iteration,
                weight,
                "Iteration applied"
            );

            if completes {
                let success = rollout::succeeded(policy, status);
                let winner = rollout::winner(policy, success);
                return complete(ctx, experiment, key, targets, status, success, winner, now).await;
            }
            Ok(Action::requeue(policy.interval))
        }
        Verdict::Complete { success, winner } => {
            complete(ctx, experiment, key, targets, status, success, winner, now).await
        }
    }
}

/// Collapse traffic to the winner (or drop created rules under the delete
/// policy), release ownership and mark completion
#[allow(clippy::too_many_arguments)]
async fn complete(
    ctx: &Context,
    experiment: &Experiment,
    key: &ExperimentKey,
    targets: &Targets,
    status: &mut ExperimentStatus,
    success: bool,
    winner: Winner,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    status.traffic_split = match remove_created_rules(ctx, experiment, targets).await? {
        Some(current) => rollout::final_split(winner, current),
        None => match transition(ctx, targets, &Transition::Stabilize(winner)).await {
            Ok(state) => state.weights(),
            Err(e) => return Err(routing_failed(status, e, now)),
        },
    };
    status.analysis_state = empty_analysis_state();
    let message = if success {
        format!("succeeded, traffic kept on {:?}", winner).to_lowercase()
    } else {
        "failed, traffic restored to baseline".to_string()
    };
    status.mark_experiment_completed(&message, now);
    ctx.cache.remove(key);
    if let Some(ref metrics) = ctx.metrics {
        metrics.record_completion(success);
    }

    info!(
        experiment = %key,
        success,
        baseline = status.traffic_split.baseline,
        candidate = status.traffic_split.candidate,
        "Experiment completed"
    );
    Ok(Action::await_change())
}

/// Delete the rules under the delete policy when this controller created them
///
/// Returns the candidate weight the rules carried, or `None` when the rules
/// have to stay and be stabilized instead.
async fn remove_created_rules(
    ctx: &Context,
    experiment: &Experiment,
    targets: &Targets,
) -> Result<Option<i32>, ReconcileError> {
    if experiment.spec.cleanup != Some(CleanupPolicy::Delete) {
        return Ok(None);
    }
    match load_routing_state(ctx.routing.as_ref(), targets).await? {
        Some(state) if state.controller_created() => {
            let current = state.weights().candidate;
            delete_rules(ctx.routing.as_ref(), &state).await?;
            Ok(Some(current))
        }
        _ => Ok(None),
    }
}

/// Read routing, apply `transition` and write it back
///
/// Conflicts are retried from a fresh read up to `MAX_CONFLICT_ATTEMPTS`
/// times. A transition that changes nothing is not written.
async fn transition(
    ctx: &Context,
    targets: &Targets,
    transition: &Transition,
) -> Result<RoutingState, RoutingError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = ensure_routing_state(ctx.routing.as_ref(), targets).await?;
        let next = apply_transition(current.clone(), transition)?;
        if next == current {
            return Ok(current);
        }
        match persist(ctx.routing.as_ref(), next).await {
            Ok(state) => return Ok(state),
            Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_ATTEMPTS => {
                debug!(attempt, error = %e, "Routing write conflicted, retrying from a fresh read");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn routing_failed(
    status: &mut ExperimentStatus,
    error: RoutingError,
    now: DateTime<Utc>,
) -> ReconcileError {
    // conflicts are retried quickly and do not deserve a condition
    let is_conflict = matches!(&error, RoutingError::Store(e) if e.is_conflict());
    if !is_conflict {
        status.mark_routing_rules_error(&error.to_string(), now);
    }
    ReconcileError::Routing(error)
}

/// Record missing or contested targets and schedule rediscovery
fn targets_missing(
    ctx: &Context,
    experiment: &Experiment,
    status: &mut ExperimentStatus,
    error: &TargetError,
    now: DateTime<Utc>,
) -> Action {
    let namespace = experiment.target_namespace();
    match error {
        TargetError::ServiceNotFound(name) => {
            ctx.cache.mark_service_found(name, &namespace, false);
        }
        TargetError::MissingBaseline(name)
        | TargetError::MissingCandidate(name)
        | TargetError::MissingBaselineRevision(name)
        | TargetError::MissingCandidateRevision(name) => {
            ctx.cache.mark_backend_found(name, &namespace, false);
        }
        _ => {}
    }

    if status.mark_targets_error(error.reason(), &error.detail(), now) {
        warn!(
            experiment = %experiment.name_any(),
            reason = error.reason(),
            error = %error,
            "Targets unavailable"
        );
    }

    Action::requeue(target_backoff(status, now))
}

/// Rediscovery delay, growing with how long the targets have been missing
fn target_backoff(status: &ExperimentStatus, now: DateTime<Utc>) -> Duration {
    let since = status
        .condition(ConditionType::TargetsProvided)
        .and_then(|c| c.last_transition_time.as_deref());
    Duration::from_secs(seconds_since(since, now).clamp(TARGET_BACKOFF_MIN, TARGET_BACKOFF_MAX))
}

fn paused_by_override(status: &ExperimentStatus) -> bool {
    status.phase == Some(Phase::Paused)
        && status
            .condition(ConditionType::ExperimentCompleted)
            .and_then(|c| c.reason.as_deref())
            == Some(reason::ACTION_PAUSE)
}

/// Release ownership and restore routing before the Experiment goes away
///
/// Under the `delete` cleanup policy, rules the controller created are
/// deleted. Otherwise rules still driven by this experiment are stabilized
/// on the baseline.
async fn finalize(
    experiment: &Experiment,
    ctx: &Context,
    key: &ExperimentKey,
) -> Result<Action, ReconcileError> {
    ctx.cache.remove(key);

    if !experiment.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(Action::await_change());
    }

    let targets = Targets::from_spec(experiment);
    if let Some(state) = load_routing_state(ctx.routing.as_ref(), &targets).await? {
        let owned = state.owner() == Some(key.name.as_str());
        let delete = experiment.spec.cleanup == Some(CleanupPolicy::Delete)
            && state.controller_created()
            && (owned || state.owner().is_none());

        if delete {
            delete_rules(ctx.routing.as_ref(), &state).await?;
        } else if owned && state.role() == RoutingRole::Progressing {
            let stable = apply_transition(state, &Transition::Stabilize(Winner::Baseline))?;
            persist(ctx.routing.as_ref(), stable).await?;
            info!(experiment = %key, "Routing restored to baseline on deletion");
        }
    }

    let finalizers: Vec<String> = experiment
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    ctx.experiments.set_finalizers(experiment, finalizers).await?;

    if let Some(ref metrics) = ctx.metrics {
        metrics.remove_traffic_weight(&key.namespace, &key.name);
    }
    info!(experiment = %key, "Experiment finalized");
    Ok(Action::await_change())
}
