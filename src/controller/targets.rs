//! Target resolution
//!
//! Turns `spec.targetService` into concrete backends. On the service mesh
//! platform these are Deployments behind a core Service; on the serverless
//! platform they are Revisions listed in a Knative Service traffic block.
//! Nothing here is cached: every pass resolves from the cluster again.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;

use super::cache::Claim;
use super::platform::{BackendPlatform, StoreError};
use super::routing::EXPERIMENT_LABEL;
use crate::crd::condition::reason;
use crate::crd::experiment::{Experiment, Platform};

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("service {0} has no template")]
    MissingTemplate(String),

    #[error("service {0} has no traffic block")]
    MissingTraffic(String),

    #[error("baseline {0} not found")]
    MissingBaseline(String),

    #[error("candidate {0} not found")]
    MissingCandidate(String),

    #[error("baseline revision {0} not in traffic block")]
    MissingBaselineRevision(String),

    #[error("candidate revision {0} not in traffic block")]
    MissingCandidateRevision(String),

    #[error("no core service behind revision {0}")]
    MissingCoreService(String),

    #[error("targets already owned by experiment {0}")]
    ExistingExperiment(String),

    #[error("failed to read targets: {0}")]
    Store(#[from] StoreError),
}

impl TargetError {
    /// Reason code for the TargetsProvided condition
    pub fn reason(&self) -> &'static str {
        match self {
            TargetError::ServiceNotFound(_) => reason::NOT_FOUND,
            TargetError::MissingTemplate(_) => reason::MISSING_TEMPLATE,
            TargetError::MissingTraffic(_) => reason::MISSING_TRAFFIC,
            TargetError::MissingBaseline(_) => reason::MISSING_BASELINE,
            TargetError::MissingCandidate(_) => reason::MISSING_CANDIDATE,
            TargetError::MissingBaselineRevision(_) => reason::MISSING_BASELINE_REVISION,
            TargetError::MissingCandidateRevision(_) => reason::MISSING_CANDIDATE_REVISION,
            TargetError::MissingCoreService(_) => reason::MISSING_CORE_SERVICE,
            TargetError::ExistingExperiment(_) => reason::EXISTING_EXPERIMENT,
            TargetError::Store(_) => reason::TARGETS_ERROR,
        }
    }

    /// Condition message (the reason is carried separately)
    pub fn detail(&self) -> String {
        match self {
            TargetError::ServiceNotFound(s)
            | TargetError::MissingTemplate(s)
            | TargetError::MissingTraffic(s)
            | TargetError::MissingBaseline(s)
            | TargetError::MissingCandidate(s)
            | TargetError::MissingBaselineRevision(s)
            | TargetError::MissingCandidateRevision(s)
            | TargetError::MissingCoreService(s) => s.clone(),
            TargetError::ExistingExperiment(owner) => {
                format!("service is already controlled by {}", owner)
            }
            TargetError::Store(e) => e.to_string(),
        }
    }
}

/// One concrete backend (a Deployment or a Revision)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    /// Pod template labels, used for routing subsets
    pub labels: BTreeMap<String, String>,
    /// Core Service fronting a revision, when it was looked up
    pub service: Option<String>,
}

impl Backend {
    fn named(name: &str) -> Self {
        Backend {
            name: name.to_string(),
            labels: BTreeMap::new(),
            service: None,
        }
    }
}

/// Resolved targets of one experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    pub platform: Platform,
    pub service_name: String,
    pub namespace: String,
    pub baseline: Backend,
    pub candidate: Backend,
}

impl Targets {
    /// Targets as named in the spec, without looking anything up
    ///
    /// Used when the cluster may no longer have the backends, e.g. while
    /// cleaning up after a deleted Experiment.
    pub fn from_spec(experiment: &Experiment) -> Self {
        let target = &experiment.spec.target_service;
        Targets {
            platform: target.platform(),
            service_name: target.name.clone(),
            namespace: experiment.target_namespace(),
            baseline: Backend::named(&target.baseline),
            candidate: Backend::named(candidate_name(experiment).unwrap_or_default()),
        }
    }

    pub fn claim(&self) -> Claim {
        Claim {
            namespace: self.namespace.clone(),
            service: self.service_name.clone(),
            backends: vec![self.baseline.name.clone(), self.candidate.name.clone()],
        }
    }
}

/// Resolve baseline and candidate for an experiment
///
/// # Arguments
/// * `platform` - cluster lookups
/// * `experiment` - the Experiment being reconciled
/// * `needs_core_services` - also resolve the core Service behind each revision
///   (serverless only, used for analytics descriptors)
pub async fn resolve_targets(
    platform: &dyn BackendPlatform,
    experiment: &Experiment,
    needs_core_services: bool,
) -> Result<Targets, TargetError> {
    match experiment.spec.target_service.platform() {
        Platform::ServiceMesh => resolve_deployments(platform, experiment).await,
        Platform::Serverless => {
            resolve_revisions(platform, experiment, needs_core_services).await
        }
    }
}

fn not_found_as<F>(error: StoreError, missing: F) -> TargetError
where
    F: FnOnce() -> TargetError,
{
    if error.is_not_found() {
        missing()
    } else {
        TargetError::Store(error)
    }
}

async fn resolve_deployments(
    platform: &dyn BackendPlatform,
    experiment: &Experiment,
) -> Result<Targets, TargetError> {
    let target = &experiment.spec.target_service;
    let namespace = experiment.target_namespace();

    let service = platform
        .get_service(&namespace, &target.name)
        .await
        .map_err(|e| not_found_as(e, || TargetError::ServiceNotFound(target.name.clone())))?;

    let selector = service
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .filter(|s| !s.is_empty())
        .map(selector_string)
        .ok_or_else(|| TargetError::MissingBaseline(target.baseline.clone()))?;

    let deployments = platform.list_deployments(&namespace, &selector).await?;

    let baseline = deployments
        .iter()
        .find(|d| d.name_any() == target.baseline)
        .ok_or_else(|| TargetError::MissingBaseline(target.baseline.clone()))?;

    // a candidate picked on an earlier pass is kept, even once newer deployments appear
    let candidate = match candidate_name(experiment) {
        Some(name) => deployments
            .iter()
            .find(|d| d.name_any() == name)
            .ok_or_else(|| TargetError::MissingCandidate(name.to_string()))?,
        None => pick_candidate(&deployments, &target.baseline).ok_or_else(|| {
            TargetError::MissingCandidate(format!("no deployment behind {}", target.name))
        })?,
    };

    Ok(Targets {
        platform: Platform::ServiceMesh,
        service_name: target.name.clone(),
        namespace,
        baseline: deployment_backend(baseline),
        candidate: deployment_backend(candidate),
    })
}

/// Candidate named in the spec, else the one recorded when it was picked
fn candidate_name(experiment: &Experiment) -> Option<&str> {
    experiment
        .spec
        .target_service
        .candidate
        .as_deref()
        .or_else(|| experiment.status.as_ref()?.candidate.as_deref())
}

/// Newest deployment other than the baseline; equal timestamps pick the greater name
pub fn pick_candidate<'a>(deployments: &'a [Deployment], baseline: &str) -> Option<&'a Deployment> {
    deployments
        .iter()
        .filter(|d| d.name_any() != baseline)
        .max_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.name_any().cmp(&b.name_any()))
        })
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn deployment_backend(deployment: &Deployment) -> Backend {
    let labels = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    Backend {
        name: deployment.name_any(),
        labels,
        service: None,
    }
}

async fn resolve_revisions(
    platform: &dyn BackendPlatform,
    experiment: &Experiment,
    needs_core_services: bool,
) -> Result<Targets, TargetError> {
    let target = &experiment.spec.target_service;
    let namespace = experiment.target_namespace();

    let service = platform
        .get_knative_service(&namespace, &target.name)
        .await
        .map_err(|e| not_found_as(e, || TargetError::ServiceNotFound(target.name.clone())))?;

    if service.spec.template.is_none() {
        return Err(TargetError::MissingTemplate(target.name.clone()));
    }

    if let Some(owner) = service.labels().get(EXPERIMENT_LABEL) {
        if *owner != experiment.name_any() {
            return Err(TargetError::ExistingExperiment(owner.clone()));
        }
    }

    if service.spec.traffic.is_empty() {
        return Err(TargetError::MissingTraffic(target.name.clone()));
    }

    if service.spec.traffic_for(&target.baseline).is_none() {
        return Err(TargetError::MissingBaselineRevision(target.baseline.clone()));
    }

    let candidate_name = target.candidate.clone().unwrap_or_default();
    if service.spec.traffic_for(&candidate_name).is_none() {
        return Err(TargetError::MissingCandidateRevision(candidate_name));
    }

    let mut baseline = Backend::named(&target.baseline);
    let mut candidate = Backend::named(&candidate_name);

    if needs_core_services {
        baseline.service = Some(core_service_for(platform, &namespace, &baseline.name).await?);
        candidate.service = Some(core_service_for(platform, &namespace, &candidate.name).await?);
    }

    Ok(Targets {
        platform: Platform::Serverless,
        service_name: target.name.clone(),
        namespace,
        baseline,
        candidate,
    })
}

/// Name of the core Service fronting a revision
async fn core_service_for(
    platform: &dyn BackendPlatform,
    namespace: &str,
    revision: &str,
) -> Result<String, TargetError> {
    let missing = |e: StoreError| TargetError::MissingCoreService(format!("{}: {}", revision, e));

    let rev = platform.get_revision(namespace, revision).await.map_err(missing)?;
    let service_name = rev
        .status
        .and_then(|s| s.service_name)
        .unwrap_or_else(|| revision.to_string());

    platform
        .get_service(namespace, &service_name)
        .await
        .map_err(missing)?;

    Ok(service_name)
}
