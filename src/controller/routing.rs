//! Routing state for one logical service
//!
//! On the service mesh platform the state is a DestinationRule (subsets) plus
//! a VirtualService (weights), both named `{service}-kokeilu`. On the
//! serverless platform it is the traffic block of the Knative Service.
//!
//! Lifecycle, tracked by the `kokeilu.io/role` label:
//!
//! ```text
//! Init ──StartProgressing──► Progressing ──SetWeight──► Progressing
//!   ▲                              │
//! Stable ◄────Stabilize(winner)────┘
//! ```
//!
//! Transitions are pure: they take a state and return a new one. Writing the
//! result back (and handling conflicts) is the caller's job.

use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use super::platform::{RoutingStore, StoreError};
use super::targets::Targets;
use crate::crd::experiment::{OnSuccess, Platform, TrafficSplit};
use crate::crd::istio::{
    DestinationRule, DestinationRuleSpec, HttpRoute, HttpRouteDestination, Subset,
    VirtualService, VirtualServiceSpec,
};
use crate::crd::knative::KnativeService;

/// Role of the routing objects: init | progressing | stable
pub const ROLE_LABEL: &str = "kokeilu.io/role";

/// Name of the experiment currently driving the routing objects
pub const EXPERIMENT_LABEL: &str = "kokeilu.io/experiment";

/// Present on objects the controller created itself
pub const INIT_LABEL: &str = "kokeilu.io/init";

pub const BASELINE_SUBSET: &str = "baseline";
pub const CANDIDATE_SUBSET: &str = "candidate";

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("invalid candidate weight {0}, must be 0-100")]
    InvalidWeight(i32),

    #[error("routing rules are {0:?}, expected Progressing")]
    NotProgressing(RoutingRole),

    #[error("routing rules are owned by experiment {0}")]
    OwnedBy(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingRole {
    Init,
    Progressing,
    Stable,
}

impl RoutingRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingRole::Init => "init",
            RoutingRole::Progressing => "progressing",
            RoutingRole::Stable => "stable",
        }
    }

    fn from_label(value: Option<&String>) -> Self {
        match value.map(String::as_str) {
            Some("progressing") => RoutingRole::Progressing,
            Some("init") => RoutingRole::Init,
            _ => RoutingRole::Stable,
        }
    }
}

/// Which side traffic collapses to when routing stabilizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Baseline,
    Candidate,
    /// Keep the current split
    Both,
}

impl From<OnSuccess> for Winner {
    fn from(policy: OnSuccess) -> Self {
        match policy {
            OnSuccess::Baseline => Winner::Baseline,
            OnSuccess::Candidate => Winner::Candidate,
            OnSuccess::Both => Winner::Both,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Init/Stable → Progressing, all traffic on baseline
    StartProgressing {
        experiment: String,
        baseline: BTreeMap<String, String>,
        candidate: BTreeMap<String, String>,
    },
    /// Progressing → Progressing with candidate weight `w`
    SetWeight(i32),
    /// Progressing → Stable
    Stabilize(Winner),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutingState {
    Istio {
        destination_rule: DestinationRule,
        virtual_service: VirtualService,
    },
    Knative {
        service: KnativeService,
        baseline: String,
        candidate: String,
    },
}

impl RoutingState {
    pub fn role(&self) -> RoutingRole {
        match self {
            RoutingState::Istio {
                virtual_service, ..
            } => RoutingRole::from_label(virtual_service.labels().get(ROLE_LABEL)),
            RoutingState::Knative { service, .. } => {
                if service.labels().contains_key(EXPERIMENT_LABEL) {
                    RoutingRole::Progressing
                } else {
                    RoutingRole::Stable
                }
            }
        }
    }

    /// Experiment currently driving these rules
    pub fn owner(&self) -> Option<&str> {
        let labels = match self {
            RoutingState::Istio {
                virtual_service, ..
            } => virtual_service.labels(),
            RoutingState::Knative { service, .. } => service.labels(),
        };
        labels.get(EXPERIMENT_LABEL).map(String::as_str)
    }

    /// Whether the controller created these objects (and may delete them)
    pub fn controller_created(&self) -> bool {
        match self {
            RoutingState::Istio {
                destination_rule,
                virtual_service,
            } => {
                destination_rule.labels().contains_key(INIT_LABEL)
                    && virtual_service.labels().contains_key(INIT_LABEL)
            }
            RoutingState::Knative { .. } => false,
        }
    }

    /// Current split between baseline and candidate
    pub fn weights(&self) -> TrafficSplit {
        match self {
            RoutingState::Istio {
                virtual_service, ..
            } => {
                let routes = virtual_service
                    .spec
                    .http
                    .first()
                    .map(|h| h.route.as_slice())
                    .unwrap_or_default();
                let weight_of = |subset: &str| {
                    routes
                        .iter()
                        .find(|r| r.destination.subset.as_deref() == Some(subset))
                        .map(|r| r.weight.unwrap_or(if routes.len() == 1 { 100 } else { 0 }))
                        .unwrap_or(0)
                };
                TrafficSplit {
                    baseline: weight_of(BASELINE_SUBSET),
                    candidate: weight_of(CANDIDATE_SUBSET),
                }
            }
            RoutingState::Knative {
                service,
                baseline,
                candidate,
            } => {
                let percent_of = |revision: &str| {
                    service
                        .spec
                        .traffic_for(revision)
                        .and_then(|t| t.percent)
                        .unwrap_or(0) as i32
                };
                TrafficSplit {
                    baseline: percent_of(baseline),
                    candidate: percent_of(candidate),
                }
            }
        }
    }
}

pub fn rule_name(service: &str) -> String {
    format!("{}-kokeilu", service)
}

fn service_host(service: &str, namespace: &str) -> String {
    format!("{}.{}.svc.cluster.local", service, namespace)
}

fn set_label(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

fn remove_label(meta: &mut ObjectMeta, key: &str) {
    if let Some(labels) = meta.labels.as_mut() {
        labels.remove(key);
    }
}

/// Apply a transition, returning the new state
///
/// Object names and resource versions are carried over untouched so the
/// eventual replace is rejected if someone else wrote in between.
pub fn apply_transition(
    state: RoutingState,
    transition: &Transition,
) -> Result<RoutingState, RoutingError> {
    let role = state.role();

    match transition {
        Transition::StartProgressing { experiment, .. } => {
            if let Some(owner) = state.owner() {
                if owner != experiment {
                    return Err(RoutingError::OwnedBy(owner.to_string()));
                }
            }
        }
        Transition::SetWeight(weight) => {
            if !(0..=100).contains(weight) {
                return Err(RoutingError::InvalidWeight(*weight));
            }
            if role != RoutingRole::Progressing {
                return Err(RoutingError::NotProgressing(role));
            }
        }
        Transition::Stabilize(_) => {}
    }

    Ok(match state {
        RoutingState::Istio {
            destination_rule,
            virtual_service,
        } => {
            let (destination_rule, virtual_service) =
                transition_istio(destination_rule, virtual_service, role, transition);
            RoutingState::Istio {
                destination_rule,
                virtual_service,
            }
        }
        RoutingState::Knative {
            service,
            baseline,
            candidate,
        } => RoutingState::Knative {
            service: transition_knative(service, &baseline, &candidate, transition),
            baseline,
            candidate,
        },
    })
}

fn transition_istio(
    mut rule: DestinationRule,
    mut vs: VirtualService,
    role: RoutingRole,
    transition: &Transition,
) -> (DestinationRule, VirtualService) {
    let host = rule.spec.host.clone();

    match transition {
        Transition::StartProgressing {
            experiment,
            baseline,
            candidate,
        } => {
            rule.spec.subsets = vec![
                subset(BASELINE_SUBSET, baseline),
                subset(CANDIDATE_SUBSET, candidate),
            ];
            // re-entering Progressing keeps the weight already applied
            let weight = if role == RoutingRole::Progressing {
                RoutingState::Istio {
                    destination_rule: rule.clone(),
                    virtual_service: vs.clone(),
                }
                .weights()
                .candidate
            } else {
                0
            };
            set_routes(&mut vs, split_routes(&host, weight));
            for meta in [&mut rule.metadata, &mut vs.metadata] {
                set_label(meta, ROLE_LABEL, RoutingRole::Progressing.as_str());
                set_label(meta, EXPERIMENT_LABEL, experiment);
            }
        }
        Transition::SetWeight(weight) => {
            set_routes(&mut vs, split_routes(&host, *weight));
        }
        Transition::Stabilize(winner) => {
            let keep = match winner {
                Winner::Baseline => Some(BASELINE_SUBSET),
                Winner::Candidate => Some(CANDIDATE_SUBSET),
                Winner::Both => None,
            };
            if let Some(keep) = keep {
                rule.spec.subsets.retain(|s| s.name == keep);
                set_routes(&mut vs, vec![HttpRouteDestination::to_subset(&host, keep, 100)]);
            }
            for meta in [&mut rule.metadata, &mut vs.metadata] {
                set_label(meta, ROLE_LABEL, RoutingRole::Stable.as_str());
                remove_label(meta, EXPERIMENT_LABEL);
            }
        }
    }

    (rule, vs)
}

fn subset(name: &str, labels: &BTreeMap<String, String>) -> Subset {
    Subset {
        name: name.to_string(),
        labels: labels.clone(),
        extra: BTreeMap::new(),
    }
}

fn split_routes(host: &str, candidate: i32) -> Vec<HttpRouteDestination> {
    vec![
        HttpRouteDestination::to_subset(host, BASELINE_SUBSET, 100 - candidate),
        HttpRouteDestination::to_subset(host, CANDIDATE_SUBSET, candidate),
    ]
}

fn set_routes(vs: &mut VirtualService, routes: Vec<HttpRouteDestination>) {
    match vs.spec.http.first_mut() {
        Some(http) => http.route = routes,
        None => vs.spec.http.push(HttpRoute {
            route: routes,
            extra: BTreeMap::new(),
        }),
    }
}

fn transition_knative(
    mut service: KnativeService,
    baseline: &str,
    candidate: &str,
    transition: &Transition,
) -> KnativeService {
    let current = RoutingState::Knative {
        service: service.clone(),
        baseline: baseline.to_string(),
        candidate: candidate.to_string(),
    };

    let weight = match transition {
        Transition::StartProgressing { experiment, .. } => {
            set_label(&mut service.metadata, EXPERIMENT_LABEL, experiment);
            if current.role() == RoutingRole::Progressing {
                Some(current.weights().candidate)
            } else {
                Some(0)
            }
        }
        Transition::SetWeight(weight) => Some(*weight),
        Transition::Stabilize(winner) => {
            remove_label(&mut service.metadata, EXPERIMENT_LABEL);
            match winner {
                Winner::Baseline => Some(0),
                Winner::Candidate => Some(100),
                Winner::Both => None,
            }
        }
    };

    if let Some(weight) = weight {
        for target in service.spec.traffic.iter_mut() {
            let percent = match target.revision_name.as_deref() {
                Some(name) if name == baseline => 100 - weight,
                Some(name) if name == candidate => weight,
                _ => 0,
            };
            target.percent = Some(i64::from(percent));
        }
    }

    service
}

fn init_destination_rule(targets: &Targets) -> DestinationRule {
    let mut rule = DestinationRule::new(
        &rule_name(&targets.service_name),
        DestinationRuleSpec {
            host: service_host(&targets.service_name, &targets.namespace),
            subsets: vec![subset(BASELINE_SUBSET, &targets.baseline.labels)],
            extra: BTreeMap::new(),
        },
    );
    rule.metadata.namespace = Some(targets.namespace.clone());
    set_label(&mut rule.metadata, ROLE_LABEL, RoutingRole::Init.as_str());
    set_label(&mut rule.metadata, INIT_LABEL, "true");
    rule
}

fn init_virtual_service(targets: &Targets) -> VirtualService {
    let host = service_host(&targets.service_name, &targets.namespace);
    let mut vs = VirtualService::new(
        &rule_name(&targets.service_name),
        VirtualServiceSpec {
            hosts: vec![targets.service_name.clone()],
            http: vec![HttpRoute {
                route: vec![HttpRouteDestination::to_subset(
                    &host,
                    BASELINE_SUBSET,
                    100,
                )],
                extra: BTreeMap::new(),
            }],
            extra: BTreeMap::new(),
        },
    );
    vs.metadata.namespace = Some(targets.namespace.clone());
    set_label(&mut vs.metadata, ROLE_LABEL, RoutingRole::Init.as_str());
    set_label(&mut vs.metadata, INIT_LABEL, "true");
    vs
}

/// Read the routing objects for `targets`, creating any that are missing
///
/// Istio rules that do not exist are created in the Init role (all traffic
/// on baseline). A Knative service is never created here; target resolution
/// has already confirmed it exists.
pub async fn ensure_routing_state(
    store: &dyn RoutingStore,
    targets: &Targets,
) -> Result<RoutingState, StoreError> {
    match targets.platform {
        Platform::ServiceMesh => {
            let name = rule_name(&targets.service_name);
            let namespace = &targets.namespace;

            let destination_rule = match store.get_destination_rule(namespace, &name).await {
                Ok(rule) => rule,
                Err(e) if e.is_not_found() => {
                    info!(rule = %name, namespace = %namespace, "Creating DestinationRule");
                    store
                        .create_destination_rule(&init_destination_rule(targets))
                        .await?
                }
                Err(e) => return Err(e),
            };

            let virtual_service = match store.get_virtual_service(namespace, &name).await {
                Ok(vs) => vs,
                Err(e) if e.is_not_found() => {
                    info!(rule = %name, namespace = %namespace, "Creating VirtualService");
                    store
                        .create_virtual_service(&init_virtual_service(targets))
                        .await?
                }
                Err(e) => return Err(e),
            };

            Ok(RoutingState::Istio {
                destination_rule,
                virtual_service,
            })
        }
        Platform::Serverless => {
            let service = store
                .get_knative_service(&targets.namespace, &targets.service_name)
                .await?;
            Ok(RoutingState::Knative {
                service,
                baseline: targets.baseline.name.clone(),
                candidate: targets.candidate.name.clone(),
            })
        }
    }
}

/// Read the routing objects for `targets` without creating anything
///
/// Returns None when any of them is missing.
pub async fn load_routing_state(
    store: &dyn RoutingStore,
    targets: &Targets,
) -> Result<Option<RoutingState>, StoreError> {
    fn found<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
        match result {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    match targets.platform {
        Platform::ServiceMesh => {
            let name = rule_name(&targets.service_name);
            let namespace = &targets.namespace;
            let Some(destination_rule) =
                found(store.get_destination_rule(namespace, &name).await)?
            else {
                return Ok(None);
            };
            let Some(virtual_service) = found(store.get_virtual_service(namespace, &name).await)?
            else {
                return Ok(None);
            };
            Ok(Some(RoutingState::Istio {
                destination_rule,
                virtual_service,
            }))
        }
        Platform::Serverless => Ok(found(
            store
                .get_knative_service(&targets.namespace, &targets.service_name)
                .await,
        )?
        .map(|service| RoutingState::Knative {
            service,
            baseline: targets.baseline.name.clone(),
            candidate: targets.candidate.name.clone(),
        })),
    }
}

/// Write a state back, returning it with the server's resource versions
pub async fn persist(
    store: &dyn RoutingStore,
    state: RoutingState,
) -> Result<RoutingState, StoreError> {
    match state {
        RoutingState::Istio {
            destination_rule,
            virtual_service,
        } => {
            let destination_rule = store.replace_destination_rule(&destination_rule).await?;
            let virtual_service = store.replace_virtual_service(&virtual_service).await?;
            debug!(rule = %virtual_service.name_any(), "Routing rules updated");
            Ok(RoutingState::Istio {
                destination_rule,
                virtual_service,
            })
        }
        RoutingState::Knative {
            service,
            baseline,
            candidate,
        } => {
            let service = store.replace_knative_service(&service).await?;
            debug!(service = %service.name_any(), "Knative traffic updated");
            Ok(RoutingState::Knative {
                service,
                baseline,
                candidate,
            })
        }
    }
}

/// Delete controller-created rules; objects already gone are fine
pub async fn delete_rules(store: &dyn RoutingStore, state: &RoutingState) -> Result<(), StoreError> {
    let RoutingState::Istio {
        destination_rule,
        virtual_service,
    } = state
    else {
        return Ok(());
    };

    let namespace = destination_rule
        .namespace()
        .unwrap_or_else(|| "default".to_string());

    match store
        .delete_destination_rule(&namespace, &destination_rule.name_any())
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    match store
        .delete_virtual_service(&namespace, &virtual_service.name_any())
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    info!(rule = %virtual_service.name_any(), namespace = %namespace, "Routing rules deleted");
    Ok(())
}

#[cfg(test)]
#[path = "routing_test.rs"]
mod tests;
