//! Cluster access behind traits
//!
//! The reconciler never talks to `kube::Api` directly. It goes through three
//! seams so tests can swap in an in-memory cluster:
//!
//! - `RoutingStore` - Istio rules and the Knative service traffic block
//! - `BackendPlatform` - core Services, Deployments, Knative Revisions
//! - `ExperimentStore` - status patches and the cleanup finalizer
//!
//! `KubeStore` implements all three on top of a `kube::Client`.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::crd::experiment::{Experiment, ExperimentStatus};
use crate::crd::istio::{DestinationRule, VirtualService};
use crate::crd::knative::{KnativeService, Revision};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("{kind} {namespace}/{name} was modified concurrently")]
    Conflict {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl StoreError {
    /// Map a kube error for a specific object, keeping 404/409 distinguishable
    pub fn from_kube(error: kube::Error, kind: &'static str, name: &str, namespace: &str) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 404 => StoreError::NotFound {
                kind,
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            kube::Error::Api(response) if response.code == 409 => StoreError::Conflict {
                kind,
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            _ => StoreError::Kube(error),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Finalizer that lets the controller restore routing before an Experiment disappears
pub const FINALIZER: &str = "kokeilu.io/routing-cleanup";

#[async_trait]
pub trait RoutingStore: Send + Sync {
    async fn get_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DestinationRule, StoreError>;
    async fn create_destination_rule(
        &self,
        rule: &DestinationRule,
    ) -> Result<DestinationRule, StoreError>;
    async fn replace_destination_rule(
        &self,
        rule: &DestinationRule,
    ) -> Result<DestinationRule, StoreError>;
    async fn delete_destination_rule(&self, namespace: &str, name: &str)
        -> Result<(), StoreError>;

    async fn get_virtual_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualService, StoreError>;
    async fn create_virtual_service(
        &self,
        service: &VirtualService,
    ) -> Result<VirtualService, StoreError>;
    async fn replace_virtual_service(
        &self,
        service: &VirtualService,
    ) -> Result<VirtualService, StoreError>;
    async fn delete_virtual_service(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn get_knative_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KnativeService, StoreError>;
    async fn replace_knative_service(
        &self,
        service: &KnativeService,
    ) -> Result<KnativeService, StoreError>;
}

#[async_trait]
pub trait BackendPlatform: Send + Sync {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError>;

    /// Deployments matching a label selector such as `app=reviews`
    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, StoreError>;

    async fn get_knative_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KnativeService, StoreError>;

    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Revision, StoreError>;
}

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Write `status` over the status `experiment` was read with
    ///
    /// Fields dropped since then are cleared. The resource version of
    /// `experiment` guards the write, so a pass working from a stale read
    /// fails with `StoreError::Conflict`.
    async fn patch_status(
        &self,
        experiment: &Experiment,
        status: &ExperimentStatus,
    ) -> Result<(), StoreError>;

    /// Replace the finalizer list; the resource version guards the write
    ///
    /// Returns the Experiment as stored, carrying its new resource version.
    async fn set_finalizers(
        &self,
        experiment: &Experiment,
        finalizers: Vec<String>,
    ) -> Result<Experiment, StoreError>;
}

/// Production implementation backed by the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }
}

/// JSON merge patch turning `old` into `new`
///
/// Keys present in `old` but absent from `new` are set to null so the
/// server drops them. Arrays and scalars are replaced whole.
pub fn merge_diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                let entry = match old.get(key) {
                    Some(previous) => merge_diff(previous, value),
                    None => value.clone(),
                };
                patch.insert(key.clone(), entry);
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Merge patch body for the status subresource
///
/// Carries the resource version the status was read at; the API server
/// rejects the patch with 409 once the object has moved on.
pub fn status_patch(
    experiment: &Experiment,
    status: &ExperimentStatus,
) -> Result<Value, serde_json::Error> {
    let new = serde_json::to_value(status)?;
    let body = match experiment.status.as_ref() {
        Some(previous) => merge_diff(&serde_json::to_value(previous)?, &new),
        None => new,
    };
    Ok(match &experiment.metadata.resource_version {
        Some(version) => json!({ "metadata": { "resourceVersion": version }, "status": body }),
        None => json!({ "status": body }),
    })
}

fn object_name<K: kube::Resource>(object: &K) -> (String, String) {
    let meta = object.meta();
    (
        meta.name.clone().unwrap_or_default(),
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
    )
}

#[async_trait]
impl RoutingStore for KubeStore {
    async fn get_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DestinationRule, StoreError> {
        let api: Api<DestinationRule> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, "DestinationRule", name, namespace))
    }

    async fn create_destination_rule(
        &self,
        rule: &DestinationRule,
    ) -> Result<DestinationRule, StoreError> {
        let (name, namespace) = object_name(rule);
        let api: Api<DestinationRule> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), rule)
            .await
            .map_err(|e| StoreError::from_kube(e, "DestinationRule", &name, &namespace))
    }

    async fn replace_destination_rule(
        &self,
        rule: &DestinationRule,
    ) -> Result<DestinationRule, StoreError> {
        let (name, namespace) = object_name(rule);
        let api: Api<DestinationRule> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), rule)
            .await
            .map_err(|e| StoreError::from_kube(e, "DestinationRule", &name, &namespace))
    }

    async fn delete_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let api: Api<DestinationRule> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, "DestinationRule", name, namespace))
    }

    async fn get_virtual_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualService, StoreError> {
        let api: Api<VirtualService> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, "VirtualService", name, namespace))
    }

    async fn create_virtual_service(
        &self,
        service: &VirtualService,
    ) -> Result<VirtualService, StoreError> {
        let (name, namespace) = object_name(service);
        let api: Api<VirtualService> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), service)
            .await
            .map_err(|e| StoreError::from_kube(e, "VirtualService", &name, &namespace))
    }

    async fn replace_virtual_service(
        &self,
        service: &VirtualService,
    ) -> Result<VirtualService, StoreError> {
        let (name, namespace) = object_name(service);
        let api: Api<VirtualService> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), service)
            .await
            .map_err(|e| StoreError::from_kube(e, "VirtualService", &name, &namespace))
    }

    async fn delete_virtual_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let api: Api<VirtualService> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, "VirtualService", name, namespace))
    }

    async fn get_knative_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KnativeService, StoreError> {
        let api: Api<KnativeService> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, "KnativeService", name, namespace))
    }

    async fn replace_knative_service(
        &self,
        service: &KnativeService,
    ) -> Result<KnativeService, StoreError> {
        let (name, namespace) = object_name(service);
        let api: Api<KnativeService> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), service)
            .await
            .map_err(|e| StoreError::from_kube(e, "KnativeService", &name, &namespace))
    }
}

#[async_trait]
impl BackendPlatform for KubeStore {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, "Service", name, namespace))
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, StoreError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| StoreError::from_kube(e, "Deployment", selector, namespace))?;
        Ok(list.items)
    }

    async fn get_knative_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KnativeService, StoreError> {
        RoutingStore::get_knative_service(self, namespace, name).await
    }

    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Revision, StoreError> {
        let api: Api<Revision> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube(e, "Revision", name, namespace))
    }
}

#[async_trait]
impl ExperimentStore for KubeStore {
    async fn patch_status(
        &self,
        experiment: &Experiment,
        status: &ExperimentStatus,
    ) -> Result<(), StoreError> {
        let (name, namespace) = object_name(experiment);
        let api: Api<Experiment> = Api::namespaced(self.client.clone(), &namespace);
        let body = status_patch(experiment, status)
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, "Experiment", &name, &namespace))
    }

    async fn set_finalizers(
        &self,
        experiment: &Experiment,
        finalizers: Vec<String>,
    ) -> Result<Experiment, StoreError> {
        let (name, namespace) = object_name(experiment);
        let api: Api<Experiment> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({
            "metadata": {
                "resourceVersion": experiment.metadata.resource_version,
                "finalizers": finalizers,
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, "Experiment", &name, &namespace))
    }
}
