//! In-memory cluster for controller tests
//!
//! Implements every store trait over plain maps. Each write bumps a global
//! resource version; a replace carrying a stale version fails with
//! `StoreError::Conflict` the way the API server would.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::Resource;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::platform::{BackendPlatform, ExperimentStore, RoutingStore, StoreError};
use crate::crd::experiment::{Experiment, ExperimentStatus};
use crate::crd::istio::{DestinationRule, VirtualService};
use crate::crd::knative::{KnativeService, Revision};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn meta_key<K: Resource>(object: &K) -> Key {
    key(
        object.meta().namespace.as_deref().unwrap_or("default"),
        object.meta().name.as_deref().unwrap_or_default(),
    )
}

#[derive(Default)]
pub struct FakeCluster {
    version: AtomicU64,
    pub destination_rules: Mutex<HashMap<Key, DestinationRule>>,
    pub virtual_services: Mutex<HashMap<Key, VirtualService>>,
    pub knative_services: Mutex<HashMap<Key, KnativeService>>,
    pub revisions: Mutex<HashMap<Key, Revision>>,
    pub services: Mutex<HashMap<Key, Service>>,
    pub deployments: Mutex<HashMap<Key, Deployment>>,
    pub statuses: Mutex<HashMap<Key, ExperimentStatus>>,
    pub finalizers: Mutex<HashMap<Key, Vec<String>>>,
    /// Resource version of each Experiment the controller has written
    pub experiment_versions: Mutex<HashMap<Key, String>>,
    /// Number of upcoming status patches that fail with a conflict
    pub conflicts_on_status: AtomicUsize,
    /// Number of upcoming VirtualService replaces that fail with a conflict
    pub conflicts_on_replace: AtomicUsize,
    /// Number of routing writes performed (create, replace, delete)
    pub routing_writes: AtomicUsize,
    pub status_patches: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp<K: Resource>(&self, object: &mut K) {
        object.meta_mut().resource_version = Some(self.next_version());
    }

    /// Core Service with a selector, e.g. `app=reviews`
    pub fn add_service(&self, namespace: &str, name: &str, selector: &[(&str, &str)]) {
        let selector: BTreeMap<String, String> = selector
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let service: Service = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": name, "namespace": namespace},
            "spec": {"selector": selector}
        }))
        .unwrap();
        self.services
            .lock()
            .unwrap()
            .insert(key(namespace, name), service);
    }

    /// Deployment whose pod template carries `labels`, created at `created` (RFC3339)
    pub fn add_deployment(
        &self,
        namespace: &str,
        name: &str,
        labels: &[(&str, &str)],
        created: &str,
    ) {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let deployment: Deployment = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": labels,
                "creationTimestamp": created
            },
            "spec": {
                "selector": {"matchLabels": labels},
                "template": {"metadata": {"labels": labels}}
            }
        }))
        .unwrap();
        self.deployments
            .lock()
            .unwrap()
            .insert(key(namespace, name), deployment);
    }

    pub fn remove_deployment(&self, namespace: &str, name: &str) {
        self.deployments
            .lock()
            .unwrap()
            .remove(&key(namespace, name));
    }

    pub fn add_knative_service(&self, mut service: KnativeService) {
        self.stamp(&mut service);
        let k = meta_key(&service);
        self.knative_services.lock().unwrap().insert(k, service);
    }

    pub fn add_revision(&self, namespace: &str, name: &str, service_name: Option<&str>) {
        let revision: Revision = serde_json::from_value(json!({
            "apiVersion": "serving.knative.dev/v1",
            "kind": "Revision",
            "metadata": {"name": name, "namespace": namespace},
            "spec": {},
            "status": {"serviceName": service_name}
        }))
        .unwrap();
        self.revisions
            .lock()
            .unwrap()
            .insert(key(namespace, name), revision);
    }

    pub fn destination_rule(&self, namespace: &str, name: &str) -> Option<DestinationRule> {
        self.destination_rules
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn virtual_service(&self, namespace: &str, name: &str) -> Option<VirtualService> {
        self.virtual_services
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn knative_service(&self, namespace: &str, name: &str) -> Option<KnativeService> {
        self.knative_services
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn status(&self, namespace: &str, name: &str) -> Option<ExperimentStatus> {
        self.statuses
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn experiment_version(&self, namespace: &str, name: &str) -> Option<String> {
        self.experiment_versions
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
    }

    /// Accept a write made from `experiment` and bump its resource version
    ///
    /// A read older than the last write fails with a conflict. Experiments
    /// never written here accept any version.
    fn bump_experiment(&self, experiment: &Experiment) -> Result<String, StoreError> {
        let k = meta_key(experiment);
        let mut versions = self.experiment_versions.lock().unwrap();
        if let (Some(read), Some(current)) =
            (experiment.meta().resource_version.as_ref(), versions.get(&k))
        {
            if read != current {
                return Err(StoreError::Conflict {
                    kind: "Experiment",
                    name: k.1,
                    namespace: k.0,
                });
            }
        }
        let version = self.next_version();
        versions.insert(k, version.clone());
        Ok(version)
    }

    pub fn status_writes(&self) -> usize {
        self.status_patches.load(Ordering::SeqCst)
    }

    pub fn routing_writes(&self) -> usize {
        self.routing_writes.load(Ordering::SeqCst)
    }

    fn get_object<K: Clone>(
        map: &Mutex<HashMap<Key, K>>,
        kind: &'static str,
        namespace: &str,
        name: &str,
    ) -> Result<K, StoreError> {
        map.lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    fn create_object<K: Resource + Clone>(
        &self,
        map: &Mutex<HashMap<Key, K>>,
        kind: &'static str,
        object: &K,
    ) -> Result<K, StoreError> {
        let k = meta_key(object);
        let mut map = map.lock().unwrap();
        if map.contains_key(&k) {
            return Err(StoreError::Conflict {
                kind,
                name: k.1,
                namespace: k.0,
            });
        }
        let mut stored = object.clone();
        self.stamp(&mut stored);
        map.insert(k, stored.clone());
        self.routing_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    fn replace_object<K: Resource + Clone>(
        &self,
        map: &Mutex<HashMap<Key, K>>,
        kind: &'static str,
        object: &K,
    ) -> Result<K, StoreError> {
        let k = meta_key(object);
        let mut map = map.lock().unwrap();
        let current = map.get(&k).ok_or_else(|| StoreError::NotFound {
            kind,
            name: k.1.clone(),
            namespace: k.0.clone(),
        })?;
        if object.meta().resource_version.is_some()
            && object.meta().resource_version != current.meta().resource_version
        {
            return Err(StoreError::Conflict {
                kind,
                name: k.1,
                namespace: k.0,
            });
        }
        let mut stored = object.clone();
        self.stamp(&mut stored);
        map.insert(k, stored.clone());
        self.routing_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    fn delete_object<K>(
        &self,
        map: &Mutex<HashMap<Key, K>>,
        kind: &'static str,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        match map.lock().unwrap().remove(&key(namespace, name)) {
            Some(_) => {
                self.routing_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind,
                name: name.to_string(),
                namespace: namespace.to_string(),
            }),
        }
    }
}

#[async_trait]
impl RoutingStore for FakeCluster {
    async fn get_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DestinationRule, StoreError> {
        Self::get_object(&self.destination_rules, "DestinationRule", namespace, name)
    }

    async fn create_destination_rule(
        &self,
        rule: &DestinationRule,
    ) -> Result<DestinationRule, StoreError> {
        self.create_object(&self.destination_rules, "DestinationRule", rule)
    }

    async fn replace_destination_rule(
        &self,
        rule: &DestinationRule,
    ) -> Result<DestinationRule, StoreError> {
        self.replace_object(&self.destination_rules, "DestinationRule", rule)
    }

    async fn delete_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.delete_object(&self.destination_rules, "DestinationRule", namespace, name)
    }

    async fn get_virtual_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualService, StoreError> {
        Self::get_object(&self.virtual_services, "VirtualService", namespace, name)
    }

    async fn create_virtual_service(
        &self,
        service: &VirtualService,
    ) -> Result<VirtualService, StoreError> {
        self.create_object(&self.virtual_services, "VirtualService", service)
    }

    async fn replace_virtual_service(
        &self,
        service: &VirtualService,
    ) -> Result<VirtualService, StoreError> {
        let pending = self.conflicts_on_replace.load(Ordering::SeqCst);
        if pending > 0 {
            self.conflicts_on_replace.store(pending - 1, Ordering::SeqCst);
            // someone else wrote first
            let k = meta_key(service);
            if let Some(current) = self.virtual_services.lock().unwrap().get_mut(&k) {
                current.meta_mut().resource_version = Some(self.next_version());
            }
            return Err(StoreError::Conflict {
                kind: "VirtualService",
                name: k.1,
                namespace: k.0,
            });
        }
        self.replace_object(&self.virtual_services, "VirtualService", service)
    }

    async fn delete_virtual_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.delete_object(&self.virtual_services, "VirtualService", namespace, name)
    }

    async fn get_knative_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KnativeService, StoreError> {
        Self::get_object(&self.knative_services, "KnativeService", namespace, name)
    }

    async fn replace_knative_service(
        &self,
        service: &KnativeService,
    ) -> Result<KnativeService, StoreError> {
        self.replace_object(&self.knative_services, "KnativeService", service)
    }
}

#[async_trait]
impl BackendPlatform for FakeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError> {
        Self::get_object(&self.services, "Service", namespace, name)
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, StoreError> {
        let wanted: Vec<(&str, &str)> = selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();

        let deployments = self.deployments.lock().unwrap();
        let mut matching: Vec<Deployment> = deployments
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, d)| {
                let labels = d
                    .spec
                    .as_ref()
                    .and_then(|s| s.template.metadata.as_ref())
                    .and_then(|m| m.labels.as_ref());
                wanted.iter().all(|(k, v)| {
                    labels.and_then(|l| l.get(*k)).map(String::as_str) == Some(*v)
                })
            })
            .map(|(_, d)| d.clone())
            .collect();
        matching.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(matching)
    }

    async fn get_knative_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KnativeService, StoreError> {
        Self::get_object(&self.knative_services, "KnativeService", namespace, name)
    }

    async fn get_revision(&self, namespace: &str, name: &str) -> Result<Revision, StoreError> {
        Self::get_object(&self.revisions, "Revision", namespace, name)
    }
}

#[async_trait]
impl ExperimentStore for FakeCluster {
    async fn patch_status(
        &self,
        experiment: &Experiment,
        status: &ExperimentStatus,
    ) -> Result<(), StoreError> {
        let pending = self.conflicts_on_status.load(Ordering::SeqCst);
        if pending > 0 {
            self.conflicts_on_status.store(pending - 1, Ordering::SeqCst);
            let k = meta_key(experiment);
            return Err(StoreError::Conflict {
                kind: "Experiment",
                name: k.1,
                namespace: k.0,
            });
        }
        self.bump_experiment(experiment)?;
        self.status_patches.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .insert(meta_key(experiment), status.clone());
        Ok(())
    }

    async fn set_finalizers(
        &self,
        experiment: &Experiment,
        finalizers: Vec<String>,
    ) -> Result<Experiment, StoreError> {
        let version = self.bump_experiment(experiment)?;
        self.finalizers
            .lock()
            .unwrap()
            .insert(meta_key(experiment), finalizers.clone());
        let mut stored = experiment.clone();
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(version);
        Ok(stored)
    }
}
