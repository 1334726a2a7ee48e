//! Experiment ownership cache
//!
//! Maps target services and backends to the single experiment that owns
//! them. Three maps live behind one `parking_lot::RwLock`:
//!
//! - experiment key → shared abstract (liveness flags of its targets)
//! - service key → experiment key
//! - backend key → experiment key
//!
//! Every operation holds the lock for its whole duration and never awaits
//! while holding it. Liveness flags inside an abstract are atomics so that a
//! handle returned by `register` can be read without touching the lock.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::crd::experiment::Experiment;
use kube::ResourceExt;

/// Identity of an Experiment resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExperimentKey {
    pub name: String,
    pub namespace: String,
}

impl ExperimentKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        ExperimentKey {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn of(experiment: &Experiment) -> Self {
        ExperimentKey::new(
            experiment.name_any(),
            experiment.namespace().unwrap_or_else(|| "default".to_string()),
        )
    }
}

impl fmt::Display for ExperimentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// What an experiment claims: one service and its backends, in one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub namespace: String,
    pub service: String,
    pub backends: Vec<String>,
}

/// Live view of an experiment's targets, shared between the cache and callers
#[derive(Debug)]
pub struct ExperimentAbstract {
    pub namespace: String,
    pub service_name: String,
    service_found: AtomicBool,
    backends: HashMap<String, AtomicBool>,
}

impl ExperimentAbstract {
    fn new(claim: &Claim) -> Self {
        ExperimentAbstract {
            namespace: claim.namespace.clone(),
            service_name: claim.service.clone(),
            service_found: AtomicBool::new(false),
            backends: claim
                .backends
                .iter()
                .map(|b| (b.clone(), AtomicBool::new(false)))
                .collect(),
        }
    }

    pub fn service_found(&self) -> bool {
        self.service_found.load(Ordering::SeqCst)
    }

    pub fn backend_found(&self, name: &str) -> Option<bool> {
        self.backends.get(name).map(|f| f.load(Ordering::SeqCst))
    }

    pub fn backend_names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Whether this abstract was registered for exactly `claim`
    pub fn matches(&self, claim: &Claim) -> bool {
        self.namespace == claim.namespace
            && self.service_name == claim.service
            && self.backends.len() == claim.backends.len()
            && claim.backends.iter().all(|b| self.backends.contains_key(b))
    }
}

/// One row of the `/ownership` endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OwnershipEntry {
    pub experiment: String,
    #[serde(rename = "experimentNamespace")]
    pub experiment_namespace: String,
    pub namespace: String,
    pub service: String,
    #[serde(rename = "serviceFound")]
    pub service_found: bool,
    pub backends: BTreeMap<String, bool>,
}

#[derive(Default)]
struct Maps {
    abstracts: HashMap<ExperimentKey, Arc<ExperimentAbstract>>,
    services: HashMap<TargetKey, ExperimentKey>,
    backends: HashMap<TargetKey, ExperimentKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TargetKey {
    name: String,
    namespace: String,
}

impl TargetKey {
    fn new(name: &str, namespace: &str) -> Self {
        TargetKey {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

/// Concurrent ownership registry, cheap to clone
#[derive(Clone, Default)]
pub struct ExperimentCache {
    inner: Arc<RwLock<Maps>>,
}

impl ExperimentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an experiment's claim, or return the existing abstract
    ///
    /// Idempotent: a second call for the same key returns the same `Arc`
    /// and leaves the indexes untouched.
    pub fn register(&self, key: &ExperimentKey, claim: &Claim) -> Arc<ExperimentAbstract> {
        let mut maps = self.inner.write();
        Self::insert(&mut maps, key, claim)
    }

    /// Register unless another experiment already owns part of the claim
    ///
    /// The check and the insert happen under one write lock, so two
    /// experiments racing for the same backend cannot both win.
    ///
    /// # Returns
    /// * `Ok(abstract)` - claim registered (or already held by `key`)
    /// * `Err(owner)` - the experiment currently owning the service or a backend
    pub fn claim(
        &self,
        key: &ExperimentKey,
        claim: &Claim,
    ) -> Result<Arc<ExperimentAbstract>, ExperimentKey> {
        let mut maps = self.inner.write();

        let service = TargetKey::new(&claim.service, &claim.namespace);
        let backends = claim
            .backends
            .iter()
            .map(|b| TargetKey::new(b, &claim.namespace));

        let conflict = maps
            .services
            .get(&service)
            .into_iter()
            .chain(backends.filter_map(|b| maps.backends.get(&b)))
            .find(|owner| *owner != key)
            .cloned();

        match conflict {
            Some(owner) => Err(owner),
            None => Ok(Self::insert(&mut maps, key, claim)),
        }
    }

    fn insert(maps: &mut Maps, key: &ExperimentKey, claim: &Claim) -> Arc<ExperimentAbstract> {
        if let Some(existing) = maps.abstracts.get(key) {
            return existing.clone();
        }

        let entry = Arc::new(ExperimentAbstract::new(claim));
        maps.abstracts.insert(key.clone(), entry.clone());
        maps.services.insert(
            TargetKey::new(&claim.service, &claim.namespace),
            key.clone(),
        );
        for backend in &claim.backends {
            maps.backends
                .insert(TargetKey::new(backend, &claim.namespace), key.clone());
        }
        entry
    }

    pub fn resolve_by_backend(&self, name: &str, namespace: &str) -> Option<ExperimentKey> {
        self.inner
            .read()
            .backends
            .get(&TargetKey::new(name, namespace))
            .cloned()
    }

    pub fn resolve_by_service(&self, name: &str, namespace: &str) -> Option<ExperimentKey> {
        self.inner
            .read()
            .services
            .get(&TargetKey::new(name, namespace))
            .cloned()
    }

    pub fn get(&self, key: &ExperimentKey) -> Option<Arc<ExperimentAbstract>> {
        self.inner.read().abstracts.get(key).cloned()
    }

    /// Record whether a backend currently exists; false when nobody owns it
    pub fn mark_backend_found(&self, name: &str, namespace: &str, present: bool) -> bool {
        let maps = self.inner.read();
        let Some(owner) = maps.backends.get(&TargetKey::new(name, namespace)) else {
            return false;
        };
        match maps
            .abstracts
            .get(owner)
            .and_then(|a| a.backends.get(name))
        {
            Some(flag) => {
                flag.store(present, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Record whether the service currently exists; false when nobody owns it
    pub fn mark_service_found(&self, name: &str, namespace: &str, present: bool) -> bool {
        let maps = self.inner.read();
        let Some(owner) = maps.services.get(&TargetKey::new(name, namespace)) else {
            return false;
        };
        match maps.abstracts.get(owner) {
            Some(entry) => {
                entry.service_found.store(present, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Drop an experiment and every index pointing at it
    pub fn remove(&self, key: &ExperimentKey) {
        let mut maps = self.inner.write();
        let Some(entry) = maps.abstracts.remove(key) else {
            return;
        };

        let service = TargetKey::new(&entry.service_name, &entry.namespace);
        if maps.services.get(&service) == Some(key) {
            maps.services.remove(&service);
        }
        for backend in entry.backends.keys() {
            let target = TargetKey::new(backend, &entry.namespace);
            if maps.backends.get(&target) == Some(key) {
                maps.backends.remove(&target);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().abstracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ownership table sorted by experiment
    pub fn snapshot(&self) -> Vec<OwnershipEntry> {
        let maps = self.inner.read();
        let mut entries: Vec<OwnershipEntry> = maps
            .abstracts
            .iter()
            .map(|(key, entry)| OwnershipEntry {
                experiment: key.name.clone(),
                experiment_namespace: key.namespace.clone(),
                namespace: entry.namespace.clone(),
                service: entry.service_name.clone(),
                service_found: entry.service_found(),
                backends: entry
                    .backends
                    .iter()
                    .map(|(name, found)| (name.clone(), found.load(Ordering::SeqCst)))
                    .collect(),
            })
            .collect();
        entries.sort_by(|a, b| {
            (&a.experiment_namespace, &a.experiment).cmp(&(&b.experiment_namespace, &b.experiment))
        });
        entries
    }
}
