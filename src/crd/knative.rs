//! Minimal Knative Serving types (serving.knative.dev/v1)

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Service",
    root = "KnativeService",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
pub struct KnativeServiceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficTarget>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TrafficTarget {
    #[serde(rename = "revisionName", skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<i64>,

    #[serde(rename = "latestRevision", skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl KnativeServiceSpec {
    pub fn traffic_for(&self, revision: &str) -> Option<&TrafficTarget> {
        self.traffic
            .iter()
            .find(|t| t.revision_name.as_deref() == Some(revision))
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Revision",
    namespaced,
    status = "RevisionStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
pub struct RevisionSpec {
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RevisionStatus {
    /// Core Service fronting this revision
    #[serde(rename = "serviceName", skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_knative_service_traffic_lookup() {
        let ksvc: KnativeService = serde_json::from_value(json!({
            "apiVersion": "serving.knative.dev/v1",
            "kind": "Service",
            "metadata": {"name": "helloworld", "namespace": "knative-demo"},
            "spec": {
                "template": {"spec": {"containers": [{"image": "hello:v2"}]}},
                "traffic": [
                    {"revisionName": "helloworld-00001", "percent": 100},
                    {"revisionName": "helloworld-00002", "percent": 0, "tag": "candidate"}
                ]
            }
        }))
        .unwrap();

        assert!(ksvc.spec.template.is_some());
        let candidate = ksvc.spec.traffic_for("helloworld-00002").unwrap();
        assert_eq!(candidate.percent, Some(0));
        assert_eq!(candidate.tag.as_deref(), Some("candidate"));
        assert!(ksvc.spec.traffic_for("helloworld-00003").is_none());
    }

    #[test]
    fn test_revision_status_service_name() {
        let revision: Revision = serde_json::from_value(json!({
            "apiVersion": "serving.knative.dev/v1",
            "kind": "Revision",
            "metadata": {"name": "helloworld-00001"},
            "spec": {"containers": []},
            "status": {"serviceName": "helloworld-00001", "observedGeneration": 1}
        }))
        .unwrap();

        assert_eq!(
            revision.status.and_then(|s| s.service_name).as_deref(),
            Some("helloworld-00001")
        );
    }

    #[test]
    fn test_knative_service_kind_and_equality() {
        use kube::Resource;

        assert_eq!(KnativeService::kind(&()), "Service");
        assert_eq!(KnativeService::api_version(&()), "serving.knative.dev/v1");

        let ksvc = KnativeService::new("helloworld", KnativeServiceSpec::default());
        let mut shifted = ksvc.clone();
        assert_eq!(ksvc, shifted);
        shifted.spec.traffic.push(TrafficTarget {
            revision_name: Some("helloworld-00002".to_string()),
            percent: Some(10),
            ..Default::default()
        });
        assert_ne!(ksvc, shifted);
    }
}
