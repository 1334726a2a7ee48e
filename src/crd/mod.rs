pub mod condition;
pub mod experiment;
pub mod istio;
pub mod knative;
