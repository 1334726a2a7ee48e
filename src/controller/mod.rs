pub mod analytics;
pub mod cache;
pub mod clock;
pub mod experiment;
pub mod platform;
pub mod rollout;
pub mod routing;
pub mod targets;

#[cfg(test)]
pub mod testing;

pub use experiment::{error_policy, reconcile, Context, ReconcileError};
