//! Experiment reconciliation
//!
//! - `validation`: spec checks that the CRD schema cannot express
//! - `reconcile`: one pass of the experiment state machine

pub mod reconcile;
pub mod validation;

pub use reconcile::*;
pub use validation::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "experiment_test.rs"]
mod tests;
