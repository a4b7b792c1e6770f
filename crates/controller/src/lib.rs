//! Replicon controller: reconciliation pass, mutation executor and the
//! worker-pool Driver that feeds it.

#![forbid(unsafe_code)]

pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod queue;
pub mod reconcile;

pub use config::ControllerConfig;
pub use driver::Driver;
pub use error::ReconcileError;
pub use executor::MutationExecutor;
pub use queue::WorkQueue;
pub use reconcile::{PassResult, Reconciler};
