//! Admission control for incoming requests.
//!
//! The [`AdmissionController`] runs the rate check and then the concurrency
//! check for a client. [`AdmissionLayer`] wires it into a tower/axum stack so
//! every request is admitted before the handler runs and its lease is released
//! when the handler finishes, fails, or is cancelled.

mod controller;
mod layer;
mod response;
mod service;

pub use controller::{
    Admission, AdmissionController, AdmissionStats, FailurePolicy, LeaseGuard, Rejection, StatsSnapshot,
};
pub use layer::AdmissionLayer;
pub use service::AdmissionService;
