//! ServiceBinding controller
//!
//! Resolves a binding's service to a Secret, resolves its workloads, and
//! projects the Secret into every workload's pod template:
//! - [`resolver`]: service and workload reference resolution
//! - [`projector`]: the projection contract and the default pod-template projector
//! - [`pipeline`]: the four ordered reconcile stages
//! - [`controller`]: finalizer handling, status writes and the reconcile entry point

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod pipeline;
pub mod projector;
pub mod resolver;

#[cfg(test)]
mod testing;

pub use controller::{error_policy, reconcile, BindingContext};
pub use projector::{PodTemplateProjector, Projector};
