//! Admission webhooks for ServiceBinding
//!
//! - [`gvk`]: the kinds bindings reference
//! - [`rules`]: folding those kinds into webhook rules
//! - [`controller`]: keeping the webhook configurations' rules in sync
//! - [`admission`]: the projector and trigger admission endpoints

#![deny(missing_docs)]

pub mod admission;
pub mod client;
pub mod configuration;
pub mod controller;
pub mod gvk;
pub mod rules;

#[cfg(test)]
mod testing;

pub use admission::{admission_router, AdmissionState};
pub use controller::{error_policy, reconcile_projector, reconcile_trigger, WebhookContext};
