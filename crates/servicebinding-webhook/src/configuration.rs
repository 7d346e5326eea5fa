//! Uniform access to the rules of one entry in a mutating or validating
//! webhook configuration

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, RuleWithOperations, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};

/// A webhook configuration of either admission type
#[derive(Clone, Debug, PartialEq)]
pub enum WebhookConfiguration {
    /// Configuration of mutating webhooks
    Mutating(MutatingWebhookConfiguration),
    /// Configuration of validating webhooks
    Validating(ValidatingWebhookConfiguration),
}

impl WebhookConfiguration {
    /// Kubernetes kind of the wrapped configuration
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mutating(_) => "MutatingWebhookConfiguration",
            Self::Validating(_) => "ValidatingWebhookConfiguration",
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::Mutating(c) => c.name_any(),
            Self::Validating(c) => c.name_any(),
        }
    }

    /// Rules of the named webhook entry; `None` when there is no such entry
    pub fn rules(&self, webhook: &str) -> Option<Vec<RuleWithOperations>> {
        match self {
            Self::Mutating(c) => c
                .webhooks
                .iter()
                .flatten()
                .find(|w| w.name == webhook)
                .map(|w| w.rules.clone().unwrap_or_default()),
            Self::Validating(c) => c
                .webhooks
                .iter()
                .flatten()
                .find(|w| w.name == webhook)
                .map(|w| w.rules.clone().unwrap_or_default()),
        }
    }

    /// Replace the rules of the named webhook entry.
    ///
    /// Returns false when there is no such entry.
    pub fn set_rules(&mut self, webhook: &str, rules: Vec<RuleWithOperations>) -> bool {
        let slot = match self {
            Self::Mutating(c) => c
                .webhooks
                .iter_mut()
                .flatten()
                .find(|w| w.name == webhook)
                .map(|w| &mut w.rules),
            Self::Validating(c) => c
                .webhooks
                .iter_mut()
                .flatten()
                .find(|w| w.name == webhook)
                .map(|w| &mut w.rules),
        };
        match slot {
            Some(slot) => {
                *slot = Some(rules);
                true
            }
            None => false,
        }
    }

    /// Reference used to attach events
    pub fn object_ref(&self) -> ObjectReference {
        match self {
            Self::Mutating(c) => c.object_ref(&()),
            Self::Validating(c) => c.object_ref(&()),
        }
    }
}
