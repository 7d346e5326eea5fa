//! ServiceBinding CRD
//!
//! A ServiceBinding connects a provisioned service (or a plain Secret) to one
//! or more workloads. The controller resolves the service to a binding
//! Secret and projects that Secret into the workloads' pod templates.
//!
//! Example:
//! ```yaml
//! apiVersion: servicebinding.io/v1beta1
//! kind: ServiceBinding
//! metadata:
//!   name: account-db
//!   namespace: default
//! spec:
//!   service:
//!     apiVersion: db.example.com/v1
//!     kind: PostgresCluster
//!     name: accounts
//!   workload:
//!     apiVersion: apps/v1
//!     kind: Deployment
//!     selector:
//!       matchLabels:
//!         app: accounts
//!   env:
//!     - name: DATABASE_URL
//!       key: url
//! ```

use std::collections::BTreeMap;

use kube::api::GroupVersionKind;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;
use crate::kube_utils::parse_api_version;

/// Desired state of a ServiceBinding
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "servicebinding.io",
    version = "v1beta1",
    kind = "ServiceBinding",
    namespaced,
    status = "ServiceBindingStatus",
    shortname = "sb",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".status.binding.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Name of the binding as seen by the workload (mount directory).
    /// Defaults to the resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Overrides the `type` entry of the projected binding
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    /// Overrides the `provider` entry of the projected binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// The workload(s) receiving the binding
    pub workload: WorkloadReference,

    /// The service exposing the binding Secret
    pub service: ServiceReference,

    /// Environment variables sourced from keys of the binding Secret
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvMapping>,
}

/// Reference to a provisioned service or to a Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    /// API version of the referent
    pub api_version: String,
    /// Kind of the referent
    pub kind: String,
    /// Name of the referent, in the binding's namespace
    pub name: String,
}

impl ServiceReference {
    /// Group/version/kind of the referent
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = parse_api_version(&self.api_version);
        GroupVersionKind::gvk(&group, &version, &self.kind)
    }

    /// True when the service is a core Secret rather than a provisioned service
    pub fn is_direct_secret(&self) -> bool {
        let (group, _) = parse_api_version(&self.api_version);
        group.is_empty() && self.kind == "Secret"
    }
}

/// Reference to the workload(s) a binding is projected into
///
/// Exactly one of `name` and `selector` is expected to be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    /// API version of the referent
    pub api_version: String,
    /// Kind of the referent
    pub kind: String,
    /// Name of a single workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Label selector matching zero or more workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

impl WorkloadReference {
    /// Group/version/kind of the referent
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = parse_api_version(&self.api_version);
        GroupVersionKind::gvk(&group, &version, &self.kind)
    }
}

/// Kubernetes label selector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels that must be present with exactly these values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements, all of which must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// A single set-based label requirement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// Label key
    pub key: String,
    /// One of In, NotIn, Exists, DoesNotExist
    pub operator: String,
    /// Values for In and NotIn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Maps a key of the binding Secret to an environment variable
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvMapping {
    /// Environment variable name
    pub name: String,
    /// Key in the binding Secret
    pub key: String,
}

/// Name of the resolved binding Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    /// Secret name, in the binding's namespace
    pub name: String,
}

/// Observed state of a ServiceBinding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Ready, ServiceAvailable and WorkloadProjected conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// The resolved binding Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<SecretReference>,
}

impl ServiceBinding {
    /// Name under which the binding is projected into workloads
    pub fn binding_name(&self) -> String {
        self.spec
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| self.metadata.name.clone())
            .unwrap_or_default()
    }

    /// Name of the resolved binding Secret, if resolution has succeeded
    pub fn secret_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.binding.as_ref())
            .map(|b| b.name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// True once a deletion timestamp has been set
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True if the binding carries the given finalizer
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}
