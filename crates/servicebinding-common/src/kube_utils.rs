//! Small helpers over kube-rs types: API version parsing, dynamic API
//! resources and label selector conversion.

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::api::{ApiResource, GroupVersionKind};
use kube::core::Selector;

use crate::crd::LabelSelector;
use crate::{Error, Result};

/// Split an apiVersion into (group, version). Core resources have an empty group.
///
/// # Examples
///
/// ```
/// use servicebinding_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Format a group/version pair back into an apiVersion string
pub fn format_api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    }
}

/// Build an `ApiResource` for a kind whose plural resource name is known
pub fn build_api_resource(gvk: &GroupVersionKind, plural: &str) -> ApiResource {
    ApiResource {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        api_version: format_api_version(&gvk.group, &gvk.version),
        kind: gvk.kind.clone(),
        plural: plural.to_string(),
    }
}

/// Convert a binding's selector into a kube [`Selector`].
///
/// Unknown operators, and `In`/`NotIn` without values, are rejected instead
/// of being dropped from the selection. The result renders the API server's
/// query syntax through `Display` and is evaluated with
/// [`SelectorExt::matches`](kube::core::SelectorExt::matches).
pub fn to_selector(selector: &LabelSelector) -> Result<Selector> {
    let native = metav1::LabelSelector {
        match_labels: Some(selector.match_labels.clone()),
        match_expressions: Some(
            selector
                .match_expressions
                .iter()
                .map(|req| metav1::LabelSelectorRequirement {
                    key: req.key.clone(),
                    operator: req.operator.clone(),
                    values: (!req.values.is_empty()).then(|| req.values.clone()),
                })
                .collect(),
        ),
    };

    Selector::try_from(native)
        .map_err(|e| Error::internal(format!("invalid label selector: {e}")))
}
