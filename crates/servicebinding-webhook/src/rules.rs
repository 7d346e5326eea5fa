//! Webhook rule synthesis
//!
//! Observed kinds are mapped to REST resources and folded into one rule per
//! API group. Versions are not tracked: every rule matches `*` so that all
//! served versions of a resource are intercepted. Output is sorted by group
//! and by resource, so the same cluster state always yields the same rules.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;
use kube::api::GroupVersionKind;

use servicebinding_common::{ResourceMapper, Result};

/// Operations intercepted by the projector webhook
pub const PROJECTOR_OPERATIONS: &[&str] = &["CREATE", "UPDATE"];

/// Operations intercepted by the trigger webhook
pub const TRIGGER_OPERATIONS: &[&str] = &["CREATE", "UPDATE", "DELETE"];

/// Scope the API server fills in when a rule leaves it unset
const DEFAULT_SCOPE: &str = "*";

/// Fold `(group, resource)` pairs into one rule per group.
pub fn merge_rules<I>(resources: I, operations: &[&str]) -> Vec<RuleWithOperations>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (group, resource) in resources {
        groups.entry(group).or_default().insert(resource);
    }

    groups
        .into_iter()
        .map(|(group, resources)| RuleWithOperations {
            api_groups: Some(vec![group]),
            api_versions: Some(vec!["*".to_string()]),
            operations: Some(operations.iter().map(|op| op.to_string()).collect()),
            resources: Some(resources.into_iter().collect()),
            scope: None,
        })
        .collect()
}

/// Map every kind to its resource and merge the result into rules.
///
/// A kind that cannot be mapped fails the whole synthesis.
pub async fn webhook_rules(
    mapper: &dyn ResourceMapper,
    gvks: &[GroupVersionKind],
    operations: &[&str],
) -> Result<Vec<RuleWithOperations>> {
    let mut resources = Vec::with_capacity(gvks.len());
    for gvk in gvks {
        let ar = mapper.resolve(gvk).await?;
        resources.push((ar.group, ar.plural));
    }
    Ok(merge_rules(resources, operations))
}

/// Compare rule lists, treating an unset scope as the server default
pub fn rules_equal(stored: &[RuleWithOperations], desired: &[RuleWithOperations]) -> bool {
    let normalize = |rule: &RuleWithOperations| RuleWithOperations {
        scope: Some(
            rule.scope
                .clone()
                .unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
        ),
        ..rule.clone()
    };
    stored.len() == desired.len()
        && stored
            .iter()
            .zip(desired)
            .all(|(a, b)| normalize(a) == normalize(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMapper;
    use servicebinding_common::kube_utils::build_api_resource;
    use servicebinding_common::Error;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(g, r)| (g.to_string(), r.to_string()))
            .collect()
    }

    fn plural_mapper() -> MockMapper {
        let mut mapper = MockMapper::new();
        mapper.expect_resolve().returning(|gvk| match gvk.kind.as_str() {
            "Deployment" => Ok(build_api_resource(gvk, "deployments")),
            "StatefulSet" => Ok(build_api_resource(gvk, "statefulsets")),
            "MyService" => Ok(build_api_resource(gvk, "myservices")),
            other => Err(Error::mapping(&gvk.group, &gvk.version, other, "no matches for kind")),
        });
        mapper
    }

    mod merge {
        use super::*;

        #[test]
        fn one_rule_per_group() {
            let rules = merge_rules(
                pairs(&[("apps", "statefulsets"), ("apps", "deployments")]),
                PROJECTOR_OPERATIONS,
            );

            assert_eq!(rules.len(), 1);
            assert_eq!(rules[0].api_groups, Some(vec!["apps".to_string()]));
            assert_eq!(rules[0].api_versions, Some(vec!["*".to_string()]));
            assert_eq!(
                rules[0].resources,
                Some(vec!["deployments".to_string(), "statefulsets".to_string()])
            );
            assert_eq!(
                rules[0].operations,
                Some(vec!["CREATE".to_string(), "UPDATE".to_string()])
            );
        }

        #[test]
        fn input_order_does_not_matter() {
            let forward = merge_rules(
                pairs(&[
                    ("example", "myservices"),
                    ("apps", "deployments"),
                    ("", "pods"),
                    ("apps", "deployments"),
                ]),
                TRIGGER_OPERATIONS,
            );
            let backward = merge_rules(
                pairs(&[
                    ("apps", "deployments"),
                    ("", "pods"),
                    ("example", "myservices"),
                ]),
                TRIGGER_OPERATIONS,
            );

            assert_eq!(forward, backward);
            let groups: Vec<String> = forward
                .iter()
                .flat_map(|r| r.api_groups.clone().unwrap_or_default())
                .collect();
            assert_eq!(groups, vec!["", "apps", "example"]);
        }

        #[test]
        fn nothing_observed_yields_no_rules() {
            assert!(merge_rules(Vec::new(), PROJECTOR_OPERATIONS).is_empty());
        }
    }

    mod synthesis {
        use super::*;

        #[tokio::test]
        async fn deployments_and_statefulsets_share_a_rule() {
            let gvks = vec![
                GroupVersionKind::gvk("apps", "v1", "Deployment"),
                GroupVersionKind::gvk("apps", "v1", "StatefulSet"),
            ];

            let rules = webhook_rules(&plural_mapper(), &gvks, TRIGGER_OPERATIONS)
                .await
                .expect("synthesis should succeed");

            assert_eq!(rules.len(), 1);
            assert_eq!(
                rules[0].resources,
                Some(vec!["deployments".to_string(), "statefulsets".to_string()])
            );
        }

        #[tokio::test]
        async fn unmappable_kind_fails_everything() {
            let gvks = vec![
                GroupVersionKind::gvk("apps", "v1", "Deployment"),
                GroupVersionKind::gvk("example", "v1", "Unknown"),
            ];

            let result = webhook_rules(&plural_mapper(), &gvks, TRIGGER_OPERATIONS).await;
            assert!(matches!(result, Err(Error::Mapping { .. })));
        }
    }

    mod comparison {
        use super::*;

        #[test]
        fn server_defaulted_scope_is_equal() {
            let desired = merge_rules(pairs(&[("apps", "deployments")]), PROJECTOR_OPERATIONS);
            let mut stored = desired.clone();
            stored[0].scope = Some("*".to_string());

            assert!(rules_equal(&stored, &desired));
        }

        #[test]
        fn different_resources_differ() {
            let desired = merge_rules(pairs(&[("apps", "deployments")]), PROJECTOR_OPERATIONS);
            let stored = merge_rules(pairs(&[("apps", "statefulsets")]), PROJECTOR_OPERATIONS);

            assert!(!rules_equal(&stored, &desired));
            assert!(!rules_equal(&[], &desired));
        }
    }
}
