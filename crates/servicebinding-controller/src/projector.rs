//! Workload projection
//!
//! [`Projector`] is the contract the pipeline consumes: `project` injects a
//! binding into a workload, `unproject` removes it again. The pipeline only
//! compares the result with the original, so any projector honoring
//! `unproject(project(w)) == w` can be plugged in.
//!
//! [`PodTemplateProjector`] is the default. It edits the workload's pod
//! template:
//! - a projected volume `servicebinding-<binding uid>` sourcing the Secret,
//!   plus `type`/`provider` entries through the downward API
//! - a read-only mount at `$SERVICE_BINDING_ROOT/<binding name>` in every
//!   container and init container
//! - `SERVICE_BINDING_ROOT` when the container does not set it
//! - the binding's `env` mappings as `secretKeyRef` variables, except where
//!   the container already defines a variable of that name
//! - bookkeeping annotations under `projector.servicebinding.io/`
//!
//! Unprojection only removes what the bookkeeping says the projector added,
//! so values and empty fields the workload carried before are left alone.

use std::collections::{BTreeMap, BTreeSet};

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[cfg(test)]
use mockall::automock;

use servicebinding_common::crd::ServiceBinding;
use servicebinding_common::{Error, Result};

/// Environment variable pointing at the directory holding all bindings
pub const SERVICE_BINDING_ROOT: &str = "SERVICE_BINDING_ROOT";

/// Value of `SERVICE_BINDING_ROOT` when the container does not set one
pub const DEFAULT_BINDING_ROOT: &str = "/bindings";

/// Prefix of every volume created by the projector
pub const VOLUME_PREFIX: &str = "servicebinding-";

/// Prefix of every pod template annotation created by the projector
pub const ANNOTATION_PREFIX: &str = "projector.servicebinding.io";

/// Pod template locations, tried in order (CronJob nests one level deeper)
const TEMPLATE_POINTERS: [&str; 2] = ["/spec/template", "/spec/jobTemplate/spec/template"];

const CONTAINER_LISTS: [&str; 2] = ["initContainers", "containers"];

const CONTAINER_FIELDS: [&str; 2] = ["env", "volumeMounts"];

/// Injects binding data into workloads and removes it again
#[cfg_attr(test, automock)]
pub trait Projector: Send + Sync {
    /// Apply the binding to the workload in place
    fn project(&self, binding: &ServiceBinding, workload: &mut DynamicObject) -> Result<()>;

    /// Remove everything `project` added for this binding
    fn unproject(&self, binding: &ServiceBinding, workload: &mut DynamicObject) -> Result<()>;
}

/// Projects bindings into a workload's pod template
#[derive(Clone, Copy, Debug, Default)]
pub struct PodTemplateProjector;

impl PodTemplateProjector {
    /// Create the default projector
    pub fn new() -> Self {
        Self
    }
}

/// Bookkeeping shared by every binding projected into one pod template
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
struct TemplateState {
    /// Fields that did not exist before projection
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    created: BTreeSet<String>,
    /// Containers whose `SERVICE_BINDING_ROOT` was injected
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    root: BTreeSet<String>,
}

impl TemplateState {
    fn is_empty(&self) -> bool {
        self.created.is_empty() && self.root.is_empty()
    }
}

/// Env variable names a binding owns, per container name
type OwnedEnv = BTreeMap<String, BTreeSet<String>>;

/// Name of the volume holding the given binding
pub fn volume_name(binding: &ServiceBinding) -> String {
    format!("{VOLUME_PREFIX}{}", binding_key(binding))
}

fn binding_key(binding: &ServiceBinding) -> String {
    binding
        .uid()
        .filter(|uid| !uid.is_empty())
        .unwrap_or_else(|| binding.name_any())
}

fn annotation_key(field: &str, key: &str) -> String {
    format!("{ANNOTATION_PREFIX}/{field}-{key}")
}

fn state_annotation() -> String {
    format!("{ANNOTATION_PREFIX}/state")
}

fn created_marker(field: &str, container: &str) -> String {
    format!("{field}:{container}")
}

fn entry_name(value: &Value) -> Option<&str> {
    value.get("name").and_then(Value::as_str)
}

/// Container names are unique across init and regular containers
fn container_id(container: &Map<String, Value>) -> Option<String> {
    container.get("name").and_then(Value::as_str).map(str::to_string)
}

fn object_entry<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
) -> Option<&'a mut Map<String, Value>> {
    parent
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

fn array_entry<'a>(parent: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Vec<Value>> {
    parent
        .entry(key)
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
}

/// Note `field` as created when the parent does not carry it yet
fn track_created(
    parent: &Map<String, Value>,
    field: &str,
    marker: String,
    state: &mut TemplateState,
) {
    if !parent.contains_key(field) {
        state.created.insert(marker);
    }
}

/// Drop a field the projector created once nothing is left in it
fn remove_if_created(
    parent: &mut Map<String, Value>,
    field: &str,
    marker: &str,
    state: &mut TemplateState,
) {
    let empty = match parent.get(field) {
        Some(Value::Array(list)) => list.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        _ => false,
    };
    if empty && state.created.remove(marker) {
        parent.remove(field);
    }
}

/// Replace the entry with the same `name`, or append
fn upsert_named(list: &mut Vec<Value>, item: Value) {
    match list
        .iter_mut()
        .find(|existing| entry_name(existing) == entry_name(&item))
    {
        Some(existing) => *existing = item,
        None => list.push(item),
    }
}

fn set_annotation(annotations: &mut Map<String, Value>, key: String, value: Option<&str>) {
    match value {
        Some(v) => {
            annotations.insert(key, Value::String(v.to_string()));
        }
        None => {
            annotations.remove(&key);
        }
    }
}

/// Decode a JSON annotation; unreadable bookkeeping owns nothing
fn decode<T: DeserializeOwned + Default>(value: Option<&Value>) -> T {
    value
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

/// Store a JSON annotation, removing it when there is nothing to record
fn encode<T: Serialize>(
    annotations: &mut Map<String, Value>,
    key: String,
    value: &T,
    empty: bool,
) {
    let encoded = (!empty)
        .then(|| serde_json::to_string(value).ok())
        .flatten();
    set_annotation(annotations, key, encoded.as_deref());
}

fn annotations_mut(template: &mut Map<String, Value>) -> Option<&mut Map<String, Value>> {
    template
        .get_mut("metadata")
        .and_then(Value::as_object_mut)?
        .get_mut("annotations")
        .and_then(Value::as_object_mut)
}

fn pod_template_mut<'a>(
    workload: &'a mut DynamicObject,
    workload_name: &str,
) -> Result<&'a mut Map<String, Value>> {
    let pointer = TEMPLATE_POINTERS
        .iter()
        .copied()
        .find(|p| workload.data.pointer(p).is_some_and(Value::is_object))
        .ok_or_else(|| Error::projection(workload_name, "workload has no pod template"))?;

    workload
        .data
        .pointer_mut(pointer)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::projection(workload_name, "workload has no pod template"))
}

fn projected_volume(binding: &ServiceBinding, key: &str, secret: &str) -> Value {
    let mut sources = vec![json!({ "secret": { "name": secret } })];

    let items: Vec<Value> = [
        ("type", binding.spec.type_.is_some()),
        ("provider", binding.spec.provider.is_some()),
    ]
    .into_iter()
    .filter(|(_, set)| *set)
    .map(|(field, _)| {
        json!({
            "path": field,
            "fieldRef": {
                "fieldPath": format!("metadata.annotations['{}']", annotation_key(field, key))
            }
        })
    })
    .collect();
    if !items.is_empty() {
        sources.push(json!({ "downwardAPI": { "items": items } }));
    }

    json!({
        "name": format!("{VOLUME_PREFIX}{key}"),
        "projected": { "sources": sources }
    })
}

/// Project into one container, returning the env names the binding now owns
fn project_container(
    container: &mut Map<String, Value>,
    id: &str,
    binding: &ServiceBinding,
    volume: &str,
    secret: &str,
    previous: &BTreeSet<String>,
    state: &mut TemplateState,
) -> Option<BTreeSet<String>> {
    for field in CONTAINER_FIELDS {
        track_created(container, field, created_marker(field, id), state);
    }
    let env = array_entry(container, "env")?;

    let root = match env
        .iter()
        .find(|e| entry_name(e) == Some(SERVICE_BINDING_ROOT))
    {
        Some(existing) => existing
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_BINDING_ROOT)
            .to_string(),
        None => {
            env.push(json!({ "name": SERVICE_BINDING_ROOT, "value": DEFAULT_BINDING_ROOT }));
            state.root.insert(id.to_string());
            DEFAULT_BINDING_ROOT.to_string()
        }
    };

    // mappings dropped from the binding since the last projection
    env.retain(|e| {
        let name = entry_name(e).unwrap_or_default();
        !(previous.contains(name) && !binding.spec.env.iter().any(|m| m.name == name))
    });

    let mut owned = BTreeSet::new();
    for mapping in &binding.spec.env {
        let defined_elsewhere = !previous.contains(&mapping.name)
            && env.iter().any(|e| entry_name(e) == Some(mapping.name.as_str()));
        if defined_elsewhere {
            continue;
        }
        upsert_named(
            env,
            json!({
                "name": mapping.name,
                "valueFrom": { "secretKeyRef": { "name": secret, "key": mapping.key } }
            }),
        );
        owned.insert(mapping.name.clone());
    }

    let mount_path = format!(
        "{}/{}",
        root.trim_end_matches('/'),
        binding.binding_name()
    );
    let mounts = array_entry(container, "volumeMounts")?;
    upsert_named(
        mounts,
        json!({ "name": volume, "mountPath": mount_path, "readOnly": true }),
    );
    Some(owned)
}

fn unproject_container(
    container: &mut Map<String, Value>,
    id: &str,
    volume: &str,
    owned: Option<&BTreeSet<String>>,
    state: &mut TemplateState,
) {
    if let Some(mounts) = container
        .get_mut("volumeMounts")
        .and_then(Value::as_array_mut)
    {
        mounts.retain(|m| entry_name(m) != Some(volume));
    }

    let still_bound = container
        .get("volumeMounts")
        .and_then(Value::as_array)
        .is_some_and(|mounts| {
            mounts
                .iter()
                .filter_map(entry_name)
                .any(|n| n.starts_with(VOLUME_PREFIX))
        });
    let injected_root = !still_bound && state.root.remove(id);

    if let Some(env) = container.get_mut("env").and_then(Value::as_array_mut) {
        env.retain(|e| {
            let name = entry_name(e).unwrap_or_default();
            let mapped = owned.is_some_and(|names| names.contains(name));
            !(mapped || (injected_root && name == SERVICE_BINDING_ROOT))
        });
    }

    for field in CONTAINER_FIELDS {
        remove_if_created(container, field, &created_marker(field, id), state);
    }
}

impl Projector for PodTemplateProjector {
    fn project(&self, binding: &ServiceBinding, workload: &mut DynamicObject) -> Result<()> {
        let Some(secret) = binding.secret_name() else {
            return self.unproject(binding, workload);
        };

        let workload_name = workload.name_any();
        let malformed = || Error::projection(&workload_name, "pod template has an unexpected shape");
        let key = binding_key(binding);
        let volume = volume_name(binding);

        let template = pod_template_mut(workload, &workload_name)?;

        let (mut state, previous_env) = match annotations_mut(template) {
            Some(annotations) => (
                decode::<TemplateState>(annotations.get(&state_annotation())),
                decode::<OwnedEnv>(annotations.get(&annotation_key("env", &key))),
            ),
            None => Default::default(),
        };
        track_created(template, "metadata", "metadata".to_string(), &mut state);
        let has_annotations = template
            .get("metadata")
            .and_then(Value::as_object)
            .is_some_and(|metadata| metadata.contains_key("annotations"));
        if !has_annotations {
            state.created.insert("annotations".to_string());
        }

        let spec = template
            .get_mut("spec")
            .and_then(Value::as_object_mut)
            .ok_or_else(malformed)?;
        track_created(spec, "volumes", "volumes".to_string(), &mut state);
        let volumes = array_entry(spec, "volumes").ok_or_else(malformed)?;
        upsert_named(volumes, projected_volume(binding, &key, secret));

        let mut owned_env = OwnedEnv::new();
        for list in CONTAINER_LISTS {
            let Some(containers) = spec.get_mut(list).and_then(Value::as_array_mut) else {
                continue;
            };
            for container in containers.iter_mut() {
                let container = container.as_object_mut().ok_or_else(malformed)?;
                let id = container_id(container).ok_or_else(malformed)?;
                let previous = previous_env.get(&id).cloned().unwrap_or_default();
                let owned = project_container(
                    container, &id, binding, &volume, secret, &previous, &mut state,
                )
                .ok_or_else(malformed)?;
                if !owned.is_empty() {
                    owned_env.insert(id, owned);
                }
            }
        }

        let metadata = object_entry(template, "metadata").ok_or_else(malformed)?;
        let annotations = object_entry(metadata, "annotations").ok_or_else(malformed)?;
        set_annotation(annotations, annotation_key("secret", &key), Some(secret));
        set_annotation(
            annotations,
            annotation_key("type", &key),
            binding.spec.type_.as_deref(),
        );
        set_annotation(
            annotations,
            annotation_key("provider", &key),
            binding.spec.provider.as_deref(),
        );
        encode(
            annotations,
            annotation_key("env", &key),
            &owned_env,
            owned_env.is_empty(),
        );
        encode(annotations, state_annotation(), &state, state.is_empty());
        Ok(())
    }

    fn unproject(&self, binding: &ServiceBinding, workload: &mut DynamicObject) -> Result<()> {
        let workload_name = workload.name_any();
        let key = binding_key(binding);
        let volume = volume_name(binding);

        let template = pod_template_mut(workload, &workload_name)?;

        let (mut state, owned_env) = match annotations_mut(template) {
            Some(annotations) => {
                let owned = annotations.remove(&annotation_key("env", &key));
                let owned = decode::<OwnedEnv>(owned.as_ref());
                for field in ["secret", "type", "provider"] {
                    annotations.remove(&annotation_key(field, &key));
                }
                (decode::<TemplateState>(annotations.get(&state_annotation())), owned)
            }
            None => Default::default(),
        };

        if let Some(spec) = template.get_mut("spec").and_then(Value::as_object_mut) {
            if let Some(volumes) = spec.get_mut("volumes").and_then(Value::as_array_mut) {
                volumes.retain(|v| entry_name(v) != Some(volume.as_str()));
            }
            remove_if_created(spec, "volumes", "volumes", &mut state);

            for list in CONTAINER_LISTS {
                if let Some(containers) = spec.get_mut(list).and_then(Value::as_array_mut) {
                    for container in containers.iter_mut().filter_map(Value::as_object_mut) {
                        let Some(id) = container_id(container) else {
                            continue;
                        };
                        unproject_container(
                            container,
                            &id,
                            &volume,
                            owned_env.get(&id),
                            &mut state,
                        );
                    }
                }
            }
        }

        if let Some(annotations) = annotations_mut(template) {
            let secret_prefix = annotation_key("secret", "");
            let projected = annotations.keys().any(|k| k.starts_with(&secret_prefix));
            encode(
                annotations,
                state_annotation(),
                &state,
                !projected || state.is_empty(),
            );
        }
        if let Some(metadata) = template.get_mut("metadata").and_then(Value::as_object_mut) {
            remove_if_created(metadata, "annotations", "annotations", &mut state);
        }
        remove_if_created(template, "metadata", "metadata", &mut state);
        Ok(())
    }
}
