//! Read-only view over schema-less resources.
//!
//! Provisioned services are arbitrary custom resources. The only field the
//! controller reads from them is `status.binding.name`; all key-path access
//! on untyped objects goes through [`Document`].

use kube::api::DynamicObject;
use serde_json::Value;

/// Key-path addressable view of a structured document
#[derive(Clone, Copy, Debug)]
pub struct Document<'a> {
    root: &'a Value,
}

impl<'a> Document<'a> {
    /// View a raw JSON value
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    /// View the body (everything except metadata) of a dynamic object
    pub fn of(obj: &'a DynamicObject) -> Self {
        Self::new(&obj.data)
    }

    /// Walk the given keys; `None` if any segment is missing or not an object
    pub fn get(&self, path: &[&str]) -> Option<&'a Value> {
        path.iter()
            .try_fold(self.root, |node, key| node.as_object()?.get(*key))
    }

    /// String at the given path, if present and a string
    pub fn get_str(&self, path: &[&str]) -> Option<&'a str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Name of the binding Secret a provisioned service exposes.
    ///
    /// An absent or empty `status.binding.name` means the service has not
    /// published a Secret yet.
    pub fn binding_secret_name(&self) -> Option<String> {
        self.get_str(&["status", "binding", "name"])
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}
