//! Error types for the ServiceBinding operator
//!
//! Client calls are classified at the boundary: a 404 becomes
//! [`Error::NotFound`], a 403 becomes [`Error::Forbidden`] and a 409 becomes
//! [`Error::Conflict`]. The reconcilers branch on those classes; everything
//! else is propagated and retried by the controller's error policy.

use thiserror::Error;

/// Main error type for ServiceBinding operations
#[derive(Debug, Error)]
pub enum Error {
    /// The referenced object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Name (or namespace/name) of the missing object
        name: String,
    },

    /// The controller lacks RBAC permission for the operation
    #[error("forbidden to {verb} {kind} {name}")]
    Forbidden {
        /// Kind of the object
        kind: String,
        /// Name of the object, or "*" for list operations
        name: String,
        /// API verb that was denied (get, list, update, patch)
        verb: String,
    },

    /// Optimistic concurrency failure; the whole reconcile must be retried
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Kind of the object
        kind: String,
        /// Name of the object
        name: String,
        /// Message returned by the API server
        message: String,
    },

    /// Kubernetes API error that does not fit a more specific class
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A kind could not be mapped to a REST resource
    #[error("no resource mapping for {group}/{version}, Kind={kind}: {message}")]
    Mapping {
        /// API group of the kind
        group: String,
        /// API version of the kind
        version: String,
        /// The kind
        kind: String,
        /// Why the mapping failed
        message: String,
    },

    /// The projector could not apply or remove a binding
    #[error("projection error for workload {workload}: {message}")]
    Projection {
        /// Name of the workload being projected
        workload: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error: {message}")]
    Internal {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Classify a kube-rs error for an operation on a named object
    pub fn from_kube(
        err: kube::Error,
        kind: impl Into<String>,
        name: impl Into<String>,
        verb: impl Into<String>,
    ) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound {
                kind: kind.into(),
                name: name.into(),
            },
            kube::Error::Api(resp) if resp.code == 403 => Self::Forbidden {
                kind: kind.into(),
                name: name.into(),
                verb: verb.into(),
            },
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict {
                kind: kind.into(),
                name: name.into(),
                message: resp.message.clone(),
            },
            _ => Self::Kube { source: err },
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(
        kind: impl Into<String>,
        name: impl Into<String>,
        verb: impl Into<String>,
    ) -> Self {
        Self::Forbidden {
            kind: kind.into(),
            name: name.into(),
            verb: verb.into(),
        }
    }

    /// Create a mapping error for a kind that has no REST resource
    pub fn mapping(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Mapping {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a projection error for the given workload
    pub fn projection(workload: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Projection {
            workload: workload.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// True if the error is an HTTP 404 from the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 404,
            _ => false,
        }
    }

    /// True if the error is an HTTP 403 from the API server
    pub fn is_forbidden(&self) -> bool {
        match self {
            Self::Forbidden { .. } => true,
            Self::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 403,
            _ => false,
        }
    }

    /// True if the error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 409,
            _ => false,
        }
    }
}
