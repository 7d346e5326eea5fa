//! Admission endpoints
//!
//! The synthesized webhook rules point the API server here:
//! - `POST /projector` mutates a workload on admission so that it carries
//!   every binding that targets it, before the object is ever stored
//! - `POST /trigger` never rejects anything; it wakes the binding controller
//!   for every binding whose service or workload was just written
//! - `GET /healthz` answers `ok`

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kube::api::{DynamicObject, GroupVersionKind};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::SelectorExt;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use servicebinding_common::crd::{ServiceBinding, ServiceReference, WorkloadReference};
use servicebinding_common::kube_utils::to_selector;
use servicebinding_controller::Projector;

use crate::client::WebhookKubeClient;

/// Error type for admission operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            WebhookError::InvalidReview(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Shared state of the admission handlers
pub struct AdmissionState {
    /// Kubernetes client used to look up bindings
    pub kube: Arc<dyn WebhookKubeClient>,
    /// Projects bindings into admitted workloads
    pub projector: Arc<dyn Projector>,
    /// Feeds binding reconciles into the binding controller
    pub triggers: mpsc::Sender<ObjectRef<ServiceBinding>>,
}

/// Build the admission router
pub fn admission_router(state: Arc<AdmissionState>) -> Router {
    Router::new()
        .route("/projector", post(projector_handler))
        .route("/trigger", post(trigger_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Handle a mutating admission review for a workload
pub async fn projector_handler(
    State(state): State<Arc<AdmissionState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let req = parse_request(body)?;
    Ok(Json(project_request(&state, &req).await.into_review()))
}

/// Handle a validating admission review for a service or workload
pub async fn trigger_handler(
    State(state): State<Arc<AdmissionState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let req = parse_request(body)?;
    Ok(Json(trigger_request(&state, &req).await.into_review()))
}

fn parse_request(
    body: AdmissionReview<DynamicObject>,
) -> Result<AdmissionRequest<DynamicObject>, WebhookError> {
    let req: Result<AdmissionRequest<DynamicObject>, _> = body.try_into();
    req.map_err(|e| {
        error!(error = %e, "Failed to parse admission request");
        WebhookError::InvalidReview(e.to_string())
    })
}

/// True if the reference names the admitted object's kind and the object
/// itself (by name, or by selector over its labels). An invalid selector
/// matches nothing.
pub fn workload_matches(
    reference: &WorkloadReference,
    kind: &GroupVersionKind,
    obj: &DynamicObject,
) -> bool {
    let gvk = reference.gvk();
    if gvk.group != kind.group || gvk.kind != kind.kind {
        return false;
    }
    match (&reference.name, &reference.selector) {
        (Some(name), _) => obj.metadata.name.as_ref() == Some(name),
        (None, Some(selector)) => {
            to_selector(selector).is_ok_and(|selector| selector.matches(obj.labels()))
        }
        (None, None) => false,
    }
}

/// True if the reference names the admitted object
pub fn service_matches(
    reference: &ServiceReference,
    kind: &GroupVersionKind,
    obj: &DynamicObject,
) -> bool {
    let gvk = reference.gvk();
    gvk.group == kind.group
        && gvk.kind == kind.kind
        && obj.metadata.name.as_deref() == Some(reference.name.as_str())
}

fn request_namespace(req: &AdmissionRequest<DynamicObject>, obj: &DynamicObject) -> String {
    req.namespace
        .clone()
        .or_else(|| obj.namespace())
        .unwrap_or_default()
}

async fn project_request(
    state: &AdmissionState,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let Some(obj) = &req.object else {
        debug!(uid = %req.uid, "no object in request, allowing unchanged");
        return AdmissionResponse::from(req);
    };
    let namespace = request_namespace(req, obj);

    let bindings = match state.kube.list_bindings_in(&namespace).await {
        Ok(bindings) => bindings,
        Err(e) => {
            error!(uid = %req.uid, error = %e, "Failed to list bindings");
            return AdmissionResponse::from(req).deny(e.to_string());
        }
    };

    let mut matching: Vec<&ServiceBinding> = bindings
        .iter()
        .filter(|b| !b.is_deleting() && workload_matches(&b.spec.workload, &req.kind, obj))
        .collect();
    if matching.is_empty() {
        return AdmissionResponse::from(req);
    }
    matching.sort_by_key(|b| b.name_any());

    let mut projected = obj.clone();
    for binding in &matching {
        if let Err(e) = state.projector.project(binding, &mut projected) {
            warn!(uid = %req.uid, binding = %binding.name_any(), error = %e, "Projection failed");
            return AdmissionResponse::from(req).deny(e.to_string());
        }
    }

    let patch = match (serde_json::to_value(obj), serde_json::to_value(&projected)) {
        (Ok(before), Ok(after)) => json_patch::diff(&before, &after),
        (Err(e), _) | (_, Err(e)) => {
            error!(uid = %req.uid, error = %e, "Failed to serialize workload");
            return AdmissionResponse::from(req).deny(format!("serialization error: {e}"));
        }
    };
    if patch.0.is_empty() {
        return AdmissionResponse::from(req);
    }

    info!(
        uid = %req.uid,
        workload = ?obj.metadata.name,
        bindings = matching.len(),
        patch_ops = patch.0.len(),
        "Projecting bindings into workload"
    );

    match AdmissionResponse::from(req).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %req.uid, error = %e, "Failed to serialize patch");
            AdmissionResponse::from(req).deny(format!("patch serialization error: {e}"))
        }
    }
}

async fn trigger_request(
    state: &AdmissionState,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let obj = match req.operation {
        Operation::Delete => req.old_object.as_ref(),
        _ => req.object.as_ref(),
    };
    let Some(obj) = obj else {
        return response;
    };
    let namespace = request_namespace(req, obj);

    let bindings = match state.kube.list_bindings_in(&namespace).await {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!(uid = %req.uid, error = %e, "Failed to list bindings, not triggering");
            return response;
        }
    };

    for binding in bindings.iter().filter(|b| {
        service_matches(&b.spec.service, &req.kind, obj)
            || workload_matches(&b.spec.workload, &req.kind, obj)
    }) {
        debug!(uid = %req.uid, binding = %binding.name_any(), "Triggering binding reconcile");
        if let Err(e) = state.triggers.try_send(ObjectRef::from_obj(binding)) {
            warn!(binding = %binding.name_any(), error = %e, "Failed to enqueue binding");
        }
    }

    response
}
