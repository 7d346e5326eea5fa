//! ServiceBinding controller
//!
//! Each reconcile copies the binding, makes sure the finalizer is in place,
//! runs the [`Pipeline`] for the binding's lifecycle phase and writes the
//! status back when it changed. Once a deleting binding's workloads are
//! unprojected the finalizer is removed and the binding goes away.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use servicebinding_common::crd::{carry_transition_times, ConditionManager, ServiceBinding};
use servicebinding_common::events::{
    ControllerEvent, EventPublisher, KubeEventPublisher, NoopEventPublisher,
};
use servicebinding_common::{DiscoveryMapper, Error, ResourceMapper, BINDING_FINALIZER};

use crate::client::{BindingKubeClient, BindingKubeClientImpl};
use crate::pipeline::{LifecyclePhase, Pipeline, Stage};
use crate::projector::{PodTemplateProjector, Projector};

/// Name the controller reports Kubernetes events under
pub const CONTROLLER_NAME: &str = "servicebinding-controller";

/// Delay before retrying a failed reconcile
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Controller context shared by every binding reconcile
pub struct BindingContext {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn BindingKubeClient>,
    /// Kind to REST resource resolution
    pub mapper: Arc<dyn ResourceMapper>,
    /// Injects bindings into workloads
    pub projector: Arc<dyn Projector>,
    /// Kubernetes event publisher
    pub events: Arc<dyn EventPublisher>,
}

impl BindingContext {
    /// Create a builder for constructing a context
    pub fn builder(client: Client) -> BindingContextBuilder {
        BindingContextBuilder::new(client)
    }

    /// Context with production collaborators for the given client
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Context over mock collaborators; events are dropped
    pub fn for_testing(
        kube: Arc<dyn BindingKubeClient>,
        mapper: Arc<dyn ResourceMapper>,
        projector: Arc<dyn Projector>,
    ) -> Self {
        Self {
            kube,
            mapper,
            projector,
            events: Arc::new(NoopEventPublisher),
        }
    }
}

/// Builder for [`BindingContext`]
pub struct BindingContextBuilder {
    client: Client,
    mapper: Option<Arc<dyn ResourceMapper>>,
    projector: Option<Arc<dyn Projector>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl BindingContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            mapper: None,
            projector: None,
            events: None,
        }
    }

    /// Share a mapper (and its cache) with other controllers
    pub fn mapper(mut self, mapper: Arc<dyn ResourceMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Replace the default pod template projector
    pub fn projector(mut self, projector: Arc<dyn Projector>) -> Self {
        self.projector = Some(projector);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the context, filling in production defaults
    pub fn build(self) -> BindingContext {
        BindingContext {
            kube: Arc::new(BindingKubeClientImpl::new(self.client.clone())),
            mapper: self
                .mapper
                .unwrap_or_else(|| Arc::new(DiscoveryMapper::new(self.client.clone()))),
            projector: self
                .projector
                .unwrap_or_else(|| Arc::new(PodTemplateProjector::new())),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))),
        }
    }
}

/// Reconcile a ServiceBinding
#[instrument(
    skip(binding, ctx),
    fields(binding = %binding.name_any(), namespace = %binding.namespace().unwrap_or_default())
)]
pub async fn reconcile(binding: Arc<ServiceBinding>, ctx: Arc<BindingContext>) -> Result<Action, Error> {
    let phase = LifecyclePhase::of(&binding);
    let mut current = (*binding).clone();

    if !current.has_finalizer(BINDING_FINALIZER) {
        if phase == LifecyclePhase::Deleting {
            debug!("binding deleted before it was finalized, nothing to clean up");
            return Ok(Action::await_change());
        }
        current = add_finalizer(&current, &ctx).await?;
    }

    debug!(?phase, "reconciling binding");
    let stored = current.status.clone();
    let stored_conditions = stored
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    let status = current.status.get_or_insert_with(Default::default);
    ConditionManager::new(&mut status.conditions).reset(&Stage::conditions_for_phase(phase));

    let pipeline = Pipeline::new(
        ctx.kube.as_ref(),
        ctx.mapper.as_ref(),
        ctx.projector.as_ref(),
    );
    let outcome = pipeline.run(&mut current, phase).await;

    let status = current.status.get_or_insert_with(Default::default);
    carry_transition_times(&stored_conditions, &mut status.conditions);
    status.observed_generation = current.metadata.generation;

    // conditions recorded before a failing stage are still written
    if current.status != stored {
        match ctx.kube.update_status(&current).await {
            Ok(updated) => {
                publish(&ctx, &updated, ControllerEvent::StatusUpdated).await;
                current = updated;
            }
            Err(e) => {
                outcome?;
                return Err(e);
            }
        }
    }
    outcome?;

    if phase == LifecyclePhase::Deleting {
        remove_finalizer(&current, &ctx).await?;
        info!("workloads unprojected, finalizer removed");
    }

    Ok(Action::await_change())
}

/// Requeue a failed binding after a fixed delay
pub fn error_policy(binding: Arc<ServiceBinding>, error: &Error, _ctx: Arc<BindingContext>) -> Action {
    if error.is_conflict() {
        debug!(
            binding = %binding.name_any(),
            namespace = %binding.namespace().unwrap_or_default(),
            "binding changed during reconcile, retrying"
        );
    } else {
        error!(
            ?error,
            binding = %binding.name_any(),
            namespace = %binding.namespace().unwrap_or_default(),
            "reconciliation failed"
        );
    }
    Action::requeue(RETRY_DELAY)
}

async fn add_finalizer(binding: &ServiceBinding, ctx: &BindingContext) -> Result<ServiceBinding, Error> {
    let mut finalizers = binding.finalizers().to_vec();
    finalizers.push(BINDING_FINALIZER.to_string());
    patch_finalizers(binding, ctx, finalizers).await
}

async fn remove_finalizer(binding: &ServiceBinding, ctx: &BindingContext) -> Result<ServiceBinding, Error> {
    let finalizers: Vec<String> = binding
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != BINDING_FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(binding, ctx, finalizers).await
}

async fn patch_finalizers(
    binding: &ServiceBinding,
    ctx: &BindingContext,
    finalizers: Vec<String>,
) -> Result<ServiceBinding, Error> {
    let patched = ctx.kube.patch_finalizers(binding, &finalizers).await?;
    publish(ctx, &patched, ControllerEvent::FinalizerPatched).await;
    Ok(patched)
}

async fn publish(ctx: &BindingContext, binding: &ServiceBinding, event: ControllerEvent) {
    ctx.events.publish(&binding.object_ref(&()), event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBindingKubeClient;
    use crate::testing::{
        deployment, mapper_for, mark_deleted, secret_binding, selector_workload, MockEvents,
    };
    use kube::api::DynamicObject;
    use servicebinding_common::crd::{
        condition_types, reasons as condition_reasons, ConditionStatus, SecretReference,
        ServiceBindingStatus, ServiceReference,
    };
    use std::sync::{Arc as StdArc, Mutex};

    /// Records every status written through the mock client
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: StdArc<Mutex<Vec<ServiceBinding>>>,
    }

    impl StatusCapture {
        fn record(&self, binding: &ServiceBinding) {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .push(binding.clone());
        }

        fn last(&self) -> ServiceBinding {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
                .expect("status should have been written")
        }

        fn count(&self) -> usize {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .len()
        }
    }

    /// Records every workload written through the mock client
    #[derive(Clone, Default)]
    struct WorkloadCapture {
        updates: StdArc<Mutex<Vec<DynamicObject>>>,
    }

    impl WorkloadCapture {
        fn record(&self, obj: &DynamicObject) {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .push(obj.clone());
        }

        fn all(&self) -> Vec<DynamicObject> {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .clone()
        }
    }

    fn finalized(mut binding: ServiceBinding) -> ServiceBinding {
        binding.metadata.finalizers = Some(vec![BINDING_FINALIZER.to_string()]);
        binding
    }

    fn condition(binding: &ServiceBinding, type_: &str) -> (ConditionStatus, String) {
        binding
            .status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
            .map(|c| (c.status, c.reason.clone()))
            .expect("condition should be set")
    }

    /// Mock client whose writes echo their input and are captured
    fn capturing_client(
        workloads: Vec<DynamicObject>,
    ) -> (MockBindingKubeClient, StatusCapture, WorkloadCapture) {
        let statuses = StatusCapture::default();
        let written = WorkloadCapture::default();

        let mut kube = MockBindingKubeClient::new();
        kube.expect_list_objects()
            .returning(move |_, _, _| Ok(workloads.clone()));
        let capture = statuses.clone();
        kube.expect_update_status().returning(move |b| {
            capture.record(b);
            Ok(b.clone())
        });
        let capture = written.clone();
        kube.expect_update_object().returning(move |_, obj| {
            capture.record(obj);
            Ok(obj.clone())
        });
        kube.expect_patch_finalizers().returning(|b, finalizers| {
            let mut patched = b.clone();
            patched.metadata.finalizers = Some(finalizers.to_vec());
            Ok(patched)
        });
        (kube, statuses, written)
    }

    fn context(kube: MockBindingKubeClient) -> Arc<BindingContext> {
        Arc::new(BindingContext::for_testing(
            Arc::new(kube),
            Arc::new(mapper_for("deployments")),
            Arc::new(PodTemplateProjector::new()),
        ))
    }

    mod live {
        use super::*;

        #[tokio::test]
        async fn direct_secret_becomes_ready() {
            let (kube, statuses, _) = capturing_client(Vec::new());
            let binding = finalized(secret_binding("my-secret", selector_workload("app", "web")));

            let action = reconcile(Arc::new(binding), context(kube))
                .await
                .expect("reconcile should succeed");
            assert_eq!(action, Action::await_change());

            let written = statuses.last();
            let status = written.status.as_ref().expect("status");
            assert_eq!(
                status.binding.as_ref().map(|b| b.name.as_str()),
                Some("my-secret")
            );
            assert_eq!(status.observed_generation, Some(1));
            assert_eq!(
                condition(&written, condition_types::SERVICE_AVAILABLE),
                (
                    ConditionStatus::True,
                    condition_reasons::RESOLVED_BINDING_SECRET.to_string()
                )
            );
            assert_eq!(
                condition(&written, condition_types::READY),
                (ConditionStatus::True, condition_reasons::READY.to_string())
            );
        }

        #[tokio::test]
        async fn selector_projects_only_matching_workloads() {
            let (kube, _, written) = capturing_client(vec![
                deployment("one", &[("app", "web")]),
                deployment("two", &[("app", "web")]),
                deployment("three", &[("app", "db")]),
            ]);
            let binding = finalized(secret_binding("my-secret", selector_workload("app", "web")));

            reconcile(Arc::new(binding), context(kube))
                .await
                .expect("reconcile should succeed");

            let names: Vec<String> = written.all().iter().map(|w| w.name_any()).collect();
            assert_eq!(names, vec!["one", "two"]);
            for workload in written.all() {
                let volumes = &workload.data["spec"]["template"]["spec"]["volumes"];
                assert_eq!(volumes[0]["projected"]["sources"][0]["secret"]["name"], "my-secret");
            }
        }

        #[tokio::test]
        async fn second_pass_writes_nothing() {
            let original = vec![deployment("app", &[("app", "web")])];
            let (kube, statuses, written) = capturing_client(original);
            let binding = finalized(secret_binding("my-secret", selector_workload("app", "web")));
            reconcile(Arc::new(binding), context(kube))
                .await
                .expect("first pass should succeed");

            let mut kube = MockBindingKubeClient::new();
            let projected = written.all();
            kube.expect_list_objects()
                .returning(move |_, _, _| Ok(projected.clone()));
            kube.expect_update_status().never();
            kube.expect_update_object().never();
            kube.expect_patch_finalizers().never();

            reconcile(Arc::new(statuses.last()), context(kube))
                .await
                .expect("second pass should succeed");
            assert_eq!(statuses.count(), 1);
        }

        #[tokio::test]
        async fn new_binding_gets_finalizer_and_event() {
            let (kube, statuses, _) = capturing_client(Vec::new());
            let mut events = MockEvents::new();
            events
                .expect_publish()
                .withf(|object, event| {
                    object.name.as_deref() == Some("my-binding")
                        && *event == ControllerEvent::FinalizerPatched
                })
                .times(1)
                .returning(|_, _| ());
            events
                .expect_publish()
                .withf(|_, event| *event == ControllerEvent::StatusUpdated)
                .times(1)
                .returning(|_, _| ());

            let mut ctx = BindingContext::for_testing(
                Arc::new(kube),
                Arc::new(mapper_for("deployments")),
                Arc::new(PodTemplateProjector::new()),
            );
            ctx.events = Arc::new(events);

            let binding = secret_binding("my-secret", selector_workload("app", "web"));
            reconcile(Arc::new(binding), Arc::new(ctx))
                .await
                .expect("reconcile should succeed");

            assert!(statuses.last().has_finalizer(BINDING_FINALIZER));
        }

        #[tokio::test]
        async fn missing_binding_clears_stored_secret() {
            let (mut kube, statuses, _) = capturing_client(Vec::new());
            kube.expect_get_object().returning(|_, _, name| {
                let mut service = deployment(name, &[]);
                service.data = serde_json::json!({ "status": {} });
                Ok(service)
            });

            let mut binding = finalized(secret_binding("unused", selector_workload("app", "web")));
            binding.spec.service = ServiceReference {
                api_version: "example.com/v1".to_string(),
                kind: "Database".to_string(),
                name: "db".to_string(),
            };
            binding.status = Some(ServiceBindingStatus {
                binding: Some(SecretReference {
                    name: "old-secret".to_string(),
                }),
                ..Default::default()
            });

            reconcile(Arc::new(binding), context(kube))
                .await
                .expect("reconcile should succeed");

            let written = statuses.last();
            assert_eq!(written.status.as_ref().and_then(|s| s.binding.clone()), None);
            assert_eq!(
                condition(&written, condition_types::SERVICE_AVAILABLE),
                (
                    ConditionStatus::Unknown,
                    condition_reasons::SERVICE_MISSING_BINDING.to_string()
                )
            );
        }

        #[tokio::test]
        async fn missing_service_keeps_stored_secret() {
            let (mut kube, statuses, _) = capturing_client(Vec::new());
            kube.expect_get_object()
                .returning(|_, _, _| Err(Error::not_found("Database", "default/db")));

            let mut binding = finalized(secret_binding("unused", selector_workload("app", "web")));
            binding.spec.service = ServiceReference {
                api_version: "example.com/v1".to_string(),
                kind: "Database".to_string(),
                name: "db".to_string(),
            };
            binding.status = Some(ServiceBindingStatus {
                binding: Some(SecretReference {
                    name: "old-secret".to_string(),
                }),
                ..Default::default()
            });

            reconcile(Arc::new(binding), context(kube))
                .await
                .expect("reconcile should succeed");

            let written = statuses.last();
            assert_eq!(
                written
                    .status
                    .as_ref()
                    .and_then(|s| s.binding.as_ref())
                    .map(|b| b.name.as_str()),
                Some("old-secret")
            );
            assert_eq!(
                condition(&written, condition_types::READY),
                (
                    ConditionStatus::Unknown,
                    condition_reasons::SERVICE_NOT_FOUND.to_string()
                )
            );
        }

        #[tokio::test]
        async fn forbidden_service_is_not_ready() {
            let (mut kube, statuses, _) = capturing_client(Vec::new());
            kube.expect_get_object()
                .returning(|_, _, _| Err(Error::forbidden("Database", "default/db", "get")));

            let mut binding = finalized(secret_binding("unused", selector_workload("app", "web")));
            binding.spec.service = ServiceReference {
                api_version: "example.com/v1".to_string(),
                kind: "Database".to_string(),
                name: "db".to_string(),
            };

            reconcile(Arc::new(binding), context(kube))
                .await
                .expect("forbidden is recorded, not returned");

            let written = statuses.last();
            assert_eq!(
                condition(&written, condition_types::READY),
                (
                    ConditionStatus::False,
                    condition_reasons::SERVICE_FORBIDDEN.to_string()
                )
            );
        }

        #[tokio::test]
        async fn forbidden_workload_list_stays_false_after_patching() {
            let statuses = StatusCapture::default();
            let mut kube = MockBindingKubeClient::new();
            kube.expect_list_objects()
                .returning(|_, _, _| Err(Error::forbidden("Deployment", "default/*", "list")));
            kube.expect_update_object().never();
            let capture = statuses.clone();
            kube.expect_update_status().returning(move |b| {
                capture.record(b);
                Ok(b.clone())
            });

            let binding = finalized(secret_binding("my-secret", selector_workload("app", "web")));
            reconcile(Arc::new(binding), context(kube))
                .await
                .expect("forbidden is recorded, not returned");

            let written = statuses.last();
            assert_eq!(
                condition(&written, condition_types::WORKLOAD_PROJECTED),
                (
                    ConditionStatus::False,
                    condition_reasons::WORKLOAD_FORBIDDEN.to_string()
                )
            );
            assert_eq!(
                condition(&written, condition_types::SERVICE_AVAILABLE).0,
                ConditionStatus::True
            );
            assert_eq!(condition(&written, condition_types::READY).0, ConditionStatus::False);
        }

        #[tokio::test]
        async fn failing_stage_still_writes_status() {
            let (mut kube, statuses, _) = capturing_client(Vec::new());
            kube.expect_get_object()
                .returning(|_, _, _| Err(Error::internal("connection reset")));

            let mut binding = finalized(secret_binding("unused", selector_workload("app", "web")));
            binding.spec.service = ServiceReference {
                api_version: "example.com/v1".to_string(),
                kind: "Database".to_string(),
                name: "db".to_string(),
            };

            let result = reconcile(Arc::new(binding), context(kube)).await;

            assert!(matches!(result, Err(Error::Internal { .. })));
            assert_eq!(statuses.count(), 1);
            assert_eq!(
                condition(&statuses.last(), condition_types::READY),
                (
                    ConditionStatus::Unknown,
                    condition_reasons::INITIALIZING.to_string()
                )
            );
        }
    }

    mod deleting {
        use super::*;

        #[tokio::test]
        async fn without_finalizer_does_nothing() {
            let mut kube = MockBindingKubeClient::new();
            kube.expect_list_objects().never();
            kube.expect_update_status().never();
            kube.expect_patch_finalizers().never();

            let mut binding = secret_binding("my-secret", selector_workload("app", "web"));
            mark_deleted(&mut binding);

            let action = reconcile(Arc::new(binding), context(kube))
                .await
                .expect("reconcile should succeed");
            assert_eq!(action, Action::await_change());
        }

        #[tokio::test]
        async fn unprojects_then_removes_finalizer() {
            let mut binding = finalized(secret_binding("my-secret", selector_workload("app", "web")));
            binding.status = Some(ServiceBindingStatus {
                binding: Some(SecretReference {
                    name: "my-secret".to_string(),
                }),
                ..Default::default()
            });

            let original = deployment("app", &[("app", "web")]);
            let mut projected = original.clone();
            PodTemplateProjector::new()
                .project(&binding, &mut projected)
                .expect("projection should succeed");

            let written = WorkloadCapture::default();
            let mut kube = MockBindingKubeClient::new();
            kube.expect_list_objects()
                .returning(move |_, _, _| Ok(vec![projected.clone()]));
            let capture = written.clone();
            kube.expect_update_object().times(1).returning(move |_, obj| {
                capture.record(obj);
                Ok(obj.clone())
            });
            kube.expect_update_status().returning(|b| Ok(b.clone()));
            kube.expect_patch_finalizers()
                .withf(|_, finalizers| finalizers.is_empty())
                .times(1)
                .returning(|b, _| Ok(b.clone()));

            mark_deleted(&mut binding);
            reconcile(Arc::new(binding), context(kube))
                .await
                .expect("reconcile should succeed");

            assert_eq!(written.all(), vec![original]);
        }

        #[tokio::test]
        async fn keeps_finalizer_when_unprojection_fails() {
            let mut kube = MockBindingKubeClient::new();
            kube.expect_list_objects()
                .returning(|_, _, _| Err(Error::internal("apiserver unavailable")));
            kube.expect_update_status().returning(|b| Ok(b.clone()));
            kube.expect_patch_finalizers().never();

            let mut binding = finalized(secret_binding("my-secret", selector_workload("app", "web")));
            mark_deleted(&mut binding);

            let result = reconcile(Arc::new(binding), context(kube)).await;
            assert!(result.is_err());
        }
    }

    #[test]
    fn error_policy_requeues() {
        let binding = Arc::new(secret_binding("s", selector_workload("app", "web")));
        let ctx = context(MockBindingKubeClient::new());
        let action = error_policy(binding, &Error::internal("boom"), ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }
}
