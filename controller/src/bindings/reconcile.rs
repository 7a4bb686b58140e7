use std::{sync::Arc, time::Duration};

use catalog_common::{
    colors::{FG1, FG2},
    error::{Classify, Error},
    finalizer,
    leader::run_elected,
};
use catalog_osb_client::LastOperationState;
use catalog_types::{BindingPhase, OperationKind, ServiceBinding, UnbindStatus, reasons};
use futures::stream::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    api::ListParams,
    runtime::{
        Controller,
        controller::Action,
        events::{EventType, NewEvent},
    },
};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use super::{actions, preconditions};
use crate::{context::Context, instances::params, resolver};

const FINALIZER: &str = "servicecatalog.example.io/binding-protection";

pub async fn run(client: Client, context: Arc<Context>, shutdown: CancellationToken) {
    println!("{}", "Starting ServiceBinding controller...".green());
    let namespace = context.config.namespace.clone();
    run_elected(
        client.clone(),
        &namespace,
        "servicecatalog-binding-controller-lock",
        shutdown,
        move || {
            let client = client.clone();
            let context = context.clone();
            async move {
                let bindings: Api<ServiceBinding> = Api::all(client);
                Controller::new(bindings, ListParams::default())
                    .run(reconcile, on_error, context)
                    .for_each(|_res| async move {})
                    .await;
            }
        },
    )
    .await;
}

#[derive(Debug, Clone)]
enum BindingAction {
    AddFinalizer,
    Bind,
    AwaitAsync,
    Unbind,
    ReapFinalizer,
    RetryTimedOut,
    NoOp,
    Requeue(Duration),
}

impl BindingAction {
    fn label(&self) -> &'static str {
        match self {
            BindingAction::AddFinalizer => "AddFinalizer",
            BindingAction::Bind => "Bind",
            BindingAction::AwaitAsync => "AwaitAsync",
            BindingAction::Unbind => "Unbind",
            BindingAction::ReapFinalizer => "ReapFinalizer",
            BindingAction::RetryTimedOut => "RetryTimedOut",
            BindingAction::NoOp => "NoOp",
            BindingAction::Requeue(_) => "Requeue",
        }
    }
}

fn retry_budget_exceeded(binding: &ServiceBinding, budget: Duration) -> bool {
    binding
        .status
        .as_ref()
        .and_then(|s| s.current_operation.as_ref())
        .map(|op| chrono::Utc::now().signed_duration_since(op.started_at.0))
        .and_then(|age| age.to_std().ok())
        .is_some_and(|age| age >= budget)
}

fn determine_action(binding: &ServiceBinding, context: &Context) -> BindingAction {
    if binding.metadata.deletion_timestamp.is_some() {
        let unbind_status = binding
            .status
            .as_ref()
            .map(|s| s.unbind_status)
            .unwrap_or(UnbindStatus::NotRequired);
        if binding
            .status
            .as_ref()
            .and_then(|s| s.current_operation.as_ref())
            .is_some()
        {
            return if retry_budget_exceeded(binding, context.config.reconciliation_retry_duration) {
                BindingAction::RetryTimedOut
            } else {
                BindingAction::AwaitAsync
            };
        }
        return match unbind_status {
            UnbindStatus::Required => BindingAction::Unbind,
            UnbindStatus::Succeeded | UnbindStatus::NotRequired => BindingAction::ReapFinalizer,
            UnbindStatus::Failed => BindingAction::Requeue(Duration::from_secs(30)),
        };
    }

    if !finalizer::has(binding, FINALIZER) {
        return BindingAction::AddFinalizer;
    }

    if binding
        .status
        .as_ref()
        .and_then(|s| s.current_operation.as_ref())
        .is_some()
    {
        return if retry_budget_exceeded(binding, context.config.reconciliation_retry_duration) {
            BindingAction::RetryTimedOut
        } else {
            BindingAction::AwaitAsync
        };
    }

    if binding
        .status
        .as_ref()
        .is_some_and(|s| s.orphan_mitigation_in_progress)
    {
        return BindingAction::Unbind;
    }

    if binding.status.as_ref().map(|s| s.phase) == Some(BindingPhase::Failed) {
        return BindingAction::NoOp;
    }

    let never_bound = binding
        .status
        .as_ref()
        .and_then(|s| s.external_properties.as_ref())
        .is_none();
    if never_bound {
        return BindingAction::Bind;
    }

    BindingAction::NoOp
}

async fn reconcile(binding: Arc<ServiceBinding>, context: Arc<Context>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = binding
        .namespace()
        .ok_or_else(|| Error::UserInput("ServiceBinding must be namespaced".to_string()))?;
    let name = binding.name_any();
    let key = format!("{namespace}/{name}");

    let action = determine_action(&binding, &context);
    if context.action_changed(&key, action.label()) {
        println!(
            "{}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " ACTION: ".color(FG1),
            action.label().color(FG2),
        );
    }

    let result = match action {
        BindingAction::AddFinalizer => {
            let api: Api<ServiceBinding> = Api::namespaced(client, &namespace);
            finalizer::add(&api, &binding, FINALIZER).await?;
            Action::requeue(Duration::from_secs(1))
        }
        BindingAction::Bind => {
            let _permit = context.acquire_sync_permit().await;
            let instance = Api::<catalog_types::ServiceInstance>::namespaced(client.clone(), &namespace)
                .get(&binding.spec.instance_ref.name)
                .await?;
            let resolved = resolve_instance_plan(&client, &binding, &instance).await?;

            match preconditions::check(&client, &instance, &resolved, &namespace).await? {
                Err(failure) => {
                    actions::note_condition(&client, &binding, failure.reason(), failure.message())
                        .await?;
                    Action::requeue(Duration::from_secs(10))
                }
                Ok(()) => {
                    actions::start_bind(&client, &binding).await?;
                    let (parameters, checksum) = params::assemble(
                        &client,
                        &namespace,
                        binding.spec.parameters.as_ref(),
                        &binding.spec.parameters_from,
                    )
                    .await?;
                    let osb = context.osb_client_for(&broker_of(&context, &resolved).await?).await?;
                    actions::dispatch_bind(
                        &client,
                        &binding,
                        &resolved,
                        parameters,
                        checksum,
                        &osb,
                        context.config.async_binding_operations_enabled,
                    )
                    .await?;
                    emit_event(&context, &binding, reasons::BINDING, "Bind dispatched to broker");
                    Action::requeue(Duration::from_secs(5))
                }
            }
        }
        BindingAction::AwaitAsync => {
            let resolved = resolve_or_note(&client, &binding).await?;
            let osb = context.osb_client_for(&broker_of(&context, &resolved).await?).await?;
            let state = actions::poll(&client, &binding, &osb).await?;
            match state {
                LastOperationState::InProgress => {
                    Action::requeue(next_backoff(&binding, context.config.operation_polling_maximum_backoff_duration))
                }
                _ => Action::await_change(),
            }
        }
        BindingAction::Unbind => {
            let _permit = context.acquire_sync_permit().await;
            let resolved = resolve_or_note(&client, &binding).await?;
            actions::start_unbind(&client, &binding).await?;
            let osb = context.osb_client_for(&broker_of(&context, &resolved).await?).await?;
            actions::dispatch_unbind(
                &client,
                &binding,
                &resolved,
                &osb,
                context.config.async_binding_operations_enabled,
            )
            .await?;
            emit_event(&context, &binding, reasons::UNBINDING, "Unbind dispatched to broker");
            Action::requeue(Duration::from_secs(5))
        }
        BindingAction::ReapFinalizer => {
            let api: Api<ServiceBinding> = Api::namespaced(client, &namespace);
            if finalizer::has(&binding, FINALIZER) {
                finalizer::remove(&api, &binding, FINALIZER).await?;
            }
            Action::await_change()
        }
        BindingAction::RetryTimedOut => {
            let kind = binding
                .status
                .as_ref()
                .and_then(|s| s.current_operation.as_ref())
                .map(|o| o.kind);
            let orphan_mitigation = matches!(kind, Some(OperationKind::Bind));
            actions::mark_failed(
                &client,
                &binding,
                reasons::RECONCILIATION_RETRY_TIMEOUT,
                "operation did not reach a terminal state within the retry budget".to_string(),
                orphan_mitigation,
            )
            .await?;
            Action::requeue(Duration::from_secs(30))
        }
        BindingAction::Requeue(d) => Action::requeue(d),
        BindingAction::NoOp => Action::requeue(context.config.resync_interval),
    };

    Ok(result)
}

fn next_backoff(binding: &ServiceBinding, ceiling: Duration) -> Duration {
    let elapsed = binding
        .status
        .as_ref()
        .and_then(|s| s.current_operation.as_ref())
        .map(|op| chrono::Utc::now().signed_duration_since(op.started_at.0))
        .and_then(|age| age.to_std().ok())
        .unwrap_or_default();
    let attempt = ((elapsed.as_secs() / 5).min(12)) as u32;
    let backoff = Duration::from_secs(5).saturating_mul(1u32 << attempt);
    backoff.min(ceiling)
}

async fn resolve_or_note(
    client: &Client,
    binding: &ServiceBinding,
) -> Result<resolver::ResolvedPlanRef, Error> {
    let instance = Api::<catalog_types::ServiceInstance>::namespaced(
        client.clone(),
        &binding.namespace().unwrap_or_default(),
    )
    .get(&binding.spec.instance_ref.name)
    .await?;
    resolve_instance_plan(client, binding, &instance).await
}

async fn resolve_instance_plan(
    client: &Client,
    binding: &ServiceBinding,
    instance: &catalog_types::ServiceInstance,
) -> Result<resolver::ResolvedPlanRef, Error> {
    match resolver::resolve_plan_reference(client, &instance.spec.plan_reference).await {
        Ok(resolved) => Ok(resolved),
        Err(e) => {
            actions::note_condition(
                client,
                binding,
                reasons::REFERENCE_RESOLVE_FAILED,
                e.to_string(),
            )
            .await?;
            Err(Error::UserInput(e.to_string()))
        }
    }
}

async fn broker_of(
    context: &Context,
    resolved: &resolver::ResolvedPlanRef,
) -> Result<catalog_types::Broker, Error> {
    let brokers: Api<catalog_types::Broker> = Api::all(context.client.clone());
    Ok(brokers.get(&resolved.class.spec.broker_name).await?)
}

/// Best-effort: a failure to publish an Event must never fail the
/// reconcile, since the status condition already recorded the same
/// transition durably.
fn emit_event(context: &Context, binding: &ServiceBinding, reason: &str, note: &str) {
    let recorder = context.recorder_for(binding);
    let ev = NewEvent {
        action: "Reconciling".to_string(),
        reason: reason.to_string(),
        note: Some(note.to_string()),
        event_type: EventType::Normal,
        secondary_object: None,
    };
    tokio::spawn(async move {
        if let Err(e) = recorder.publish(ev).await {
            eprintln!("failed to publish event: {e}");
        }
    });
}

fn on_error(binding: Arc<ServiceBinding>, error: &Error, _context: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!(
            "service binding {}/{} reconciliation error: {error}",
            binding.namespace().unwrap_or_default(),
            binding.name_any()
        )
        .red()
    );
    if error.is_retriable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_types::{Operation, ServiceBindingStatus};
    use kube::api::ObjectMeta;

    fn binding_with_status(status: ServiceBindingStatus) -> ServiceBinding {
        ServiceBinding {
            metadata: ObjectMeta {
                name: Some("my-binding".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: serde_json::from_value(serde_json::json!({
                "instanceRef": {"name": "my-instance"},
                "secretName": "my-secret",
                "externalId": "22222222-2222-2222-2222-222222222222",
            }))
            .expect("valid ServiceBindingSpec fixture"),
            status: Some(status),
        }
    }

    fn operation(kind: OperationKind, started_at: chrono::DateTime<chrono::Utc>) -> Operation {
        Operation {
            kind,
            started_at: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(started_at),
            broker_operation_key: None,
        }
    }

    #[test]
    fn retry_budget_not_exceeded_while_within_budget() {
        let binding = binding_with_status(ServiceBindingStatus {
            current_operation: Some(operation(OperationKind::Bind, chrono::Utc::now())),
            ..Default::default()
        });
        assert!(!retry_budget_exceeded(&binding, Duration::from_secs(3600)));
    }

    #[test]
    fn retry_budget_exceeded_once_operation_outlives_budget() {
        let started = chrono::Utc::now() - chrono::Duration::hours(2);
        let binding = binding_with_status(ServiceBindingStatus {
            current_operation: Some(operation(OperationKind::Unbind, started)),
            ..Default::default()
        });
        assert!(retry_budget_exceeded(&binding, Duration::from_secs(3600)));
    }

    #[test]
    fn backoff_starts_near_floor_for_a_fresh_operation() {
        let binding = binding_with_status(ServiceBindingStatus {
            current_operation: Some(operation(OperationKind::Bind, chrono::Utc::now())),
            ..Default::default()
        });
        assert_eq!(
            next_backoff(&binding, Duration::from_secs(1200)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn backoff_doubles_with_elapsed_time_and_clamps_to_ceiling() {
        let started = chrono::Utc::now() - chrono::Duration::seconds(65);
        let binding = binding_with_status(ServiceBindingStatus {
            current_operation: Some(operation(OperationKind::Bind, started)),
            ..Default::default()
        });
        assert_eq!(
            next_backoff(&binding, Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn deletion_with_unbind_required_and_no_current_operation_means_unbind_is_due() {
        let mut binding = binding_with_status(ServiceBindingStatus {
            unbind_status: UnbindStatus::Required,
            phase: BindingPhase::Ready,
            ..Default::default()
        });
        binding.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
        assert!(binding.metadata.deletion_timestamp.is_some());
        assert_eq!(
            binding.status.as_ref().map(|s| s.unbind_status),
            Some(UnbindStatus::Required)
        );
        assert!(
            binding
                .status
                .as_ref()
                .and_then(|s| s.current_operation.as_ref())
                .is_none()
        );
    }

    #[test]
    fn orphan_mitigation_without_deletion_still_routes_to_unbind() {
        let binding = binding_with_status(ServiceBindingStatus {
            phase: BindingPhase::Failed,
            orphan_mitigation_in_progress: true,
            orphan_mitigation_reason: Some("secret already exists".to_string()),
            unbind_status: UnbindStatus::Required,
            ..Default::default()
        });
        assert!(binding.metadata.deletion_timestamp.is_none());
        assert!(binding.status.as_ref().unwrap().orphan_mitigation_in_progress);
        assert_eq!(
            binding.status.as_ref().map(|s| s.unbind_status),
            Some(UnbindStatus::Required)
        );
    }

    #[test]
    fn failed_phase_without_pending_mitigation_is_terminal() {
        let binding = binding_with_status(ServiceBindingStatus {
            phase: BindingPhase::Failed,
            orphan_mitigation_in_progress: false,
            unbind_status: UnbindStatus::Succeeded,
            ..Default::default()
        });
        assert!(!binding.status.as_ref().unwrap().orphan_mitigation_in_progress);
        assert_eq!(binding.status.as_ref().map(|s| s.phase), Some(BindingPhase::Failed));
    }
}
