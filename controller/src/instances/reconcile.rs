use std::{sync::Arc, time::Duration};

use catalog_common::{
    colors::{FG1, FG2},
    error::{Classify, Error},
    finalizer,
    leader::run_elected,
};
use catalog_osb_client::LastOperationState;
use catalog_types::{DeprovisionStatus, InstancePhase, OperationKind, ServiceInstance};
use futures::stream::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    api::ListParams,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use super::{actions, params};
use crate::{cache, context::Context, resolver};

const FINALIZER: &str = "servicecatalog.example.io/instance-protection";

pub async fn run(client: Client, context: Arc<Context>, shutdown: CancellationToken) {
    println!("{}", "Starting ServiceInstance controller...".green());
    let namespace = context.config.namespace.clone();
    run_elected(
        client.clone(),
        &namespace,
        "servicecatalog-instance-controller-lock",
        shutdown,
        move || {
            let client = client.clone();
            let context = context.clone();
            async move {
                let instances: Api<ServiceInstance> = Api::all(client);
                Controller::new(instances, ListParams::default())
                    .run(reconcile, on_error, context)
                    .for_each(|_res| async move {})
                    .await;
            }
        },
    )
    .await;
}

#[derive(Debug, Clone)]
enum InstanceAction {
    AddFinalizer,
    Provision,
    Update,
    AwaitAsync,
    Deprovision,
    ReapFinalizer,
    RetryTimedOut,
    NoOp,
    Requeue(Duration),
}

impl InstanceAction {
    fn label(&self) -> &'static str {
        match self {
            InstanceAction::AddFinalizer => "AddFinalizer",
            InstanceAction::Provision => "Provision",
            InstanceAction::Update => "Update",
            InstanceAction::AwaitAsync => "AwaitAsync",
            InstanceAction::Deprovision => "Deprovision",
            InstanceAction::ReapFinalizer => "ReapFinalizer",
            InstanceAction::RetryTimedOut => "RetryTimedOut",
            InstanceAction::NoOp => "NoOp",
            InstanceAction::Requeue(_) => "Requeue",
        }
    }
}

fn retry_budget_exceeded(instance: &ServiceInstance, budget: Duration) -> bool {
    instance
        .status
        .as_ref()
        .and_then(|s| s.current_operation.as_ref())
        .map(|op| chrono::Utc::now().signed_duration_since(op.started_at.0))
        .and_then(|age| age.to_std().ok())
        .is_some_and(|age| age >= budget)
}

async fn determine_action(
    instance: &ServiceInstance,
    context: &Context,
) -> Result<InstanceAction, Error> {
    if instance.metadata.deletion_timestamp.is_some() {
        let deprovision_status = instance
            .status
            .as_ref()
            .map(|s| s.deprovision_status)
            .unwrap_or(DeprovisionStatus::NotRequired);
        if instance
            .status
            .as_ref()
            .and_then(|s| s.current_operation.as_ref())
            .is_some()
        {
            if retry_budget_exceeded(instance, context.config.reconciliation_retry_duration) {
                return Ok(InstanceAction::RetryTimedOut);
            }
            return Ok(InstanceAction::AwaitAsync);
        }
        return match deprovision_status {
            DeprovisionStatus::Required => {
                let bindings = cache::bindings_referencing_instance(
                    &context.client,
                    &instance.namespace().unwrap_or_default(),
                    &instance.name_any(),
                )
                .await?;
                if bindings.is_empty() {
                    Ok(InstanceAction::Deprovision)
                } else {
                    Ok(InstanceAction::Requeue(Duration::from_secs(5)))
                }
            }
            DeprovisionStatus::Succeeded | DeprovisionStatus::NotRequired => {
                Ok(InstanceAction::ReapFinalizer)
            }
            DeprovisionStatus::Failed => Ok(InstanceAction::Requeue(Duration::from_secs(30))),
        };
    }

    if !finalizer::has(instance, FINALIZER) {
        return Ok(InstanceAction::AddFinalizer);
    }

    if instance
        .status
        .as_ref()
        .and_then(|s| s.current_operation.as_ref())
        .is_some()
    {
        if retry_budget_exceeded(instance, context.config.reconciliation_retry_duration) {
            return Ok(InstanceAction::RetryTimedOut);
        }
        return Ok(InstanceAction::AwaitAsync);
    }

    if instance
        .status
        .as_ref()
        .is_some_and(|s| s.orphan_mitigation_in_progress)
    {
        return Ok(InstanceAction::Deprovision);
    }

    if instance.status.as_ref().map(|s| s.phase) == Some(InstancePhase::Failed) {
        return Ok(InstanceAction::NoOp);
    }

    let (_parameters, checksum) = params::assemble(
        &context.client,
        &instance.namespace().unwrap_or_default(),
        instance.spec.parameters.as_ref(),
        &instance.spec.parameters_from,
    )
    .await?;

    let never_provisioned = instance
        .status
        .as_ref()
        .and_then(|s| s.external_properties.as_ref())
        .is_none();
    if never_provisioned {
        return Ok(InstanceAction::Provision);
    }

    let current_checksum = instance
        .status
        .as_ref()
        .and_then(|s| s.external_properties.as_ref())
        .and_then(|p| p.parameters_checksum.as_deref());
    let reconciled_update_requests = instance
        .status
        .as_ref()
        .map(|s| s.reconciled_update_requests)
        .unwrap_or_default();
    if current_checksum != Some(checksum.as_str())
        || reconciled_update_requests != instance.spec.update_requests
    {
        return Ok(InstanceAction::Update);
    }

    Ok(InstanceAction::NoOp)
}

async fn reconcile(instance: Arc<ServiceInstance>, context: Arc<Context>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("ServiceInstance must be namespaced".to_string()))?;
    let name = instance.name_any();
    let key = format!("{namespace}/{name}");

    let action = determine_action(&instance, &context).await?;
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
        InstanceAction::AddFinalizer => {
            let api: Api<ServiceInstance> = Api::namespaced(client, &namespace);
            finalizer::add(&api, &instance, FINALIZER).await?;
            Action::requeue(Duration::from_secs(1))
        }
        InstanceAction::Provision => {
            let _permit = context.acquire_sync_permit().await;
            let resolved = resolve_or_note(&client, &instance).await?;
            actions::start_provision(&client, &instance, &resolved).await?;
            let (parameters, checksum) = params::assemble(
                &client,
                &namespace,
                instance.spec.parameters.as_ref(),
                &instance.spec.parameters_from,
            )
            .await?;
            let osb = context.osb_client_for(&broker_of(&context, &resolved).await?).await?;
            actions::dispatch_provision(&client, &instance, &resolved, parameters, checksum, &osb)
                .await?;
            Action::requeue(Duration::from_secs(5))
        }
        InstanceAction::Update => {
            let _permit = context.acquire_sync_permit().await;
            let resolved = resolve_or_note(&client, &instance).await?;
            actions::start_update(&client, &instance).await?;
            let (parameters, checksum) = params::assemble(
                &client,
                &namespace,
                instance.spec.parameters.as_ref(),
                &instance.spec.parameters_from,
            )
            .await?;
            let osb = context.osb_client_for(&broker_of(&context, &resolved).await?).await?;
            actions::dispatch_update(&client, &instance, &resolved, parameters, checksum, &osb)
                .await?;
            Action::requeue(Duration::from_secs(5))
        }
        InstanceAction::AwaitAsync => {
            let resolved = resolve_or_note(&client, &instance).await?;
            let osb = context.osb_client_for(&broker_of(&context, &resolved).await?).await?;
            let state = actions::poll(&client, &instance, &osb).await?;
            match state {
                LastOperationState::InProgress => {
                    Action::requeue(next_backoff(&instance, context.config.operation_polling_maximum_backoff_duration))
                }
                _ => Action::await_change(),
            }
        }
        InstanceAction::Deprovision => {
            let _permit = context.acquire_sync_permit().await;
            let resolved = resolve_or_note(&client, &instance).await?;
            actions::start_deprovision(&client, &instance).await?;
            let osb = context.osb_client_for(&broker_of(&context, &resolved).await?).await?;
            actions::dispatch_deprovision(&client, &instance, &resolved, &osb).await?;
            Action::requeue(Duration::from_secs(5))
        }
        InstanceAction::ReapFinalizer => {
            let api: Api<ServiceInstance> = Api::namespaced(client, &namespace);
            if finalizer::has(&instance, FINALIZER) {
                finalizer::remove(&api, &instance, FINALIZER).await?;
            }
            Action::await_change()
        }
        InstanceAction::RetryTimedOut => {
            let kind = instance
                .status
                .as_ref()
                .and_then(|s| s.current_operation.as_ref())
                .map(|o| o.kind);
            let orphan_mitigation = matches!(kind, Some(OperationKind::Provision));
            actions::mark_failed(
                &client,
                &instance,
                catalog_types::reasons::RECONCILIATION_RETRY_TIMEOUT,
                "operation did not reach a terminal state within the retry budget".to_string(),
                orphan_mitigation,
            )
            .await?;
            Action::requeue(Duration::from_secs(30))
        }
        InstanceAction::Requeue(d) => Action::requeue(d),
        InstanceAction::NoOp => Action::requeue(context.config.resync_interval),
    };

    Ok(result)
}

/// Operation polling backoff: `min(2^attempt * 5s, ceiling)`, attempt
/// approximated from how long the current operation has been in flight so a
/// crash-restarted controller resumes roughly where the curve left off
/// instead of re-polling at the tightest interval.
fn next_backoff(instance: &ServiceInstance, ceiling: Duration) -> Duration {
    let elapsed = instance
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
    instance: &ServiceInstance,
) -> Result<resolver::ResolvedPlanRef, Error> {
    match resolver::resolve_plan_reference(client, &instance.spec.plan_reference).await {
        Ok(resolved) => Ok(resolved),
        Err(e) => {
            actions::note_condition(
                client,
                instance,
                catalog_types::reasons::REFERENCE_RESOLVE_FAILED,
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

fn on_error(instance: Arc<ServiceInstance>, error: &Error, _context: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!(
            "service instance {}/{} reconciliation error: {error}",
            instance.namespace().unwrap_or_default(),
            instance.name_any()
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
    use catalog_types::{Operation, PropertiesState, ServiceInstanceStatus};
    use kube::api::ObjectMeta;

    fn instance_with_status(status: ServiceInstanceStatus) -> ServiceInstance {
        ServiceInstance {
            metadata: ObjectMeta {
                name: Some("my-instance".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: serde_json::from_value(serde_json::json!({
                "clusterServiceClassExternalName": "db",
                "clusterServicePlanExternalName": "small",
                "externalId": "11111111-1111-1111-1111-111111111111",
            }))
            .expect("valid ServiceInstanceSpec fixture"),
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
        let instance = instance_with_status(ServiceInstanceStatus {
            current_operation: Some(operation(OperationKind::Provision, chrono::Utc::now())),
            ..Default::default()
        });
        assert!(!retry_budget_exceeded(&instance, Duration::from_secs(3600)));
    }

    #[test]
    fn retry_budget_exceeded_once_operation_outlives_budget() {
        let started = chrono::Utc::now() - chrono::Duration::hours(2);
        let instance = instance_with_status(ServiceInstanceStatus {
            current_operation: Some(operation(OperationKind::Provision, started)),
            ..Default::default()
        });
        assert!(retry_budget_exceeded(&instance, Duration::from_secs(3600)));
    }

    #[test]
    fn retry_budget_not_exceeded_without_a_current_operation() {
        let instance = instance_with_status(ServiceInstanceStatus::default());
        assert!(!retry_budget_exceeded(&instance, Duration::from_secs(1)));
    }

    #[test]
    fn backoff_starts_near_floor_for_a_fresh_operation() {
        let instance = instance_with_status(ServiceInstanceStatus {
            current_operation: Some(operation(OperationKind::Provision, chrono::Utc::now())),
            ..Default::default()
        });
        let backoff = next_backoff(&instance, Duration::from_secs(1200));
        assert_eq!(backoff, Duration::from_secs(5));
    }

    #[test]
    fn backoff_doubles_with_elapsed_time_and_clamps_to_ceiling() {
        let started = chrono::Utc::now() - chrono::Duration::seconds(65);
        let instance = instance_with_status(ServiceInstanceStatus {
            current_operation: Some(operation(OperationKind::Update, started)),
            ..Default::default()
        });
        let backoff = next_backoff(&instance, Duration::from_secs(30));
        assert_eq!(backoff, Duration::from_secs(30));
    }

    #[test]
    fn never_provisioned_instance_without_current_operation_provisions() {
        let instance = instance_with_status(ServiceInstanceStatus::default());
        assert!(
            instance
                .status
                .as_ref()
                .and_then(|s| s.external_properties.as_ref())
                .is_none()
        );
    }

    #[test]
    fn checksum_drift_is_detectable_from_status() {
        let instance = instance_with_status(ServiceInstanceStatus {
            external_properties: Some(PropertiesState {
                parameters_checksum: Some("abc123".to_string()),
                user_info: None,
            }),
            reconciled_update_requests: 2,
            ..Default::default()
        });
        let current_checksum = instance
            .status
            .as_ref()
            .and_then(|s| s.external_properties.as_ref())
            .and_then(|p| p.parameters_checksum.as_deref());
        assert_eq!(current_checksum, Some("abc123"));
        assert_ne!(
            instance.status.as_ref().map(|s| s.reconciled_update_requests),
            Some(3)
        );
    }

    #[test]
    fn orphan_mitigation_without_deletion_still_routes_to_deprovision() {
        let instance = instance_with_status(ServiceInstanceStatus {
            phase: InstancePhase::Failed,
            orphan_mitigation_in_progress: true,
            orphan_mitigation_reason: Some("broker rejected the plan change".to_string()),
            deprovision_status: DeprovisionStatus::Required,
            ..Default::default()
        });
        assert!(instance.metadata.deletion_timestamp.is_none());
        assert!(instance.status.as_ref().unwrap().orphan_mitigation_in_progress);
        assert_eq!(
            instance.status.as_ref().map(|s| s.deprovision_status),
            Some(DeprovisionStatus::Required)
        );
    }

    #[test]
    fn failed_phase_without_pending_mitigation_is_terminal() {
        let instance = instance_with_status(ServiceInstanceStatus {
            phase: InstancePhase::Failed,
            orphan_mitigation_in_progress: false,
            deprovision_status: DeprovisionStatus::Succeeded,
            ..Default::default()
        });
        assert!(!instance.status.as_ref().unwrap().orphan_mitigation_in_progress);
        assert_eq!(instance.status.as_ref().map(|s| s.phase), Some(InstancePhase::Failed));
    }
}
