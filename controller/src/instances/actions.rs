use catalog_common::{
    error::{Classify, Error},
    patch::patch_status,
};
use catalog_osb_client::{DispatchOutcome, LastOperationState, OsbClient, ProvisionRequest, UpdateInstanceRequest};
use catalog_types::{
    DeprovisionStatus, InstancePhase, LocalObjectReference, Operation, OperationKind,
    PropertiesState, ServiceInstance, reasons,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{Api, Client, ResourceExt};
use serde_json::Value;

use crate::resolver::ResolvedPlanRef;

fn condition(type_: &str, status: &str, reason: &str, message: String) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: Time(chrono::Utc::now()),
        observed_generation: None,
    }
}

pub async fn start_provision(
    client: &Client,
    instance: &ServiceInstance,
    resolved: &ResolvedPlanRef,
) -> Result<(), Error> {
    let api: Api<ServiceInstance> = Api::namespaced(client.clone(), &instance.namespace().unwrap_or_default());
    patch_status(&api, instance, |status| {
        status.phase = InstancePhase::Provisioning;
        status.class_ref = Some(LocalObjectReference {
            name: resolved.class.name_any(),
        });
        status.plan_ref = Some(LocalObjectReference {
            name: resolved.plan.name_any(),
        });
        status.current_operation = Some(Operation {
            kind: OperationKind::Provision,
            started_at: Time(chrono::Utc::now()),
            broker_operation_key: None,
        });
        status.conditions = vec![condition(
            "Ready",
            "False",
            reasons::PROVISIONING,
            "Provisioning in progress".to_string(),
        )];
    })
    .await?;
    Ok(())
}

pub async fn dispatch_provision(
    client: &Client,
    instance: &ServiceInstance,
    resolved: &ResolvedPlanRef,
    parameters: Option<Value>,
    checksum: String,
    osb: &OsbClient,
) -> Result<(), Error> {
    let req = ProvisionRequest {
        service_id: resolved.class.spec.external_id.clone(),
        plan_id: resolved.plan.spec.external_id.clone(),
        organization_guid: instance.namespace().unwrap_or_default(),
        space_guid: instance.namespace().unwrap_or_default(),
        context: None,
        parameters: parameters.clone(),
    };
    let outcome = osb
        .provision_instance(&instance.spec.external_id, true, &req, None)
        .await;

    let api: Api<ServiceInstance> = Api::namespaced(client.clone(), &instance.namespace().unwrap_or_default());
    match outcome {
        Ok(DispatchOutcome::Completed(_)) => {
            complete_provision(&api, instance, checksum).await
        }
        Ok(DispatchOutcome::Async { operation }) => {
            patch_status(&api, instance, |status| {
                status.last_operation_key = operation;
                status.in_progress_properties = Some(PropertiesState {
                    parameters_checksum: Some(checksum),
                    user_info: instance.spec.user_info.clone(),
                });
            })
            .await?;
            Ok(())
        }
        Err(e) if e.requires_orphan_mitigation() => {
            mark_failed(client, instance, reasons::PROVISION_FAILED, e.to_string(), true).await?;
            Err(Error::UserInput(e.to_string()))
        }
        Err(e) => {
            patch_status(&api, instance, |status| {
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::PROVISION_FAILED,
                    e.to_string(),
                )];
            })
            .await?;
            Err(Error::UserInput(e.to_string()))
        }
    }
}

async fn complete_provision(
    api: &Api<ServiceInstance>,
    instance: &ServiceInstance,
    checksum: String,
) -> Result<(), Error> {
    patch_status(api, instance, |status| {
        status.phase = InstancePhase::Ready;
        status.current_operation = None;
        status.last_operation_key = None;
        status.deprovision_status = DeprovisionStatus::Required;
        status.provisioned_at = Some(Time(chrono::Utc::now()));
        status.external_properties = Some(PropertiesState {
            parameters_checksum: Some(checksum),
            user_info: instance.spec.user_info.clone(),
        });
        status.in_progress_properties = None;
        status.reconciled_generation = instance.metadata.generation.unwrap_or_default();
        status.conditions = vec![condition(
            "Ready",
            "True",
            reasons::PROVISIONED,
            "The instance was provisioned successfully".to_string(),
        )];
    })
    .await?;
    Ok(())
}

pub async fn start_update(client: &Client, instance: &ServiceInstance) -> Result<(), Error> {
    let api: Api<ServiceInstance> = Api::namespaced(client.clone(), &instance.namespace().unwrap_or_default());
    patch_status(&api, instance, |status| {
        status.phase = InstancePhase::Updating;
        status.current_operation = Some(Operation {
            kind: OperationKind::Update,
            started_at: Time(chrono::Utc::now()),
            broker_operation_key: None,
        });
        status.conditions = vec![condition(
            "Ready",
            "False",
            reasons::UPDATING,
            "Update in progress".to_string(),
        )];
    })
    .await?;
    Ok(())
}

pub async fn dispatch_update(
    client: &Client,
    instance: &ServiceInstance,
    resolved: &ResolvedPlanRef,
    parameters: Option<Value>,
    checksum: String,
    osb: &OsbClient,
) -> Result<(), Error> {
    let req = UpdateInstanceRequest {
        service_id: resolved.class.spec.external_id.clone(),
        plan_id: Some(resolved.plan.spec.external_id.clone()),
        parameters: parameters.clone(),
        previous_values: None,
    };
    let outcome = osb
        .update_instance(&instance.spec.external_id, true, &req, None)
        .await;

    let api: Api<ServiceInstance> = Api::namespaced(client.clone(), &instance.namespace().unwrap_or_default());
    match outcome {
        Ok(DispatchOutcome::Completed(_)) => complete_update(&api, instance, checksum).await,
        Ok(DispatchOutcome::Async { operation }) => {
            patch_status(&api, instance, |status| {
                status.last_operation_key = operation;
                status.in_progress_properties = Some(PropertiesState {
                    parameters_checksum: Some(checksum),
                    user_info: instance.spec.user_info.clone(),
                });
            })
            .await?;
            Ok(())
        }
        Err(e) if e.requires_orphan_mitigation() => {
            mark_failed(client, instance, reasons::UPDATE_FAILED, e.to_string(), false).await?;
            Err(Error::UserInput(e.to_string()))
        }
        Err(e) => {
            patch_status(&api, instance, |status| {
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::UPDATE_FAILED,
                    e.to_string(),
                )];
            })
            .await?;
            Err(Error::UserInput(e.to_string()))
        }
    }
}

async fn complete_update(
    api: &Api<ServiceInstance>,
    instance: &ServiceInstance,
    checksum: String,
) -> Result<(), Error> {
    patch_status(api, instance, |status| {
        status.phase = InstancePhase::Ready;
        status.current_operation = None;
        status.last_operation_key = None;
        status.external_properties = Some(PropertiesState {
            parameters_checksum: Some(checksum),
            user_info: instance.spec.user_info.clone(),
        });
        status.in_progress_properties = None;
        status.reconciled_generation = instance.metadata.generation.unwrap_or_default();
        status.reconciled_update_requests = instance.spec.update_requests;
        status.conditions = vec![condition(
            "Ready",
            "True",
            reasons::UPDATED,
            "The instance was updated successfully".to_string(),
        )];
    })
    .await?;
    Ok(())
}

pub async fn start_deprovision(client: &Client, instance: &ServiceInstance) -> Result<(), Error> {
    let api: Api<ServiceInstance> = Api::namespaced(client.clone(), &instance.namespace().unwrap_or_default());
    patch_status(&api, instance, |status| {
        status.phase = InstancePhase::Deprovisioning;
        status.current_operation = Some(Operation {
            kind: OperationKind::Deprovision,
            started_at: Time(chrono::Utc::now()),
            broker_operation_key: None,
        });
        status.conditions = vec![condition(
            "Ready",
            "False",
            reasons::DEPROVISIONING,
            "Deprovisioning in progress".to_string(),
        )];
    })
    .await?;
    Ok(())
}

pub async fn dispatch_deprovision(
    client: &Client,
    instance: &ServiceInstance,
    resolved: &ResolvedPlanRef,
    osb: &OsbClient,
) -> Result<(), Error> {
    let outcome = osb
        .deprovision_instance(
            &instance.spec.external_id,
            &resolved.class.spec.external_id,
            &resolved.plan.spec.external_id,
            true,
            None,
        )
        .await;

    let api: Api<ServiceInstance> = Api::namespaced(client.clone(), &instance.namespace().unwrap_or_default());
    match outcome {
        Ok(DispatchOutcome::Completed(_)) => complete_deprovision(&api, instance).await,
        Ok(DispatchOutcome::Async { operation }) => {
            patch_status(&api, instance, |status| {
                status.last_operation_key = operation;
            })
            .await?;
            Ok(())
        }
        Err(e) if matches!(e, catalog_osb_client::OsbError::Gone) => {
            complete_deprovision(&api, instance).await
        }
        Err(e) if e.requires_orphan_mitigation() => {
            patch_status(&api, instance, |status| {
                status.phase = InstancePhase::Failed;
                status.current_operation = None;
                status.deprovision_status = DeprovisionStatus::Failed;
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::DEPROVISION_FAILED,
                    e.to_string(),
                )];
            })
            .await?;
            Err(Error::UserInput(e.to_string()))
        }
        Err(e) => {
            patch_status(&api, instance, |status| {
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::DEPROVISION_FAILED,
                    e.to_string(),
                )];
            })
            .await?;
            Err(Error::UserInput(e.to_string()))
        }
    }
}

async fn complete_deprovision(api: &Api<ServiceInstance>, instance: &ServiceInstance) -> Result<(), Error> {
    let mitigation_reason = instance
        .status
        .as_ref()
        .filter(|s| s.orphan_mitigation_in_progress)
        .and_then(|s| s.orphan_mitigation_reason.clone());
    patch_status(api, instance, |status| {
        status.current_operation = None;
        status.last_operation_key = None;
        status.deprovision_status = DeprovisionStatus::Succeeded;
        match &mitigation_reason {
            Some(original) => {
                status.phase = InstancePhase::Failed;
                status.orphan_mitigation_in_progress = false;
                status.orphan_mitigation_reason = None;
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::ORPHAN_MITIGATION,
                    format!("orphan mitigation complete; original failure: {original}"),
                )];
            }
            None => {
                status.phase = InstancePhase::Deprovisioning;
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::DEPROVISIONED,
                    "The instance was deprovisioned successfully".to_string(),
                )];
            }
        }
    })
    .await?;
    Ok(())
}

/// Polls the broker's `last_operation` endpoint for the operation currently
/// recorded in `status.currentOperation`, advancing to the terminal state on
/// `succeeded`/`failed` and leaving status untouched (just requeued by the
/// caller on the backoff curve) while still `in_progress`.
pub async fn poll(
    client: &Client,
    instance: &ServiceInstance,
    osb: &OsbClient,
) -> Result<LastOperationState, Error> {
    let op = instance
        .status
        .as_ref()
        .and_then(|s| s.current_operation.as_ref())
        .map(|o| o.kind);
    let result = osb
        .poll_instance_last_operation(
            &instance.spec.external_id,
            instance
                .status
                .as_ref()
                .and_then(|s| s.last_operation_key.as_deref()),
        )
        .await
        .map_err(|e| Error::UserInput(e.to_string()))?;

    let api: Api<ServiceInstance> = Api::namespaced(client.clone(), &instance.namespace().unwrap_or_default());
    match result.state {
        LastOperationState::InProgress => {}
        LastOperationState::Succeeded => match op {
            Some(OperationKind::Provision) => {
                let checksum = instance
                    .status
                    .as_ref()
                    .and_then(|s| s.in_progress_properties.as_ref())
                    .and_then(|p| p.parameters_checksum.clone())
                    .unwrap_or_default();
                complete_provision(&api, instance, checksum).await?;
            }
            Some(OperationKind::Update) => {
                let checksum = instance
                    .status
                    .as_ref()
                    .and_then(|s| s.in_progress_properties.as_ref())
                    .and_then(|p| p.parameters_checksum.clone())
                    .unwrap_or_default();
                complete_update(&api, instance, checksum).await?;
            }
            Some(OperationKind::Deprovision) => {
                complete_deprovision(&api, instance).await?;
            }
            _ => {}
        },
        LastOperationState::Failed => {
            let message = result
                .description
                .clone()
                .unwrap_or_else(|| "last_operation reported failed".to_string());
            match op {
                Some(OperationKind::Provision) => {
                    mark_failed(client, instance, reasons::PROVISION_FAILED, message, true).await?;
                }
                _ => {
                    // Deprovision/Update: leave currentOperation in place so the
                    // normal retry-budget/backoff path keeps retrying until
                    // RetryTimedOut promotes this to a terminal Failed.
                    let reason = match op {
                        Some(OperationKind::Deprovision) => reasons::DEPROVISION_FAILED,
                        _ => reasons::UPDATE_FAILED,
                    };
                    patch_status(&api, instance, |status| {
                        status.conditions = vec![condition("Ready", "False", reason, message.clone())];
                    })
                    .await?;
                }
            }
        }
    }
    Ok(result.state)
}

/// Records a condition without forcing `phase` to `Failed` — used for
/// transient failures (an unresolved plan reference, a broker call error
/// before the retry budget is exhausted) that should keep retrying rather
/// than present as terminal.
pub async fn note_condition(
    client: &Client,
    instance: &ServiceInstance,
    reason: &str,
    message: String,
) -> Result<(), Error> {
    let api: Api<ServiceInstance> = Api::namespaced(client.clone(), &instance.namespace().unwrap_or_default());
    patch_status(&api, instance, |status| {
        status.conditions = vec![condition("Ready", "False", reason, message)];
    })
    .await?;
    Ok(())
}

pub async fn mark_failed(
    client: &Client,
    instance: &ServiceInstance,
    reason: &str,
    message: String,
    orphan_mitigation: bool,
) -> Result<(), Error> {
    let api: Api<ServiceInstance> = Api::namespaced(client.clone(), &instance.namespace().unwrap_or_default());
    patch_status(&api, instance, |status| {
        status.phase = InstancePhase::Failed;
        status.current_operation = None;
        status.orphan_mitigation_in_progress = orphan_mitigation;
        if orphan_mitigation {
            status.deprovision_status = DeprovisionStatus::Required;
            status.orphan_mitigation_reason = Some(message.clone());
        }
        status.conditions = vec![condition("Ready", "False", reason, message)];
    })
    .await?;
    Ok(())
}
