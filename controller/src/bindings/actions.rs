use std::collections::BTreeMap;

use catalog_common::{
    error::{Classify, Error},
    patch::patch_status,
};
use catalog_osb_client::{BindRequest, DispatchOutcome, LastOperationState, OsbClient};
use catalog_types::{
    BindingPhase, Operation, OperationKind, PropertiesState, ServiceBinding, UnbindStatus, reasons,
};
use k8s_openapi::{
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::{ByteString, Condition, OwnerReference, Time},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{Patch, PatchParams, PostParams},
};
use serde_json::Value;

use crate::resolver::ResolvedPlanRef;

use super::transform;

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

fn binding_owner_reference(binding: &ServiceBinding) -> OwnerReference {
    OwnerReference {
        api_version: <ServiceBinding as Resource>::api_version(&()).to_string(),
        kind: <ServiceBinding as Resource>::kind(&()).to_string(),
        name: binding.name_any(),
        uid: binding.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub async fn start_bind(client: &Client, binding: &ServiceBinding) -> Result<(), Error> {
    let api: Api<ServiceBinding> =
        Api::namespaced(client.clone(), &binding.namespace().unwrap_or_default());
    patch_status(&api, binding, |status| {
        status.phase = BindingPhase::Binding;
        status.current_operation = Some(Operation {
            kind: OperationKind::Bind,
            started_at: Time(chrono::Utc::now()),
            broker_operation_key: None,
        });
        status.conditions = vec![condition(
            "Ready",
            "False",
            reasons::BINDING,
            "Binding in progress".to_string(),
        )];
    })
    .await?;
    Ok(())
}

pub async fn dispatch_bind(
    client: &Client,
    binding: &ServiceBinding,
    resolved: &ResolvedPlanRef,
    parameters: Option<Value>,
    checksum: String,
    osb: &OsbClient,
    async_operations_enabled: bool,
) -> Result<(), Error> {
    let req = BindRequest {
        service_id: resolved.class.spec.external_id.clone(),
        plan_id: resolved.plan.spec.external_id.clone(),
        bind_resource: None,
        parameters: parameters.clone(),
    };
    let outcome = osb
        .bind(
            &binding.spec.instance_ref.name,
            &binding.spec.external_id,
            async_operations_enabled,
            &req,
            None,
        )
        .await;

    let api: Api<ServiceBinding> =
        Api::namespaced(client.clone(), &binding.namespace().unwrap_or_default());
    match outcome {
        Ok(DispatchOutcome::Completed(response)) => {
            complete_bind(client, &api, binding, checksum, response.credentials).await
        }
        Ok(DispatchOutcome::Async { operation }) => {
            patch_status(&api, binding, |status| {
                status.last_operation_key = operation;
                status.in_progress_properties = Some(PropertiesState {
                    parameters_checksum: Some(checksum),
                    user_info: binding.spec.user_info.clone(),
                });
            })
            .await?;
            Ok(())
        }
        Err(e) if e.requires_orphan_mitigation() => {
            mark_failed(client, binding, reasons::BIND_FAILED, e.to_string(), true).await?;
            Err(Error::UserInput(e.to_string()))
        }
        Err(e) => {
            patch_status(&api, binding, |status| {
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::BIND_FAILED,
                    e.to_string(),
                )];
            })
            .await?;
            Err(Error::UserInput(e.to_string()))
        }
    }
}

async fn complete_bind(
    client: &Client,
    api: &Api<ServiceBinding>,
    binding: &ServiceBinding,
    checksum: String,
    credentials: Option<Value>,
) -> Result<(), Error> {
    let raw = match credentials {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut m = serde_json::Map::new();
            m.insert("credentials".to_string(), other);
            m
        }
        None => serde_json::Map::new(),
    };

    let mut extra_secrets = Vec::new();
    for t in &binding.spec.secret_transforms {
        if let catalog_types::SecretTransform::AddKeysFrom { secret_ref } = t {
            let secrets: Api<Secret> =
                Api::namespaced(client.clone(), &binding.namespace().unwrap_or_default());
            let secret = secrets.get(&secret_ref.name).await?;
            extra_secrets.push((secret_ref.name.clone(), secret_to_map(&secret)));
        }
    }

    let transformed = transform::apply(raw, &binding.spec.secret_transforms, &extra_secrets)?;

    match inject_secret(client, binding, transformed).await {
        Ok(()) => {
            patch_status(api, binding, |status| {
                status.phase = BindingPhase::Ready;
                status.current_operation = None;
                status.last_operation_key = None;
                status.unbind_status = UnbindStatus::Required;
                status.bound_at = Some(Time(chrono::Utc::now()));
                status.external_properties = Some(PropertiesState {
                    parameters_checksum: Some(checksum),
                    user_info: binding.spec.user_info.clone(),
                });
                status.in_progress_properties = None;
                status.reconciled_generation = binding.metadata.generation.unwrap_or_default();
                status.conditions = vec![condition(
                    "Ready",
                    "True",
                    reasons::BOUND,
                    "The binding was injected successfully".to_string(),
                )];
            })
            .await?;
            Ok(())
        }
        Err(e) => {
            patch_status(api, binding, |status| {
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::SECRET_CONFLICT,
                    e.to_string(),
                )];
            })
            .await?;
            Err(e)
        }
    }
}

fn secret_to_map(secret: &Secret) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    for (k, v) in secret.data.iter().flatten() {
        let value = serde_json::from_slice(&v.0)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&v.0).into_owned()));
        out.insert(k.clone(), value);
    }
    out
}

/// Writes the transformed credential map into `spec.secretName`, refusing
/// to touch a pre-existing Secret this binding does not already own — a
/// name collision with a Secret the cluster owner manages by hand must
/// surface as `ErrorInjectingBindResult`, not silently clobber it.
async fn inject_secret(
    client: &Client,
    binding: &ServiceBinding,
    data: serde_json::Map<String, Value>,
) -> Result<(), Error> {
    let namespace = binding.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    let mut bytes: BTreeMap<String, ByteString> = BTreeMap::new();
    for (k, v) in data {
        let raw = match v {
            Value::String(s) => s.into_bytes(),
            other => serde_json::to_vec(&other)?,
        };
        bytes.insert(k, ByteString(raw));
    }

    let mut secret = Secret {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(binding.spec.secret_name.clone()),
            namespace: Some(namespace),
            owner_references: Some(vec![binding_owner_reference(binding)]),
            ..Default::default()
        },
        data: Some(bytes),
        ..Default::default()
    };
    secret.type_ = Some("servicecatalog.example.io/binding".to_string());

    if let Some(existing) = secrets.get_opt(&binding.spec.secret_name).await? {
        let owned_by_this_binding = existing
            .owner_references()
            .iter()
            .any(|o| o.uid == binding.uid().unwrap_or_default());
        if !owned_by_this_binding {
            return Err(Error::UserInput(format!(
                "secret {} already exists and is not owned by this binding",
                binding.spec.secret_name
            )));
        }
    }

    match secrets
        .patch(
            &binding.spec.secret_name,
            &PatchParams::apply(catalog_common::MANAGER_NAME).force(),
            &Patch::Apply(&secret),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            secrets.create(&PostParams::default(), &secret).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn start_unbind(client: &Client, binding: &ServiceBinding) -> Result<(), Error> {
    let api: Api<ServiceBinding> =
        Api::namespaced(client.clone(), &binding.namespace().unwrap_or_default());
    patch_status(&api, binding, |status| {
        status.phase = BindingPhase::Unbinding;
        status.current_operation = Some(Operation {
            kind: OperationKind::Unbind,
            started_at: Time(chrono::Utc::now()),
            broker_operation_key: None,
        });
        status.conditions = vec![condition(
            "Ready",
            "False",
            reasons::UNBINDING,
            "Unbinding in progress".to_string(),
        )];
    })
    .await?;

    let secrets: Api<Secret> =
        Api::namespaced(client.clone(), &binding.namespace().unwrap_or_default());
    match secrets
        .delete(&binding.spec.secret_name, &kube::api::DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn dispatch_unbind(
    client: &Client,
    binding: &ServiceBinding,
    resolved: &ResolvedPlanRef,
    osb: &OsbClient,
    async_operations_enabled: bool,
) -> Result<(), Error> {
    let outcome = osb
        .unbind(
            &binding.spec.instance_ref.name,
            &binding.spec.external_id,
            &resolved.class.spec.external_id,
            &resolved.plan.spec.external_id,
            async_operations_enabled,
            None,
        )
        .await;

    let api: Api<ServiceBinding> =
        Api::namespaced(client.clone(), &binding.namespace().unwrap_or_default());
    match outcome {
        Ok(DispatchOutcome::Completed(_)) => complete_unbind(&api, binding).await,
        Ok(DispatchOutcome::Async { operation }) => {
            patch_status(&api, binding, |status| {
                status.last_operation_key = operation;
            })
            .await?;
            Ok(())
        }
        Err(e) if matches!(e, catalog_osb_client::OsbError::Gone) => {
            complete_unbind(&api, binding).await
        }
        Err(e) if e.requires_orphan_mitigation() => {
            patch_status(&api, binding, |status| {
                status.phase = BindingPhase::Failed;
                status.current_operation = None;
                status.unbind_status = UnbindStatus::Failed;
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::UNBIND_FAILED,
                    e.to_string(),
                )];
            })
            .await?;
            Err(Error::UserInput(e.to_string()))
        }
        Err(e) => {
            patch_status(&api, binding, |status| {
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::UNBIND_FAILED,
                    e.to_string(),
                )];
            })
            .await?;
            Err(Error::UserInput(e.to_string()))
        }
    }
}

async fn complete_unbind(api: &Api<ServiceBinding>, binding: &ServiceBinding) -> Result<(), Error> {
    let mitigation_reason = binding
        .status
        .as_ref()
        .filter(|s| s.orphan_mitigation_in_progress)
        .and_then(|s| s.orphan_mitigation_reason.clone());
    patch_status(api, binding, |status| {
        status.current_operation = None;
        status.last_operation_key = None;
        status.unbind_status = UnbindStatus::Succeeded;
        match &mitigation_reason {
            Some(original) => {
                status.phase = BindingPhase::Failed;
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
                status.conditions = vec![condition(
                    "Ready",
                    "False",
                    reasons::UNBOUND,
                    "The binding was unbound successfully".to_string(),
                )];
            }
        }
    })
    .await?;
    Ok(())
}

/// Polls the broker's `last_operation` endpoint for a binding's in-flight
/// bind/unbind, mirroring `instances::actions::poll`.
pub async fn poll(
    client: &Client,
    binding: &ServiceBinding,
    osb: &OsbClient,
) -> Result<LastOperationState, Error> {
    let op = binding
        .status
        .as_ref()
        .and_then(|s| s.current_operation.as_ref())
        .map(|o| o.kind);
    let result = osb
        .poll_binding_last_operation(
            &binding.spec.instance_ref.name,
            &binding.spec.external_id,
            binding
                .status
                .as_ref()
                .and_then(|s| s.last_operation_key.as_deref()),
        )
        .await
        .map_err(|e| Error::UserInput(e.to_string()))?;

    let api: Api<ServiceBinding> =
        Api::namespaced(client.clone(), &binding.namespace().unwrap_or_default());
    match result.state {
        LastOperationState::InProgress => {}
        LastOperationState::Succeeded => match op {
            Some(OperationKind::Bind) => {
                let checksum = binding
                    .status
                    .as_ref()
                    .and_then(|s| s.in_progress_properties.as_ref())
                    .and_then(|p| p.parameters_checksum.clone())
                    .unwrap_or_default();
                let credentials = osb
                    .get_binding(&binding.spec.instance_ref.name, &binding.spec.external_id)
                    .await
                    .map_err(|e| Error::UserInput(e.to_string()))?
                    .credentials;
                complete_bind(client, &api, binding, checksum, credentials).await?;
            }
            Some(OperationKind::Unbind) => {
                complete_unbind(&api, binding).await?;
            }
            _ => {}
        },
        LastOperationState::Failed => {
            let message = result
                .description
                .clone()
                .unwrap_or_else(|| "last_operation reported failed".to_string());
            match op {
                Some(OperationKind::Bind) => {
                    mark_failed(client, binding, reasons::BIND_FAILED, message, true).await?;
                }
                _ => {
                    // Unbind: leave currentOperation in place so the normal
                    // retry-budget/backoff path keeps retrying until
                    // RetryTimedOut promotes this to a terminal Failed.
                    patch_status(&api, binding, |status| {
                        status.conditions = vec![condition(
                            "Ready",
                            "False",
                            reasons::UNBIND_FAILED,
                            message.clone(),
                        )];
                    })
                    .await?;
                }
            }
        }
    }
    Ok(result.state)
}

pub async fn note_condition(
    client: &Client,
    binding: &ServiceBinding,
    reason: &str,
    message: String,
) -> Result<(), Error> {
    let api: Api<ServiceBinding> =
        Api::namespaced(client.clone(), &binding.namespace().unwrap_or_default());
    patch_status(&api, binding, |status| {
        status.conditions = vec![condition("Ready", "False", reason, message)];
    })
    .await?;
    Ok(())
}

pub async fn mark_failed(
    client: &Client,
    binding: &ServiceBinding,
    reason: &str,
    message: String,
    orphan_mitigation: bool,
) -> Result<(), Error> {
    let api: Api<ServiceBinding> =
        Api::namespaced(client.clone(), &binding.namespace().unwrap_or_default());
    patch_status(&api, binding, |status| {
        status.phase = BindingPhase::Failed;
        status.current_operation = None;
        status.orphan_mitigation_in_progress = orphan_mitigation;
        if orphan_mitigation {
            status.unbind_status = UnbindStatus::Required;
            status.orphan_mitigation_reason = Some(message.clone());
        }
        status.conditions = vec![condition("Ready", "False", reason, message)];
    })
    .await?;
    Ok(())
}
