use catalog_common::error::Error;
use catalog_types::{InstancePhase, ServiceInstance, reasons};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};

use crate::resolver::{self, ResolvedPlanRef};

/// Binding preconditions that must hold before a bind call is dispatched,
/// checked fresh on every reconcile rather than cached from when the
/// binding was created — an instance can leave `Ready` after a binding
/// already exists, and an already-bound instance must not be blocked by a
/// later precondition failure.
pub enum PreconditionFailure {
    InstanceNotReady,
    NotBindable,
    NamespaceNotFound,
}

impl PreconditionFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            PreconditionFailure::InstanceNotReady => reasons::INSTANCE_NOT_READY,
            PreconditionFailure::NotBindable => reasons::NOT_BINDABLE,
            PreconditionFailure::NamespaceNotFound => reasons::NAMESPACE_NOT_FOUND,
        }
    }

    pub fn message(&self) -> String {
        match self {
            PreconditionFailure::InstanceNotReady => {
                "referenced ServiceInstance is not Ready".to_string()
            }
            PreconditionFailure::NotBindable => {
                "resolved plan/class is not bindable".to_string()
            }
            PreconditionFailure::NamespaceNotFound => {
                "binding namespace does not exist".to_string()
            }
        }
    }
}

pub async fn check(
    client: &Client,
    instance: &ServiceInstance,
    resolved: &ResolvedPlanRef,
    namespace: &str,
) -> Result<Result<(), PreconditionFailure>, Error> {
    if instance.status.as_ref().map(|s| s.phase) != Some(InstancePhase::Ready) {
        return Ok(Err(PreconditionFailure::InstanceNotReady));
    }

    if !resolver::effective_bindable(&resolved.class, &resolved.plan) {
        return Ok(Err(PreconditionFailure::NotBindable));
    }

    let namespaces: Api<Namespace> = Api::all(client.clone());
    if namespaces.get_opt(namespace).await?.is_none() {
        return Ok(Err(PreconditionFailure::NamespaceNotFound));
    }

    Ok(Ok(()))
}
