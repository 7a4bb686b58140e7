use catalog_types::{ServiceBinding, ServiceInstance};
use kube::{Api, Client, api::ListParams};

/// Returns every `ServiceInstance` (in any namespace) whose resolved
/// `status.classRef` points at `class_name`. Used by the class/plan reaper
/// to decide whether a `RemovedFromBrokerCatalog` class or plan is safe to
/// delete.
pub async fn instances_referencing_class(
    client: &Client,
    class_name: &str,
) -> Result<Vec<ServiceInstance>, kube::Error> {
    let api: Api<ServiceInstance> = Api::all(client.clone());
    let all = api.list(&ListParams::default()).await?;
    Ok(all
        .items
        .into_iter()
        .filter(|i| {
            i.status
                .as_ref()
                .and_then(|s| s.class_ref.as_ref())
                .is_some_and(|r| r.name == class_name)
        })
        .collect())
}

pub async fn instances_referencing_plan(
    client: &Client,
    plan_name: &str,
) -> Result<Vec<ServiceInstance>, kube::Error> {
    let api: Api<ServiceInstance> = Api::all(client.clone());
    let all = api.list(&ListParams::default()).await?;
    Ok(all
        .items
        .into_iter()
        .filter(|i| {
            i.status
                .as_ref()
                .and_then(|s| s.plan_ref.as_ref())
                .is_some_and(|r| r.name == plan_name)
        })
        .collect())
}

/// Returns every `ServiceBinding` (in any namespace) referencing `instance_name`
/// in the given namespace. Used when an instance enters deprovisioning to
/// confirm no live bindings remain.
pub async fn bindings_referencing_instance(
    client: &Client,
    namespace: &str,
    instance_name: &str,
) -> Result<Vec<ServiceBinding>, kube::Error> {
    let api: Api<ServiceBinding> = Api::namespaced(client.clone(), namespace);
    let all = api.list(&ListParams::default()).await?;
    Ok(all
        .items
        .into_iter()
        .filter(|b| b.spec.instance_ref.name == instance_name)
        .collect())
}
