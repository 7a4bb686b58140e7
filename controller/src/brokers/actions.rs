use catalog_common::{annotations, error::Error, patch::patch_status};
use catalog_types::{
    Broker, BrokerPhase, CatalogRestrictions, LocalObjectReference, ServiceClass,
    ServiceClassSpec, ServicePlan, ServicePlanSpec, reasons,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference, Time};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{ListParams, Patch, PatchParams, PostParams},
};

use super::planner::{CatalogPlanEntry, CatalogServiceEntry, filter_catalog_entries, parse_catalog};

pub async fn mark_fetching(client: &Client, broker: &Broker) -> Result<(), Error> {
    let api: Api<Broker> = Api::all(client.clone());
    patch_status(&api, broker, |status| {
        status.phase = BrokerPhase::Fetching;
    })
    .await?;
    Ok(())
}

pub async fn mark_failing(client: &Client, broker: &Broker, reason: String) -> Result<(), Error> {
    let api: Api<Broker> = Api::all(client.clone());
    patch_status(&api, broker, |status| {
        status.phase = BrokerPhase::Failing;
        status.conditions = vec![failing_condition(reason.clone())];
    })
    .await?;
    Ok(())
}

pub async fn mark_deleting(client: &Client, broker: &Broker) -> Result<(), Error> {
    let api: Api<Broker> = Api::all(client.clone());
    patch_status(&api, broker, |status| {
        status.phase = BrokerPhase::Deleting;
    })
    .await?;
    Ok(())
}

fn failing_condition(reason: String) -> Condition {
    Condition {
        type_: "Ready".to_string(),
        status: "False".to_string(),
        reason: reasons::CATALOG_FETCH_FAILED.to_string(),
        message: reason,
        last_transition_time: Time(chrono::Utc::now()),
        observed_generation: None,
    }
}

fn ready_condition() -> Condition {
    Condition {
        type_: "Ready".to_string(),
        status: "True".to_string(),
        reason: reasons::CATALOG_READY.to_string(),
        message: "Catalog fetched and published".to_string(),
        last_transition_time: Time(chrono::Utc::now()),
        observed_generation: None,
    }
}

/// Upserts a `ServiceClass`/`ServicePlan` pair for every entry in the
/// already-fetched, already-filtered catalog, then marks every
/// pre-existing class/plan owned by this broker that no longer appears as
/// `removedFromBrokerCatalog=true`. Deletion of orphaned classes/plans is
/// left to the reaper (classes::reconcile) once no instance references
/// them.
pub async fn publish_catalog(
    client: &Client,
    broker: &Broker,
    restrictions: Option<&CatalogRestrictions>,
    raw: catalog_osb_client::CatalogResponse,
    checksum: &str,
) -> Result<(), Error> {
    let entries = parse_catalog(&raw).map_err(|e| Error::UserInput(e.to_string()))?;
    let entries = filter_catalog_entries(entries, restrictions);

    let classes_api: Api<ServiceClass> = Api::all(client.clone());
    let plans_api: Api<ServicePlan> = Api::all(client.clone());

    let mut live_class_names = Vec::new();
    let mut live_plan_names = Vec::new();

    for entry in &entries {
        let class_name = class_resource_name(broker, entry);
        live_class_names.push(class_name.clone());
        upsert_class(&classes_api, broker, &class_name, entry).await?;

        for plan in &entry.plans {
            let plan_name = plan_resource_name(broker, entry, plan);
            live_plan_names.push(plan_name.clone());
            upsert_plan(&plans_api, broker, &class_name, &plan_name, plan).await?;
        }
    }

    mark_classes_removed(&classes_api, broker, &live_class_names).await?;
    mark_plans_removed(&plans_api, broker, &live_plan_names).await?;

    let broker_api: Api<Broker> = Api::all(client.clone());
    let generation = broker.metadata.generation.unwrap_or_default();
    patch_status(&broker_api, broker, |status| {
        status.phase = BrokerPhase::Ready;
        status.conditions = vec![ready_condition()];
        status.last_catalog_fetch_time = Some(Time(chrono::Utc::now()));
        status.last_catalog_fetch_checksum = Some(checksum.to_string());
        status.reconciled_generation = generation;
    })
    .await?;

    Ok(())
}

fn class_resource_name(broker: &Broker, entry: &CatalogServiceEntry) -> String {
    format!("{}-{}", broker.name_any(), entry.id)
}

fn plan_resource_name(broker: &Broker, entry: &CatalogServiceEntry, plan: &CatalogPlanEntry) -> String {
    format!("{}-{}-{}", broker.name_any(), entry.id, plan.id)
}

fn broker_owner_reference(broker: &Broker) -> OwnerReference {
    OwnerReference {
        api_version: <Broker as Resource>::api_version(&()).to_string(),
        kind: <Broker as Resource>::kind(&()).to_string(),
        name: broker.name_any(),
        uid: broker.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

async fn upsert_class(
    api: &Api<ServiceClass>,
    broker: &Broker,
    name: &str,
    entry: &CatalogServiceEntry,
) -> Result<(), Error> {
    let spec = ServiceClassSpec {
        broker_name: broker.name_any(),
        external_id: entry.id.clone(),
        external_name: entry.name.clone(),
        description: entry.description.clone(),
        bindable: entry.bindable,
        plan_updatable: entry.plan_updateable,
        tags: entry.tags.clone(),
    };
    let mut obj = ServiceClass::new(name, spec.clone());
    obj.owner_references_mut().push(broker_owner_reference(broker));
    obj.annotations_mut()
        .insert(annotations::BROKER_NAME.to_string(), broker.name_any());
    if let Some(uid) = broker.uid() {
        obj.annotations_mut()
            .insert(annotations::BROKER_UID.to_string(), uid);
    }
    obj.annotations_mut()
        .insert(annotations::SPEC_HASH.to_string(), catalog_common::hash_spec(&spec));

    match api
        .patch(name, &PatchParams::apply(catalog_common::MANAGER_NAME).force(), &Patch::Apply(&obj))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            api.create(&PostParams::default(), &obj).await?;
            Ok(())
        }
        Err(e) => Err(Error::from(e)),
    }
}

async fn upsert_plan(
    api: &Api<ServicePlan>,
    broker: &Broker,
    class_name: &str,
    name: &str,
    plan: &CatalogPlanEntry,
) -> Result<(), Error> {
    let spec = ServicePlanSpec {
        broker_name: broker.name_any(),
        service_class_ref: LocalObjectReference {
            name: class_name.to_string(),
        },
        external_id: plan.id.clone(),
        external_name: plan.name.clone(),
        description: plan.description.clone(),
        bindable: plan.bindable,
        free: plan.free,
        instance_create_parameter_schema: plan
            .schemas
            .as_ref()
            .and_then(|s| s.pointer("/service_instance/create/parameters").cloned()),
        instance_update_parameter_schema: plan
            .schemas
            .as_ref()
            .and_then(|s| s.pointer("/service_instance/update/parameters").cloned()),
        binding_create_parameter_schema: plan
            .schemas
            .as_ref()
            .and_then(|s| s.pointer("/service_binding/create/parameters").cloned()),
    };
    let mut obj = ServicePlan::new(name, spec.clone());
    obj.owner_references_mut().push(broker_owner_reference(broker));
    obj.annotations_mut()
        .insert(annotations::BROKER_NAME.to_string(), broker.name_any());
    obj.annotations_mut()
        .insert(annotations::SPEC_HASH.to_string(), catalog_common::hash_spec(&spec));

    match api
        .patch(name, &PatchParams::apply(catalog_common::MANAGER_NAME).force(), &Patch::Apply(&obj))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            api.create(&PostParams::default(), &obj).await?;
            Ok(())
        }
        Err(e) => Err(Error::from(e)),
    }
}

/// Marks every class/plan this broker owns as `removedFromBrokerCatalog`,
/// same as a relist that found an empty catalog. Called when the broker
/// itself is deleted so the class/plan reaper (classes::reconcile) picks
/// them up and deletes each one once no instance still references it.
pub async fn mark_owned_children_removed(client: &Client, broker: &Broker) -> Result<(), Error> {
    let classes_api: Api<ServiceClass> = Api::all(client.clone());
    let plans_api: Api<ServicePlan> = Api::all(client.clone());
    mark_classes_removed(&classes_api, broker, &[]).await?;
    mark_plans_removed(&plans_api, broker, &[]).await?;
    Ok(())
}

/// Whether any `ServiceClass`/`ServicePlan` owned by this broker is still
/// present. The finalizer must not be removed while either is, or a
/// deleted broker would strand classes/plans with a dangling owner
/// reference and no controller left to reap them.
pub async fn owned_children_remain(client: &Client, broker: &Broker) -> Result<bool, Error> {
    let classes_api: Api<ServiceClass> = Api::all(client.clone());
    let plans_api: Api<ServicePlan> = Api::all(client.clone());
    let classes = classes_api.list(&ListParams::default()).await?;
    if classes.items.iter().any(|c| c.spec.broker_name == broker.name_any()) {
        return Ok(true);
    }
    let plans = plans_api.list(&ListParams::default()).await?;
    Ok(plans.items.iter().any(|p| p.spec.broker_name == broker.name_any()))
}

async fn mark_classes_removed(
    api: &Api<ServiceClass>,
    broker: &Broker,
    live_names: &[String],
) -> Result<(), Error> {
    let all = api.list(&ListParams::default()).await?;
    for class in all
        .items
        .into_iter()
        .filter(|c| c.spec.broker_name == broker.name_any())
        .filter(|c| !live_names.contains(&c.name_any()))
        .filter(|c| !c.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog))
    {
        patch_status(api, &class, |status| {
            status.removed_from_broker_catalog = true;
        })
        .await?;
    }
    Ok(())
}

async fn mark_plans_removed(
    api: &Api<ServicePlan>,
    broker: &Broker,
    live_names: &[String],
) -> Result<(), Error> {
    let all = api.list(&ListParams::default()).await?;
    for plan in all
        .items
        .into_iter()
        .filter(|p| p.spec.broker_name == broker.name_any())
        .filter(|p| !live_names.contains(&p.name_any()))
        .filter(|p| !p.status.as_ref().is_some_and(|s| s.removed_from_broker_catalog))
    {
        patch_status(api, &plan, |status| {
            status.removed_from_broker_catalog = true;
        })
        .await?;
    }
    Ok(())
}
