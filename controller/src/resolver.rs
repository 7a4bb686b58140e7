use catalog_types::{PlanReference, ServiceClass, ServicePlan};
use kube::{Api, Client, ResourceExt, api::ListParams};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no service class/plan matches the given reference")]
    NotFound,

    #[error("more than one service class/plan matches the given reference; refusing to guess")]
    Ambiguous,

    #[error("resolved plan does not belong to the resolved class")]
    PlanClassMismatch,

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

pub struct ResolvedPlanRef {
    pub class: ServiceClass,
    pub plan: ServicePlan,
}

/// Resolves a `ServiceInstance`/`ServiceBinding`'s plan reference against
/// the cluster-scoped class/plan objects, either by external (broker
/// catalog) name or by the stable Kubernetes object name. Ambiguity on the
/// by-name path (more than one class sharing an external name) is a
/// non-retriable failure, never a silent pick of the first match.
pub async fn resolve_plan_reference(
    client: &Client,
    reference: &PlanReference,
) -> Result<ResolvedPlanRef, ResolveError> {
    let classes: Api<ServiceClass> = Api::all(client.clone());
    let plans: Api<ServicePlan> = Api::all(client.clone());

    let class = match reference {
        PlanReference::ByName {
            cluster_service_class_external_name,
            ..
        } => {
            let all = classes.list(&ListParams::default()).await?;
            let mut matches: Vec<ServiceClass> = all
                .items
                .into_iter()
                .filter(|c| &c.spec.external_name == cluster_service_class_external_name)
                .collect();
            match matches.len() {
                0 => return Err(ResolveError::NotFound),
                1 => matches.remove(0),
                _ => return Err(ResolveError::Ambiguous),
            }
        }
        PlanReference::ById {
            cluster_service_class_ref,
            ..
        } => classes
            .get_opt(cluster_service_class_ref)
            .await?
            .ok_or(ResolveError::NotFound)?,
    };

    let plan = match reference {
        PlanReference::ByName {
            cluster_service_plan_external_name,
            ..
        } => {
            let all = plans.list(&ListParams::default()).await?;
            let mut matches: Vec<ServicePlan> = all
                .items
                .into_iter()
                .filter(|p| {
                    &p.spec.external_name == cluster_service_plan_external_name
                        && p.spec.service_class_ref.name == class.name_any()
                })
                .collect();
            match matches.len() {
                0 => return Err(ResolveError::NotFound),
                1 => matches.remove(0),
                _ => return Err(ResolveError::Ambiguous),
            }
        }
        PlanReference::ById {
            cluster_service_plan_ref,
            ..
        } => plans
            .get_opt(cluster_service_plan_ref)
            .await?
            .ok_or(ResolveError::NotFound)?,
    };

    if plan.spec.service_class_ref.name != class.name_any() {
        return Err(ResolveError::PlanClassMismatch);
    }

    Ok(ResolvedPlanRef { class, plan })
}

/// Effective bindability: a plan's own `bindable` flag overrides its
/// class's, matching the OSB catalog's plan-level override semantics.
pub fn effective_bindable(class: &ServiceClass, plan: &ServicePlan) -> bool {
    plan.spec.bindable.unwrap_or(class.spec.bindable)
}
