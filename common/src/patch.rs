use catalog_types::{
    Broker, BrokerStatus, ServiceBinding, ServiceBindingStatus, ServiceClass, ServiceClassStatus,
    ServiceInstance, ServiceInstanceStatus, ServicePlan, ServicePlanStatus,
};
use kube::{
    Api, Resource,
    api::{Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::MANAGER_NAME;

/// Gives `patch_status` a mutable handle on a resource's status half
/// without each reconciler hand-rolling the `Option<Status>` dance.
pub trait Object<S> {
    fn mut_status(&mut self) -> &mut S;
}

macro_rules! impl_object {
    ($kind:ty, $status:ty) => {
        impl Object<$status> for $kind {
            fn mut_status(&mut self) -> &mut $status {
                if self.status.is_none() {
                    self.status = Some(Default::default());
                }
                self.status.as_mut().expect("status initialized above")
            }
        }
    };
}

impl_object!(Broker, BrokerStatus);
impl_object!(ServiceClass, ServiceClassStatus);
impl_object!(ServicePlan, ServicePlanStatus);
impl_object!(ServiceInstance, ServiceInstanceStatus);
impl_object!(ServiceBinding, ServiceBindingStatus);

/// Patches `instance`'s status subresource with the mutation `f` applies,
/// using a JSON-Patch diff against the pre-mutation value (so unrelated
/// concurrent status writes from other fields are not clobbered).
pub async fn patch_status<T, S>(
    api: &Api<T>,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, kube::Error>
where
    T: Clone + Resource + Object<S> + Serialize + DeserializeOwned + Debug,
{
    let mut modified = instance.clone();
    f(modified.mut_status());

    let before = serde_json::to_value(instance).expect("typed resource serializes");
    let after = serde_json::to_value(&modified).expect("typed resource serializes");
    let diff = json_patch::diff(&before, &after);
    if diff.0.is_empty() {
        return Ok(instance.clone());
    }

    let name = instance.meta().name.clone().unwrap_or_default();
    api.patch_status(&name, &PatchParams::apply(MANAGER_NAME), &Patch::Json::<T>(diff))
        .await
}
