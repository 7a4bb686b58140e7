//! Hand-rolled finalizer add/remove, used instead of
//! `kube::runtime::finalizer` because our deletion flows span multiple
//! reconciles (deprovision/unbind are async state machines) rather than
//! completing inside one `Cleanup` callback.

use kube::{
    Api, Resource,
    api::{Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::MANAGER_NAME;

pub fn has<T: Resource>(obj: &T, name: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|existing| existing == name))
}

pub async fn add<T>(api: &Api<T>, obj: &T, name: &str) -> Result<T, kube::Error>
where
    T: Clone + Resource + Serialize + DeserializeOwned + Debug,
{
    if has(obj, name) {
        return Ok(obj.clone());
    }
    let object_name = obj.meta().name.clone().unwrap_or_default();
    let existing = obj.meta().finalizers.clone().unwrap_or_default();
    let patch = if existing.is_empty() {
        serde_json::json!({
            "metadata": { "finalizers": [name] }
        })
    } else {
        let mut finalizers = existing;
        finalizers.push(name.to_string());
        serde_json::json!({
            "metadata": { "finalizers": finalizers }
        })
    };
    api.patch(
        &object_name,
        &PatchParams::apply(MANAGER_NAME),
        &Patch::Merge(patch),
    )
    .await
}

pub async fn remove<T>(api: &Api<T>, obj: &T, name: &str) -> Result<T, kube::Error>
where
    T: Clone + Resource + Serialize + DeserializeOwned + Debug,
{
    if !has(obj, name) {
        return Ok(obj.clone());
    }
    let object_name = obj.meta().name.clone().unwrap_or_default();
    let remaining: Vec<String> = obj
        .meta()
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|existing| existing != name)
        .collect();
    let patch = serde_json::json!({
        "metadata": { "finalizers": remaining }
    });
    api.patch(
        &object_name,
        &PatchParams::apply(MANAGER_NAME),
        &Patch::Merge(patch),
    )
    .await
}
