use std::collections::BTreeMap;

use catalog_common::error::Error;
use catalog_types::ParametersFromSource;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde_json::Value;

/// Merges `spec.parameters` with every `spec.parametersFrom[].secretKeyRef`,
/// returning the assembled parameter object and a stable checksum over it.
/// A missing referenced secret is surfaced as `Error::Kube` (via the
/// underlying 404) so the caller's retry-budget accounting treats it the
/// same as any other transient broker-adjacent failure rather than an
/// immediate terminal one.
pub async fn assemble(
    client: &Client,
    namespace: &str,
    inline: Option<&Value>,
    parameters_from: &[ParametersFromSource],
) -> Result<(Option<Value>, String), Error> {
    if inline.is_none() && parameters_from.is_empty() {
        return Ok((None, checksum(&Value::Null)));
    }

    let mut merged: BTreeMap<String, Value> = BTreeMap::new();
    if let Some(Value::Object(map)) = inline {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    for source in parameters_from {
        let secret = secrets.get(&source.secret_key_ref.name).await?;
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(&source.secret_key_ref.key))
            .ok_or_else(|| {
                Error::UserInput(format!(
                    "secret {} missing key {}",
                    source.secret_key_ref.name, source.secret_key_ref.key
                ))
            })?;
        let value: Value = serde_json::from_slice(&data.0)?;
        if let Value::Object(map) = value {
            for (k, v) in map {
                merged.insert(k, v);
            }
        }
    }

    let value = Value::Object(merged.into_iter().collect());
    let sum = checksum(&value);
    Ok((Some(value), sum))
}

fn checksum(value: &Value) -> String {
    catalog_common::hash_spec(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_under_key_reordering() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn checksum_changes_with_value() {
        let a = serde_json::json!({"a": 1});
        let b = serde_json::json!({"a": 2});
        assert_ne!(checksum(&a), checksum(&b));
    }
}
