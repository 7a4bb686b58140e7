use catalog_common::error::Error;
use catalog_types::SecretTransform;
use jsonpath_rust::{JsonPathInst, path::config::JsonPathConfig};
use serde_json::{Map, Value};

/// Applies `secretTransforms` left to right over the broker's raw bind
/// credentials, matching the Open Service Broker secret-transform spec:
/// later transforms see the output of earlier ones, so a `RenameKey`
/// followed by an `AddKey` referencing the new name works as expected.
pub fn apply(
    credentials: Map<String, Value>,
    transforms: &[SecretTransform],
    extra_secrets: &[(String, Map<String, Value>)],
) -> Result<Map<String, Value>, Error> {
    let original = Value::Object(credentials.clone());
    let mut out = credentials;
    for transform in transforms {
        match transform {
            SecretTransform::RenameKey { from, to } => {
                if let Some(v) = out.remove(from) {
                    out.insert(to.clone(), v);
                }
            }
            SecretTransform::RemoveKey { key } => {
                out.remove(key);
            }
            SecretTransform::AddKey {
                key,
                value,
                string_value,
                json_path_expression,
            } => {
                let resolved = if let Some(s) = string_value {
                    Value::String(s.clone())
                } else if let Some(v) = value {
                    serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()))
                } else if let Some(path) = json_path_expression {
                    extract_json_path(&original, path)?
                } else {
                    return Err(Error::UserInput(format!(
                        "AddKey transform for {key} specifies no value, stringValue, or jsonPathExpression"
                    )));
                };
                out.insert(key.clone(), resolved);
            }
            SecretTransform::AddKeysFrom { secret_ref } => {
                let source = extra_secrets
                    .iter()
                    .find(|(name, _)| name == &secret_ref.name)
                    .map(|(_, data)| data)
                    .ok_or_else(|| {
                        Error::UserInput(format!(
                            "AddKeysFrom references secret {} which was not resolved",
                            secret_ref.name
                        ))
                    })?;
                for (k, v) in source {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
    }
    Ok(out)
}

fn extract_json_path(json: &Value, path: &str) -> Result<Value, Error> {
    let cfg = JsonPathConfig::default();
    let parsed = path
        .parse::<JsonPathInst>()
        .map_err(|err| Error::UserInput(format!("invalid jsonPathExpression {path:?}: {err}")))?;
    let found = parsed.find_slice(json, cfg);
    let Some(first) = found.into_iter().next() else {
        return Err(Error::UserInput(format!(
            "jsonPathExpression {path:?} matched nothing"
        )));
    };
    Ok((*first).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn rename_key_moves_value() {
        let creds = map(json!({"uri": "postgres://host"}));
        let transforms = vec![SecretTransform::RenameKey {
            from: "uri".to_string(),
            to: "url".to_string(),
        }];
        let out = apply(creds, &transforms, &[]).unwrap();
        assert!(!out.contains_key("uri"));
        assert_eq!(out.get("url"), Some(&json!("postgres://host")));
    }

    #[test]
    fn remove_key_drops_value() {
        let creds = map(json!({"password": "secret", "username": "admin"}));
        let transforms = vec![SecretTransform::RemoveKey {
            key: "password".to_string(),
        }];
        let out = apply(creds, &transforms, &[]).unwrap();
        assert!(!out.contains_key("password"));
        assert!(out.contains_key("username"));
    }

    #[test]
    fn add_key_with_string_value() {
        let creds = map(json!({}));
        let transforms = vec![SecretTransform::AddKey {
            key: "static".to_string(),
            value: None,
            string_value: Some("fixed".to_string()),
            json_path_expression: None,
        }];
        let out = apply(creds, &transforms, &[]).unwrap();
        assert_eq!(out.get("static"), Some(&json!("fixed")));
    }

    #[test]
    fn add_key_with_json_path_expression() {
        let creds = map(json!({"connection": {"host": "db.internal", "port": 5432}}));
        let transforms = vec![SecretTransform::AddKey {
            key: "host".to_string(),
            value: None,
            string_value: None,
            json_path_expression: Some("$.connection.host".to_string()),
        }];
        let out = apply(creds, &transforms, &[]).unwrap();
        assert_eq!(out.get("host"), Some(&json!("db.internal")));
    }

    #[test]
    fn add_keys_from_merges_extra_secret() {
        let creds = map(json!({"username": "admin"}));
        let transforms = vec![SecretTransform::AddKeysFrom {
            secret_ref: catalog_types::LocalObjectReference {
                name: "extra".to_string(),
            },
        }];
        let extra = vec![("extra".to_string(), map(json!({"apiKey": "abc123"})))];
        let out = apply(creds, &transforms, &extra).unwrap();
        assert_eq!(out.get("apiKey"), Some(&json!("abc123")));
        assert_eq!(out.get("username"), Some(&json!("admin")));
    }

    #[test]
    fn transforms_apply_in_order() {
        let creds = map(json!({"uri": "postgres://host"}));
        let transforms = vec![
            SecretTransform::RenameKey {
                from: "uri".to_string(),
                to: "url".to_string(),
            },
            SecretTransform::AddKey {
                key: "uri_copy".to_string(),
                value: None,
                string_value: None,
                json_path_expression: Some("$.uri".to_string()),
            },
        ];
        let out = apply(creds, &transforms, &[]).unwrap();
        assert!(!out.contains_key("uri"));
        assert_eq!(out.get("url"), Some(&json!("postgres://host")));
        assert_eq!(out.get("uri_copy"), Some(&json!("postgres://host")));
    }

    #[test]
    fn add_key_string_value_wins_over_value() {
        let creds = map(json!({}));
        let transforms = vec![SecretTransform::AddKey {
            key: "k".to_string(),
            value: Some("\"from-value\"".to_string()),
            string_value: Some("from-string-value".to_string()),
            json_path_expression: None,
        }];
        let out = apply(creds, &transforms, &[]).unwrap();
        assert_eq!(out.get("k"), Some(&json!("from-string-value")));
    }

    #[test]
    fn json_path_expression_resolves_against_original_credentials() {
        let creds = map(json!({"uri": "postgres://host"}));
        let transforms = vec![
            SecretTransform::RemoveKey {
                key: "uri".to_string(),
            },
            SecretTransform::AddKey {
                key: "uri_copy".to_string(),
                value: None,
                string_value: None,
                json_path_expression: Some("$.uri".to_string()),
            },
        ];
        let out = apply(creds, &transforms, &[]).unwrap();
        assert!(!out.contains_key("uri"));
        assert_eq!(out.get("uri_copy"), Some(&json!("postgres://host")));
    }
}
