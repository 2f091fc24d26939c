//! Attribute flattening and sensitive-path propagation.

use serde_json::Value;

use crate::{Attribute, RawInstance, RawPathStep};

/// Flatten one resource instance into leaf attributes and apply its
/// sensitive paths.
pub(crate) fn instance_attributes(inst: &RawInstance) -> Vec<Attribute> {
    let mut attrs = Vec::new();

    if let Some(value) = &inst.attributes {
        flatten_value("", value, &mut attrs);
    } else if let Some(flat) = &inst.attributes_flat {
        // Legacy flatmap attributes: keys are already dotted leaf paths.
        for (key, value) in flat {
            if is_flatmap_count_key(key) {
                continue;
            }
            attrs.push(Attribute {
                key: key.clone(),
                value: value.to_string(),
                sensitive: false,
            });
        }
    }

    let paths: Vec<String> = inst
        .sensitive_attributes
        .iter()
        .map(|steps| path_to_key(steps))
        .filter(|p| !p.is_empty())
        .collect();

    if !paths.is_empty() {
        for attr in &mut attrs {
            if paths.iter().any(|p| covers(p, &attr.key)) {
                attr.sensitive = true;
            }
        }
    }

    attrs
}

/// True when `path` marks `key`: equal, or `key` is a descendant leaf.
fn covers(path: &str, key: &str) -> bool {
    key == path || (key.len() > path.len() && key.starts_with(path) && key.as_bytes()[path.len()] == b'.')
}

fn flatten_value(prefix: &str, value: &Value, out: &mut Vec<Attribute>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let key = join_key(prefix, k);
                flatten_value(&key, v, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                let key = join_key(prefix, &i.to_string());
                flatten_value(&key, v, out);
            }
        }
        // Scalars and empty composites are leaves; the raw JSON text is
        // preserved so diffs round-trip byte-for-byte.
        leaf => {
            if !prefix.is_empty() {
                out.push(Attribute {
                    key: prefix.to_string(),
                    value: leaf.to_string(),
                    sensitive: false,
                });
            }
        }
    }
}

fn join_key(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}

/// Normalize a sensitive-path descriptor to its dotted form.
fn path_to_key(steps: &[RawPathStep]) -> String {
    let mut parts = Vec::with_capacity(steps.len());
    for step in steps {
        match step.kind.as_str() {
            "get_attr" => {
                if let Some(name) = step.value.as_str() {
                    parts.push(name.to_string());
                }
            }
            "index" => match &step.value {
                Value::Number(n) => parts.push(n.to_string()),
                Value::String(s) => parts.push(s.clone()),
                _ => {}
            },
            _ => {}
        }
    }
    parts.join(".")
}

/// Flatmap encodes map/list sizes under `%` and `#` keys; they are not
/// real leaves.
fn is_flatmap_count_key(key: &str) -> bool {
    key == "%" || key == "#" || key.ends_with(".%") || key.ends_with(".#")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(attributes: Value, sensitive: Vec<Vec<RawPathStep>>) -> RawInstance {
        RawInstance {
            index_key: None,
            attributes: Some(attributes),
            attributes_flat: None,
            sensitive_attributes: sensitive,
        }
    }

    fn get_attr(name: &str) -> RawPathStep {
        RawPathStep {
            kind: "get_attr".to_string(),
            value: Value::String(name.to_string()),
        }
    }

    fn index(i: u64) -> RawPathStep {
        RawPathStep {
            kind: "index".to_string(),
            value: json!(i),
        }
    }

    fn by_key<'a>(attrs: &'a [Attribute], key: &str) -> &'a Attribute {
        attrs
            .iter()
            .find(|a| a.key == key)
            .unwrap_or_else(|| panic!("missing attribute {key}"))
    }

    #[test]
    fn leaves_keep_raw_json_text() {
        let attrs = instance_attributes(&instance(
            json!({"name": "web", "count": 3, "enabled": true, "desc": null}),
            vec![],
        ));

        assert_eq!(by_key(&attrs, "name").value, "\"web\"");
        assert_eq!(by_key(&attrs, "count").value, "3");
        assert_eq!(by_key(&attrs, "enabled").value, "true");
        assert_eq!(by_key(&attrs, "desc").value, "null");
    }

    #[test]
    fn nested_values_flatten_with_dotted_keys() {
        let attrs = instance_attributes(&instance(
            json!({"tags": {"Name": "web", "Env": "prod"}, "sg": ["a", "b"]}),
            vec![],
        ));

        assert_eq!(by_key(&attrs, "tags.Name").value, "\"web\"");
        assert_eq!(by_key(&attrs, "tags.Env").value, "\"prod\"");
        assert_eq!(by_key(&attrs, "sg.0").value, "\"a\"");
        assert_eq!(by_key(&attrs, "sg.1").value, "\"b\"");
    }

    #[test]
    fn empty_composites_are_leaves() {
        let attrs = instance_attributes(&instance(json!({"tags": {}, "sg": []}), vec![]));

        assert_eq!(by_key(&attrs, "tags").value, "{}");
        assert_eq!(by_key(&attrs, "sg").value, "[]");
    }

    #[test]
    fn sensitive_leaf_is_marked_and_stored_verbatim() {
        let attrs = instance_attributes(&instance(
            json!({"password": "secret123", "username": "user", "api_key": "key456"}),
            vec![vec![get_attr("password")], vec![get_attr("api_key")]],
        ));

        assert_eq!(attrs.len(), 3);
        assert!(by_key(&attrs, "password").sensitive);
        assert!(by_key(&attrs, "api_key").sensitive);
        assert!(!by_key(&attrs, "username").sensitive);
        // Values are stored verbatim; redaction is a render-time concern.
        assert_eq!(by_key(&attrs, "password").value, "\"secret123\"");
        assert_eq!(by_key(&attrs, "api_key").value, "\"key456\"");
        assert_eq!(by_key(&attrs, "username").value, "\"user\"");
    }

    #[test]
    fn sensitive_subtree_marks_all_descendants() {
        let attrs = instance_attributes(&instance(
            json!({
                "credentials": {"user": "u", "nested": {"token": "t"}},
                "credentials_backup": "x"
            }),
            vec![vec![get_attr("credentials")]],
        ));

        assert!(by_key(&attrs, "credentials.user").sensitive);
        assert!(by_key(&attrs, "credentials.nested.token").sensitive);
        // Sibling with a common name prefix is not a descendant.
        assert!(!by_key(&attrs, "credentials_backup").sensitive);
    }

    #[test]
    fn sensitive_index_path_marks_one_element() {
        let attrs = instance_attributes(&instance(
            json!({"keys": ["public", "private"]}),
            vec![vec![get_attr("keys"), index(1)]],
        ));

        assert!(!by_key(&attrs, "keys.0").sensitive);
        assert!(by_key(&attrs, "keys.1").sensitive);
    }

    #[test]
    fn flatmap_count_keys_are_dropped() {
        let mut flat = serde_json::Map::new();
        flat.insert("tags.%".to_string(), json!("2"));
        flat.insert("tags.Name".to_string(), json!("web"));
        flat.insert("sg.#".to_string(), json!("1"));
        flat.insert("sg.0".to_string(), json!("sg-1"));

        let inst = RawInstance {
            index_key: None,
            attributes: None,
            attributes_flat: Some(flat),
            sensitive_attributes: vec![],
        };
        let attrs = instance_attributes(&inst);

        assert_eq!(attrs.len(), 2);
        assert_eq!(by_key(&attrs, "tags.Name").value, "\"web\"");
        assert_eq!(by_key(&attrs, "sg.0").value, "\"sg-1\"");
    }
}
