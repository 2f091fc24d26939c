//! Sequential upgrades from state file formats 1-3 to the v4 shape.
//!
//! Each hop only rewrites the fields the normalized document keeps;
//! fields v4 dropped (deposed instances, dependency metadata) are not
//! carried forward.

use serde::Deserialize;
use serde_json::Value;

use crate::{RawInstance, RawResource, RawState, Result};

/// Common layout of formats 1 through 3: modules own a map of resources
/// keyed by address, each with flat string attributes under `primary`.
#[derive(Debug, Default, Deserialize)]
struct LegacyState {
    #[serde(default)]
    terraform_version: String,
    #[serde(default)]
    serial: i64,
    #[serde(default)]
    lineage: String,
    #[serde(default)]
    modules: Vec<LegacyModule>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyModule {
    #[serde(default)]
    path: Vec<String>,
    #[serde(default)]
    resources: serde_json::Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyResource {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    provider: String,
    #[serde(default)]
    primary: LegacyInstance,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyInstance {
    #[serde(default)]
    attributes: serde_json::Map<String, Value>,
}

pub(crate) fn to_v4(version: u64, value: Value) -> Result<RawState> {
    let mut state: LegacyState = serde_json::from_value(value)?;
    if version < 2 {
        state = v1_to_v2(state);
    }
    if version < 3 {
        state = v2_to_v3(state);
    }
    Ok(v3_to_v4(state))
}

/// v2 introduced lineage and deposed-instance tracking. Lineage defaults
/// to empty for v1 documents; deposed instances are not kept.
fn v1_to_v2(state: LegacyState) -> LegacyState {
    state
}

/// v3 reworked provider addressing inside module paths. The flat
/// `provider` string on each resource is already what v4 carries over.
fn v2_to_v3(state: LegacyState) -> LegacyState {
    state
}

/// v3 -> v4: modules flatten into a resource list; each resource address
/// key splits into mode/type/name/index and the primary instance's flat
/// attribute map rides along for later flattening.
fn v3_to_v4(state: LegacyState) -> RawState {
    let mut resources = Vec::new();

    for module in state.modules {
        let module_addr = module_address(&module.path);
        for (key, value) in module.resources {
            let legacy: LegacyResource = match serde_json::from_value(value) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let (mode, kind_from_key, name, index) = split_address(&key);
            let kind = if legacy.kind.is_empty() {
                kind_from_key
            } else {
                legacy.kind
            };

            resources.push(RawResource {
                module: module_addr.clone(),
                mode,
                kind,
                name,
                provider: legacy.provider,
                instances: vec![RawInstance {
                    index_key: index.map(Value::from),
                    attributes: None,
                    attributes_flat: Some(legacy.primary.attributes),
                    sensitive_attributes: vec![],
                }],
            });
        }
    }

    RawState {
        terraform_version: state.terraform_version,
        serial: state.serial,
        lineage: state.lineage,
        resources,
    }
}

/// `["root"]` is the root module (no address); `["root","app","db"]`
/// becomes `"module.app.module.db"`.
fn module_address(path: &[String]) -> Option<String> {
    let children: Vec<&str> = path
        .iter()
        .skip_while(|p| p.as_str() == "root")
        .map(String::as_str)
        .collect();
    if children.is_empty() {
        None
    } else {
        Some(
            children
                .iter()
                .map(|c| format!("module.{c}"))
                .collect::<Vec<_>>()
                .join("."),
        )
    }
}

/// Split a legacy resource address: `aws_instance.web`,
/// `aws_instance.web.3` (counted), `data.aws_ami.ubuntu`.
fn split_address(key: &str) -> (String, String, String, Option<u64>) {
    let segments: Vec<&str> = key.split('.').collect();
    let (mode, rest) = if segments.first() == Some(&"data") {
        ("data", &segments[1..])
    } else {
        ("managed", &segments[..])
    };

    let kind = rest.first().copied().unwrap_or_default().to_string();
    let name = rest.get(1).copied().unwrap_or_default().to_string();
    let index = rest.get(2).and_then(|s| s.parse::<u64>().ok());

    (mode.to_string(), kind, name, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read;

    #[test]
    fn v3_state_upgrades_to_v4_shape() {
        let doc = read(
            br#"{
              "version": 3,
              "terraform_version": "0.11.14",
              "serial": 12,
              "lineage": "legacy-lineage",
              "modules": [
                {
                  "path": ["root"],
                  "resources": {
                    "aws_instance.web": {
                      "type": "aws_instance",
                      "provider": "provider.aws",
                      "primary": {
                        "id": "i-abc",
                        "attributes": {
                          "id": "i-abc",
                          "tags.%": "1",
                          "tags.Name": "web"
                        }
                      }
                    },
                    "data.aws_ami.ubuntu": {
                      "type": "aws_ami",
                      "provider": "provider.aws",
                      "primary": {"id": "ami-1", "attributes": {"id": "ami-1"}}
                    }
                  }
                },
                {
                  "path": ["root", "app"],
                  "resources": {
                    "aws_db_instance.main.0": {
                      "type": "aws_db_instance",
                      "provider": "provider.aws",
                      "primary": {"id": "db-1", "attributes": {"id": "db-1"}}
                    }
                  }
                }
              ]
            }"#,
        )
        .unwrap();

        assert_eq!(doc.tf_version, "0.11.14");
        assert_eq!(doc.serial, 12);
        assert_eq!(doc.lineage, "legacy-lineage");

        let root = doc.modules.iter().find(|m| m.path == "root").unwrap();
        let web = root.resources.iter().find(|r| r.name == "web").unwrap();
        assert_eq!(web.mode, "managed");
        assert_eq!(web.kind, "aws_instance");
        // Count keys are dropped; real leaves survive with quoting.
        assert!(web.attributes.iter().all(|a| a.key != "tags.%"));
        assert!(
            web.attributes
                .iter()
                .any(|a| a.key == "tags.Name" && a.value == "\"web\"")
        );

        let ami = root.resources.iter().find(|r| r.name == "ubuntu").unwrap();
        assert_eq!(ami.mode, "data");
        assert_eq!(ami.kind, "aws_ami");

        let app = doc.modules.iter().find(|m| m.path == "module.app").unwrap();
        assert_eq!(app.resources[0].index.as_deref(), Some("0"));
    }

    #[test]
    fn v1_state_without_lineage_parses() {
        let doc = read(
            br#"{
              "version": 1,
              "serial": 1,
              "modules": [
                {
                  "path": ["root"],
                  "resources": {
                    "aws_instance.one": {
                      "type": "aws_instance",
                      "primary": {"id": "i-1", "attributes": {"id": "i-1"}}
                    }
                  }
                }
              ]
            }"#,
        )
        .unwrap();

        assert_eq!(doc.lineage, "");
        assert_eq!(doc.resource_count(), 1);
    }

    #[test]
    fn module_address_nests() {
        assert_eq!(module_address(&["root".to_string()]), None);
        assert_eq!(
            module_address(&["root".to_string(), "app".to_string()]),
            Some("module.app".to_string())
        );
        assert_eq!(
            module_address(&["root".to_string(), "app".to_string(), "db".to_string()]),
            Some("module.app.module.db".to_string())
        );
    }
}
