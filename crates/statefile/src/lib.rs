//! Terraform state document parsing
//!
//! This crate provides:
//! - JSON decoding for state file format versions 1 through 4
//! - Sequential upgrade of older formats to the v4 in-memory shape
//! - Flattening of resource instance attributes into dotted leaf keys
//! - Sensitive-path marking with subtree propagation
//!
//! Only the v4-shaped [`Document`] leaves this crate; callers never see
//! the legacy layouts.

mod flatten;
mod upgrade;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid state JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state file has no version field")]
    MissingVersion,

    #[error("unsupported state file version: {0}")]
    UnsupportedVersion(u64),

    #[error("state contains no modules")]
    EmptyState,
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// A state document normalized to the v4 shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub tf_version: String,
    pub serial: i64,
    pub lineage: String,
    pub modules: Vec<Module>,
}

impl Document {
    /// Total number of resources across all modules.
    pub fn resource_count(&self) -> usize {
        self.modules.iter().map(|m| m.resources.len()).sum()
    }
}

/// A module inside a state. The root module has path `"root"`; child
/// modules carry their full address (e.g. `"module.app"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub path: String,
    pub resources: Vec<Resource>,
}

/// One managed or data resource instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub mode: String,
    pub index: Option<String>,
    pub provider: String,
    pub attributes: Vec<Attribute>,
}

/// A single flattened leaf value.
///
/// `value` holds the raw JSON stringification of the leaf (`"\"web\""`,
/// `"42"`, `"null"`), never a re-encoded form, so textual diffs stay
/// stable across ingests. Sensitive leaves are stored verbatim as well;
/// redaction happens at render time only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
    pub sensitive: bool,
}

/// Parse a raw state document.
///
/// Accepts format versions 1 through 4; anything older or newer is
/// rejected with [`ParseError::UnsupportedVersion`]. A syntactically
/// valid document that yields no modules fails with
/// [`ParseError::EmptyState`].
pub fn read(raw: &[u8]) -> Result<Document> {
    let value: Value = serde_json::from_slice(raw)?;
    let version = value
        .get("version")
        .and_then(Value::as_u64)
        .ok_or(ParseError::MissingVersion)?;

    let v4 = match version {
        4 => serde_json::from_value(value)?,
        1..=3 => upgrade::to_v4(version, value)?,
        other => return Err(ParseError::UnsupportedVersion(other)),
    };

    build_document(v4)
}

// Raw v4 wire shapes. Kept private; `upgrade` rewrites the legacy
// layouts into these before `build_document` runs.

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawState {
    #[serde(default)]
    pub(crate) terraform_version: String,
    #[serde(default)]
    pub(crate) serial: i64,
    #[serde(default)]
    pub(crate) lineage: String,
    #[serde(default)]
    pub(crate) resources: Vec<RawResource>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawResource {
    #[serde(default)]
    pub(crate) module: Option<String>,
    #[serde(default = "default_mode")]
    pub(crate) mode: String,
    #[serde(rename = "type", default)]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) provider: String,
    #[serde(default)]
    pub(crate) instances: Vec<RawInstance>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawInstance {
    #[serde(default)]
    pub(crate) index_key: Option<Value>,
    #[serde(default)]
    pub(crate) attributes: Option<Value>,
    #[serde(default)]
    pub(crate) attributes_flat: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub(crate) sensitive_attributes: Vec<Vec<RawPathStep>>,
}

/// One step of a sensitive-attribute path descriptor
/// (`{"type":"get_attr","value":"password"}` or
/// `{"type":"index","value":0}`).
#[derive(Debug, Deserialize)]
pub(crate) struct RawPathStep {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) value: Value,
}

fn default_mode() -> String {
    "managed".to_string()
}

fn build_document(raw: RawState) -> Result<Document> {
    let mut modules: Vec<Module> = Vec::new();

    for res in raw.resources {
        let module_path = res
            .module
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "root".to_string());

        for inst in &res.instances {
            let resource = Resource {
                kind: res.kind.clone(),
                name: res.name.clone(),
                mode: res.mode.clone(),
                index: inst.index_key.as_ref().map(render_index),
                provider: res.provider.clone(),
                attributes: flatten::instance_attributes(inst),
            };

            let slot = match modules.iter().position(|m| m.path == module_path) {
                Some(i) => i,
                None => {
                    modules.push(Module {
                        path: module_path.clone(),
                        resources: Vec::new(),
                    });
                    modules.len() - 1
                }
            };
            modules[slot].resources.push(resource);
        }
    }

    if modules.is_empty() {
        return Err(ParseError::EmptyState);
    }

    Ok(Document {
        tf_version: raw.terraform_version,
        serial: raw.serial,
        lineage: raw.lineage,
        modules,
    })
}

fn render_index(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
