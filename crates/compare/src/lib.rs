//! State version diff engine
//!
//! Computes resource-level set differences and per-resource attribute
//! diffs between two versions of a state, with stable ordering and
//! sensitive-value redaction in every rendered form.

use std::collections::BTreeMap;

use serde::Serialize;
use similar::TextDiff;
use statefile::{Attribute, Document, Resource};
use store::StateRecord;
use tracing::info;

/// Full comparison result between two state versions.
#[derive(Debug, Clone, Serialize)]
pub struct StateCompare {
    pub stats: CompareStats,
    pub differences: Differences,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompareStats {
    pub from: StateInfo,
    pub to: StateInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateInfo {
    pub path: String,
    pub version_id: String,
    pub resource_count: usize,
    pub tf_version: String,
    pub serial: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Differences {
    /// Resource address -> pretty-printed block, for addresses present
    /// only in the older version.
    pub only_in_old: BTreeMap<String, String>,
    pub only_in_new: BTreeMap<String, String>,
    pub in_both: Vec<String>,
    /// Populated only for resources whose rendered form differs.
    pub resource_diff: BTreeMap<String, ResourceDiff>,
}

/// Attribute-level differences of one resource present on both sides.
/// `only_in_old` refers to the *from* side, `only_in_new` to the *to*
/// side.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceDiff {
    pub only_in_old: BTreeMap<String, String>,
    pub only_in_new: BTreeMap<String, String>,
    pub unified_diff: String,
}

/// Compare two versions of a state.
pub fn compare(from: &StateRecord, to: &StateRecord) -> StateCompare {
    let from_resources = state_resources(&from.document);
    let to_resources = state_resources(&to.document);

    let stats = CompareStats {
        from: StateInfo {
            path: from.path.clone(),
            version_id: from.version_id.clone(),
            resource_count: from_resources.len(),
            tf_version: from.tf_version.clone(),
            serial: from.serial,
        },
        to: StateInfo {
            path: to.path.clone(),
            version_id: to.version_id.clone(),
            resource_count: to_resources.len(),
            tf_version: to.tf_version.clone(),
            serial: to.serial,
        },
    };

    let mut only_in_old = BTreeMap::new();
    for address in slice_diff(&from_resources, &to_resources) {
        if let Some(res) = get_resource(&from.document, &address) {
            only_in_old.insert(address, format_resource(res));
        }
    }

    let mut only_in_new = BTreeMap::new();
    for address in slice_diff(&to_resources, &from_resources) {
        if let Some(res) = get_resource(&to.document, &address) {
            only_in_new.insert(address, format_resource(res));
        }
    }

    let in_both = slice_inter(&to_resources, &from_resources);

    let mut resource_diff = BTreeMap::new();
    for address in &in_both {
        let diff = compare_resource(from, to, address);
        if !diff.unified_diff.is_empty() {
            resource_diff.insert(address.clone(), diff);
        }
    }

    info!(
        path = %from.path,
        from = %from.version_id,
        to = %to.version_id,
        "Comparing state versions"
    );

    StateCompare {
        stats,
        differences: Differences {
            only_in_old,
            only_in_new,
            in_both,
            resource_diff,
        },
    }
}

/// All resource addresses of a state, first-encountered order.
fn state_resources(doc: &Document) -> Vec<String> {
    let mut out = Vec::new();
    for module in &doc.modules {
        for resource in &module.resources {
            out.push(format!("{}.{}.{}", module.path, resource.kind, resource.name));
        }
    }
    out
}

/// Elements of `a` absent from `b`, preserving `a`'s order.
fn slice_diff(a: &[String], b: &[String]) -> Vec<String> {
    a.iter()
        .filter(|e| !b.contains(e))
        .cloned()
        .collect()
}

/// Elements present in both, preserving `a`'s order.
fn slice_inter(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().filter(|e| b.contains(e)).cloned().collect()
}

fn get_resource<'a>(doc: &'a Document, address: &str) -> Option<&'a Resource> {
    for module in &doc.modules {
        if !address.starts_with(module.path.as_str()) {
            continue;
        }
        for resource in &module.resources {
            if address == format!("{}.{}.{}", module.path, resource.kind, resource.name) {
                return Some(resource);
            }
        }
    }
    None
}

/// ASCII-sorted attribute keys of a resource.
fn resource_attributes(res: &Resource) -> Vec<String> {
    let mut keys: Vec<String> = res.attributes.iter().map(|a| a.key.clone()).collect();
    keys.sort();
    keys
}

fn get_attribute<'a>(res: &'a Resource, key: &str) -> Option<&'a Attribute> {
    res.attributes.iter().find(|a| a.key == key)
}

/// Render one attribute value, redacting sensitive entries: `(null)`
/// for a stored null, `({len})` otherwise, where the length counts the
/// value as stored (raw JSON text, quotes included).
fn render_value(attr: &Attribute) -> String {
    if !attr.sensitive {
        return attr.value.clone();
    }
    if attr.value == "null" {
        return "(null)".to_string();
    }
    format!("({})", attr.value.len())
}

/// Canonical pretty-print used as diff input; must be byte-stable.
fn format_resource(res: &Resource) -> String {
    let mut out = format!("resource \"{}\" \"{}\" {{\n", res.kind, res.name);
    for key in resource_attributes(res) {
        if let Some(attr) = get_attribute(res, &key) {
            out.push_str(&format!("  {} = {}\n", attr.key, render_value(attr)));
        }
    }
    out.push_str("}\n");
    out
}

fn state_label(record: &StateRecord) -> String {
    format!("{} ({})", record.path, record.last_modified.to_rfc3339())
}

/// Attribute-level comparison of one resource address present on both
/// sides. `from` is always the older side.
fn compare_resource(from: &StateRecord, to: &StateRecord, address: &str) -> ResourceDiff {
    let empty = Resource::default();
    let res_from = get_resource(&from.document, address).unwrap_or(&empty);
    let res_to = get_resource(&to.document, address).unwrap_or(&empty);

    let attrs_from = resource_attributes(res_from);
    let attrs_to = resource_attributes(res_to);

    let mut diff = ResourceDiff::default();

    for key in slice_diff(&attrs_from, &attrs_to) {
        if let Some(attr) = get_attribute(res_from, &key) {
            diff.only_in_old.insert(key, render_value(attr));
        }
    }
    for key in slice_diff(&attrs_to, &attrs_from) {
        if let Some(attr) = get_attribute(res_to, &key) {
            diff.only_in_new.insert(key, render_value(attr));
        }
    }

    let old_text = format_resource(res_from);
    let new_text = format_resource(res_to);
    if old_text != new_text {
        diff.unified_diff = TextDiff::from_lines(old_text.as_str(), new_text.as_str())
            .unified_diff()
            .context_radius(3)
            .header(&state_label(from), &state_label(to))
            .to_string();
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use statefile::Module;

    fn attribute(key: &str, value: &str, sensitive: bool) -> Attribute {
        Attribute {
            key: key.to_string(),
            value: value.to_string(),
            sensitive,
        }
    }

    fn resource(kind: &str, name: &str, attrs: Vec<Attribute>) -> Resource {
        Resource {
            kind: kind.to_string(),
            name: name.to_string(),
            mode: "managed".to_string(),
            index: None,
            provider: "aws".to_string(),
            attributes: attrs,
        }
    }

    fn record(version_id: &str, resources: Vec<Resource>) -> StateRecord {
        let document = Document {
            tf_version: "1.5.0".to_string(),
            serial: 1,
            lineage: "l".to_string(),
            modules: vec![Module {
                path: "root".to_string(),
                resources,
            }],
        };
        StateRecord {
            path: "env/app.tfstate".to_string(),
            version_id: version_id.to_string(),
            tf_version: "1.5.0".to_string(),
            serial: 1,
            lineage: "l".to_string(),
            last_modified: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            fetched_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            document,
        }
    }

    fn web_instance(instance_type: &str) -> Resource {
        resource(
            "aws_instance",
            "web",
            vec![
                attribute("id", "\"i-123\"", false),
                attribute("instance_type", &format!("\"{instance_type}\""), false),
            ],
        )
    }

    #[test]
    fn identical_states_produce_empty_differences() {
        let a = record("v1", vec![web_instance("t2.micro")]);
        let b = record("v2", vec![web_instance("t2.micro")]);

        let result = compare(&a, &b);
        assert!(result.differences.only_in_old.is_empty());
        assert!(result.differences.only_in_new.is_empty());
        assert!(result.differences.resource_diff.is_empty());
        assert_eq!(result.differences.in_both, vec!["root.aws_instance.web"]);
    }

    #[test]
    fn self_compare_is_empty() {
        let a = record("v1", vec![web_instance("t2.micro")]);
        let result = compare(&a, &a);
        assert!(result.differences.only_in_old.is_empty());
        assert!(result.differences.only_in_new.is_empty());
        assert!(result.differences.resource_diff.is_empty());
    }

    #[test]
    fn changed_attribute_appears_in_unified_diff() {
        let a = record("v1", vec![web_instance("t2.micro")]);
        let b = record("v2", vec![web_instance("t2.small")]);

        let result = compare(&a, &b);
        let diff = result
            .differences
            .resource_diff
            .get("root.aws_instance.web")
            .expect("resource diff present");

        assert!(diff.only_in_old.is_empty());
        assert!(diff.only_in_new.is_empty());
        assert!(diff.unified_diff.contains("-  instance_type = \"t2.micro\""));
        assert!(diff.unified_diff.contains("+  instance_type = \"t2.small\""));
    }

    #[test]
    fn set_operations_are_symmetric() {
        let a = record(
            "v1",
            vec![web_instance("t2.micro"), resource("aws_s3_bucket", "logs", vec![])],
        );
        let b = record(
            "v2",
            vec![web_instance("t2.micro"), resource("aws_sqs_queue", "jobs", vec![])],
        );

        let ab = compare(&a, &b);
        let ba = compare(&b, &a);

        let ab_old: Vec<&String> = ab.differences.only_in_old.keys().collect();
        let ba_new: Vec<&String> = ba.differences.only_in_new.keys().collect();
        assert_eq!(ab_old, ba_new);

        let mut in_both_ab = ab.differences.in_both.clone();
        let mut in_both_ba = ba.differences.in_both.clone();
        in_both_ab.sort();
        in_both_ba.sort();
        assert_eq!(in_both_ab, in_both_ba);
    }

    #[test]
    fn removed_resource_lands_in_only_in_old() {
        let a = record(
            "v1",
            vec![web_instance("t2.micro"), resource("aws_s3_bucket", "logs", vec![])],
        );
        let b = record("v2", vec![web_instance("t2.micro")]);

        let result = compare(&a, &b);
        assert!(result
            .differences
            .only_in_old
            .contains_key("root.aws_s3_bucket.logs"));
        assert!(result.differences.only_in_new.is_empty());
    }

    #[test]
    fn attribute_only_in_from_side_lands_in_only_in_old() {
        let a = record(
            "v1",
            vec![resource(
                "aws_instance",
                "web",
                vec![
                    attribute("id", "\"i-123\"", false),
                    attribute("ebs_optimized", "true", false),
                ],
            )],
        );
        let b = record(
            "v2",
            vec![resource(
                "aws_instance",
                "web",
                vec![attribute("id", "\"i-123\"", false)],
            )],
        );

        let result = compare(&a, &b);
        let diff = result
            .differences
            .resource_diff
            .get("root.aws_instance.web")
            .unwrap();
        assert_eq!(diff.only_in_old.get("ebs_optimized").unwrap(), "true");
        assert!(diff.only_in_new.is_empty());
    }

    #[test]
    fn sensitive_values_render_as_length() {
        let a = record(
            "v1",
            vec![resource(
                "aws_db_instance",
                "main",
                vec![
                    attribute("username", "\"root\"", false),
                    attribute("password", "\"hunter2\"", true),
                ],
            )],
        );
        let b = record(
            "v2",
            vec![resource(
                "aws_db_instance",
                "main",
                vec![
                    attribute("username", "\"root\"", false),
                    attribute("password", "\"other\"", true),
                ],
            )],
        );

        let result = compare(&a, &b);
        let diff = result
            .differences
            .resource_diff
            .get("root.aws_db_instance.main")
            .unwrap();

        // Lengths cover the stored JSON text, quotes included:
        // "\"hunter2\"" is 9 bytes, "\"other\"" is 7.
        assert!(diff.unified_diff.contains("-  password = (9)"));
        assert!(diff.unified_diff.contains("+  password = (7)"));
        // The secret itself never appears in the rendered diff.
        assert!(!diff.unified_diff.contains("hunter2"));
    }

    #[test]
    fn sensitive_null_renders_as_null_marker() {
        let res = resource(
            "aws_db_instance",
            "main",
            vec![attribute("password", "null", true)],
        );
        let printed = format_resource(&res);
        assert!(printed.contains("password = (null)"));
    }

    #[test]
    fn pretty_print_is_deterministic() {
        let res = resource(
            "aws_instance",
            "web",
            vec![
                attribute("zone", "\"b\"", false),
                attribute("ami", "\"ami-1\"", false),
                attribute("id", "\"i-1\"", false),
            ],
        );
        let first = format_resource(&res);
        let second = format_resource(&res);
        assert_eq!(first, second);

        // Keys are emitted in ASCII order regardless of input order.
        let ami = first.find("ami").unwrap();
        let id = first.find("id =").unwrap();
        let zone = first.find("zone").unwrap();
        assert!(ami < id && id < zone);
    }

    #[test]
    fn diff_labels_carry_path_and_timestamp() {
        let a = record("v1", vec![web_instance("t2.micro")]);
        let b = record("v2", vec![web_instance("t2.small")]);

        let result = compare(&a, &b);
        let diff = result
            .differences
            .resource_diff
            .get("root.aws_instance.web")
            .unwrap();
        assert!(diff.unified_diff.contains("--- env/app.tfstate (2024-05-01T00:00:00+00:00)"));
        assert!(diff.unified_diff.contains("+++ env/app.tfstate (2024-05-01T00:00:00+00:00)"));
    }
}
