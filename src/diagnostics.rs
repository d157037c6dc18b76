//! Support export of everything the coordinator currently knows.
//!
//! Built from cached state only, so generating it never hits the Manager.

use crate::config::ManagerConfig;
use crate::coordinator::{CoordinatorStatus, Snapshot, ThingsSnapshot};
use crate::item_state::{Item, StateValue};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const REDACTED: &str = "REDACTED";
const SENSITIVE_KEYS: &[&str] = &["password", "token", "cookie", "authorization", "session"];
const SAMPLE_SIZE: usize = 50;
const TOP_PROBLEMS: usize = 20;

pub struct DiagnosticsSource<'a> {
    pub config: &'a ManagerConfig,
    pub status: &'a CoordinatorStatus,
    /// Parsed items of the last successful poll keyed by cleaned name
    pub items: &'a BTreeMap<String, Item>,
    /// Normalized keys shared by several raw items, with the raw names involved
    pub key_collisions: &'a BTreeMap<String, BTreeSet<String>>,
    pub snapshot: &'a Snapshot,
    pub things: &'a ThingsSnapshot,
}

pub fn build_report(source: &DiagnosticsSource<'_>) -> Value {
    let items: Vec<(&String, Value)> = source
        .items
        .iter()
        .map(|(name, item)| (name, item_payload(item)))
        .collect();

    let first: Map<String, Value> = items
        .iter()
        .take(SAMPLE_SIZE)
        .map(|(name, payload)| (name.to_string(), payload.clone()))
        .collect();
    let last = (items.len() > SAMPLE_SIZE).then(|| {
        items[items.len().saturating_sub(SAMPLE_SIZE)..]
            .iter()
            .map(|(name, payload)| (name.to_string(), payload.clone()))
            .collect::<Map<String, Value>>()
    });

    let all_items: Map<String, Value> = items
        .iter()
        .map(|(name, payload)| (name.to_string(), payload.clone()))
        .collect();

    let problems = problem_items(source.items);
    let numeric = source
        .items
        .values()
        .filter(|item| item.raw_value.as_number().is_some())
        .count();

    let unit_conflicts: Map<String, Value> = source
        .snapshot
        .items
        .iter()
        .filter_map(|(key, item)| {
            item.unit_conflict
                .as_ref()
                .map(|conflict| (key.clone(), Value::String(conflict.clone())))
        })
        .collect();

    let report = json!({
        "generated_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "config": source.config.to_diagnostics(),
        "coordinator": {
            "host": source.config.host,
            "status": source.status,
            "update_interval_seconds": source.config.scan_interval().as_secs(),
            "data_items": source.items.len(),
            "numeric_items": numeric,
            "published_items": source.snapshot.len(),
            "stale_keys": source.snapshot.stale_keys,
        },
        "items": all_items,
        "stats": stats(source.items),
        "problem_items": {
            "problem_items_top_20": problems.iter().take(TOP_PROBLEMS).collect::<Vec<_>>(),
            "problem_items_total": problems.len(),
        },
        "samples": {
            "first_50": first,
            "last_50": last,
        },
        "unit_conflicts": unit_conflicts,
        "key_collisions": source.key_collisions,
        "things_summary": things_summary(source.things),
    });

    redact(report)
}

/// Replaces the value of every key that looks like it holds a secret
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let lower = key.to_lowercase();
                    if SENSITIVE_KEYS.iter().any(|s| lower.contains(s)) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, redact(value))
                    }
                })
                .collect(),
        ),
        Value::Array(entries) => Value::Array(entries.into_iter().map(redact).collect()),
        other => other,
    }
}

fn item_payload(item: &Item) -> Value {
    json!({
        "type": item.item_type,
        "label": item.label,
        "category": item.category,
        "editable": item.editable,
        "group_names": item.group_names,
        "raw_state": item.raw_state,
        "state_pattern": item.pattern_hint,
        "parsed_value": item.raw_value,
        "unit": item.raw_unit,
        "timestamp_ms": item.timestamp_ms,
    })
}

fn stats(items: &BTreeMap<String, Item>) -> Value {
    let mut types: BTreeMap<String, usize> = BTreeMap::new();
    let mut categories: BTreeMap<String, usize> = BTreeMap::new();
    let mut units: BTreeMap<String, usize> = BTreeMap::new();
    let mut editable: BTreeMap<&str, usize> = BTreeMap::new();
    let mut missing_label = 0;
    let mut null_value = 0;
    let mut non_numeric = 0;

    for item in items.values() {
        *types
            .entry(item.item_type.clone().unwrap_or_else(|| "unknown".into()))
            .or_default() += 1;
        *categories
            .entry(item.category.clone().unwrap_or_else(|| "unknown".into()))
            .or_default() += 1;
        *units
            .entry(item.raw_unit.clone().unwrap_or_else(|| "none".into()))
            .or_default() += 1;
        *editable
            .entry(if item.editable { "true" } else { "false" })
            .or_default() += 1;

        if item.label.as_deref().map_or(true, str::is_empty) {
            missing_label += 1;
        }
        match item.raw_value {
            StateValue::Null => null_value += 1,
            StateValue::Number(_) => {}
            _ => non_numeric += 1,
        }
    }

    json!({
        "types": types,
        "categories": categories,
        "units": units,
        "editable": editable,
        "missing_label": missing_label,
        "null_value": null_value,
        "non_numeric_value": non_numeric,
    })
}

/// Items that most often explain a missing or odd sensor
fn problem_items(items: &BTreeMap<String, Item>) -> Vec<Value> {
    items
        .iter()
        .filter_map(|(name, item)| {
            let issue = match &item.raw_value {
                StateValue::Null => "value is NULL".to_string(),
                StateValue::Number(_) => {
                    let unitless = matches!(item.raw_unit.as_deref(), None | Some("") | Some("N"));
                    let wants_unit = ["power", "work", "energy"]
                        .iter()
                        .any(|token| name.contains(token));
                    if unitless && wants_unit && item.pattern_hint.is_none() {
                        "missing unit".to_string()
                    } else {
                        return None;
                    }
                }
                StateValue::Bool(value) => format!("non-numeric value: {value}"),
                StateValue::Text(value) => format!("non-numeric value: {value:?}"),
            };
            Some(json!({ "name": name, "issue": issue }))
        })
        .collect()
}

fn things_summary(things: &ThingsSnapshot) -> Value {
    let compact: Map<String, Value> = things
        .iter()
        .map(|(uid, thing)| {
            let status = thing.get("statusInfo");
            let field = |camel: &str, lower: &str| {
                thing
                    .get(camel)
                    .or_else(|| thing.get(lower))
                    .cloned()
                    .unwrap_or(Value::Null)
            };
            (
                uid.clone(),
                json!({
                    "label": thing.get("label"),
                    "thing_type_uid": field("thingTypeUID", "thingTypeUid"),
                    "bridge_uid": field("bridgeUID", "bridgeUid"),
                    "status": status.and_then(|s| s.get("status")),
                    "status_detail": status.and_then(|s| s.get("statusDetail")),
                    "properties": thing.get("properties"),
                    "channels_count": thing
                        .get("channels")
                        .and_then(Value::as_array)
                        .map_or(0, Vec::len),
                }),
            )
        })
        .collect();

    json!({
        "things_count": compact.len(),
        "things_compact": compact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{self, NormalizeOptions};

    fn item(value: Value) -> Item {
        Item::from_json(value, 0).unwrap()
    }

    fn items_from(values: Vec<Value>) -> BTreeMap<String, Item> {
        values
            .into_iter()
            .map(item)
            .map(|item| (naming::clean_item_key(&item.name).to_string(), item))
            .collect()
    }

    fn report_for(items: &BTreeMap<String, Item>, things: &ThingsSnapshot) -> Value {
        let mut config = ManagerConfig::new("192.168.1.20", "installer", "hunter2");
        config.item_names = vec!["grid_power".into()];
        let snapshot = Snapshot {
            items: items
                .values()
                .filter_map(|i| naming::normalize(i, &NormalizeOptions::default()).ok())
                .map(|n| (n.key.clone(), n))
                .collect(),
            ..Default::default()
        };
        build_report(&DiagnosticsSource {
            config: &config,
            status: &CoordinatorStatus::default(),
            items,
            key_collisions: &BTreeMap::new(),
            snapshot: &snapshot,
            things,
        })
    }

    #[test]
    fn test_redact_nested_keys() {
        let redacted = redact(json!({
            "Password": "x",
            "nested": { "api_token": "y", "list": [{ "Cookie": "z", "keep": 1 }] },
            "kiwiSessionId": "abc",
            "host": "manager"
        }));

        assert_eq!(redacted["Password"], REDACTED);
        assert_eq!(redacted["nested"]["api_token"], REDACTED);
        assert_eq!(redacted["nested"]["list"][0]["Cookie"], REDACTED);
        assert_eq!(redacted["nested"]["list"][0]["keep"], 1);
        assert_eq!(redacted["kiwiSessionId"], REDACTED);
        assert_eq!(redacted["host"], "manager");
    }

    #[test]
    fn test_report_layout_and_secrets() {
        let items = items_from(vec![
            json!({"name": "grid_power", "state": "10 W", "type": "Number:Power", "label": "Grid"}),
            json!({"name": "battery_mode", "state": "IDLE", "type": "String"}),
            json!({"name": "house_energy", "state": "NULL"}),
            json!({"name": "pv_power_raw", "state": "12"}),
        ]);
        let report = report_for(&items, &ThingsSnapshot::new());

        assert!(report["generated_at"].as_str().unwrap().ends_with('Z'));
        assert_eq!(report["config"]["password"], REDACTED);
        assert_eq!(report["config"]["host"], "192.168.1.20");
        assert_eq!(report["coordinator"]["data_items"], 4);
        assert_eq!(report["coordinator"]["numeric_items"], 2);
        assert_eq!(report["items"]["grid_power"]["raw_state"], "10 W");
        assert_eq!(report["stats"]["types"]["unknown"], 2);
        assert_eq!(report["stats"]["null_value"], 1);
        assert_eq!(report["stats"]["non_numeric_value"], 1);
        assert_eq!(report["stats"]["missing_label"], 3);

        let problems = &report["problem_items"];
        assert_eq!(problems["problem_items_total"], 3);
        let issues: Vec<&str> = problems["problem_items_top_20"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["issue"].as_str().unwrap())
            .collect();
        assert!(issues.contains(&"value is NULL"));
        assert!(issues.contains(&"missing unit"));
        assert!(issues.contains(&"non-numeric value: \"IDLE\""));

        assert_eq!(report["samples"]["first_50"].as_object().unwrap().len(), 4);
        assert!(report["samples"]["last_50"].is_null());
    }

    #[test]
    fn test_samples_split_large_item_lists() {
        let items = items_from(
            (0..120)
                .map(|i| json!({"name": format!("item_{i:03}"), "state": format!("{i}")}))
                .collect(),
        );
        let report = report_for(&items, &ThingsSnapshot::new());

        let first = report["samples"]["first_50"].as_object().unwrap();
        let last = report["samples"]["last_50"].as_object().unwrap();
        assert_eq!(first.len(), 50);
        assert_eq!(last.len(), 50);
        assert!(first.contains_key("item_000"));
        assert!(last.contains_key("item_119"));
        assert!(!last.contains_key("item_069"));
    }

    #[test]
    fn test_things_summary() {
        let mut things = ThingsSnapshot::new();
        things.insert(
            "kiwigrid:location:standard".into(),
            json!({
                "label": "Location",
                "thingTypeUID": "kiwigrid:location",
                "statusInfo": {"status": "ONLINE", "statusDetail": "NONE"},
                "channels": [{}, {}, {}],
                "properties": {"sessionKey": "secret", "firmware": "1.2"}
            }),
        );
        let report = report_for(&BTreeMap::new(), &things);

        let summary = &report["things_summary"];
        assert_eq!(summary["things_count"], 1);
        let thing = &summary["things_compact"]["kiwigrid:location:standard"];
        assert_eq!(thing["thing_type_uid"], "kiwigrid:location");
        assert_eq!(thing["status"], "ONLINE");
        assert_eq!(thing["channels_count"], 3);
        assert_eq!(thing["properties"]["sessionKey"], REDACTED);
        assert_eq!(thing["properties"]["firmware"], "1.2");
    }
}
