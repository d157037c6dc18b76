use crate::errors::{SolarwattError, SolarwattResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_derive::{Deserialize, Serialize};

/// Number with an optional trailing unit, e.g. `1500 W`, `-3.2e2 Wh`, `21.5 °C`
static NUMBER_WITH_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([+-]?(?:\d+(?:\.\d+)?|\.\d+)(?:[eE][+-]?\d+)?)\s*([^\d\s].*)?\s*$")
        .expect("number regex is valid")
});

/// Item as served by `GET /rest/items`
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    #[serde(default)]
    pub name: Option<String>,
    /// Usually a string, some firmware sends plain JSON numbers
    #[serde(default)]
    pub state: Option<serde_json::Value>,
    #[serde(default, rename = "type")]
    pub item_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub editable: Option<bool>,
    #[serde(default)]
    pub group_names: Option<Vec<String>>,
    #[serde(default)]
    pub state_description: Option<StateDescription>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDescription {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl StateValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            StateValue::Number(value) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedState {
    pub value: StateValue,
    pub unit: Option<String>,
    pub timestamp_ms: Option<i64>,
}

impl ParsedState {
    fn value_only(value: StateValue) -> Self {
        Self {
            value,
            unit: None,
            timestamp_ms: None,
        }
    }
}

/// A single data point read from the Manager, split into value and unit
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub name: String,
    pub raw_value: StateValue,
    pub raw_unit: Option<String>,
    pub pattern_hint: Option<String>,
    pub timestamp_ms: Option<i64>,
    pub item_type: Option<String>,
    pub label: Option<String>,
    pub category: Option<String>,
    pub editable: bool,
    pub group_names: Vec<String>,
    pub raw_state: Option<String>,
}

impl Item {
    /// Parses one entry of the item list. `index` names items the Manager sent without a name.
    pub fn from_json(value: serde_json::Value, index: usize) -> SolarwattResult<Self> {
        let raw: RawItem = serde_json::from_value(value)
            .map_err(|e| SolarwattError::parse(format!("#{index}"), e.to_string()))?;
        Ok(Self::from_raw(raw, index))
    }

    pub fn from_raw(raw: RawItem, index: usize) -> Self {
        let state = raw.state.as_ref().and_then(state_text);
        let parsed = parse_state(state.as_deref());
        Self {
            name: raw.name.unwrap_or_else(|| format!("unknown_{index}")),
            raw_value: parsed.value,
            raw_unit: parsed.unit,
            pattern_hint: raw.state_description.and_then(|d| d.pattern),
            timestamp_ms: parsed.timestamp_ms,
            item_type: raw.item_type,
            label: raw.label,
            category: raw.category,
            editable: raw.editable.unwrap_or(false),
            group_names: raw.group_names.unwrap_or_default(),
            raw_state: state,
        }
    }

    pub fn is_switch(&self) -> bool {
        self.item_type
            .as_deref()
            .is_some_and(|t| t.starts_with("Switch"))
    }
}

/// State as text, whatever JSON type the Manager used for it
fn state_text(state: &serde_json::Value) -> Option<String> {
    match state {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Bool(true) => Some("ON".to_string()),
        serde_json::Value::Bool(false) => Some("OFF".to_string()),
        other => Some(other.to_string()),
    }
}

/// Splits an OpenHAB state string into value, unit and optional `timestamp|` prefix
pub fn parse_state(state: Option<&str>) -> ParsedState {
    let Some(state) = state else {
        return ParsedState::value_only(StateValue::Null);
    };
    let state = state.trim();

    match state {
        "NULL" | "UNDEF" => return ParsedState::value_only(StateValue::Null),
        "ON" => return ParsedState::value_only(StateValue::Bool(true)),
        "OFF" => return ParsedState::value_only(StateValue::Bool(false)),
        _ => {}
    }

    if let Some((left, right)) = state.split_once('|') {
        let left = left.trim();
        let mut parsed = parse_state(Some(right));
        parsed.timestamp_ms = if !left.is_empty() && left.bytes().all(|b| b.is_ascii_digit()) {
            left.parse().ok()
        } else {
            None
        };
        return parsed;
    }

    if let Some(caps) = NUMBER_WITH_UNIT.captures(state) {
        if let Ok(value) = caps[1].parse::<f64>() {
            let unit = caps
                .get(2)
                .map(|m| m.as_str().trim().replace("\\u00b0", "°"))
                .filter(|u| !u.is_empty());
            return ParsedState {
                value: StateValue::Number(value),
                unit,
                timestamp_ms: None,
            };
        }
    }

    ParsedState::value_only(StateValue::Text(state.to_string()))
}
