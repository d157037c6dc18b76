//! Item name and unit normalization.
//!
//! Everything in here is a pure function of the item plus the static rule tables
//! below. The tables are compiled once per process and shared by every poll.

use crate::errors::{SolarwattError, SolarwattResult};
use crate::item_state::Item;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_derive::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Power,
    Energy,
    Voltage,
    Current,
    Frequency,
    Temperature,
    Battery,
    Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    Total,
    TotalIncreasing,
}

/// Settings that shape names but never keys
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeOptions {
    pub name_prefix: String,
    pub enable_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedItem {
    pub key: String,
    pub name: String,
    pub display_name: String,
    pub value: f64,
    pub unit: Option<String>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub icon: Option<&'static str>,
    pub enabled_by_default: bool,
    pub unit_conflict: Option<String>,
    pub timestamp_ms: Option<i64>,
}

impl NormalizedItem {
    pub fn is_energy(&self) -> bool {
        self.device_class == Some(DeviceClass::Energy)
    }
}

// -----------------------------
// Keys
// -----------------------------

/// Installation specific segments, applied in order to the raw name
static KEY_RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"^foxesshybrid_battery_[^_]+_", "foxess_"),
        (
            r"^kiwigrid_location_standard_[^_]+_harmonized_",
            "kiwigrid_harmonized_",
        ),
        (r"^batteryflex_[^_]*\d[^_]*_", "batteryflex_"),
        (
            r"^([a-z][a-z0-9]*)_[^_]*\d[^_]*_(harmonized|inverter|limitable)_",
            "${1}_${2}_",
        ),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("key rule is a valid regex"),
            replacement,
        )
    })
    .collect()
});

/// Strips the OpenHAB `#` marker used on metadata items
pub fn clean_item_key(raw: &str) -> &str {
    raw.trim_start_matches('#')
}

/// Stable identity of an item. Only depends on the raw name.
pub fn item_key(raw: &str) -> String {
    let mut key = clean_item_key(raw).to_string();
    for (pattern, replacement) in KEY_RULES.iter() {
        key = pattern.replace(&key, *replacement).into_owned();
    }
    key
}

// -----------------------------
// Display names
// -----------------------------

const VENDOR_PREFIXES: &[&str] = &["kiwigrid_", "kacoinv_"];
const DROPPED_TOKENS: &[&str] = &["harmonized"];

const TITLE_EXCEPTIONS: &[(&str, &str)] = &[("bms", "BMS"), ("soc", "SoC"), ("soh", "SoH")];

static ACRONYMS: Lazy<Vec<(Regex, String)>> = Lazy::new(|| {
    [
        "FoxESSInv",
        "FoxESS",
        "SunSpec",
        "Modbus",
        "MPPT",
        "KEBA",
        "ACS",
        "SMA",
        "INV",
        "AC",
        "DC",
        "PV",
    ]
    .into_iter()
    .map(|term| {
        let pattern = format!(r"(?i)\b{}(\d*)\b", regex::escape(term));
        (
            Regex::new(&pattern).expect("acronym pattern is valid"),
            format!("{term}${{1}}"),
        )
    })
    .collect()
});

fn title_case_word(word: &str) -> String {
    let lower = word.to_lowercase();
    if let Some((_, fixed)) = TITLE_EXCEPTIONS.iter().find(|(w, _)| *w == lower) {
        return fixed.to_string();
    }
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Underscores to spaces, Title Case, then restores acronym casing.
/// Running it on its own output changes nothing.
pub fn cleanup_display_name(name: &str) -> String {
    let titled = name
        .replace('_', " ")
        .split_whitespace()
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ");

    ACRONYMS
        .iter()
        .fold(titled, |acc, (pattern, replacement)| {
            pattern.replace_all(&acc, replacement.as_str()).into_owned()
        })
}

/// Human readable name for an item key
pub fn display_name(key: &str, prefix: &str) -> String {
    let mut name = key;
    while let Some(rest) = VENDOR_PREFIXES.iter().find_map(|p| name.strip_prefix(p)) {
        name = rest;
    }
    let stripped = name
        .split('_')
        .filter(|token| !token.is_empty() && !DROPPED_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join("_");

    let base = cleanup_display_name(&stripped);
    let prefix = prefix.trim();
    if prefix.is_empty() {
        base
    } else {
        format!("{prefix} {base}").trim().to_string()
    }
}

// -----------------------------
// Default enabled sensors
// -----------------------------

static DEFAULT_ENABLED: Lazy<Vec<Regex>> = Lazy::new(|| {
    const FLOWS: &str = "in|out|produced|released|consumed|consumed_from_grid|consumed_from_storage|consumed_from_producers|buffered|buffered_from_grid|buffered_from_producers|self_consumed|self_supplied";
    [
        format!(r"^kiwigrid_location_standard_[^_]+_harmonized_power_(?:{FLOWS})$"),
        format!(r"^kiwigrid_location_standard_[^_]+_harmonized_work_(?:{FLOWS})_total$"),
        r"^foxesshybrid_battery_[^_]+_battery_(?:soc|bms_power|work_in_total|work_out_total|mode|bms_1_voltage|bms_1_current|bms_1_temperature)$".to_string(),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("default enabled pattern is valid"))
    .collect()
});

/// True for the small set of core items that should be visible without user action
pub fn is_enabled_by_default(raw: &str) -> bool {
    let key = clean_item_key(raw);
    DEFAULT_ENABLED.iter().any(|p| p.is_match(key))
}

fn contains_any(name_l: &str, words: &[&str]) -> bool {
    words.iter().any(|w| name_l.contains(w))
}

fn suggest_icon(name_l: &str) -> Option<&'static str> {
    if contains_any(name_l, &["pv", "solar", "generator"]) {
        Some("mdi:solar-power")
    } else if contains_any(name_l, &["grid", "netz"]) {
        Some("mdi:transmission-tower")
    } else if contains_any(name_l, &["battery", "akku"]) {
        Some("mdi:battery")
    } else if contains_any(name_l, &["house", "home", "load", "verbrauch"]) {
        Some("mdi:home-lightning-bolt")
    } else {
        None
    }
}

// -----------------------------
// Units
// -----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Power,
    Energy,
    Voltage,
    Current,
    Frequency,
    Temperature,
    Ratio,
    Time,
}

/// Unit, dimension and factor to the dimension's base unit
const UNIT_SCALES: &[(&str, Dimension, f64)] = &[
    ("W", Dimension::Power, 1.0),
    ("kW", Dimension::Power, 1e3),
    ("mW", Dimension::Power, 1e-3),
    ("µW", Dimension::Power, 1e-6),
    ("Wh", Dimension::Energy, 1.0),
    ("kWh", Dimension::Energy, 1e3),
    ("MWh", Dimension::Energy, 1e6),
    ("mWh", Dimension::Energy, 1e-3),
    ("Ws", Dimension::Energy, 1.0 / 3600.0),
    ("V", Dimension::Voltage, 1.0),
    ("mV", Dimension::Voltage, 1e-3),
    ("µV", Dimension::Voltage, 1e-6),
    ("A", Dimension::Current, 1.0),
    ("mA", Dimension::Current, 1e-3),
    ("µA", Dimension::Current, 1e-6),
    ("Hz", Dimension::Frequency, 1.0),
    ("°C", Dimension::Temperature, 1.0),
    ("%", Dimension::Ratio, 1.0),
    ("s", Dimension::Time, 1.0),
    ("ms", Dimension::Time, 1e-3),
    ("min", Dimension::Time, 60.0),
    ("h", Dimension::Time, 3600.0),
];

const SUBUNITS: &[(&str, &str)] = &[
    ("mW", "W"),
    ("µW", "W"),
    ("mV", "V"),
    ("µV", "V"),
    ("mA", "A"),
    ("µA", "A"),
    ("ms", "s"),
    ("mWh", "Wh"),
    ("Ws", "Wh"),
];

fn unit_scale(unit: &str) -> Option<(Dimension, f64)> {
    UNIT_SCALES
        .iter()
        .find(|(u, _, _)| *u == unit)
        .map(|(_, dimension, factor)| (*dimension, *factor))
}

fn convert(value: f64, from: &str, to: &str) -> Option<f64> {
    if from == to {
        return Some(value);
    }
    let (from_dim, from_factor) = unit_scale(from)?;
    let (to_dim, to_factor) = unit_scale(to)?;
    (from_dim == to_dim).then(|| value * from_factor / to_factor)
}

/// Folds the spelling variants the Manager emits into one symbol per unit
pub fn canonical_unit(raw: &str) -> String {
    let unit: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            'μ' => 'µ',
            'º' | '˚' => '°',
            _ => c,
        })
        .collect();

    let fixed = match unit.as_str() {
        "C" | "°c" | "degC" | "℃" => "°C",
        "kwh" | "KWh" | "KWH" => "kWh",
        "kw" | "KW" => "kW",
        "wh" | "WH" => "Wh",
        "sec" | "secs" | "seconds" => "s",
        "%%" => "%",
        "uW" => "µW",
        "uV" => "µV",
        "uA" => "µA",
        _ => return unit,
    };
    fixed.to_string()
}

static PATTERN_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*%[-#+ 0,(<]*\d*(?:\.\d+)?[a-zA-Z]\s*(.*?)\s*$")
        .expect("pattern unit regex is valid")
});

/// Unit named by a state description pattern such as `%.1f kWh`
pub fn unit_from_pattern(pattern: &str) -> Option<String> {
    let caps = PATTERN_UNIT.captures(pattern)?;
    let unit = caps.get(1)?.as_str();
    match unit {
        "" | "%unit%" => None,
        "%%" => Some("%".to_string()),
        _ => Some(canonical_unit(unit)),
    }
}

fn unit_from_name(name_l: &str) -> Option<&'static str> {
    let tokens: Vec<&str> = name_l.split('_').collect();
    let has = |t: &str| tokens.contains(&t);
    if has("soc") || name_l.contains("state_of_charge") || name_l.contains("stateofcharge") {
        Some("%")
    } else if has("voltage") {
        Some("V")
    } else if has("current") {
        Some("A")
    } else if has("frequency") {
        Some("Hz")
    } else if has("work") || has("energy") {
        Some("Wh")
    } else if has("power") && !has("factor") {
        Some("W")
    } else {
        None
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

// -----------------------------
// Classification
// -----------------------------

struct ClassifyInput<'a> {
    name_l: &'a str,
    unit: Option<&'a str>,
    item_type: &'a str,
}

struct ClassRule {
    matches: fn(&ClassifyInput) -> bool,
    device_class: Option<DeviceClass>,
    state_class: Option<StateClass>,
    default_unit: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub default_unit: Option<&'static str>,
}

fn is_duration_name(i: &ClassifyInput) -> bool {
    i.name_l.ends_with("seconds") || i.name_l.ends_with("sec")
}
fn is_temperature_name(i: &ClassifyInput) -> bool {
    i.name_l.contains("temperatur")
}
fn is_power_unit(i: &ClassifyInput) -> bool {
    matches!(i.unit, Some("W" | "kW"))
}
fn is_energy_unit(i: &ClassifyInput) -> bool {
    matches!(i.unit, Some("Wh" | "kWh" | "MWh"))
}
fn is_voltage_unit(i: &ClassifyInput) -> bool {
    i.unit == Some("V")
}
fn is_current_unit(i: &ClassifyInput) -> bool {
    i.unit == Some("A")
}
fn is_frequency_unit(i: &ClassifyInput) -> bool {
    i.unit == Some("Hz")
}
fn is_temperature_unit(i: &ClassifyInput) -> bool {
    i.unit == Some("°C")
}
fn is_battery_percentage(i: &ClassifyInput) -> bool {
    i.unit == Some("%")
        && contains_any(
            i.name_l,
            &["soc", "stateofcharge", "state_of_charge", "battery", "akku"],
        )
}
fn is_percentage(i: &ClassifyInput) -> bool {
    i.unit == Some("%")
}
fn is_time_unit(i: &ClassifyInput) -> bool {
    matches!(i.unit, Some("s" | "min" | "h"))
}
fn is_power_type(i: &ClassifyInput) -> bool {
    i.item_type.starts_with("Number:Power")
}
fn is_energy_type(i: &ClassifyInput) -> bool {
    i.item_type.starts_with("Number:Energy")
}
fn is_temperature_type(i: &ClassifyInput) -> bool {
    i.item_type.starts_with("Number:Temperature")
}
fn is_frequency_type(i: &ClassifyInput) -> bool {
    i.item_type.starts_with("Number:Frequency")
}
fn is_current_type(i: &ClassifyInput) -> bool {
    i.item_type.starts_with("Number:ElectricCurrent")
}
fn is_voltage_type(i: &ClassifyInput) -> bool {
    i.item_type.starts_with("Number:ElectricPotential")
}
fn is_time_type(i: &ClassifyInput) -> bool {
    i.item_type.starts_with("Number:Time")
}

const fn rule(
    matches: fn(&ClassifyInput) -> bool,
    device_class: Option<DeviceClass>,
    state_class: StateClass,
    default_unit: Option<&'static str>,
) -> ClassRule {
    ClassRule {
        matches,
        device_class,
        state_class: Some(state_class),
        default_unit,
    }
}

/// Evaluated top to bottom, first match wins
static CLASS_RULES: &[ClassRule] = &[
    rule(is_duration_name, Some(DeviceClass::Duration), StateClass::Measurement, Some("s")),
    rule(is_temperature_name, Some(DeviceClass::Temperature), StateClass::Measurement, Some("°C")),
    rule(is_power_unit, Some(DeviceClass::Power), StateClass::Measurement, Some("W")),
    rule(is_energy_unit, Some(DeviceClass::Energy), StateClass::TotalIncreasing, Some("kWh")),
    rule(is_voltage_unit, Some(DeviceClass::Voltage), StateClass::Measurement, Some("V")),
    rule(is_current_unit, Some(DeviceClass::Current), StateClass::Measurement, Some("A")),
    rule(is_frequency_unit, Some(DeviceClass::Frequency), StateClass::Measurement, Some("Hz")),
    rule(is_temperature_unit, Some(DeviceClass::Temperature), StateClass::Measurement, Some("°C")),
    rule(is_battery_percentage, Some(DeviceClass::Battery), StateClass::Measurement, Some("%")),
    rule(is_percentage, None, StateClass::Measurement, Some("%")),
    rule(is_time_unit, Some(DeviceClass::Duration), StateClass::Measurement, Some("s")),
    rule(is_power_type, Some(DeviceClass::Power), StateClass::Measurement, Some("W")),
    rule(is_energy_type, Some(DeviceClass::Energy), StateClass::TotalIncreasing, Some("kWh")),
    rule(is_temperature_type, Some(DeviceClass::Temperature), StateClass::Measurement, Some("°C")),
    rule(is_frequency_type, Some(DeviceClass::Frequency), StateClass::Measurement, Some("Hz")),
    rule(is_current_type, Some(DeviceClass::Current), StateClass::Measurement, Some("A")),
    rule(is_voltage_type, Some(DeviceClass::Voltage), StateClass::Measurement, Some("V")),
    rule(is_time_type, Some(DeviceClass::Duration), StateClass::Measurement, Some("s")),
];

/// Picks device class, state class and fallback unit for a name/unit/type triple
pub fn classify(name: &str, unit: Option<&str>, item_type: Option<&str>) -> Classification {
    let name_l = name.to_lowercase();
    let input = ClassifyInput {
        name_l: &name_l,
        unit,
        item_type: item_type.unwrap_or_default(),
    };
    CLASS_RULES
        .iter()
        .find(|r| (r.matches)(&input))
        .map(|r| Classification {
            device_class: r.device_class,
            state_class: r.state_class,
            default_unit: r.default_unit,
        })
        .unwrap_or(Classification {
            device_class: None,
            state_class: Some(StateClass::Measurement),
            default_unit: None,
        })
}

// -----------------------------
// Normalize
// -----------------------------

/// Turns a parsed item into its canonical form. Non-numeric values are a parse error.
pub fn normalize(item: &Item, options: &NormalizeOptions) -> SolarwattResult<NormalizedItem> {
    let raw_value = item.raw_value.as_number().ok_or_else(|| {
        SolarwattError::parse(
            &item.name,
            format!("non-numeric state {:?}", item.raw_state.as_deref().unwrap_or("")),
        )
    })?;
    if !raw_value.is_finite() {
        return Err(SolarwattError::parse(&item.name, "value is not finite"));
    }

    let key = item_key(&item.name);
    let name_l = key.to_lowercase();

    // Explicit units first: the pattern hint wins, the state's own unit tells us what
    // the number is actually measured in.
    let state_unit = item.raw_unit.as_deref().map(canonical_unit);
    let hint_unit = item.pattern_hint.as_deref().and_then(unit_from_pattern);
    let mut unit_conflict = None;
    let (mut value, mut unit) = match (hint_unit, state_unit) {
        (Some(hint), Some(state)) if hint != state => match convert(raw_value, &state, &hint) {
            Some(converted) => (converted, Some(hint)),
            None => {
                unit_conflict = Some(format!("pattern unit {hint} vs state unit {state}"));
                (raw_value, Some(state))
            }
        },
        (Some(hint), _) => (raw_value, Some(hint)),
        (None, state) => (raw_value, state),
    };

    if let (Some(explicit), Some(from_name)) = (unit.as_deref(), unit_from_name(&name_l)) {
        let explicit_dim = unit_scale(explicit).map(|(d, _)| d);
        let name_dim = unit_scale(from_name).map(|(d, _)| d);
        if explicit_dim.is_some() && explicit_dim != name_dim && unit_conflict.is_none() {
            unit_conflict = Some(format!("unit {explicit} vs name suggesting {from_name}"));
        }
    }

    let subunit = unit
        .as_deref()
        .and_then(|u| SUBUNITS.iter().find(|(sub, _)| *sub == u))
        .copied();
    if let Some((sub, base)) = subunit {
        if let Some(converted) = convert(value, sub, base) {
            value = converted;
            unit = Some(base.to_string());
        }
    }

    if unit.is_none() {
        unit = unit_from_name(&name_l).map(str::to_string);
    }

    let class = classify(&key, unit.as_deref(), item.item_type.as_deref());
    if unit.is_none() {
        unit = class.default_unit.map(str::to_string);
    }

    if class.device_class == Some(DeviceClass::Energy) {
        let from = unit.clone().unwrap_or_else(|| "kWh".to_string());
        if let Some(kwh) = convert(value, &from, "kWh") {
            value = kwh;
            unit = Some("kWh".to_string());
        }
    } else {
        value = match unit.as_deref() {
            Some("kW") => round_to(value, 3),
            Some("W" | "V" | "A" | "Hz" | "%" | "°C") => round_to(value, 2),
            _ => value,
        };
    }

    Ok(NormalizedItem {
        display_name: display_name(&key, &options.name_prefix),
        icon: suggest_icon(&name_l),
        enabled_by_default: options.enable_all || is_enabled_by_default(&item.name),
        name: clean_item_key(&item.name).to_string(),
        key,
        value,
        unit,
        device_class: class.device_class,
        state_class: class.state_class,
        unit_conflict,
        timestamp_ms: item.timestamp_ms,
    })
}
