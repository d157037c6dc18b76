//! Host independent descriptions of the sensors and the diagnostics button.
//!
//! A host platform turns these into its own entity types. Nothing in here holds state
//! besides the set of keys already announced.

use crate::coordinator::{Coordinator, Snapshot};
use crate::naming::{DeviceClass, StateClass};
use crate::solarwatt_client::base_url;
use serde_derive::Serialize;
use std::collections::BTreeSet;

pub const DOMAIN: &str = "solarwatt_manager";
pub const MANUFACTURER: &str = "SOLARWATT";
pub const MODEL: &str = "Manager flex / rail";
pub const DEFAULT_DEVICE_NAME: &str = "SOLARWATT Manager";

/// All entities of one Manager are grouped under this device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifier: (String, String),
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub configuration_url: String,
}

impl DeviceInfo {
    pub fn new(host: &str, name: &str) -> Self {
        let name = name.trim();
        Self {
            identifier: (DOMAIN.to_string(), host.to_string()),
            name: if name.is_empty() {
                DEFAULT_DEVICE_NAME.to_string()
            } else {
                name.to_string()
            },
            manufacturer: MANUFACTURER,
            model: MODEL,
            configuration_url: base_url(host),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDescriptor {
    pub unique_id: String,
    pub key: String,
    pub name: String,
    pub unit: Option<String>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub icon: Option<&'static str>,
    pub enabled_by_default: bool,
    pub device: DeviceInfo,
}

/// What a sensor shows right now
#[derive(Debug, Clone, PartialEq)]
pub struct SensorState {
    pub value: Option<f64>,
    pub available: bool,
    pub stale: bool,
}

/// Descriptor for every item of a snapshot. Unique ids only depend on the entry and the key.
pub fn sensor_descriptors(
    entry_id: &str,
    device: &DeviceInfo,
    snapshot: &Snapshot,
) -> Vec<SensorDescriptor> {
    snapshot
        .items
        .values()
        .map(|item| SensorDescriptor {
            unique_id: format!("{entry_id}_{}", item.key),
            key: item.key.clone(),
            name: item.display_name.clone(),
            unit: item.unit.clone(),
            device_class: item.device_class,
            state_class: item.state_class,
            icon: item.icon,
            enabled_by_default: item.enabled_by_default,
            device: device.clone(),
        })
        .collect()
}

pub fn sensor_state(coordinator: &Coordinator, key: &str) -> SensorState {
    let snapshot = coordinator.current_snapshot();
    SensorState {
        value: snapshot.get(key).map(|item| item.value),
        available: coordinator.is_available() && snapshot.get(key).is_some(),
        stale: snapshot.is_stale(key),
    }
}

/// Remembers which keys were already handed to the host, so each sensor is created once
#[derive(Debug)]
pub struct SensorRegistry {
    entry_id: String,
    device: DeviceInfo,
    known: BTreeSet<String>,
}

impl SensorRegistry {
    pub fn new(entry_id: impl Into<String>, device: DeviceInfo) -> Self {
        Self {
            entry_id: entry_id.into(),
            device,
            known: BTreeSet::new(),
        }
    }

    /// Descriptors for keys not seen before
    pub fn discover(&mut self, snapshot: &Snapshot) -> Vec<SensorDescriptor> {
        let fresh: Vec<SensorDescriptor> = sensor_descriptors(&self.entry_id, &self.device, snapshot)
            .into_iter()
            .filter(|descriptor| !self.known.contains(&descriptor.key))
            .collect();
        self.known
            .extend(fresh.iter().map(|descriptor| descriptor.key.clone()));
        fresh
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// Diagnostic button that refreshes the things listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshButton {
    pub unique_id: String,
    pub translation_key: &'static str,
    pub device: DeviceInfo,
}

impl RefreshButton {
    pub fn new(entry_id: &str, device: DeviceInfo) -> Self {
        Self {
            unique_id: format!("{entry_id}_diagnostics_refresh"),
            translation_key: "diagnostics_refresh",
            device,
        }
    }

    pub async fn press(&self, coordinator: &Coordinator) {
        coordinator.refresh_things().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item_state::Item;
    use crate::naming::{normalize, NormalizeOptions};
    use serde_json::json;

    fn snapshot_of(values: Vec<serde_json::Value>) -> Snapshot {
        let items = values
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| Item::from_json(v, i).ok())
            .filter_map(|item| normalize(&item, &NormalizeOptions::default()).ok())
            .map(|n| (n.key.clone(), n))
            .collect();
        Snapshot {
            items,
            ..Default::default()
        }
    }

    #[test]
    fn test_device_info() {
        let device = DeviceInfo::new("192.168.1.20", "");
        assert_eq!(device.name, DEFAULT_DEVICE_NAME);
        assert_eq!(
            device.identifier,
            (DOMAIN.to_string(), "192.168.1.20".to_string())
        );
        assert_eq!(device.configuration_url, "http://192.168.1.20");
    }

    #[test]
    fn test_sensor_descriptors() {
        let snapshot = snapshot_of(vec![
            json!({"name": "kacoinv_harmonized_power_produced", "state": "1500 W"}),
            json!({"name": "relay", "state": "ON", "type": "Switch"}),
        ]);
        let device = DeviceInfo::new("manager", "Roof");
        let sensors = sensor_descriptors("entry1", &device, &snapshot);

        assert_eq!(sensors.len(), 1);
        let sensor = &sensors[0];
        assert_eq!(sensor.unique_id, "entry1_kacoinv_harmonized_power_produced");
        assert_eq!(sensor.name, "Power Produced");
        assert_eq!(sensor.unit.as_deref(), Some("W"));
        assert_eq!(sensor.device_class, Some(DeviceClass::Power));
        assert_eq!(sensor.device.name, "Roof");
    }

    #[test]
    fn test_registry_announces_each_key_once() {
        let mut registry = SensorRegistry::new("entry1", DeviceInfo::new("manager", ""));

        let first = snapshot_of(vec![json!({"name": "grid_power", "state": "1 W"})]);
        assert_eq!(registry.discover(&first).len(), 1);
        assert!(registry.discover(&first).is_empty());

        let second = snapshot_of(vec![
            json!({"name": "grid_power", "state": "2 W"}),
            json!({"name": "house_power", "state": "3 W"}),
        ]);
        let fresh = registry.discover(&second);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].key, "house_power");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_refresh_button_id() {
        let button = RefreshButton::new("entry1", DeviceInfo::new("manager", ""));
        assert_eq!(button.unique_id, "entry1_diagnostics_refresh");
    }
}
