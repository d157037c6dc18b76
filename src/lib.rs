//! SOLARWATT Manager bridge
//!
//! Polls the OpenHAB based REST API of a SOLARWATT Manager, turns the raw items into
//! normalized sensor readings and keeps the latest snapshot for whoever consumes it.

pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod entities;
pub mod errors;
pub mod item_state;
pub mod naming;
pub mod solarwatt_client;

// Re-export commonly used types for easier access
pub use config::{check_connection, ConfigError, ManagerConfig};
pub use coordinator::{Coordinator, CoordinatorStatus, EnergyDeltaState, Snapshot, ThingsSnapshot};
pub use errors::{ErrorKind, SolarwattError, SolarwattResult};
pub use item_state::Item;
pub use naming::{normalize, NormalizeOptions, NormalizedItem};
pub use solarwatt_client::SolarwattClient;
