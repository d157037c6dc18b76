use crate::errors::SolarwattError;
use crate::naming::NormalizeOptions;
use crate::solarwatt_client::SolarwattClient;
use serde_json::json;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

pub const DEFAULT_USERNAME: &str = "installer";
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 15;
pub const MIN_SCAN_INTERVAL_SECS: u64 = 10;
pub const MAX_SCAN_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_RETRY_TOLERANCE: u32 = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    InvalidHost,
    #[error("username must not be empty")]
    InvalidUsername,
    #[error("password must not be empty")]
    InvalidPassword,
    #[error("scan interval must be between 10 and 3600 seconds, got {0}")]
    InvalidScanInterval(String),
    #[error("energy delta threshold must be a non-negative number, got {0}")]
    InvalidEnergyDelta(String),
    #[error("retry tolerance must be a positive integer, got {0}")]
    InvalidRetryTolerance(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::InvalidHost => "invalid_host",
            ConfigError::InvalidUsername => "invalid_username",
            ConfigError::InvalidPassword => "invalid_password",
            ConfigError::InvalidScanInterval(_) => "invalid_scan_interval",
            ConfigError::InvalidEnergyDelta(_) => "invalid_energy_delta",
            ConfigError::InvalidRetryTolerance(_) => "invalid_retry_tolerance",
        }
    }
}

impl From<ConfigError> for SolarwattError {
    fn from(err: ConfigError) -> Self {
        SolarwattError::Config(err.to_string())
    }
}

/// Everything needed to talk to one Manager
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Restricts polling to these item names, empty means all items
    pub item_names: Vec<String>,
    pub scan_interval_secs: u64,
    pub name_prefix: String,
    pub enable_all: bool,
    /// Minimum change before an energy reading is republished, 0 disables suppression
    pub energy_delta: f64,
    /// Consecutive failed polls tolerated before entities turn unavailable
    pub retry_tolerance: u32,
}

impl ManagerConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            item_names: Vec::new(),
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            name_prefix: String::new(),
            enable_all: false,
            energy_delta: 0.0,
            retry_tolerance: DEFAULT_RETRY_TOLERANCE,
        }
    }

    /// Reads `SOLARWATT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            env::var("SOLARWATT_HOST").unwrap_or_default(),
            env::var("SOLARWATT_USERNAME").unwrap_or_else(|_| DEFAULT_USERNAME.to_string()),
            env::var("SOLARWATT_PASSWORD").unwrap_or_default(),
        );
        config.item_names = parse_item_names(&env::var("SOLARWATT_ITEMS").unwrap_or_default());
        config.name_prefix = env::var("SOLARWATT_NAME_PREFIX").unwrap_or_default();
        config.enable_all = parse_bool_safe(env::var("SOLARWATT_ENABLE_ALL").ok());

        if let Ok(scan) = env::var("SOLARWATT_SCAN_INTERVAL") {
            config.scan_interval_secs = scan
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidScanInterval(scan.clone()))?;
        }
        if let Ok(delta) = env::var("SOLARWATT_ENERGY_DELTA") {
            config.energy_delta = delta
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnergyDelta(delta.clone()))?;
        }
        if let Ok(tolerance) = env::var("SOLARWATT_RETRY_TOLERANCE") {
            config.retry_tolerance = tolerance
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidRetryTolerance(tolerance.clone()))?;
        }

        info!("SOLARWATT config:");
        info!("  Host: {}", config.host);
        info!("  Username: {}", config.username);
        info!(
            "  Items: {}",
            if config.item_names.is_empty() {
                "all".to_string()
            } else {
                config.item_names.join(", ")
            }
        );
        info!("  Scan interval: {}s", config.scan_interval_secs);
        info!("  Energy delta: {}", config.energy_delta);

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidHost);
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::InvalidUsername);
        }
        if self.password.trim().is_empty() {
            return Err(ConfigError::InvalidPassword);
        }
        if !(MIN_SCAN_INTERVAL_SECS..=MAX_SCAN_INTERVAL_SECS).contains(&self.scan_interval_secs) {
            return Err(ConfigError::InvalidScanInterval(
                self.scan_interval_secs.to_string(),
            ));
        }
        if !self.energy_delta.is_finite() || self.energy_delta < 0.0 {
            return Err(ConfigError::InvalidEnergyDelta(self.energy_delta.to_string()));
        }
        if self.retry_tolerance == 0 {
            return Err(ConfigError::InvalidRetryTolerance("0".to_string()));
        }
        Ok(())
    }

    /// Interval actually used for polling. Too short falls back to the default, too long is capped.
    pub fn scan_interval(&self) -> Duration {
        let secs = if self.scan_interval_secs < MIN_SCAN_INTERVAL_SECS {
            DEFAULT_SCAN_INTERVAL_SECS
        } else {
            self.scan_interval_secs.min(MAX_SCAN_INTERVAL_SECS)
        };
        Duration::from_secs(secs)
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            name_prefix: self.name_prefix.trim().to_string(),
            enable_all: self.enable_all,
        }
    }

    /// Whether an item passes the configured filter. Matches raw names with or without `#`.
    pub fn wants_item(&self, name: &str) -> bool {
        if self.item_names.is_empty() {
            return true;
        }
        let clean = name.trim_start_matches('#');
        self.item_names
            .iter()
            .any(|wanted| wanted == name || wanted.trim_start_matches('#') == clean)
    }

    /// Config as handed to the diagnostics export, which redacts the secrets
    pub fn to_diagnostics(&self) -> serde_json::Value {
        json!({
            "host": self.host,
            "username": self.username,
            "password": self.password,
            "item_names": self.item_names,
            "scan_interval": self.scan_interval_secs,
            "name_prefix": self.name_prefix,
            "enable_all": self.enable_all,
            "energy_delta": self.energy_delta,
            "retry_tolerance": self.retry_tolerance,
        })
    }
}

/// Splits the item filter on commas and whitespace
pub fn parse_item_names(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Safely parses a boolean from an optional string, defaulting to false
pub fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}

/// Validates the config and talks to the Manager once, returning an error code on failure
pub async fn check_connection(config: &ManagerConfig) -> Result<(), &'static str> {
    if let Err(e) = config.validate() {
        error!("Invalid SOLARWATT configuration: {}", e);
        return Err(e.code());
    }

    let mut client = SolarwattClient::new(&config.host, &config.username, &config.password)
        .map_err(|e| {
            error!("Cannot create SOLARWATT client: {}", e);
            e.setup_code()
        })?;

    let result = async {
        client.detect_manager().await?;
        client.validate_connection().await
    }
    .await;

    result.map_err(|e| {
        error!("SOLARWATT connection test for {} failed: {}", config.host, e);
        e.setup_code()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Serializes tests that touch the process environment
    static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "SOLARWATT_HOST",
        "SOLARWATT_USERNAME",
        "SOLARWATT_PASSWORD",
        "SOLARWATT_ITEMS",
        "SOLARWATT_SCAN_INTERVAL",
        "SOLARWATT_NAME_PREFIX",
        "SOLARWATT_ENABLE_ALL",
        "SOLARWATT_ENERGY_DELTA",
        "SOLARWATT_RETRY_TOLERANCE",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_parse_bool_safe() {
        assert!(!parse_bool_safe(None));
        assert!(!parse_bool_safe(Some("".to_string())));
        assert!(parse_bool_safe(Some("true".to_string())));
        assert!(parse_bool_safe(Some("TrUe".to_string())));
        assert!(!parse_bool_safe(Some("false".to_string())));
        assert!(!parse_bool_safe(Some("yes".to_string())));
        assert!(!parse_bool_safe(Some("1".to_string())));
    }

    #[test]
    fn test_parse_item_names() {
        assert!(parse_item_names("").is_empty());
        assert_eq!(
            parse_item_names("a_power, b_work\n#c_soc  ,,d"),
            vec!["a_power", "b_work", "#c_soc", "d"]
        );
    }

    #[test]
    fn test_from_env_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("SOLARWATT_HOST", "192.168.1.20");
        env::set_var("SOLARWATT_PASSWORD", "secret");

        let config = ManagerConfig::from_env().unwrap();
        assert_eq!(config.host, "192.168.1.20");
        assert_eq!(config.username, DEFAULT_USERNAME);
        assert_eq!(config.scan_interval_secs, DEFAULT_SCAN_INTERVAL_SECS);
        assert_eq!(config.energy_delta, 0.0);
        assert!(!config.enable_all);
        assert!(config.validate().is_ok());

        clear_env();
    }

    #[test]
    fn test_from_env_full() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("SOLARWATT_HOST", "manager.local");
        env::set_var("SOLARWATT_USERNAME", "owner");
        env::set_var("SOLARWATT_PASSWORD", "secret");
        env::set_var("SOLARWATT_ITEMS", "x_power,y_work");
        env::set_var("SOLARWATT_SCAN_INTERVAL", "30");
        env::set_var("SOLARWATT_NAME_PREFIX", "Home");
        env::set_var("SOLARWATT_ENABLE_ALL", "True");
        env::set_var("SOLARWATT_ENERGY_DELTA", "0.05");
        env::set_var("SOLARWATT_RETRY_TOLERANCE", "5");

        let config = ManagerConfig::from_env().unwrap();
        assert_eq!(config.username, "owner");
        assert_eq!(config.item_names, vec!["x_power", "y_work"]);
        assert_eq!(config.scan_interval(), Duration::from_secs(30));
        assert_eq!(config.name_prefix, "Home");
        assert!(config.enable_all);
        assert_eq!(config.energy_delta, 0.05);
        assert_eq!(config.retry_tolerance, 5);

        clear_env();
    }

    #[test]
    fn test_from_env_rejects_garbage_numbers() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("SOLARWATT_SCAN_INTERVAL", "fast");
        let err = ManagerConfig::from_env().unwrap_err();
        assert_eq!(err.code(), "invalid_scan_interval");

        clear_env();
        env::set_var("SOLARWATT_ENERGY_DELTA", "a bit");
        let err = ManagerConfig::from_env().unwrap_err();
        assert_eq!(err.code(), "invalid_energy_delta");

        clear_env();
    }

    #[test]
    fn test_validate() {
        let good = ManagerConfig::new("10.0.0.2", "installer", "pw");
        assert!(good.validate().is_ok());

        let mut bad = good.clone();
        bad.host = "  ".to_string();
        assert_eq!(bad.validate(), Err(ConfigError::InvalidHost));

        let mut bad = good.clone();
        bad.username = String::new();
        assert_eq!(bad.validate().unwrap_err().code(), "invalid_username");

        let mut bad = good.clone();
        bad.password = String::new();
        assert_eq!(bad.validate().unwrap_err().code(), "invalid_password");

        let mut bad = good.clone();
        bad.scan_interval_secs = 5;
        assert_eq!(bad.validate().unwrap_err().code(), "invalid_scan_interval");

        let mut bad = good.clone();
        bad.scan_interval_secs = 3601;
        assert_eq!(bad.validate().unwrap_err().code(), "invalid_scan_interval");

        let mut bad = good;
        bad.energy_delta = -1.0;
        assert_eq!(bad.validate().unwrap_err().code(), "invalid_energy_delta");
    }

    #[test]
    fn test_scan_interval_clamping() {
        let mut config = ManagerConfig::new("h", "u", "p");
        config.scan_interval_secs = 2;
        assert_eq!(
            config.scan_interval(),
            Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS)
        );
        config.scan_interval_secs = 100_000;
        assert_eq!(
            config.scan_interval(),
            Duration::from_secs(MAX_SCAN_INTERVAL_SECS)
        );
    }

    #[test]
    fn test_item_filter() {
        let mut config = ManagerConfig::new("h", "u", "p");
        assert!(config.wants_item("anything"));

        config.item_names = vec!["grid_power".to_string(), "#meta_soc".to_string()];
        assert!(config.wants_item("grid_power"));
        assert!(config.wants_item("#grid_power"));
        assert!(config.wants_item("meta_soc"));
        assert!(!config.wants_item("pv_power"));
    }

    #[tokio::test]
    async fn test_check_connection_rejects_invalid_input_without_network() {
        let config = ManagerConfig::new("", "installer", "pw");
        assert_eq!(check_connection(&config).await, Err("invalid_host"));
    }
}
