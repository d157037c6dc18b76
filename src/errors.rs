use thiserror::Error;

pub type SolarwattResult<T> = Result<T, SolarwattError>;

/// Failures talking to, or making sense of, a SOLARWATT Manager
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolarwattError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Cannot reach SOLARWATT Manager: {0}")]
    Connectivity(String),

    #[error("Host is not a SOLARWATT Manager: {0}")]
    NotSolarwatt(String),

    #[error("Unexpected response from SOLARWATT Manager: {0}")]
    Protocol(String),

    #[error("Cannot parse item {item}: {reason}")]
    Parse { item: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Coarse failure class, kept in the coordinator status and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde_derive::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Connectivity,
    NotSolarwatt,
    Protocol,
    Parse,
    Config,
}

impl SolarwattError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SolarwattError::Auth(_) => ErrorKind::Auth,
            SolarwattError::Connectivity(_) => ErrorKind::Connectivity,
            SolarwattError::NotSolarwatt(_) => ErrorKind::NotSolarwatt,
            SolarwattError::Protocol(_) => ErrorKind::Protocol,
            SolarwattError::Parse { .. } => ErrorKind::Parse,
            SolarwattError::Config(_) => ErrorKind::Config,
        }
    }

    /// Error code reported back to whoever is setting up the connection
    pub fn setup_code(&self) -> &'static str {
        match self {
            SolarwattError::Auth(_) => "invalid_auth",
            SolarwattError::Connectivity(_) => "cannot_connect",
            SolarwattError::NotSolarwatt(_) => "not_solarwatt",
            SolarwattError::Protocol(_) | SolarwattError::Parse { .. } => "connection_failed",
            SolarwattError::Config(_) => "invalid_input",
        }
    }

    pub fn parse(item: impl Into<String>, reason: impl Into<String>) -> Self {
        SolarwattError::Parse {
            item: item.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for SolarwattError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SolarwattError::Protocol(err.to_string());
        }
        if let Some(status) = err.status() {
            return match status.as_u16() {
                401 | 403 => SolarwattError::Auth(format!("HTTP {status}")),
                404 => SolarwattError::NotSolarwatt(format!("HTTP {status}")),
                _ => SolarwattError::Connectivity(format!("HTTP {status}")),
            };
        }
        // Timeouts, refused connections and DNS failures all land here
        SolarwattError::Connectivity(err.to_string())
    }
}

impl From<serde_json::Error> for SolarwattError {
    fn from(err: serde_json::Error) -> Self {
        SolarwattError::Protocol(format!("invalid JSON: {err}"))
    }
}
