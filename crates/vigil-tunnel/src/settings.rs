//! Runtime Settings
//!
//! Tunable intervals, thresholds and timeouts for the control plane.
//! Every field has a default, so an empty TOML document is a valid
//! configuration.
//!
//! ```toml
//! [tester]
//! interval_secs = 15
//! timeout_secs = 5
//! endpoint = "1.1.1.1:443"
//!
//! [keys]
//! validity_secs = 86400
//! retry_secs = 60
//!
//! [idle]
//! rx_bytes_per_sec = 102400
//! tx_bytes_per_sec = 102400
//!
//! [timeouts]
//! adapter_secs = 30
//! registration_secs = 30
//!
//! [latency]
//! interval_secs = 300
//! timeout_secs = 5
//! port = 443
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection tester settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesterSettings {
    /// Seconds between the start of two consecutive tests
    pub interval_secs: u64,
    /// Per-probe timeout in seconds, strictly below the interval
    pub timeout_secs: u64,
    /// host:port both probes connect to
    pub endpoint: String,
}

impl TesterSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TesterSettings {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            timeout_secs: 5,
            endpoint: "1.1.1.1:443".to_string(),
        }
    }
}

/// Key rotation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    /// Default key validity in seconds
    pub validity_secs: u64,
    /// Default delay before retrying a failed rekey
    pub retry_secs: u64,
}

impl KeySettings {
    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            validity_secs: 24 * 60 * 60,
            retry_secs: 60,
        }
    }
}

/// Idle classification thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleSettings {
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            rx_bytes_per_sec: 100.0 * 1024.0,
            tx_bytes_per_sec: 100.0 * 1024.0,
        }
    }
}

/// Upper bounds for calls into external collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub adapter_secs: u64,
    pub registration_secs: u64,
}

impl TimeoutSettings {
    pub fn adapter(&self) -> Duration {
        Duration::from_secs(self.adapter_secs)
    }

    pub fn registration(&self) -> Duration {
        Duration::from_secs(self.registration_secs)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            adapter_secs: 30,
            registration_secs: 30,
        }
    }
}

/// Server latency reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencySettings {
    /// Seconds between two measurements
    pub interval_secs: u64,
    /// Per-measurement timeout in seconds
    pub timeout_secs: u64,
    /// Server TCP port the connect time is measured against
    pub port: u16,
}

impl LatencySettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LatencySettings {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            timeout_secs: 5,
            port: 443,
        }
    }
}

/// Complete control plane settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub tester: TesterSettings,
    pub keys: KeySettings,
    pub idle: IdleSettings,
    pub timeouts: TimeoutSettings,
    pub latency: LatencySettings,
}

impl TunnelSettings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(content)
            .map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.tester.interval_secs == 0 {
            return Err(SettingsError::Invalid("tester.interval_secs must be positive".into()));
        }
        if self.tester.timeout_secs == 0 || self.tester.timeout_secs >= self.tester.interval_secs {
            return Err(SettingsError::Invalid(
                "tester.timeout_secs must be positive and shorter than tester.interval_secs".into(),
            ));
        }
        if self.tester.endpoint.rsplit_once(':').is_none() {
            return Err(SettingsError::Invalid("tester.endpoint must be host:port".into()));
        }
        if self.keys.validity_secs == 0 || self.keys.retry_secs == 0 {
            return Err(SettingsError::Invalid("key intervals must be positive".into()));
        }
        if self.idle.rx_bytes_per_sec <= 0.0 || self.idle.tx_bytes_per_sec <= 0.0 {
            return Err(SettingsError::Invalid("idle thresholds must be positive".into()));
        }
        if self.timeouts.adapter_secs == 0 || self.timeouts.registration_secs == 0 {
            return Err(SettingsError::Invalid("timeouts must be positive".into()));
        }
        if self.latency.timeout_secs == 0 || self.latency.timeout_secs >= self.latency.interval_secs {
            return Err(SettingsError::Invalid(
                "latency.timeout_secs must be positive and shorter than latency.interval_secs".into(),
            ));
        }
        Ok(())
    }
}

/// Settings errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = TunnelSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.tester.interval(), Duration::from_secs(15));
        assert_eq!(settings.tester.timeout(), Duration::from_secs(5));
        assert_eq!(settings.keys.retry(), Duration::from_secs(60));
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let settings = TunnelSettings::from_toml("").unwrap();
        assert_eq!(settings, TunnelSettings::default());
    }

    #[test]
    fn test_partial_toml() {
        let settings = TunnelSettings::from_toml(
            r#"
            [tester]
            interval_secs = 30

            [idle]
            rx_bytes_per_sec = 2048.0
            "#,
        )
        .unwrap();

        assert_eq!(settings.tester.interval_secs, 30);
        assert_eq!(settings.tester.timeout_secs, 5);
        assert_eq!(settings.idle.rx_bytes_per_sec, 2048.0);
        assert_eq!(settings.idle.tx_bytes_per_sec, 100.0 * 1024.0);
    }

    #[test]
    fn test_timeout_must_be_shorter_than_interval() {
        let result = TunnelSettings::from_toml(
            r#"
            [tester]
            interval_secs = 5
            timeout_secs = 5
            "#,
        );
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_toml_export_reloads() {
        let mut settings = TunnelSettings::default();
        settings.keys.validity_secs = 15;

        let reloaded = TunnelSettings::from_toml(&settings.to_toml()).unwrap();
        assert_eq!(reloaded.keys.validity_secs, 15);
    }

    #[test]
    fn test_latency_section() {
        let settings = TunnelSettings::from_toml(
            r#"
            [latency]
            interval_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(settings.latency.interval(), Duration::from_secs(60));
        assert_eq!(settings.latency.port, 443);

        let result = TunnelSettings::from_toml("[latency]\ninterval_secs = 5\n");
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_json_settings() {
        let settings = TunnelSettings::from_json(r#"{"timeouts": {"adapter_secs": 10}}"#).unwrap();
        assert_eq!(settings.timeouts.adapter(), Duration::from_secs(10));
        assert_eq!(settings.timeouts.registration(), Duration::from_secs(30));
    }
}
