//! Layered configuration: a TOML file plus `SOLAR__`-prefixed environment
//! overrides, loaded once at startup via the `config` crate's layered
//! `Source` composition.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("poll_interval_seconds must be positive, got {0}")]
    NonPositivePollInterval(u64),

    #[error("instances list must not be empty")]
    EmptyInstances,

    #[error("instance '{0}' is missing plugin_type")]
    MissingPluginType(String),

    #[error("instance '{0}' has neither host nor serial_device configured")]
    MissingConnectionParams(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub serial_device: Option<String>,
    pub unit_id: Option<u8>,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

fn default_connect_timeout_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub plugin_type: String,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    pub instances: Vec<InstanceConfig>,

    pub installed_pv_capacity_watts: f64,
    pub inverter_max_ac_watts: f64,
    pub battery_usable_capacity_kwh: f64,
    pub battery_max_charge_watts: f64,
    pub battery_max_discharge_watts: f64,

    #[serde(default = "default_mppt_count")]
    pub default_mppt_count: u8,

    #[serde(default = "default_watchdog_timeout_seconds")]
    pub watchdog_timeout_seconds: u64,
    #[serde(default = "default_watchdog_grace_seconds")]
    pub watchdog_grace_seconds: u64,
    #[serde(default = "default_max_reload_attempts")]
    pub max_reload_attempts: u32,
    #[serde(default = "default_mqtt_stale_timeout_seconds")]
    pub mqtt_stale_timeout_seconds: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    #[serde(default)]
    pub energy_daily_caps: HashMap<String, f64>,
}

fn default_poll_interval_seconds() -> u64 {
    15
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_mppt_count() -> u8 {
    2
}
fn default_watchdog_timeout_seconds() -> u64 {
    90
}
fn default_watchdog_grace_seconds() -> u64 {
    45
}
fn default_max_reload_attempts() -> u32 {
    3
}
fn default_mqtt_stale_timeout_seconds() -> u64 {
    300
}
fn default_reconnect_max_attempts() -> u32 {
    3
}

impl AppConfig {
    /// Loads `path` layered under environment overrides prefixed `SOLAR__`
    /// (double underscore separates nesting, e.g. `SOLAR__POLL_INTERVAL_SECONDS`).
    /// `.env` is loaded first (if present) so exported shell vars still win.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let raw = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("SOLAR").separator("__"))
            .build()?;

        let parsed: AppConfig = raw.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::NonPositivePollInterval(self.poll_interval_seconds));
        }
        if self.instances.is_empty() {
            return Err(ConfigError::EmptyInstances);
        }
        for instance in &self.instances {
            if instance.plugin_type.trim().is_empty() {
                return Err(ConfigError::MissingPluginType(instance.name.clone()));
            }
            if instance.connection.host.is_none() && instance.connection.serial_device.is_none() {
                return Err(ConfigError::MissingConnectionParams(instance.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn rejects_empty_instances() {
        let file = write_toml(
            r#"
            installed_pv_capacity_watts = 6000.0
            inverter_max_ac_watts = 5000.0
            battery_usable_capacity_kwh = 10.0
            battery_max_charge_watts = 5000.0
            battery_max_discharge_watts = 5000.0
            instances = []
            "#,
        );
        let path = file.path().with_extension("");
        let result = AppConfig::load(path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::EmptyInstances)));
    }

    #[test]
    fn rejects_instance_missing_connection_params() {
        let file = write_toml(
            r#"
            installed_pv_capacity_watts = 6000.0
            inverter_max_ac_watts = 5000.0
            battery_usable_capacity_kwh = 10.0
            battery_max_charge_watts = 5000.0
            battery_max_discharge_watts = 5000.0

            [[instances]]
            name = "main_inverter"
            plugin_type = "modbus_inverter"
            [instances.connection]
            connect_timeout_seconds = 5
            "#,
        );
        let path = file.path().with_extension("");
        let result = AppConfig::load(path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::MissingConnectionParams(_))));
    }

    #[test]
    fn accepts_well_formed_config() {
        let file = write_toml(
            r#"
            poll_interval_seconds = 15

            installed_pv_capacity_watts = 6000.0
            inverter_max_ac_watts = 5000.0
            battery_usable_capacity_kwh = 10.0
            battery_max_charge_watts = 5000.0
            battery_max_discharge_watts = 5000.0

            [[instances]]
            name = "main_inverter"
            plugin_type = "modbus_inverter"
            [instances.connection]
            host = "192.168.1.50"
            port = 502
            connect_timeout_seconds = 5
            "#,
        );
        let path = file.path().with_extension("");
        let result = AppConfig::load(path.to_str().unwrap());
        assert!(result.is_ok(), "{result:?}");
    }
}
