//! Compile-time plugin registry.
//!
//! The original system dispatches on a `plugin_type` string via reflection;
//! here that becomes a plain function-pointer map keyed by the same stable
//! strings, built once at startup and never mutated. No `dyn Any` downcasts,
//! no reflection, no dynamic loading.

use std::collections::HashMap;

use crate::{DevicePlugin, PluginError, PluginInstanceConfig};

/// A constructor for one plugin type. Returns a boxed trait object so the
/// registry can hand back a uniform type regardless of which driver crate
/// implements it.
pub type PluginConstructor =
    fn(&PluginInstanceConfig) -> Result<Box<dyn DevicePlugin>, PluginError>;

/// Maps `plugin_type` strings (e.g. `"modbus_inverter"`, `"modbus_bms"`) to
/// their constructors. Populated once at startup from the driver crate's
/// `register(&mut registry)` call; immutable thereafter.
#[derive(Default)]
pub struct PluginRegistry {
    constructors: HashMap<String, PluginConstructor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin_type: &str, constructor: PluginConstructor) {
        self.constructors.insert(plugin_type.to_string(), constructor);
    }

    /// Builds a fresh plugin instance for the given config's `plugin_type`.
    /// Used both at startup and by the supervisor's Reinitialize sequence
    /// (spec.md §4.6), which re-loads "the same plugin_type string" into a
    /// brand new instance.
    pub fn build(&self, config: &PluginInstanceConfig) -> Result<Box<dyn DevicePlugin>, PluginError> {
        let constructor = self.constructors.get(config.plugin_type.as_str()).ok_or_else(|| {
            PluginError::ConnectFailed(format!("unknown plugin_type '{}'", config.plugin_type))
        })?;
        constructor(config)
    }

    pub fn known_types(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solar_domain_models::DeviceCategory;

    #[derive(Default)]
    struct NoopPlugin {
        status: String,
    }

    #[async_trait::async_trait]
    impl DevicePlugin for NoopPlugin {
        fn name(&self) -> &str {
            "noop"
        }
        fn pretty_name(&self) -> &str {
            "Noop"
        }
        fn category(&self) -> DeviceCategory {
            DeviceCategory::Other
        }
        async fn connect(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
        async fn disconnect(&mut self) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn connection_status(&self) -> &str {
            &self.status
        }
        fn set_connection_status(&mut self, status: &str) {
            self.status = status.to_string();
        }
        async fn read_static_data(&mut self) -> Result<solar_domain_models::DataPacket, PluginError> {
            Ok(Default::default())
        }
        async fn read_dynamic_data(&mut self) -> Result<Option<solar_domain_models::DataPacket>, PluginError> {
            Ok(Some(Default::default()))
        }
        fn last_error_message(&self) -> Option<&str> {
            None
        }
    }

    fn build_noop(_: &PluginInstanceConfig) -> Result<Box<dyn DevicePlugin>, PluginError> {
        Ok(Box::new(NoopPlugin::default()))
    }

    #[test]
    fn builds_known_type_and_rejects_unknown() {
        let mut registry = PluginRegistry::new();
        registry.register("noop", build_noop);

        let config = PluginInstanceConfig {
            instance_id: "inv1".into(),
            plugin_type: "noop".into(),
            host: None,
            port: None,
            serial_device: None,
            unit_id: None,
            connect_timeout: std::time::Duration::from_secs(1),
            extra: Default::default(),
        };
        assert!(registry.build(&config).is_ok());

        let unknown = PluginInstanceConfig { plugin_type: "made_up".into(), ..config };
        assert!(registry.build(&unknown).is_err());
    }
}
