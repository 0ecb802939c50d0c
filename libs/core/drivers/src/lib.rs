//! Concrete device drivers implementing `DevicePlugin` over Modbus TCP.

mod bms;
mod inverter;
mod modbus_util;

pub use bms::ModbusBmsDriver;
pub use inverter::ModbusInverterDriver;

use solar_core_plugin::registry::PluginRegistry;
use solar_core_plugin::{DevicePlugin, PluginError, PluginInstanceConfig};

fn build_inverter(config: &PluginInstanceConfig) -> Result<Box<dyn DevicePlugin>, PluginError> {
    Ok(Box::new(ModbusInverterDriver::from_config(config)?))
}

fn build_bms(config: &PluginInstanceConfig) -> Result<Box<dyn DevicePlugin>, PluginError> {
    Ok(Box::new(ModbusBmsDriver::from_config(config)?))
}

/// Registers every driver this crate provides under its stable
/// `plugin_type` string. Called once at startup; the registry itself never
/// mutates again after this.
pub fn register(registry: &mut PluginRegistry) {
    registry.register("modbus_inverter", build_inverter);
    registry.register("modbus_bms", build_bms);
}
