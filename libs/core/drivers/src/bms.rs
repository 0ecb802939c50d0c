//! Modbus TCP battery management system driver.
//!
//! Register layout is grounded on a Seplos-V3-style BMS input-register map:
//! pack voltage/current, SOC/SOH, per-cell voltages from a contiguous block,
//! and a coil block for the charge/discharge FET status. Idle-vs-charging-
//! vs-discharging is derived from the current sign, the same ±10 W/0.5 A
//! deadband every BMS driver in the fleet uses to avoid chattering around
//! zero.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use solar_domain_models::{keys::k, DataPacket, DeviceCategory, Value};
use solar_core_plugin::{tcp_probe, DevicePlugin, PluginError, PluginInstanceConfig};
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context as ModbusContext};
use tokio_modbus::prelude::*;

use crate::modbus_util::{decode, RegisterSpec};

const SUMMARY_BLOCK_ADDR: u16 = 0x1000;
const SUMMARY_BLOCK_LEN: u16 = 0x0E;
const CELL_BLOCK_ADDR: u16 = 0x1100;
const CELL_COUNT: usize = 16;

const REG_PACK_VOLTAGE: RegisterSpec = RegisterSpec::u16(0x1000, 0.01);
const REG_PACK_CURRENT: RegisterSpec = RegisterSpec::i16(0x1001, 0.01);
const REG_SOC: RegisterSpec = RegisterSpec::u16(0x1005, 0.1);
const REG_SOH: RegisterSpec = RegisterSpec::u16(0x1006, 0.1);
const REG_CYCLE_COUNT: RegisterSpec = RegisterSpec::u16(0x1007, 1.0);
const REG_MAX_CELL_VOLTAGE: RegisterSpec = RegisterSpec::u16(0x100A, 0.001);
const REG_MIN_CELL_VOLTAGE: RegisterSpec = RegisterSpec::u16(0x100B, 0.001);

const FET_COIL_ADDR: u16 = 0x2000;

pub struct ModbusBmsDriver {
    instance_id: String,
    addr: SocketAddr,
    unit_id: u8,
    connect_timeout: Duration,
    ctx: Option<ModbusContext>,
    last_error: Option<String>,
    connection_status: String,
}

impl ModbusBmsDriver {
    pub fn from_config(config: &PluginInstanceConfig) -> Result<Self, PluginError> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| PluginError::ConnectFailed("missing host".into()))?;
        let port = config.port.unwrap_or(502);
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| PluginError::ConnectFailed(format!("bad address: {e}")))?;

        Ok(Self {
            instance_id: config.instance_id.clone(),
            addr,
            unit_id: config.unit_id.unwrap_or(1),
            connect_timeout: config.connect_timeout,
            ctx: None,
            last_error: None,
            connection_status: "Connecting...".to_string(),
        })
    }

    async fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, PluginError> {
        let ctx = self.ctx.as_mut().ok_or(PluginError::NotConnected)?;
        match timeout(Duration::from_secs(5), ctx.read_input_registers(start, count)).await {
            Ok(Ok(regs)) => Ok(regs),
            Ok(Err(io_err)) => Err(PluginError::FrameInvalid(io_err.to_string())),
            Err(_) => Err(PluginError::Timeout(format!("read @{start} timed out"))),
        }
    }

    async fn read_fet_coils(&mut self) -> Result<Vec<bool>, PluginError> {
        let ctx = self.ctx.as_mut().ok_or(PluginError::NotConnected)?;
        match timeout(Duration::from_secs(5), ctx.read_coils(FET_COIL_ADDR, 2)).await {
            Ok(Ok(bits)) => Ok(bits),
            Ok(Err(io_err)) => Err(PluginError::FrameInvalid(io_err.to_string())),
            Err(_) => Err(PluginError::Timeout("FET coil read timed out".into())),
        }
    }
}

#[async_trait]
impl DevicePlugin for ModbusBmsDriver {
    fn name(&self) -> &str {
        "modbus_bms"
    }

    fn pretty_name(&self) -> &str {
        "Modbus Battery Management System"
    }

    fn category(&self) -> DeviceCategory {
        DeviceCategory::Bms
    }

    #[tracing::instrument(skip(self), fields(instance = %self.instance_id))]
    async fn connect(&mut self) -> Result<(), PluginError> {
        let probe = tcp_probe::probe_tcp(self.addr, self.connect_timeout).await;
        if !probe.reachable {
            self.last_error = Some(format!("{} unreachable (rtt {:?})", self.addr, probe.rtt));
            self.connection_status = "Unreachable".to_string();
            tracing::warn!(addr = %self.addr, "BMS unreachable");
            return Err(PluginError::ConnectFailed(self.last_error.clone().unwrap()));
        }

        let slave = Slave(self.unit_id);
        match timeout(self.connect_timeout, tcp::connect_slave(self.addr, slave)).await {
            Ok(Ok(ctx)) => {
                self.ctx = Some(ctx);
                self.last_error = None;
                self.connection_status = "Connected".to_string();
                Ok(())
            }
            Ok(Err(e)) => {
                self.last_error = Some(e.to_string());
                self.connection_status = format!("Connect failed: {e}");
                Err(PluginError::ConnectFailed(e.to_string()))
            }
            Err(_) => {
                self.last_error = Some("connect timed out".into());
                self.connection_status = "Connect timed out".to_string();
                Err(PluginError::Timeout("connect timed out".into()))
            }
        }
    }

    async fn disconnect(&mut self) {
        self.ctx = None;
        self.connection_status = "Disconnected".to_string();
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn connection_status(&self) -> &str {
        &self.connection_status
    }

    fn set_connection_status(&mut self, status: &str) {
        self.connection_status = status.to_string();
    }

    async fn read_static_data(&mut self) -> Result<DataPacket, PluginError> {
        let mut packet = DataPacket::new();
        packet.insert(k::STATIC_DEVICE_CATEGORY.into(), Value::Text(DeviceCategory::Bms.as_str().into()));
        packet.insert(k::STATIC_MANUFACTURER.into(), Value::Text("Generic BMS".into()));
        packet.insert(k::STATIC_MODEL_NAME.into(), Value::Text("Seplos-V3-style Pack".into()));
        packet.insert(k::STATIC_SERIAL_NUMBER.into(), Value::Text(self.instance_id.clone()));
        packet.insert(k::STATIC_FIRMWARE_VERSION.into(), Value::Text("unknown".into()));
        packet.insert(k::STATIC_RATED_POWER_WATTS.into(), Value::Number(0.0));
        packet.insert(k::STATIC_MPPT_COUNT.into(), Value::Number(0.0));
        packet.insert(k::STATIC_PHASE_COUNT.into(), Value::Number(0.0));
        Ok(packet)
    }

    async fn read_dynamic_data(&mut self) -> Result<Option<DataPacket>, PluginError> {
        let summary = match self.read_registers(SUMMARY_BLOCK_ADDR, SUMMARY_BLOCK_LEN).await {
            Ok(b) => b,
            Err(e) => {
                self.last_error = Some(e.to_string());
                return Ok(None);
            }
        };

        let cells = self.read_registers(CELL_BLOCK_ADDR, CELL_COUNT as u16).await.ok();
        let fets = self.read_fet_coils().await.ok();

        let voltage = decode(&REG_PACK_VOLTAGE, &summary, SUMMARY_BLOCK_ADDR).unwrap_or(0.0);
        let raw_current = decode(&REG_PACK_CURRENT, &summary, SUMMARY_BLOCK_ADDR).unwrap_or(0.0);
        let soc = decode(&REG_SOC, &summary, SUMMARY_BLOCK_ADDR);
        let soh = decode(&REG_SOH, &summary, SUMMARY_BLOCK_ADDR);
        let max_cell_v = decode(&REG_MAX_CELL_VOLTAGE, &summary, SUMMARY_BLOCK_ADDR);
        let min_cell_v = decode(&REG_MIN_CELL_VOLTAGE, &summary, SUMMARY_BLOCK_ADDR);

        if voltage <= 0.0 || voltage > 1000.0 {
            return Err(PluginError::DataSanity(format!("absurd pack voltage {voltage} V")));
        }

        // The device reports current positive-when-charging; invert to the
        // system-wide convention (positive = discharging).
        let current = -raw_current;
        let power = voltage * current;

        let mut packet = DataPacket::new();
        packet.insert(k::BATTERY_VOLTAGE_VOLTS.into(), Value::Number(voltage));
        packet.insert(k::BATTERY_CURRENT_AMPS.into(), Value::Number(current));
        packet.insert(k::BATTERY_POWER_WATTS.into(), Value::Number(power));
        if let Some(soc) = soc {
            packet.insert(k::BATTERY_STATE_OF_CHARGE_PERCENT.into(), Value::Number(soc));
        }
        if let Some(soh) = soh {
            packet.insert(k::BATTERY_STATE_OF_HEALTH_PERCENT.into(), Value::Number(soh));
        }
        if let Some(count) = decode(&REG_CYCLE_COUNT, &summary, SUMMARY_BLOCK_ADDR) {
            packet.insert(k::BATTERY_CYCLES_COUNT.into(), Value::Number(count));
        }
        if let (Some(max_v), Some(min_v)) = (max_cell_v, min_cell_v) {
            packet.insert(k::BATTERY_CELL_VOLTAGE_MAX_VOLTS.into(), Value::Number(max_v));
            packet.insert(k::BATTERY_CELL_VOLTAGE_MIN_VOLTS.into(), Value::Number(min_v));
            packet.insert(k::BATTERY_CELL_VOLTAGE_DELTA_VOLTS.into(), Value::Number(max_v - min_v));
        }

        if let Some(cell_regs) = &cells {
            let cell_voltages: Vec<Value> = (0..CELL_COUNT)
                .filter_map(|i| {
                    let spec = RegisterSpec::u16(CELL_BLOCK_ADDR + i as u16, 0.001);
                    decode(&spec, cell_regs, CELL_BLOCK_ADDR)
                })
                .map(Value::Number)
                .collect();
            if !cell_voltages.is_empty() {
                let avg = cell_voltages.iter().filter_map(Value::as_f64).sum::<f64>() / cell_voltages.len() as f64;
                packet.insert(k::BATTERY_CELL_VOLTAGE_AVG_VOLTS.into(), Value::Number(avg));
            }
        }

        if let Some(bits) = fets {
            if let Some(&charge_fet) = bits.first() {
                packet.insert(k::BATTERY_CHARGE_FET_ON.into(), Value::Bool(charge_fet));
            }
            if let Some(&discharge_fet) = bits.get(1) {
                packet.insert(k::BATTERY_DISCHARGE_FET_ON.into(), Value::Bool(discharge_fet));
            }
        }

        // This BMS family only ever reports "Idle"; derive the richer
        // status text from the current sign the way every BMS plugin in
        // the fleet does.
        let status_text = if current > 10.0 {
            "Discharging"
        } else if current < -10.0 {
            "Charging"
        } else {
            "idle"
        };
        packet.insert(k::BATTERY_STATUS_TEXT.into(), Value::Text(status_text.into()));

        Ok(Some(packet))
    }

    fn last_error_message(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
