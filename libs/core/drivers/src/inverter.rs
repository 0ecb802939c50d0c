//! Modbus TCP hybrid inverter driver.
//!
//! Register layout is grounded on a Growatt-style storage/hybrid inverter
//! input-register map (FC04): a low block (status, PV strings, grid,
//! temperature) and a high "storage" block starting at 1000 (battery power,
//! SOC, house load, daily/lifetime energy counters). Real fleets run several
//! inverter families with different addresses; this driver's register table
//! is the shape every one of them shares, not a universal constant.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use solar_domain_models::{keys::k, DataPacket, DeviceCategory, Value};
use solar_core_plugin::{tcp_probe, DevicePlugin, PluginError, PluginInstanceConfig};
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context as ModbusContext};
use tokio_modbus::prelude::*;

use crate::modbus_util::{decode, RegisterSpec};

const LOW_BLOCK_ADDR: u16 = 0;
const LOW_BLOCK_LEN: u16 = 38; // covers status .. grid_frequency
const GRID_PHASE_BLOCK_ADDR: u16 = 38;
const GRID_PHASE_BLOCK_LEN: u16 = 12; // Vac1/Iac1/Pac1 .. Vac3/Iac3/Pac3
const TEMP_BLOCK_ADDR: u16 = 93;
const TEMP_BLOCK_LEN: u16 = 1;
const STORAGE_BLOCK_ADDR: u16 = 1000;
const STORAGE_BLOCK_LEN: u16 = 90; // covers work_state .. total_local_load_energy
const LOAD_PHASE_BLOCK_ADDR: u16 = 1100;
const LOAD_PHASE_BLOCK_LEN: u16 = 6; // Pload1/Pload2/Pload3
const EPS_BLOCK_ADDR: u16 = 1140;
const EPS_BLOCK_LEN: u16 = 5; // Vac_Back1/Iac_Back1/Fac_Back1/Pac_Back1

const REG_INVERTER_STATUS: RegisterSpec = RegisterSpec::u16(0, 1.0);
const REG_PV1_POWER: RegisterSpec = RegisterSpec::u32(5, 0.1);
const REG_PV2_POWER: RegisterSpec = RegisterSpec::u32(9, 0.1);
const REG_OUTPUT_POWER: RegisterSpec = RegisterSpec::u32(35, 0.1);
const REG_GRID_FREQUENCY: RegisterSpec = RegisterSpec::u16(37, 0.01);
const REG_INVERTER_TEMPERATURE: RegisterSpec = RegisterSpec::i16(93, 0.1);

// Three-phase grid registers; single-phase families simply never populate
// L2/L3 (the block still reads as zero, which the merge treats as absent).
const REG_GRID_L1_VOLTAGE: RegisterSpec = RegisterSpec::u16(38, 0.1);
const REG_GRID_L1_CURRENT: RegisterSpec = RegisterSpec::u16(39, 0.1);
const REG_GRID_L1_POWER: RegisterSpec = RegisterSpec::u32(40, 0.1);
const REG_GRID_L2_VOLTAGE: RegisterSpec = RegisterSpec::u16(42, 0.1);
const REG_GRID_L2_CURRENT: RegisterSpec = RegisterSpec::u16(43, 0.1);
const REG_GRID_L2_POWER: RegisterSpec = RegisterSpec::u32(44, 0.1);
const REG_GRID_L3_VOLTAGE: RegisterSpec = RegisterSpec::u16(46, 0.1);
const REG_GRID_L3_CURRENT: RegisterSpec = RegisterSpec::u16(47, 0.1);
const REG_GRID_L3_POWER: RegisterSpec = RegisterSpec::u32(48, 0.1);

const REG_BATTERY_DISCHARGE_POWER: RegisterSpec = RegisterSpec::u32(1009, 0.1);
const REG_BATTERY_CHARGE_POWER: RegisterSpec = RegisterSpec::u32(1011, 0.1);
const REG_BATTERY_SOC: RegisterSpec = RegisterSpec::u16(1014, 1.0);
const REG_HOUSE_LOAD_POWER: RegisterSpec = RegisterSpec::u32(1016, 0.1);
const REG_POWER_TO_GRID: RegisterSpec = RegisterSpec::u32(1029, 0.1);
const REG_POWER_TO_USER: RegisterSpec = RegisterSpec::u32(1021, 0.1);
const REG_TODAY_PV_ENERGY_STORAGE: RegisterSpec = RegisterSpec::u32(1048, 0.1); // today_energy_to_grid reused below per key
const REG_TODAY_BATTERY_DISCHARGE_ENERGY: RegisterSpec = RegisterSpec::u32(1052, 0.1);
const REG_TODAY_BATTERY_CHARGE_ENERGY: RegisterSpec = RegisterSpec::u32(1056, 0.1);
const REG_TODAY_LOCAL_LOAD_ENERGY: RegisterSpec = RegisterSpec::u32(1062, 0.1);

const REG_LOAD_L1_POWER: RegisterSpec = RegisterSpec::u32(1100, 0.1);
const REG_LOAD_L2_POWER: RegisterSpec = RegisterSpec::u32(1102, 0.1);
const REG_LOAD_L3_POWER: RegisterSpec = RegisterSpec::u32(1104, 0.1);

// This inverter family's backup (EPS) output is single-phase even on
// otherwise three-phase grid-tie units, so only L1 is populated.
const REG_EPS_L1_VOLTAGE: RegisterSpec = RegisterSpec::u16(1140, 0.1);
const REG_EPS_L1_CURRENT: RegisterSpec = RegisterSpec::u16(1141, 0.1);
const REG_EPS_L1_FREQUENCY: RegisterSpec = RegisterSpec::u16(1142, 0.01);
const REG_EPS_L1_POWER: RegisterSpec = RegisterSpec::u32(1143, 0.1);

fn status_text(code: u16) -> &'static str {
    match code {
        0 => "waiting",
        1 => "Normal",
        3 => "Fault",
        _ => "Normal",
    }
}

pub struct ModbusInverterDriver {
    instance_id: String,
    addr: SocketAddr,
    unit_id: u8,
    connect_timeout: Duration,
    ctx: Option<ModbusContext>,
    last_error: Option<String>,
    connection_status: String,
}

impl ModbusInverterDriver {
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

    async fn read_block(&mut self, start: u16, count: u16) -> Result<Vec<u16>, PluginError> {
        let ctx = self.ctx.as_mut().ok_or(PluginError::NotConnected)?;
        match timeout(Duration::from_secs(5), ctx.read_input_registers(start, count)).await {
            Ok(Ok(regs)) => Ok(regs),
            Ok(Err(io_err)) => Err(PluginError::FrameInvalid(io_err.to_string())),
            Err(_) => Err(PluginError::Timeout(format!("read @{start} timed out"))),
        }
    }
}

#[async_trait]
impl DevicePlugin for ModbusInverterDriver {
    fn name(&self) -> &str {
        "modbus_inverter"
    }

    fn pretty_name(&self) -> &str {
        "Modbus Hybrid Inverter"
    }

    fn category(&self) -> DeviceCategory {
        DeviceCategory::Inverter
    }

    #[tracing::instrument(skip(self), fields(instance = %self.instance_id))]
    async fn connect(&mut self) -> Result<(), PluginError> {
        let probe = tcp_probe::probe_tcp(self.addr, self.connect_timeout).await;
        if !probe.reachable {
            self.last_error = Some(format!("{} unreachable (rtt {:?})", self.addr, probe.rtt));
            self.connection_status = "Unreachable".to_string();
            tracing::warn!(addr = %self.addr, "inverter unreachable");
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
        packet.insert(k::STATIC_DEVICE_CATEGORY.into(), Value::Text(DeviceCategory::Inverter.as_str().into()));
        packet.insert(k::STATIC_MANUFACTURER.into(), Value::Text("Generic Hybrid".into()));
        packet.insert(k::STATIC_MODEL_NAME.into(), Value::Text("Hybrid Storage Inverter".into()));
        packet.insert(k::STATIC_SERIAL_NUMBER.into(), Value::Text(self.instance_id.clone()));
        packet.insert(k::STATIC_FIRMWARE_VERSION.into(), Value::Text("unknown".into()));
        packet.insert(k::STATIC_RATED_POWER_WATTS.into(), Value::Number(5000.0));
        packet.insert(k::STATIC_MPPT_COUNT.into(), Value::Number(2.0));
        packet.insert(k::STATIC_PHASE_COUNT.into(), Value::Number(3.0));
        Ok(packet)
    }

    async fn read_dynamic_data(&mut self) -> Result<Option<DataPacket>, PluginError> {
        let low = self.read_block(LOW_BLOCK_ADDR, LOW_BLOCK_LEN).await;
        let low = match low {
            Ok(b) => b,
            Err(e) => {
                self.last_error = Some(e.to_string());
                return Ok(None);
            }
        };
        let temp = self.read_block(TEMP_BLOCK_ADDR, TEMP_BLOCK_LEN).await.ok();
        let storage = self.read_block(STORAGE_BLOCK_ADDR, STORAGE_BLOCK_LEN).await.ok();
        let grid_phases = self.read_block(GRID_PHASE_BLOCK_ADDR, GRID_PHASE_BLOCK_LEN).await.ok();
        let load_phases = self.read_block(LOAD_PHASE_BLOCK_ADDR, LOAD_PHASE_BLOCK_LEN).await.ok();
        let eps = self.read_block(EPS_BLOCK_ADDR, EPS_BLOCK_LEN).await.ok();

        let mut packet = DataPacket::new();

        let status_code = decode(&REG_INVERTER_STATUS, &low, LOW_BLOCK_ADDR).unwrap_or(0.0) as u16;
        let pv1 = decode(&REG_PV1_POWER, &low, LOW_BLOCK_ADDR).unwrap_or(0.0);
        let pv2 = decode(&REG_PV2_POWER, &low, LOW_BLOCK_ADDR).unwrap_or(0.0);
        let ac_power = decode(&REG_OUTPUT_POWER, &low, LOW_BLOCK_ADDR).unwrap_or(0.0);
        let grid_freq = decode(&REG_GRID_FREQUENCY, &low, LOW_BLOCK_ADDR);

        packet.insert(k::PV_TOTAL_DC_POWER_WATTS.into(), Value::Number(pv1 + pv2));
        packet.insert(k::AC_POWER_WATTS.into(), Value::Number(ac_power));
        if let Some(freq) = grid_freq {
            packet.insert(k::GRID_FREQUENCY_HZ.into(), Value::Number(freq));
        }

        if let Some(temp_block) = &temp {
            if let Some(t) = decode(&REG_INVERTER_TEMPERATURE, temp_block, TEMP_BLOCK_ADDR) {
                packet.insert(k::OPERATIONAL_INVERTER_TEMPERATURE_CELSIUS.into(), Value::Number(t));
            }
        }

        let mut status_text_value = status_text(status_code).to_string();

        if let Some(storage_block) = &storage {
            let discharge = decode(&REG_BATTERY_DISCHARGE_POWER, storage_block, STORAGE_BLOCK_ADDR).unwrap_or(0.0);
            let charge = decode(&REG_BATTERY_CHARGE_POWER, storage_block, STORAGE_BLOCK_ADDR).unwrap_or(0.0);
            // System-wide convention: battery power positive = discharging.
            let battery_power = discharge - charge;
            packet.insert(k::BATTERY_POWER_WATTS.into(), Value::Number(battery_power));

            if let Some(soc) = decode(&REG_BATTERY_SOC, storage_block, STORAGE_BLOCK_ADDR) {
                packet.insert(k::BATTERY_STATE_OF_CHARGE_PERCENT.into(), Value::Number(soc));
            }

            let load = decode(&REG_HOUSE_LOAD_POWER, storage_block, STORAGE_BLOCK_ADDR).unwrap_or(0.0);
            packet.insert(k::LOAD_TOTAL_POWER_WATTS.into(), Value::Number(load));

            let to_grid = decode(&REG_POWER_TO_GRID, storage_block, STORAGE_BLOCK_ADDR).unwrap_or(0.0);
            let to_user = decode(&REG_POWER_TO_USER, storage_block, STORAGE_BLOCK_ADDR).unwrap_or(0.0);
            // Export positive, import negative, matching the grid sign convention.
            packet.insert(k::GRID_TOTAL_ACTIVE_POWER_WATTS.into(), Value::Number(to_grid - to_user));

            if let Some(daily_export) = decode(&REG_TODAY_PV_ENERGY_STORAGE, storage_block, STORAGE_BLOCK_ADDR) {
                packet.insert(k::GRID_DAILY_EXPORT_ENERGY_KWH.into(), Value::Number(daily_export));
            }
            if let Some(v) = decode(&REG_TODAY_BATTERY_DISCHARGE_ENERGY, storage_block, STORAGE_BLOCK_ADDR) {
                packet.insert(k::BATTERY_DAILY_DISCHARGE_ENERGY_KWH.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_TODAY_BATTERY_CHARGE_ENERGY, storage_block, STORAGE_BLOCK_ADDR) {
                packet.insert(k::BATTERY_DAILY_CHARGE_ENERGY_KWH.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_TODAY_LOCAL_LOAD_ENERGY, storage_block, STORAGE_BLOCK_ADDR) {
                packet.insert(k::LOAD_DAILY_ENERGY_KWH.into(), Value::Number(v));
            }

            if battery_power > 10.0 {
                status_text_value = "Discharging".to_string();
            } else if battery_power < -10.0 {
                status_text_value = "Charging".to_string();
            } else if grid_freq.is_some() && status_code == 1 {
                status_text_value = "Grid Sync".to_string();
            } else if pv1 + pv2 > 10.0 {
                status_text_value = "Generating".to_string();
            }

        } else if grid_freq.is_none() {
            status_text_value = "No Grid".to_string();
        }

        if let Some(block) = &grid_phases {
            if let Some(v) = decode(&REG_GRID_L1_VOLTAGE, block, GRID_PHASE_BLOCK_ADDR) {
                packet.insert(k::GRID_L1_VOLTAGE_VOLTS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_GRID_L1_CURRENT, block, GRID_PHASE_BLOCK_ADDR) {
                packet.insert(k::GRID_L1_CURRENT_AMPS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_GRID_L1_POWER, block, GRID_PHASE_BLOCK_ADDR) {
                packet.insert(k::GRID_L1_POWER_WATTS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_GRID_L2_VOLTAGE, block, GRID_PHASE_BLOCK_ADDR) {
                packet.insert(k::GRID_L2_VOLTAGE_VOLTS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_GRID_L2_CURRENT, block, GRID_PHASE_BLOCK_ADDR) {
                packet.insert(k::GRID_L2_CURRENT_AMPS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_GRID_L2_POWER, block, GRID_PHASE_BLOCK_ADDR) {
                packet.insert(k::GRID_L2_POWER_WATTS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_GRID_L3_VOLTAGE, block, GRID_PHASE_BLOCK_ADDR) {
                packet.insert(k::GRID_L3_VOLTAGE_VOLTS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_GRID_L3_CURRENT, block, GRID_PHASE_BLOCK_ADDR) {
                packet.insert(k::GRID_L3_CURRENT_AMPS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_GRID_L3_POWER, block, GRID_PHASE_BLOCK_ADDR) {
                packet.insert(k::GRID_L3_POWER_WATTS.into(), Value::Number(v));
            }
        }

        if let Some(block) = &load_phases {
            if let Some(v) = decode(&REG_LOAD_L1_POWER, block, LOAD_PHASE_BLOCK_ADDR) {
                packet.insert(k::LOAD_L1_POWER_WATTS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_LOAD_L2_POWER, block, LOAD_PHASE_BLOCK_ADDR) {
                packet.insert(k::LOAD_L2_POWER_WATTS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_LOAD_L3_POWER, block, LOAD_PHASE_BLOCK_ADDR) {
                packet.insert(k::LOAD_L3_POWER_WATTS.into(), Value::Number(v));
            }
        }

        if let Some(block) = &eps {
            if let Some(v) = decode(&REG_EPS_L1_VOLTAGE, block, EPS_BLOCK_ADDR) {
                packet.insert(k::EPS_L1_VOLTAGE_VOLTS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_EPS_L1_CURRENT, block, EPS_BLOCK_ADDR) {
                packet.insert(k::EPS_L1_CURRENT_AMPS.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_EPS_L1_FREQUENCY, block, EPS_BLOCK_ADDR) {
                packet.insert(k::EPS_L1_FREQUENCY_HZ.into(), Value::Number(v));
                packet.insert(k::EPS_FREQUENCY_HZ.into(), Value::Number(v));
            }
            if let Some(v) = decode(&REG_EPS_L1_POWER, block, EPS_BLOCK_ADDR) {
                packet.insert(k::EPS_L1_POWER_WATTS.into(), Value::Number(v));
                packet.insert(k::EPS_TOTAL_POWER_WATTS.into(), Value::Number(v));
            }
        }

        packet.insert(k::OPERATIONAL_INVERTER_STATUS_CODE.into(), Value::Number(status_code as f64));
        packet.insert(k::OPERATIONAL_INVERTER_STATUS_TEXT.into(), Value::Text(status_text_value));

        Ok(Some(packet))
    }

    fn last_error_message(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
