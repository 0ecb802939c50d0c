//! The standard key space every device plugin reports into.
//!
//! `StandardKey` is a thin newtype over a string rather than a giant enum:
//! the set of keys is closed in the sense that every key this crate defines
//! as a constant is normative and every consumer agrees on its meaning, but
//! representing it as strings lets a driver emit an instance-scoped key
//! (`"{instance}_core_plugin_connection_status"`) without a combinatorial
//! blow-up of enum variants.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct StandardKey(String);

impl StandardKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Builds an instance-scoped key, e.g. `{instance}_core_plugin_connection_status`.
    pub fn scoped(instance_id: &str, suffix: &str) -> Self {
        Self(format!("{instance_id}_{suffix}"))
    }
}

impl fmt::Display for StandardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StandardKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StandardKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Standard key constants, grouped as in the device identification / operational /
/// PV / battery / grid / load / EPS taxonomy.
pub mod k {
    // --- device identification ---
    pub const STATIC_DEVICE_CATEGORY: &str = "static_device_category";
    pub const STATIC_MANUFACTURER: &str = "static_manufacturer";
    pub const STATIC_MODEL_NAME: &str = "static_model_name";
    pub const STATIC_SERIAL_NUMBER: &str = "static_serial_number";
    pub const STATIC_FIRMWARE_VERSION: &str = "static_firmware_version";
    pub const STATIC_RATED_POWER_WATTS: &str = "static_rated_power_watts";
    pub const STATIC_MPPT_COUNT: &str = "static_number_of_mppts";
    pub const STATIC_PHASE_COUNT: &str = "static_number_of_phases";

    // --- inverter operational ---
    pub const OPERATIONAL_INVERTER_STATUS_CODE: &str = "operational_inverter_status_code";
    pub const OPERATIONAL_INVERTER_STATUS_TEXT: &str = "operational_inverter_status_text";
    pub const OPERATIONAL_INVERTER_TEMPERATURE_CELSIUS: &str = "operational_inverter_temperature_celsius";
    pub const OPERATIONAL_FAULT_CODES_LIST: &str = "operational_fault_codes_list";
    pub const OPERATIONAL_CATEGORIZED_ALERTS_DICT: &str = "operational_categorized_alerts_dict";
    pub const OPERATIONAL_BATTERY_TIME_REMAINING_ESTIMATE_TEXT: &str =
        "operational_battery_time_remaining_estimate_text";

    // --- PV input ---
    pub const PV_TOTAL_DC_POWER_WATTS: &str = "pv_total_dc_power_watts";
    pub const PV_DAILY_YIELD_KWH: &str = "pv_daily_yield_kwh";
    pub const PV_LIFETIME_YIELD_KWH: &str = "pv_lifetime_yield_kwh";
    pub fn pv_mppt_voltage(index: u8) -> String { format!("pv_mppt_{index}_voltage_volts") }
    pub fn pv_mppt_current(index: u8) -> String { format!("pv_mppt_{index}_current_amps") }
    pub fn pv_mppt_power(index: u8) -> String { format!("pv_mppt_{index}_power_watts") }

    // --- inverter AC / grid ---
    pub const AC_POWER_WATTS: &str = "ac_power_watts";
    pub const GRID_TOTAL_ACTIVE_POWER_WATTS: &str = "grid_total_active_power_watts";
    pub const GRID_FREQUENCY_HZ: &str = "grid_frequency_hz";
    pub const GRID_DAILY_IMPORT_ENERGY_KWH: &str = "grid_daily_import_energy_kwh";
    pub const GRID_DAILY_EXPORT_ENERGY_KWH: &str = "grid_daily_export_energy_kwh";
    pub const GRID_LIFETIME_IMPORT_ENERGY_KWH: &str = "grid_lifetime_import_energy_kwh";
    pub const GRID_LIFETIME_EXPORT_ENERGY_KWH: &str = "grid_lifetime_export_energy_kwh";
    pub const GRID_L1_VOLTAGE_VOLTS: &str = "grid_l1_voltage_volts";
    pub const GRID_L2_VOLTAGE_VOLTS: &str = "grid_l2_voltage_volts";
    pub const GRID_L3_VOLTAGE_VOLTS: &str = "grid_l3_voltage_volts";
    pub const GRID_L1_CURRENT_AMPS: &str = "grid_l1_current_amps";
    pub const GRID_L2_CURRENT_AMPS: &str = "grid_l2_current_amps";
    pub const GRID_L3_CURRENT_AMPS: &str = "grid_l3_current_amps";
    pub const GRID_L1_POWER_WATTS: &str = "grid_l1_power_watts";
    pub const GRID_L2_POWER_WATTS: &str = "grid_l2_power_watts";
    pub const GRID_L3_POWER_WATTS: &str = "grid_l3_power_watts";

    // --- load ---
    pub const LOAD_TOTAL_POWER_WATTS: &str = "load_total_power_watts";
    pub const LOAD_DAILY_ENERGY_KWH: &str = "load_daily_energy_kwh";
    pub const LOAD_LIFETIME_ENERGY_KWH: &str = "load_lifetime_energy_kwh";
    pub const LOAD_L1_POWER_WATTS: &str = "load_l1_power_watts";
    pub const LOAD_L2_POWER_WATTS: &str = "load_l2_power_watts";
    pub const LOAD_L3_POWER_WATTS: &str = "load_l3_power_watts";

    // --- EPS / backup ---
    pub const EPS_TOTAL_POWER_WATTS: &str = "eps_total_power_watts";
    pub const EPS_FREQUENCY_HZ: &str = "eps_frequency_hz";
    pub const EPS_L1_VOLTAGE_VOLTS: &str = "eps_l1_voltage_volts";
    pub const EPS_L2_VOLTAGE_VOLTS: &str = "eps_l2_voltage_volts";
    pub const EPS_L3_VOLTAGE_VOLTS: &str = "eps_l3_voltage_volts";
    pub const EPS_L1_CURRENT_AMPS: &str = "eps_l1_current_amps";
    pub const EPS_L2_CURRENT_AMPS: &str = "eps_l2_current_amps";
    pub const EPS_L3_CURRENT_AMPS: &str = "eps_l3_current_amps";
    pub const EPS_L1_FREQUENCY_HZ: &str = "eps_l1_frequency_hz";
    pub const EPS_L2_FREQUENCY_HZ: &str = "eps_l2_frequency_hz";
    pub const EPS_L3_FREQUENCY_HZ: &str = "eps_l3_frequency_hz";
    pub const EPS_L1_POWER_WATTS: &str = "eps_l1_power_watts";
    pub const EPS_L2_POWER_WATTS: &str = "eps_l2_power_watts";
    pub const EPS_L3_POWER_WATTS: &str = "eps_l3_power_watts";

    // --- battery ---
    pub const BATTERY_STATE_OF_CHARGE_PERCENT: &str = "battery_state_of_charge_percent";
    pub const BATTERY_STATE_OF_HEALTH_PERCENT: &str = "battery_state_of_health_percent";
    pub const BATTERY_VOLTAGE_VOLTS: &str = "battery_voltage_volts";
    pub const BATTERY_CURRENT_AMPS: &str = "battery_current_amps";
    pub const BATTERY_POWER_WATTS: &str = "battery_power_watts";
    pub const BATTERY_TEMPERATURE_CELSIUS: &str = "battery_temperature_celsius";
    pub const BATTERY_STATUS_TEXT: &str = "battery_status_text";
    pub const BATTERY_CYCLES_COUNT: &str = "battery_cycles_count";
    pub const BATTERY_DAILY_CHARGE_ENERGY_KWH: &str = "battery_daily_charge_energy_kwh";
    pub const BATTERY_DAILY_DISCHARGE_ENERGY_KWH: &str = "battery_daily_discharge_energy_kwh";
    pub const BATTERY_CAPACITY_AH: &str = "battery_capacity_ah";
    pub const BATTERY_CELL_VOLTAGE_MIN_VOLTS: &str = "battery_cell_voltage_min_volts";
    pub const BATTERY_CELL_VOLTAGE_MAX_VOLTS: &str = "battery_cell_voltage_max_volts";
    pub const BATTERY_CELL_VOLTAGE_AVG_VOLTS: &str = "battery_cell_voltage_avg_volts";
    pub const BATTERY_CELL_VOLTAGE_DELTA_VOLTS: &str = "battery_cell_voltage_delta_volts";
    pub const BATTERY_CHARGE_FET_ON: &str = "battery_charge_fet_on";
    pub const BATTERY_DISCHARGE_FET_ON: &str = "battery_discharge_fet_on";
    pub const BATTERY_ALARMS_LIST: &str = "battery_alarms_list";
    pub const BATTERY_WARNINGS_LIST: &str = "battery_warnings_list";
    pub const BATTERY_FAULT_SUMMARY_TEXT: &str = "battery_fault_summary_text";

    // --- connection / server ---
    pub const CORE_PLUGIN_CONNECTION_STATUS: &str = "core_plugin_connection_status";
    pub const SERVER_TIMESTAMP_MS_UTC: &str = "server_timestamp_ms_utc";

    /// Keys the energy-counter filter treats as cumulative daily totals,
    /// i.e. the six daily energy totals named in spec.md §6.
    pub const DAILY_ENERGY_KEYS: &[&str] = &[
        PV_DAILY_YIELD_KWH,
        GRID_DAILY_IMPORT_ENERGY_KWH,
        GRID_DAILY_EXPORT_ENERGY_KWH,
        LOAD_DAILY_ENERGY_KWH,
        BATTERY_DAILY_CHARGE_ENERGY_KWH,
        BATTERY_DAILY_DISCHARGE_ENERGY_KWH,
    ];

    /// Keys the power-spike filter checks each cycle.
    pub const FILTERED_POWER_KEYS: &[&str] = &[
        PV_TOTAL_DC_POWER_WATTS,
        AC_POWER_WATTS,
        BATTERY_POWER_WATTS,
        GRID_TOTAL_ACTIVE_POWER_WATTS,
        LOAD_TOTAL_POWER_WATTS,
    ];

    /// Power keys whose near-zero-or-absent state drives the "meaningful read" test.
    pub const MEANINGFULNESS_POWER_KEYS: &[&str] = &[
        PV_TOTAL_DC_POWER_WATTS,
        AC_POWER_WATTS,
        BATTERY_POWER_WATTS,
        GRID_TOTAL_ACTIVE_POWER_WATTS,
        LOAD_TOTAL_POWER_WATTS,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Inverter,
    Bms,
    Meter,
    Other,
}

impl DeviceCategory {
    pub fn parse(text: &str) -> Self {
        match text {
            "inverter" => Self::Inverter,
            "bms" => Self::Bms,
            "meter" => Self::Meter,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inverter => "inverter",
            Self::Bms => "bms",
            Self::Meter => "meter",
            Self::Other => "other",
        }
    }
}

/// The closed set of inverter status strings that count as "fully operational"
/// for the purpose of stagnation detection (spec.md §4.2 step 4).
pub const FULLY_OPERATIONAL_STATUSES: &[&str] = &[
    "Generating",
    "Grid Sync",
    "Discharging",
    "Charging",
    "Normal",
    "No Grid",
];

/// The closed set of "waiting" inverter statuses (spec.md §4.2 step 5) — a
/// cycle in one of these states counts as successful for the watchdog but
/// resets the stagnation triplet, and fails the processor's "meaningful" test.
pub const WAITING_STATUSES: &[&str] = &["waiting", "standby", "idle", "off", "sleep"];

pub fn is_waiting_status(status: &str) -> bool {
    WAITING_STATUSES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(status))
}

pub fn is_fully_operational_status(status: &str) -> bool {
    FULLY_OPERATIONAL_STATUSES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(status))
}
