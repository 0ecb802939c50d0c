//! Tunables for the three stateful filters, carried over 1:1 from the
//! values the fleet has run in production — treat every constant here as
//! normative, not a starting guess.

/// System-wide physical limits the power and energy filters size their
/// thresholds against. Supplied by the daemon's configuration layer at
/// startup and on reload; a driver never sees these directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemLimits {
    pub pv_installed_capacity_w: f64,
    pub inverter_max_ac_power_w: f64,
    pub battery_max_charge_power_w: f64,
    pub battery_max_discharge_power_w: f64,
    pub battery_usable_capacity_kwh: f64,
    pub poll_interval_seconds: f64,
}

impl SystemLimits {
    pub fn battery_power_limit_w(&self) -> f64 {
        self.battery_max_charge_power_w.max(self.battery_max_discharge_power_w)
    }
}

/// Per-key absolute daily caps (kWh) for the six cumulative counters the
/// energy filter tracks. `None` disables the cap for that key.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DailyCaps {
    pub pv_daily_yield_kwh: Option<f64>,
    pub grid_daily_import_kwh: Option<f64>,
    pub grid_daily_export_kwh: Option<f64>,
    pub load_daily_energy_kwh: Option<f64>,
    pub battery_daily_charge_kwh: Option<f64>,
    pub battery_daily_discharge_kwh: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    pub spike_factor: f64,
    pub spike_confirmation_threshold: u32,
    pub soc_change_buffer: f64,
    pub soc_max_overage: f64,
    pub energy_safety_margin: f64,
    pub energy_headroom_kwh: f64,
    pub strict_spike_multiplier: f64,
    pub absurd_spike_multiplier: f64,
    pub max_elapsed_hours: f64,
    pub min_elapsed_seconds: f64,
    pub reset_time_start_hour: u32,
    pub reset_time_end_hour: u32,
    pub reset_threshold_ratio: f64,
    pub reset_min_last_value_kwh: f64,
    pub reset_max_new_value_kwh: f64,
    pub max_pending_history_size: usize,
    pub decrease_correction_enabled: bool,
    pub decrease_correction_time_minutes: f64,
    pub decrease_correction_min_samples: u32,
    pub decrease_correction_max_ratio: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            spike_factor: 1.5,
            spike_confirmation_threshold: 3,
            soc_change_buffer: 1.5,
            soc_max_overage: 105.0,
            energy_safety_margin: 3.0,
            energy_headroom_kwh: 0.1,
            strict_spike_multiplier: 10.0,
            absurd_spike_multiplier: 100.0,
            max_elapsed_hours: 1.0,
            min_elapsed_seconds: 1.0,
            reset_time_start_hour: 23,
            reset_time_end_hour: 2,
            reset_threshold_ratio: 0.1,
            reset_min_last_value_kwh: 5.0,
            reset_max_new_value_kwh: 2.0,
            max_pending_history_size: 100,
            decrease_correction_enabled: true,
            decrease_correction_time_minutes: 10.0,
            decrease_correction_min_samples: 5,
            decrease_correction_max_ratio: 0.8,
        }
    }
}
