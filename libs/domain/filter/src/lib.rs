//! Stateful filters applied to one processor cycle's merged telemetry.
//!
//! Every filter here consults the previous cycle's filtered flat map as its
//! "last known good" baseline (spec.md §4.5): a power filter rejects
//! instantaneous spikes, an SOC filter rejects physically-impossible jumps,
//! and an energy filter protects cumulative daily counters against spikes,
//! unit-conversion errors, and bogus decreases while still letting a
//! legitimate midnight reset through.

mod config;
mod energy;
mod power;
mod soc;
mod state;

pub use config::{DailyCaps, FilterConfig, SystemLimits};
pub use state::{DecreaseCandidate, FilterState, SpikeCandidate};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use solar_domain_models::{keys::k, DataPacket, StandardKey, Value};

/// Drives all three filters across one merged packet, holding the
/// cross-cycle state (spike/decrease candidates, last-seen timestamps) that
/// makes the energy filter adaptive.
pub struct FilterEngine {
    config: FilterConfig,
    limits: SystemLimits,
    daily_caps: DailyCaps,
    tz: Tz,
    state: FilterState,
}

impl FilterEngine {
    pub fn new(config: FilterConfig, limits: SystemLimits, daily_caps: DailyCaps, tz: Tz) -> Self {
        Self { config, limits, daily_caps, tz, state: FilterState::new() }
    }

    pub fn update_limits(&mut self, limits: SystemLimits, daily_caps: DailyCaps) {
        self.limits = limits;
        self.daily_caps = daily_caps;
    }

    pub fn reset_state(&mut self) {
        self.state.clear_all();
    }

    fn power_limit_w(&self, key: &str) -> Option<f64> {
        match key {
            k::PV_TOTAL_DC_POWER_WATTS => Some(self.limits.pv_installed_capacity_w),
            k::AC_POWER_WATTS => Some(self.limits.inverter_max_ac_power_w),
            k::BATTERY_POWER_WATTS => Some(self.limits.battery_power_limit_w()),
            _ => None,
        }
    }

    fn energy_limits(&self, key: &str) -> (f64, Option<f64>) {
        match key {
            k::PV_DAILY_YIELD_KWH => (self.limits.pv_installed_capacity_w, self.daily_caps.pv_daily_yield_kwh),
            k::BATTERY_DAILY_CHARGE_ENERGY_KWH => {
                (self.limits.battery_max_charge_power_w, self.daily_caps.battery_daily_charge_kwh)
            }
            k::BATTERY_DAILY_DISCHARGE_ENERGY_KWH => {
                (self.limits.battery_max_discharge_power_w, self.daily_caps.battery_daily_discharge_kwh)
            }
            k::GRID_DAILY_IMPORT_ENERGY_KWH => {
                (self.limits.inverter_max_ac_power_w, self.daily_caps.grid_daily_import_kwh)
            }
            k::GRID_DAILY_EXPORT_ENERGY_KWH => {
                (self.limits.inverter_max_ac_power_w, self.daily_caps.grid_daily_export_kwh)
            }
            k::LOAD_DAILY_ENERGY_KWH => {
                (self.limits.inverter_max_ac_power_w * 1.5, self.daily_caps.load_daily_energy_kwh)
            }
            _ => (self.limits.inverter_max_ac_power_w, None),
        }
    }

    /// Filters a complete merged packet against the previous cycle's
    /// filtered packet. Keys present in either map are covered; a key
    /// dropped entirely by the current cycle falls back to its last known
    /// value (spec.md §4.5 "non-filtered keys" rule, generalized to every
    /// key so a transient missing field never blanks a consumer's view).
    pub fn apply_all(&mut self, current: &DataPacket, last_good: &DataPacket, now: DateTime<Utc>) -> DataPacket {
        if current.is_empty() {
            return last_good.clone();
        }

        let mut filtered = DataPacket::new();
        let mut all_keys: Vec<StandardKey> = current.keys().cloned().collect();
        for key in last_good.keys() {
            if !current.contains_key(key) {
                all_keys.push(key.clone());
            }
        }

        for key in all_keys {
            let current_value = current.get(&key);
            let last_value = last_good.get(&key);

            let outcome = if k::FILTERED_POWER_KEYS.contains(&key.as_str()) {
                power::filter_power_value(
                    key.as_str(),
                    current_value,
                    last_value.and_then(Value::as_f64),
                    self.power_limit_w(key.as_str()).unwrap_or(0.0),
                    self.config.spike_factor,
                )
                .map(Value::Number)
            } else if k::DAILY_ENERGY_KEYS.contains(&key.as_str()) {
                let (max_power_w, daily_cap_kwh) = self.energy_limits(key.as_str());
                energy::filter_energy_value(
                    &key,
                    current_value,
                    last_value.and_then(Value::as_f64),
                    now,
                    self.tz,
                    max_power_w,
                    daily_cap_kwh,
                    &self.config,
                    self.limits.poll_interval_seconds,
                    &mut self.state,
                )
                .map(Value::Number)
            } else if key.as_str() == k::BATTERY_STATE_OF_CHARGE_PERCENT {
                soc::filter_soc_value(
                    current_value,
                    last_value.and_then(Value::as_f64),
                    self.config.soc_max_overage,
                    self.limits.battery_max_charge_power_w,
                    self.limits.battery_usable_capacity_kwh,
                    self.limits.poll_interval_seconds,
                    self.config.soc_change_buffer,
                )
                .map(Value::Number)
            } else {
                Some(current_value.cloned().unwrap_or_else(|| last_value.cloned().unwrap_or(Value::Null)))
            };

            let resolved = outcome
                .or_else(|| last_value.and_then(Value::as_f64).map(Value::Number))
                .or_else(|| last_value.cloned())
                .unwrap_or(Value::Null);
            filtered.insert(key, resolved);
        }

        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limits() -> SystemLimits {
        SystemLimits {
            pv_installed_capacity_w: 6000.0,
            inverter_max_ac_power_w: 5000.0,
            battery_max_charge_power_w: 5000.0,
            battery_max_discharge_power_w: 5000.0,
            battery_usable_capacity_kwh: 10.0,
            poll_interval_seconds: 15.0,
        }
    }

    #[test]
    fn power_spike_held_end_to_end() {
        let mut engine = FilterEngine::new(FilterConfig::default(), limits(), DailyCaps::default(), Tz::UTC);
        let mut last = DataPacket::new();
        last.insert(StandardKey::from(k::PV_TOTAL_DC_POWER_WATTS), Value::Number(4000.0));

        let mut current = DataPacket::new();
        current.insert(StandardKey::from(k::PV_TOTAL_DC_POWER_WATTS), Value::Number(15000.0));

        let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        let out = engine.apply_all(&current, &last, now);
        assert_eq!(out.get(&StandardKey::from(k::PV_TOTAL_DC_POWER_WATTS)), Some(&Value::Number(4000.0)));
    }

    #[test]
    fn non_filtered_key_passes_through() {
        let mut engine = FilterEngine::new(FilterConfig::default(), limits(), DailyCaps::default(), Tz::UTC);
        let last = DataPacket::new();
        let mut current = DataPacket::new();
        current.insert(StandardKey::from(k::OPERATIONAL_INVERTER_STATUS_TEXT), Value::Text("Generating".into()));

        let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        let out = engine.apply_all(&current, &last, now);
        assert_eq!(
            out.get(&StandardKey::from(k::OPERATIONAL_INVERTER_STATUS_TEXT)),
            Some(&Value::Text("Generating".into()))
        );
    }

    #[test]
    fn missing_current_key_falls_back_to_last_known() {
        let mut engine = FilterEngine::new(FilterConfig::default(), limits(), DailyCaps::default(), Tz::UTC);
        let mut last = DataPacket::new();
        last.insert(StandardKey::from(k::STATIC_MANUFACTURER), Value::Text("Growatt".into()));
        let mut current = DataPacket::new();
        current.insert(StandardKey::from(k::AC_POWER_WATTS), Value::Number(100.0));

        let now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        let out = engine.apply_all(&current, &last, now);
        assert_eq!(out.get(&StandardKey::from(k::STATIC_MANUFACTURER)), Some(&Value::Text("Growatt".into())));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    proptest! {
        /// spec.md §8 property 7: given |x| > 1.5 * max_w, output equals last known.
        #[test]
        fn power_filter_law(
            max_w in 100.0f64..20000.0,
            last in 0.0f64..20000.0,
            excess in 1.01f64..5.0,
        ) {
            let spike_factor = 1.5;
            let value = max_w * spike_factor * excess;
            let out = power::filter_power_value("ac_power_watts", Some(&Value::Number(value)), Some(last), max_w, spike_factor);
            prop_assert_eq!(out, Some(last));
        }

        /// spec.md §8 property 8: within the per-interval bound, SOC output equals
        /// the new value; this samples changes small enough to always be inside it.
        #[test]
        fn soc_filter_law_within_bound(
            last in 10.0f64..90.0,
            delta in -0.3f64..0.3,
        ) {
            let new_value = (last + delta).clamp(0.0, 100.0);
            let out = soc::filter_soc_value(Some(&Value::Number(new_value)), Some(last), 105.0, 5000.0, 10.0, 15.0, 1.5);
            prop_assert_eq!(out, Some(new_value));
        }

        /// spec.md §8 property 9: a spike-magnitude candidate repeated for
        /// `spike_confirmation_threshold` cycles is accepted on the confirming cycle.
        #[test]
        fn energy_adaptive_spike_confirms_eventually(last in 1.0f64..50.0, bump in 0.5f64..5.0) {
            let mut state = FilterState::new();
            let config = FilterConfig::default();
            let key = StandardKey::from(k::PV_DAILY_YIELD_KWH);
            let spike_value = last + bump;
            let mut now = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
            let mut out = None;
            for _ in 0..config.spike_confirmation_threshold {
                now += chrono::Duration::seconds(15);
                out = energy::filter_energy_value(
                    &key, Some(&Value::Number(spike_value)), Some(last), now, Tz::UTC,
                    1.0, None, &config, 15.0, &mut state,
                );
            }
            prop_assert_eq!(out, Some(spike_value));
        }
    }
}
