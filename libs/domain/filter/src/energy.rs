//! Adaptive filtering for cumulative daily energy counters.
//!
//! Three things make this filter more than a simple clamp: a daily-reset
//! window so totals can legitimately fall back to near-zero overnight, an
//! adaptive spike confirmation so a sensor that starts reporting a higher
//! (but real) baseline isn't held forever, and a delayed-decrease correction
//! so a spike that slipped through earlier can eventually be walked back.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use solar_domain_models::{StandardKey, Value};

use crate::config::FilterConfig;
use crate::state::{DecreaseCandidate, FilterState, SpikeCandidate};

const SAME_VALUE_RELATIVE_TOLERANCE: f64 = 1e-3;
const DECREASE_VALUE_RELATIVE_TOLERANCE: f64 = 0.05;

fn approx_eq(a: f64, b: f64, rel_tol: f64) -> bool {
    (a - b).abs() <= rel_tol * a.abs().max(b.abs())
}

fn is_daily_reset_time(now: DateTime<Utc>, tz: Tz, start_hour: u32, end_hour: u32) -> bool {
    let local_hour = now.with_timezone(&tz).hour();
    local_hour >= start_hour || local_hour <= end_hour
}

fn is_valid_daily_reset(value: f64, last_known: f64, config: &FilterConfig, is_reset_time: bool) -> bool {
    is_reset_time
        && value < last_known * config.reset_threshold_ratio
        && last_known > config.reset_min_last_value_kwh
        && value < config.reset_max_new_value_kwh
}

fn handle_intelligent_decrease_correction(
    key: &StandardKey,
    value: f64,
    last_known: f64,
    now: DateTime<Utc>,
    config: &FilterConfig,
    state: &mut FilterState,
) -> Option<f64> {
    if !config.decrease_correction_enabled {
        return None;
    }

    if value >= last_known * config.decrease_correction_max_ratio {
        state.potential_decreases.remove(key);
        return None;
    }

    let Some(existing) = state.potential_decreases.get(key).copied() else {
        state.potential_decreases.insert(
            key.clone(),
            DecreaseCandidate { value, first_seen: now, last_seen: now, count: 1 },
        );
        tracing::info!(
            key = %key,
            value,
            last_known,
            wait_minutes = config.decrease_correction_time_minutes,
            "FILTER: started tracking potential decrease correction"
        );
        return None;
    };

    if !approx_eq(value, existing.value, DECREASE_VALUE_RELATIVE_TOLERANCE) {
        tracing::info!(key = %key, from = existing.value, to = value, "FILTER: decrease-correction candidate changed, resetting");
        state.potential_decreases.insert(
            key.clone(),
            DecreaseCandidate { value, first_seen: now, last_seen: now, count: 1 },
        );
        return None;
    }

    let count = existing.count + 1;
    let elapsed_minutes = (now - existing.first_seen).num_seconds() as f64 / 60.0;
    let time_met = elapsed_minutes >= config.decrease_correction_time_minutes;
    let samples_met = count >= config.decrease_correction_min_samples;

    if time_met && samples_met {
        tracing::warn!(
            key = %key,
            value,
            last_known,
            elapsed_minutes,
            count,
            "FILTER: decrease correction confirmed, accepting persistent lower value"
        );
        state.potential_decreases.remove(key);
        return Some(value);
    }

    tracing::info!(
        key = %key,
        value,
        elapsed_minutes,
        count,
        needed_minutes = config.decrease_correction_time_minutes,
        needed_count = config.decrease_correction_min_samples,
        "FILTER: decrease correction pending"
    );
    state.potential_decreases.insert(
        key.clone(),
        DecreaseCandidate { value: existing.value, first_seen: existing.first_seen, last_seen: now, count },
    );
    None
}

fn calculate_elapsed_hours(
    key: &StandardKey,
    now: DateTime<Utc>,
    poll_interval_seconds: f64,
    config: &FilterConfig,
    state: &mut FilterState,
) -> f64 {
    let elapsed_hours = match state.last_energy_timestamps.get(key) {
        None => poll_interval_seconds / 3600.0,
        Some(&last_timestamp) => {
            let elapsed_seconds = (now - last_timestamp).num_milliseconds() as f64 / 1000.0;
            if elapsed_seconds < config.min_elapsed_seconds {
                poll_interval_seconds / 3600.0
            } else {
                (elapsed_seconds / 3600.0).min(config.max_elapsed_hours)
            }
        }
    };

    state.last_energy_timestamps.insert(key.clone(), now);
    elapsed_hours
}

fn handle_energy_spike_detection(
    key: &StandardKey,
    value: f64,
    last_known: f64,
    max_increase_kwh: f64,
    config: &FilterConfig,
    state: &mut FilterState,
) -> f64 {
    let absurd_threshold = max_increase_kwh * config.absurd_spike_multiplier;
    if value > last_known + absurd_threshold {
        tracing::warn!(key = %key, value, last_known, absurd_threshold, "FILTER: absurd energy spike rejected outright");
        return last_known;
    }

    let strict_threshold = max_increase_kwh * config.strict_spike_multiplier;
    if value > last_known + strict_threshold {
        tracing::warn!(key = %key, value, last_known, strict_threshold, "FILTER: large energy spike rejected outright");
        return last_known;
    }

    tracing::warn!(key = %key, value, last_known, max_increase_kwh, "FILTER: initial energy spike detected");

    let candidate = state.potential_spikes.get(key).copied();
    let count = match candidate {
        Some(c) if approx_eq(value, c.value, SAME_VALUE_RELATIVE_TOLERANCE) => c.count + 1,
        _ => 1,
    };
    state.potential_spikes.insert(key.clone(), SpikeCandidate { value, count });

    if count >= config.spike_confirmation_threshold {
        tracing::info!(key = %key, value, last_known, count, "FILTER: spike confirmed as new baseline");
        state.potential_spikes.remove(key);
        value
    } else {
        tracing::warn!(
            key = %key,
            value,
            last_known,
            count,
            needed = config.spike_confirmation_threshold,
            "FILTER: potential spike holding"
        );
        last_known
    }
}

/// Filters one cumulative energy counter. `max_power_w` is the per-key
/// maximum power rating used to size the plausible-increase bound (PV
/// capacity, battery charge/discharge limit, or inverter AC max, per
/// spec.md §4.5 step 5). `daily_cap_kwh` is the absolute ceiling for this
/// key, if configured.
#[allow(clippy::too_many_arguments)]
pub fn filter_energy_value(
    key: &StandardKey,
    current: Option<&Value>,
    last_known: Option<f64>,
    now: DateTime<Utc>,
    tz: Tz,
    max_power_w: f64,
    daily_cap_kwh: Option<f64>,
    config: &FilterConfig,
    poll_interval_seconds: f64,
    state: &mut FilterState,
) -> Option<f64> {
    let value = match current.and_then(Value::as_f64) {
        Some(v) if v >= 0.0 => v,
        _ => return last_known,
    };

    if let Some(cap) = daily_cap_kwh {
        if value > cap {
            return match last_known {
                None => {
                    tracing::error!(key = %key, value, cap, "FILTER: initial value exceeds daily cap, seeding with 0.0");
                    Some(0.0)
                }
                Some(last) => {
                    tracing::warn!(key = %key, value, cap, last, "FILTER: value exceeds daily cap, preserving last known");
                    Some(last)
                }
            };
        }
    }

    let Some(last) = last_known else {
        tracing::info!(key = %key, value, "FILTER: accepting initial energy value");
        return Some(value);
    };

    if value < last && !approx_eq(value, last, SAME_VALUE_RELATIVE_TOLERANCE) {
        let reset_time = is_daily_reset_time(now, tz, config.reset_time_start_hour, config.reset_time_end_hour);
        if is_valid_daily_reset(value, last, config, reset_time) {
            tracing::info!(key = %key, value, last, "FILTER: daily reset detected, accepting new value");
            state.clear_key(key);
            return Some(value);
        }

        if let Some(corrected) = handle_intelligent_decrease_correction(key, value, last, now, config, state) {
            state.potential_spikes.remove(key);
            return Some(corrected);
        }

        tracing::warn!(key = %key, value, last, reset_time, "FILTER: rejecting decrease, holding last known value");
        return Some(last);
    }

    if last > 0.01 {
        let elapsed_hours = calculate_elapsed_hours(key, now, poll_interval_seconds, config, state);
        let max_power = if max_power_w > 0.0 { max_power_w } else { 0.0 };
        let max_increase_kwh =
            (max_power / 1000.0) * elapsed_hours * config.energy_safety_margin + config.energy_headroom_kwh;

        if value > last + max_increase_kwh {
            let outcome = handle_energy_spike_detection(key, value, last, max_increase_kwh, config, state);
            state.cleanup_spikes(config.max_pending_history_size);
            state.cleanup_decreases(config.decrease_correction_time_minutes * 120.0, now);
            return Some(outcome);
        }

        state.potential_spikes.remove(key);
    }

    state.cleanup_spikes(config.max_pending_history_size);
    state.cleanup_decreases(config.decrease_correction_time_minutes * 120.0, now);
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn accepts_initial_value() {
        let mut state = FilterState::new();
        let config = FilterConfig::default();
        let v = Value::Number(12.0);
        let key = StandardKey::from("pv_daily_yield_kwh");
        let out = filter_energy_value(&key, Some(&v), None, utc(2026, 7, 27, 12, 0, 0), Tz::UTC, 6000.0, Some(80.0), &config, 15.0, &mut state);
        assert_eq!(out, Some(12.0));
    }

    #[test]
    fn daily_reset_accepted_in_window() {
        let mut state = FilterState::new();
        let config = FilterConfig::default();
        let v = Value::Number(0.1);
        let key = StandardKey::from("grid_daily_import_energy_kwh");
        let now = utc(2026, 7, 27, 23, 42, 0);
        let out = filter_energy_value(&key, Some(&v), Some(48.3), now, Tz::UTC, 5000.0, Some(80.0), &config, 15.0, &mut state);
        assert_eq!(out, Some(0.1));
        assert!(!state.potential_decreases.contains_key(&key));
    }

    #[test]
    fn absurd_spike_rejected_outright() {
        let mut state = FilterState::new();
        let config = FilterConfig::default();
        let v = Value::Number(1_000_000.0);
        let key = StandardKey::from("pv_daily_yield_kwh");
        let now = utc(2026, 7, 27, 12, 0, 15);
        let out = filter_energy_value(&key, Some(&v), Some(12.0), now, Tz::UTC, 6000.0, Some(80.0), &config, 15.0, &mut state);
        assert_eq!(out, Some(12.0));
    }

    #[test]
    fn adaptive_spike_confirms_on_third_repeat() {
        let mut state = FilterState::new();
        let config = FilterConfig::default();
        let key = StandardKey::from("pv_daily_yield_kwh");
        let spike = Value::Number(13.0);
        let mut last = 12.0;
        let mut now = utc(2026, 7, 27, 12, 0, 0);
        for i in 0..3 {
            now += chrono::Duration::seconds(15);
            let out = filter_energy_value(&key, Some(&spike), Some(last), now, Tz::UTC, 1.0, Some(80.0), &config, 15.0, &mut state);
            if i < 2 {
                assert_eq!(out, Some(12.0), "iteration {i} should still hold");
            } else {
                assert_eq!(out, Some(13.0), "third repeat should confirm new baseline");
            }
            last = 12.0;
        }
    }

    #[test]
    fn delayed_decrease_confirmed_after_window() {
        let mut state = FilterState::new();
        let config = FilterConfig::default();
        let key = StandardKey::from("load_daily_energy_kwh");
        let low = Value::Number(5.0);
        let mut now = utc(2026, 7, 27, 10, 0, 0);
        let mut out = None;
        for _ in 0..5 {
            now += chrono::Duration::minutes(3);
            out = filter_energy_value(&key, Some(&low), Some(10.0), now, Tz::UTC, 5000.0, Some(80.0), &config, 15.0, &mut state);
        }
        assert_eq!(out, Some(5.0));
    }
}
