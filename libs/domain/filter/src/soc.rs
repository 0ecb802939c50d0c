//! Battery state-of-charge jump limiting.

use solar_domain_models::Value;

/// Rejects an SOC reading outside `[0, max_overage]`, and rejects any jump
/// larger than what one poll interval could plausibly produce given the
/// battery's charge rate and usable capacity.
pub fn filter_soc_value(
    current: Option<&Value>,
    last_known: Option<f64>,
    max_overage: f64,
    battery_max_charge_w: f64,
    battery_usable_capacity_kwh: f64,
    poll_interval_seconds: f64,
    change_buffer: f64,
) -> Option<f64> {
    let value = match current.and_then(Value::as_f64) {
        Some(v) if (0.0..=max_overage).contains(&v) => v,
        _ => return last_known,
    };

    let Some(last) = last_known else {
        return Some(value);
    };

    let capacity_wh = battery_usable_capacity_kwh * 1000.0;
    let poll_interval_h = poll_interval_seconds / 3600.0;

    if capacity_wh > 0.0 && battery_max_charge_w > 0.0 {
        let max_energy_change_wh = battery_max_charge_w * poll_interval_h;
        let max_soc_change_percent = (max_energy_change_wh / capacity_wh) * 100.0;
        let threshold = max_soc_change_percent * change_buffer + 1.0;

        if (value - last).abs() > threshold {
            tracing::warn!(
                new = value,
                last,
                threshold,
                "FILTER: SOC jump detected, holding last known value"
            );
            return Some(last);
        }
    }

    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_large_jump() {
        // From spec.md S3: 60% -> 75%, threshold ~1.31%.
        let v = Value::Number(75.0);
        let out = filter_soc_value(Some(&v), Some(60.0), 105.0, 5000.0, 10.0, 15.0, 1.5);
        assert_eq!(out, Some(60.0));
    }

    #[test]
    fn accepts_small_change_within_bound() {
        let v = Value::Number(60.2);
        let out = filter_soc_value(Some(&v), Some(60.0), 105.0, 5000.0, 10.0, 15.0, 1.5);
        assert_eq!(out, Some(60.2));
    }

    #[test]
    fn rejects_out_of_range() {
        let v = Value::Number(150.0);
        let out = filter_soc_value(Some(&v), Some(60.0), 105.0, 5000.0, 10.0, 15.0, 1.5);
        assert_eq!(out, Some(60.0));
    }

    #[test]
    fn accepts_initial_value_with_no_baseline() {
        let v = Value::Number(42.0);
        let out = filter_soc_value(Some(&v), None, 105.0, 5000.0, 10.0, 15.0, 1.5);
        assert_eq!(out, Some(42.0));
    }
}
