//! Power-spike rejection. Stateless: the only memory is the last accepted
//! value the caller hands back in on the next cycle.

use solar_domain_models::Value;

/// Rejects a power reading whose magnitude exceeds `limit_w * spike_factor`.
/// Non-numeric input is rejected outright. A non-positive limit disables the
/// check (there is nothing to compare against).
pub fn filter_power_value(
    key: &str,
    current: Option<&Value>,
    last_known: Option<f64>,
    limit_w: f64,
    spike_factor: f64,
) -> Option<f64> {
    let value = match current.and_then(Value::as_f64) {
        Some(v) => v,
        None => return last_known,
    };

    let limit = limit_w * spike_factor;
    if limit > 0.0 && value.abs() > limit {
        tracing::warn!(
            key,
            value,
            limit,
            last_known,
            "FILTER: power spike detected, holding last known value"
        );
        return last_known;
    }

    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_value_within_limit() {
        let v = Value::Number(3000.0);
        assert_eq!(filter_power_value("ac_power_watts", Some(&v), Some(2900.0), 4000.0, 1.5), Some(3000.0));
    }

    #[test]
    fn rejects_spike_above_limit() {
        let v = Value::Number(15000.0);
        assert_eq!(filter_power_value("pv_total_dc_power_watts", Some(&v), Some(4000.0), 6000.0, 1.5), Some(4000.0));
    }

    #[test]
    fn rejects_non_numeric() {
        let v = Value::Text("n/a".into());
        assert_eq!(filter_power_value("ac_power_watts", Some(&v), Some(100.0), 4000.0, 1.5), Some(100.0));
    }

    #[test]
    fn disabled_limit_passes_through() {
        let v = Value::Number(999_999.0);
        assert_eq!(filter_power_value("grid_total_active_power_watts", Some(&v), None, 0.0, 1.5), Some(999_999.0));
    }
}
