//! The merge/filter/dispatch processor: a single long-lived task that owns
//! every merge and filter decision and is the only writer of the central
//! snapshot (spec.md §4.4).

use std::collections::BTreeMap;
use std::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use solar_domain_filter::FilterEngine;
use solar_domain_models::keys::{is_waiting_status, k};
use solar_domain_models::value::{flatten_packet, wrap_packet};
use solar_domain_models::{DataPacket, DeviceCategory, StandardKey, Value, Wrapped, WrappedPacket};
use solar_infra_state::{CacheEntry, CentralState, DispatchPackage, InstanceId, ReportEnvelope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Fired once, after the processor's first packet of the run. The
/// collaborator is responsible for the actual backfill query and write.
#[async_trait]
pub trait BackfillTrigger: Send + Sync {
    async fn trigger_backfill(&self);
}

/// Fired every cycle the merged packet carries a numeric inverter
/// temperature, when the smart-plug feature is enabled.
#[async_trait]
pub trait TuyaTrigger: Send + Sync {
    async fn handle_temperature(&self, temperature_c: f64);
}

/// No-op collaborators for a daemon run with the ancillary features disabled.
pub struct NoopBackfill;

#[async_trait]
impl BackfillTrigger for NoopBackfill {
    async fn trigger_backfill(&self) {}
}

pub struct NoopTuya;

#[async_trait]
impl TuyaTrigger for NoopTuya {
    async fn handle_temperature(&self, _temperature_c: f64) {}
}

fn key(name: &str) -> StandardKey {
    StandardKey::from(name)
}

/// spec.md §4.4 step 2: fails when the inverter status text is a waiting
/// status, or every meaningfulness power key is absent or near-zero.
fn is_meaningful(category: DeviceCategory, data: &DataPacket) -> bool {
    if category == DeviceCategory::Inverter {
        let is_waiting = data
            .get(&key(k::OPERATIONAL_INVERTER_STATUS_TEXT))
            .and_then(Value::as_str)
            .map(is_waiting_status)
            .unwrap_or(false);
        if is_waiting {
            return false;
        }
    }

    let all_absent_or_tiny = k::MEANINGFULNESS_POWER_KEYS.iter().all(|pk| {
        data.get(&key(pk))
            .and_then(Value::as_f64)
            .map(|v| v.abs() <= 1.0)
            .unwrap_or(true)
    });

    !all_absent_or_tiny
}

fn union_alert_maps(
    a: &BTreeMap<String, Vec<String>>,
    b: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, Vec<String>> {
    let mut out = a.clone();
    for (category, alerts) in b {
        let entry = out.entry(category.clone()).or_default();
        for alert in alerts {
            if !entry.contains(alert) {
                entry.push(alert.clone());
            }
        }
    }
    for alerts in out.values_mut() {
        if alerts.len() > 1 {
            alerts.retain(|a| a != "OK");
        }
    }
    out
}

fn is_connection_status_key(candidate: &StandardKey) -> bool {
    candidate.as_str().ends_with(k::CORE_PLUGIN_CONNECTION_STATUS)
}

/// Merges one instance's cached wrapped data into the accumulator, applying
/// the three special-cased keys (spec.md §4.4 step 4). `category_locked`
/// tracks whether `static_device_category` has already been set by an
/// inverter source, across the whole two-pass merge.
fn merge_entry(merged: &mut WrappedPacket, entry_category: Option<DeviceCategory>, data: &WrappedPacket, category_locked: &mut bool) {
    for (data_key, wrapped) in data {
        if is_connection_status_key(data_key) {
            continue;
        }

        if data_key.as_str() == k::STATIC_DEVICE_CATEGORY {
            if *category_locked && entry_category != Some(DeviceCategory::Inverter) {
                continue;
            }
            if entry_category == Some(DeviceCategory::Inverter) {
                *category_locked = true;
            }
            merged.insert(data_key.clone(), wrapped.clone());
            continue;
        }

        if data_key.as_str() == k::OPERATIONAL_CATEGORIZED_ALERTS_DICT {
            if let (Some(Wrapped { value: Value::AlertMap(existing), .. }), Value::AlertMap(incoming)) =
                (merged.get(data_key), &wrapped.value)
            {
                let merged_map = union_alert_maps(existing, incoming);
                merged.insert(data_key.clone(), Wrapped::new(Value::AlertMap(merged_map)));
                continue;
            }
            merged.insert(data_key.clone(), wrapped.clone());
            continue;
        }

        merged.insert(data_key.clone(), wrapped.clone());
    }
}

/// Two-pass merge: all non-BMS instances first (in a stable, sorted
/// instance-id order), then all BMS instances overlaid on top.
fn merge_cache(cache: &std::collections::HashMap<InstanceId, CacheEntry>) -> WrappedPacket {
    let mut ids: Vec<&InstanceId> = cache.keys().collect();
    ids.sort();

    let mut merged = WrappedPacket::new();
    let mut category_locked = false;

    for id in &ids {
        let entry = cache.get(*id).expect("id came from this cache's own key set");
        if entry.category != Some(DeviceCategory::Bms) {
            merge_entry(&mut merged, entry.category, &entry.data, &mut category_locked);
        }
    }
    for id in &ids {
        let entry = cache.get(*id).expect("id came from this cache's own key set");
        if entry.category == Some(DeviceCategory::Bms) {
            merge_entry(&mut merged, entry.category, &entry.data, &mut category_locked);
        }
    }

    merged
}

fn load_power_correction(merged: &mut WrappedPacket) {
    let ac = merged.get(&key(k::AC_POWER_WATTS)).and_then(|w| w.value.as_f64());
    let load_is_zero_or_missing = merged
        .get(&key(k::LOAD_TOTAL_POWER_WATTS))
        .and_then(|w| w.value.as_f64())
        .map(|v| v == 0.0)
        .unwrap_or(true);

    if let (true, Some(ac)) = (load_is_zero_or_missing, ac) {
        if ac > 0.0 {
            merged.insert(key(k::LOAD_TOTAL_POWER_WATTS), Wrapped::new(Value::Number(ac)));
        }
    }
}

fn format_hours_minutes(hours: f64, label: &str) -> String {
    if hours > 100.0 {
        return format!(">100h ({label})");
    }
    let total_minutes = (hours * 60.0).round().max(0.0) as i64;
    format!("~ {}h {}m ({label})", total_minutes / 60, total_minutes % 60)
}

/// spec.md §4.4 step 8's `battery_time_remaining_estimate_text` derivation.
fn battery_time_remaining_text(soc: Option<f64>, battery_power_w: Option<f64>, usable_capacity_kwh: f64) -> String {
    let (Some(soc), Some(power_w)) = (soc, battery_power_w) else {
        return "N/A".to_string();
    };

    if power_w.abs() < 25.0 {
        return "Idle".to_string();
    }

    if power_w > 0.0 {
        if soc <= 20.0 {
            return format!("<20% ({soc:.0}%)");
        }
        let remaining_kwh = usable_capacity_kwh * (soc - 20.0) / 100.0;
        format_hours_minutes(remaining_kwh * 1000.0 / power_w, "to 20%")
    } else {
        if soc >= 100.0 {
            return "Full".to_string();
        }
        let remaining_kwh = usable_capacity_kwh * (100.0 - soc) / 100.0;
        format_hours_minutes(remaining_kwh * 1000.0 / power_w.abs(), "to 100%")
    }
}

pub struct ProcessorConfig {
    pub battery_usable_capacity_kwh: f64,
    pub tuya_enabled: bool,
}

/// The processor's own run loop. Everything it mutates (the filter engine's
/// internal state, `last_filtered`, `first_packet_sent`) lives on the task's
/// stack — only the central state's snapshot and dispatch channel are
/// shared.
pub async fn run(
    state: Arc<CentralState>,
    mut report_rx: mpsc::Receiver<ReportEnvelope>,
    mut filter_engine: FilterEngine,
    config: ProcessorConfig,
    backfill: Arc<dyn BackfillTrigger>,
    tuya: Arc<dyn TuyaTrigger>,
    stop: CancellationToken,
) {
    let mut last_filtered = DataPacket::new();
    let mut first_packet_sent = false;

    loop {
        if stop.is_cancelled() {
            break;
        }

        let report = match tokio::time::timeout(Duration::from_secs(1), report_rx.recv()).await {
            Ok(Some(report)) => report,
            Ok(None) => {
                info!("report channel closed, processor exiting");
                break;
            }
            Err(_) => continue,
        };

        process_one(
            &state,
            report,
            &mut filter_engine,
            &mut last_filtered,
            &config,
            &backfill,
            &mut first_packet_sent,
            &tuya,
        )
        .await;
    }
}

#[instrument(skip_all, fields(instance = %report.instance_id))]
async fn process_one(
    state: &CentralState,
    report: ReportEnvelope,
    filter_engine: &mut FilterEngine,
    last_filtered: &mut DataPacket,
    config: &ProcessorConfig,
    backfill: &Arc<dyn BackfillTrigger>,
    first_packet_sent: &mut bool,
    tuya: &Arc<dyn TuyaTrigger>,
) {
    let now = Utc::now();
    update_cache(state, &report, now).await;

    let cache = state.cache_snapshot().await;
    let mut merged = merge_cache(&cache);

    let flat_current = flatten_packet(&merged);
    let filtered_flat = filter_engine.apply_all(&flat_current, last_filtered, now);
    *last_filtered = filtered_flat.clone();
    merged = wrap_packet(filtered_flat);

    load_power_correction(&mut merged);
    enrich(&mut merged, &cache, config, now);

    let per_plugin_data: BTreeMap<InstanceId, WrappedPacket> =
        cache.into_iter().map(|(id, entry)| (id, entry.data)).collect();

    state.replace_snapshot(merged.clone()).await;
    state.publish_dispatch(DispatchPackage { merged_data: merged.clone(), per_plugin_data });

    if !*first_packet_sent {
        *first_packet_sent = true;
        backfill.trigger_backfill().await;
    }

    if config.tuya_enabled {
        if let Some(temp) = merged.get(&key(k::OPERATIONAL_INVERTER_TEMPERATURE_CELSIUS)).and_then(|w| w.value.as_f64()) {
            tuya.handle_temperature(temp).await;
        }
    }
}

async fn update_cache(state: &CentralState, report: &ReportEnvelope, now: DateTime<Utc>) {
    let mut entry = state.cache_get(&report.instance_id).await.unwrap_or_default();
    entry.connected = report.connected;
    entry.connection_status = report.connection_status.clone();
    entry.category = Some(report.category);

    match &report.data {
        Some(data) if is_meaningful(report.category, data) => {
            entry.data = wrap_packet(data.clone());
            entry.last_updated = Some(now);
        }
        Some(_) => debug!("dynamic read not meaningful this cycle, keeping stale cache"),
        None => debug!("no data this cycle, keeping stale cache"),
    }

    state.cache_update(&report.instance_id, entry).await;
}

/// spec.md §4.4 step 8: timestamp, per-instance + global connection status,
/// and the battery time-remaining estimate.
fn enrich(
    merged: &mut WrappedPacket,
    cache: &std::collections::HashMap<InstanceId, CacheEntry>,
    config: &ProcessorConfig,
    now: DateTime<Utc>,
) {
    merged.insert(key(k::SERVER_TIMESTAMP_MS_UTC), Wrapped::new(Value::Number(now.timestamp_millis() as f64)));

    let mut any_connected = false;
    for (instance_id, entry) in cache {
        any_connected |= entry.connected;
        let scoped_key = StandardKey::scoped(instance_id, k::CORE_PLUGIN_CONNECTION_STATUS);
        merged.insert(scoped_key, Wrapped::new(Value::Text(entry.connection_status.clone())));
    }
    let global_status = if any_connected { "connected" } else { "disconnected" };
    merged.insert(key(k::CORE_PLUGIN_CONNECTION_STATUS), Wrapped::new(Value::Text(global_status.to_string())));

    let soc = merged.get(&key(k::BATTERY_STATE_OF_CHARGE_PERCENT)).and_then(|w| w.value.as_f64());
    let battery_power = merged.get(&key(k::BATTERY_POWER_WATTS)).and_then(|w| w.value.as_f64());
    let estimate = battery_time_remaining_text(soc, battery_power, config.battery_usable_capacity_kwh);
    merged.insert(
        key(k::OPERATIONAL_BATTERY_TIME_REMAINING_ESTIMATE_TEXT),
        Wrapped::new(Value::Text(estimate)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use solar_domain_filter::{DailyCaps, FilterConfig, SystemLimits};

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

    fn engine() -> FilterEngine {
        FilterEngine::new(FilterConfig::default(), limits(), DailyCaps::default(), chrono_tz::Tz::UTC)
    }

    #[tokio::test]
    async fn bms_overlay_wins_for_battery_keys() {
        let (state, _rx) = CentralState::new(10);

        let mut inverter_data = WrappedPacket::new();
        inverter_data.insert(key(k::BATTERY_POWER_WATTS), Wrapped::new(Value::Number(100.0)));
        inverter_data.insert(key(k::STATIC_DEVICE_CATEGORY), Wrapped::new(Value::Text("inverter".into())));
        state
            .cache_update(
                "inv1",
                CacheEntry { data: inverter_data, category: Some(DeviceCategory::Inverter), connected: true, connection_status: "Connected".into(), last_updated: None },
            )
            .await;

        let mut bms_data = WrappedPacket::new();
        bms_data.insert(key(k::BATTERY_POWER_WATTS), Wrapped::new(Value::Number(250.0)));
        state
            .cache_update(
                "bms1",
                CacheEntry { data: bms_data, category: Some(DeviceCategory::Bms), connected: true, connection_status: "Connected".into(), last_updated: None },
            )
            .await;

        let cache = state.cache_snapshot().await;
        let merged = merge_cache(&cache);
        assert_eq!(merged.get(&key(k::BATTERY_POWER_WATTS)), Some(&Wrapped::new(Value::Number(250.0))));
        assert_eq!(merged.get(&key(k::STATIC_DEVICE_CATEGORY)), Some(&Wrapped::new(Value::Text("inverter".into()))));
    }

    #[test]
    fn non_inverter_cannot_overwrite_locked_category() {
        let mut cache = std::collections::HashMap::new();
        let mut inverter_data = WrappedPacket::new();
        inverter_data.insert(key(k::STATIC_DEVICE_CATEGORY), Wrapped::new(Value::Text("inverter".into())));
        cache.insert(
            "a_inv".to_string(),
            CacheEntry { data: inverter_data, category: Some(DeviceCategory::Inverter), connected: true, connection_status: "Connected".into(), last_updated: None },
        );

        let mut meter_data = WrappedPacket::new();
        meter_data.insert(key(k::STATIC_DEVICE_CATEGORY), Wrapped::new(Value::Text("meter".into())));
        cache.insert(
            "b_meter".to_string(),
            CacheEntry { data: meter_data, category: Some(DeviceCategory::Meter), connected: true, connection_status: "Connected".into(), last_updated: None },
        );

        let merged = merge_cache(&cache);
        assert_eq!(merged.get(&key(k::STATIC_DEVICE_CATEGORY)), Some(&Wrapped::new(Value::Text("inverter".into()))));
    }

    #[test]
    fn meaningful_test_rejects_all_near_zero_power() {
        let mut data = DataPacket::new();
        data.insert(key(k::PV_TOTAL_DC_POWER_WATTS), Value::Number(0.5));
        data.insert(key(k::AC_POWER_WATTS), Value::Number(-0.2));
        assert!(!is_meaningful(DeviceCategory::Inverter, &data));
    }

    #[test]
    fn meaningful_test_accepts_real_power() {
        let mut data = DataPacket::new();
        data.insert(key(k::AC_POWER_WATTS), Value::Number(1500.0));
        assert!(is_meaningful(DeviceCategory::Inverter, &data));
    }

    #[test]
    fn meaningful_test_rejects_waiting_status() {
        let mut data = DataPacket::new();
        data.insert(key(k::OPERATIONAL_INVERTER_STATUS_TEXT), Value::Text("waiting".into()));
        data.insert(key(k::AC_POWER_WATTS), Value::Number(2000.0));
        assert!(!is_meaningful(DeviceCategory::Inverter, &data));
    }

    #[test]
    fn load_power_correction_fills_in_from_ac() {
        let mut merged = WrappedPacket::new();
        merged.insert(key(k::AC_POWER_WATTS), Wrapped::new(Value::Number(1200.0)));
        load_power_correction(&mut merged);
        assert_eq!(merged.get(&key(k::LOAD_TOTAL_POWER_WATTS)), Some(&Wrapped::new(Value::Number(1200.0))));
    }

    #[test]
    fn battery_time_remaining_idle_below_threshold() {
        assert_eq!(battery_time_remaining_text(Some(50.0), Some(5.0), 10.0), "Idle");
    }

    #[test]
    fn battery_time_remaining_discharging_below_target() {
        assert_eq!(battery_time_remaining_text(Some(15.0), Some(500.0), 10.0), "<20% (15%)");
    }

    #[test]
    fn battery_time_remaining_missing_inputs() {
        assert_eq!(battery_time_remaining_text(None, Some(100.0), 10.0), "N/A");
    }

    #[tokio::test]
    async fn first_cycle_triggers_backfill_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(Arc<AtomicUsize>);
        #[async_trait]
        impl BackfillTrigger for Counter {
            async fn trigger_backfill(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (state, _rx) = CentralState::new(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let backfill: Arc<dyn BackfillTrigger> = Arc::new(Counter(calls.clone()));
        let tuya: Arc<dyn TuyaTrigger> = Arc::new(NoopTuya);
        let mut filter_engine = engine();
        let mut last_filtered = DataPacket::new();
        let config = ProcessorConfig { battery_usable_capacity_kwh: 10.0, tuya_enabled: false };
        let mut first_sent = false;

        let mut data = DataPacket::new();
        data.insert(key(k::AC_POWER_WATTS), Value::Number(1000.0));
        let report = ReportEnvelope {
            instance_id: "inv1".to_string(),
            category: DeviceCategory::Inverter,
            connected: true,
            connection_status: "Connected".to_string(),
            data: Some(data),
        };

        process_one(&state, report.clone(), &mut filter_engine, &mut last_filtered, &config, &backfill, &mut first_sent, &tuya).await;
        process_one(&state, report, &mut filter_engine, &mut last_filtered, &config, &backfill, &mut first_sent, &tuya).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
