//! The per-device poller: one task per configured plugin instance, driving
//! it through connect, static read, dynamic read, stagnation detection, and
//! cadence sleep, per spec.md §4.2.

use std::time::Duration;
use std::sync::Arc;

use solar_core_plugin::{DevicePlugin, PluginError};
use solar_domain_models::keys::{is_fully_operational_status, is_waiting_status, k};
use solar_domain_models::{DataPacket, DeviceCategory, StandardKey, Value};
use solar_infra_state::{CentralState, ReportEnvelope};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct PollerParams {
    pub instance_id: String,
    pub poll_interval: Duration,
    pub max_reconnect_attempts: u32,
}

fn key(name: &str) -> StandardKey {
    StandardKey::from(name)
}

fn power_triplet(packet: &DataPacket) -> Option<(f64, f64, f64)> {
    let ac = packet.get(&key(k::AC_POWER_WATTS))?.as_f64()?;
    let pv = packet.get(&key(k::PV_TOTAL_DC_POWER_WATTS))?.as_f64()?;
    let battery = packet.get(&key(k::BATTERY_POWER_WATTS))?.as_f64()?;
    Some((ac, pv, battery))
}

fn status_text_of(packet: &DataPacket, category: DeviceCategory) -> Option<String> {
    let status_key = match category {
        DeviceCategory::Inverter => k::OPERATIONAL_INVERTER_STATUS_TEXT,
        _ => k::BATTERY_STATUS_TEXT,
    };
    packet.get(&key(status_key)).and_then(Value::as_str).map(str::to_string)
}

/// Runs the acquisition loop for one plugin instance until `stop` fires.
/// The loop never returns early on a transient error; it keeps retrying at
/// the configured cadence for the lifetime of the task.
#[instrument(skip(plugin, state, report_tx, stop), fields(instance = %params.instance_id))]
pub async fn run(
    mut plugin: Box<dyn DevicePlugin>,
    params: PollerParams,
    state: Arc<CentralState>,
    report_tx: mpsc::Sender<ReportEnvelope>,
    stop: CancellationToken,
) {
    let instance_id = params.instance_id.clone();
    state.liveness_ensure(&instance_id, now());

    let mut category = plugin.category();
    let mut static_cache: Option<DataPacket> = None;
    let mut last_triplet: Option<(f64, f64, f64)> = None;
    let mut stagnant_cycles: u32 = 0;
    let stagnation_threshold =
        (300.0 / params.poll_interval.as_secs_f64()).ceil().max(1.0) as u32;

    loop {
        if stop.is_cancelled() {
            break;
        }

        let cycle_start = Instant::now();

        if !plugin.is_connected() {
            match reconnect_burst(plugin.as_mut(), &instance_id, &state, params.max_reconnect_attempts, &stop).await {
                ReconnectOutcome::Stopped => break,
                ReconnectOutcome::Connected => {
                    static_cache = None;
                }
                ReconnectOutcome::ExhaustedBurst => {
                    state.record_cycle_failure(&instance_id, now());
                    if cancellable_sleep(params.poll_interval, &stop).await {
                        break;
                    }
                    continue;
                }
            }
        }

        if static_cache.is_none() {
            match plugin.read_static_data().await {
                Ok(static_packet) => {
                    if let Some(reported) = static_packet.get(&key(k::STATIC_DEVICE_CATEGORY)).and_then(Value::as_str) {
                        category = DeviceCategory::parse(reported);
                    }
                    static_cache = Some(static_packet);
                }
                Err(e) => warn!(error = %e, "static read failed, will retry next cycle"),
            }
        }

        let mut packet: Option<DataPacket> = None;
        // A read that came back but failed the stagnation test still moved
        // data across the wire — the MQTT-availability clock advances even
        // though the watchdog clock does not (spec.md §4.2 step 6).
        let mut read_succeeded = false;
        let mut cycle_ok = false;

        match plugin.read_dynamic_data().await {
            Ok(Some(dynamic)) => {
                read_succeeded = true;
                cycle_ok = true;
                // Union-merge cached static fields with this cycle's dynamic
                // read into one packet (spec.md §4.2 step 3).
                let mut combined = static_cache.clone().unwrap_or_default();
                combined.extend(dynamic);
                packet = Some(combined);
            }
            Ok(None) => debug!("dynamic read returned no data this cycle"),
            Err(e) => {
                warn!(error = %e, "dynamic read failed");
                if matches!(e, PluginError::DataSanity(_)) {
                    plugin.disconnect().await;
                    plugin.set_connection_status("error");
                    state.publish_connection_status(&instance_id, "error").await;
                }
            }
        }

        if let Some(ref data) = packet {
            let status_text = status_text_of(data, category);
            let triplet = power_triplet(data);
            let is_fully_operational = status_text.as_deref().map(is_fully_operational_status).unwrap_or(false);
            let is_waiting = status_text.as_deref().map(is_waiting_status).unwrap_or(false);

            if category == DeviceCategory::Inverter && is_fully_operational {
                if triplet.is_some() && triplet == last_triplet {
                    stagnant_cycles += 1;
                } else {
                    stagnant_cycles = 0;
                }
                last_triplet = triplet;

                if stagnant_cycles >= stagnation_threshold {
                    cycle_ok = false;
                    plugin.set_connection_status("Stalled");
                    state.publish_connection_status(&instance_id, "Stalled").await;
                    warn!(cycles = stagnant_cycles, "inverter power triplet stagnant, marking cycle unsuccessful");
                }
            } else {
                // Non-generating or non-inverter status resets the triplet;
                // a waiting state still counts as a successful cycle.
                last_triplet = None;
                stagnant_cycles = 0;
                let _ = is_waiting;
            }
        }

        send_report(
            &report_tx,
            &instance_id,
            category,
            plugin.is_connected(),
            plugin.connection_status(),
            packet,
        )
        .await;

        if cycle_ok {
            state.record_cycle_success(&instance_id, now(), true);
            if plugin.connection_status() != "Connected" {
                plugin.set_connection_status("Connected");
                state.publish_connection_status(&instance_id, "Connected").await;
            }
        } else {
            state.record_cycle_failure(&instance_id, now());
            if read_succeeded {
                state.record_data_read_only(&instance_id, now());
            }
        }

        let elapsed = cycle_start.elapsed();
        let remaining = params.poll_interval.saturating_sub(elapsed).max(Duration::from_millis(100));
        if cancellable_sleep(remaining, &stop).await {
            break;
        }
    }

    plugin.disconnect().await;
    plugin.set_connection_status("Disconnected");
    state.publish_connection_status(&instance_id, "Disconnected").await;
    info!("poller stopped");
}

enum ReconnectOutcome {
    Connected,
    ExhaustedBurst,
    Stopped,
}

/// Up to `max_attempts` connect attempts with `min(2^attempt, 15)s` backoff,
/// each one publishing `"Connecting... (n)"` before the attempt so a stalled
/// reconnect is visible the instant it starts.
async fn reconnect_burst(
    plugin: &mut dyn DevicePlugin,
    instance_id: &str,
    state: &CentralState,
    max_attempts: u32,
    stop: &CancellationToken,
) -> ReconnectOutcome {
    for attempt in 1..=max_attempts.max(1) {
        if stop.is_cancelled() {
            return ReconnectOutcome::Stopped;
        }

        let status = format!("Connecting... ({attempt})");
        plugin.set_connection_status(&status);
        state.publish_connection_status(instance_id, &status).await;

        match plugin.connect().await {
            Ok(()) => return ReconnectOutcome::Connected,
            Err(e) => warn!(attempt, error = %e, "connect attempt failed"),
        }

        let backoff_secs = 2u64.saturating_pow(attempt).min(15);
        if cancellable_sleep(Duration::from_secs(backoff_secs), stop).await {
            return ReconnectOutcome::Stopped;
        }
    }

    ReconnectOutcome::ExhaustedBurst
}

/// Sleeps for `duration`, racing the stop signal. Returns `true` if the stop
/// signal fired first.
async fn cancellable_sleep(duration: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

async fn send_report(
    tx: &mpsc::Sender<ReportEnvelope>,
    instance_id: &str,
    category: DeviceCategory,
    connected: bool,
    connection_status: &str,
    data: Option<DataPacket>,
) {
    let envelope = ReportEnvelope {
        instance_id: instance_id.to_string(),
        category,
        connected,
        connection_status: connection_status.to_string(),
        data,
    };
    if tx.try_send(envelope).is_err() {
        warn!("report channel full or closed, dropping this cycle's report");
    }
}

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
