//! MQTT publisher: pulls each dispatch package and publishes a combined
//! flattened state topic plus one per-instance state topic, deriving
//! per-instance availability from the MQTT-availability clock (spec.md §6).

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, MqttOptions, QoS};
use solar_domain_models::value::flatten_packet;
use solar_infra_state::CentralState;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub base_topic: String,
    pub stale_timeout: Duration,
}

/// Runs the publisher loop and its `rumqttc` event-loop driver as two
/// cooperating tasks under one `stop` signal; returns once both have wound
/// down.
#[instrument(skip(config, state, stop))]
pub async fn run(config: MqttConfig, state: Arc<CentralState>, stop: CancellationToken) {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut event_loop) = AsyncClient::new(options, 64);

    let driver_stop = stop.clone();
    let driver = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = driver_stop.cancelled() => break,
                event = event_loop.poll() => {
                    if let Err(e) = event {
                        warn!(error = %e, "mqtt event loop error, will keep retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    });

    let mut dispatch_rx = state.dispatch_subscribe();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = dispatch_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let package = dispatch_rx.borrow_and_update().clone();
                publish_package(&client, &config, &state, &package).await;
            }
        }
    }

    let _ = client.disconnect().await;
    driver.abort();
}

async fn publish_package(
    client: &AsyncClient,
    config: &MqttConfig,
    state: &Arc<CentralState>,
    package: &solar_infra_state::DispatchPackage,
) {
    let combined_flat = flatten_packet(&package.merged_data);
    let Ok(payload) = serde_json::to_string(&combined_flat) else {
        warn!("failed to serialize combined state, skipping publish");
        return;
    };

    if let Err(e) = client
        .publish(format!("{}/state", config.base_topic), QoS::AtLeastOnce, false, payload)
        .await
    {
        warn!(error = %e, "failed to publish combined state");
    }

    let now = chrono::Utc::now();
    for (instance_id, data) in &package.per_plugin_data {
        let flat = flatten_packet(data);
        if let Ok(payload) = serde_json::to_string(&flat) {
            let topic = format!("{}/{}/state", config.base_topic, instance_id);
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                warn!(error = %e, instance = %instance_id, "failed to publish per-instance state");
            }
        }

        let availability = instance_availability(state, instance_id, config.stale_timeout, now);
        let topic = format!("{}/{}/availability", config.base_topic, instance_id);
        if let Err(e) = client.publish(topic, QoS::AtLeastOnce, true, availability).await {
            warn!(error = %e, instance = %instance_id, "failed to publish availability");
        }
    }

    debug!(instances = package.per_plugin_data.len(), "published dispatch package");
}

fn instance_availability(
    state: &CentralState,
    instance_id: &str,
    stale_timeout: Duration,
    now: chrono::DateTime<chrono::Utc>,
) -> &'static str {
    let Some(liveness) = state.liveness_get(instance_id) else {
        return "offline";
    };
    match liveness.last_data_read {
        Some(timestamp) if now.signed_duration_since(timestamp) <= chrono::Duration::from_std(stale_timeout).unwrap() => "online",
        _ => "offline",
    }
}
