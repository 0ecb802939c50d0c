//! Plugin loader: resolves `plugin_type` strings to driver constructors (no
//! reflection) and owns the instantiate/teardown pairing used both at
//! startup and by a supervisor-triggered reinitialize.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use solar_core_plugin::registry::PluginRegistry;
use solar_core_plugin::PluginInstanceConfig;
use solar_infra_config::InstanceConfig;
use solar_infra_state::CentralState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::poller::{self, PollerParams};

/// A live poller's cancellation capability plus its task handle, as required
/// by the data model invariant: exactly one live poller task and exactly one
/// stop-signal capability per active plugin instance.
pub struct PollerHandle {
    pub stop: CancellationToken,
    pub join: JoinHandle<()>,
}

/// Builds the shared envelope every driver constructor reads from, from the
/// configuration layer's loosely-typed `InstanceConfig`.
fn build_instance_config(instance: &InstanceConfig) -> PluginInstanceConfig {
    PluginInstanceConfig {
        instance_id: instance.name.clone(),
        plugin_type: instance.plugin_type.clone(),
        host: instance.connection.host.clone(),
        port: instance.connection.port,
        serial_device: instance.connection.serial_device.clone(),
        unit_id: instance.connection.unit_id,
        connect_timeout: Duration::from_secs(instance.connection.connect_timeout_seconds),
        extra: std::collections::BTreeMap::new(),
    }
}

pub struct Lifecycle {
    pub plugin_registry: Arc<PluginRegistry>,
    pub instance_configs: HashMap<String, PluginInstanceConfig>,
    pub poll_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub state: Arc<CentralState>,
    pub report_tx: mpsc::Sender<solar_infra_state::ReportEnvelope>,
}

impl Lifecycle {
    pub fn new(
        plugin_registry: Arc<PluginRegistry>,
        instances: &[InstanceConfig],
        poll_interval: Duration,
        max_reconnect_attempts: u32,
        state: Arc<CentralState>,
        report_tx: mpsc::Sender<solar_infra_state::ReportEnvelope>,
    ) -> Self {
        let instance_configs = instances
            .iter()
            .map(|i| (i.name.clone(), build_instance_config(i)))
            .collect();

        Self {
            plugin_registry,
            instance_configs,
            poll_interval,
            max_reconnect_attempts,
            state,
            report_tx,
        }
    }

    pub fn known_instance_ids(&self) -> impl Iterator<Item = &str> {
        self.instance_configs.keys().map(String::as_str)
    }

    /// Instantiates a plugin for `instance_id` and spawns its poller task.
    /// Does not call `connect()` — the poller's own reconnect loop handles
    /// the first connection attempt.
    #[instrument(skip(self))]
    pub fn spawn_poller(&self, instance_id: &str) -> anyhow::Result<PollerHandle> {
        let config = self
            .instance_configs
            .get(instance_id)
            .ok_or_else(|| anyhow::anyhow!("unknown instance '{instance_id}'"))?;

        let plugin = self.plugin_registry.build(config)?;
        let stop = CancellationToken::new();

        let params = PollerParams {
            instance_id: instance_id.to_string(),
            poll_interval: self.poll_interval,
            max_reconnect_attempts: self.max_reconnect_attempts,
        };

        let state = Arc::clone(&self.state);
        let report_tx = self.report_tx.clone();
        let child_stop = stop.clone();

        let join = tokio::spawn(poller::run(plugin, params, state, report_tx, child_stop));

        info!("poller spawned");
        Ok(PollerHandle { stop, join })
    }

    /// Implements the exact Reinitialize sequence: stop+join the old poller
    /// (bounded at 5s), drop it, build a fresh plugin+poller pair, and reset
    /// the liveness counters the supervisor is responsible for resetting —
    /// but never the MQTT-availability timestamp.
    #[instrument(skip(self, old))]
    pub async fn reinitialize(&self, instance_id: &str, old: PollerHandle) -> anyhow::Result<PollerHandle> {
        let _reload_guard = self.state.reload_lock.lock().await;

        old.stop.cancel();
        if tokio::time::timeout(Duration::from_secs(5), old.join).await.is_err() {
            warn!("old poller did not stop within 5s, proceeding anyway");
        }

        self.state.reset_liveness_for_reinit(instance_id, now_utc());
        self.spawn_poller(instance_id)
    }
}

fn now_utc() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
