use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use solar_domain_filter::{DailyCaps, FilterConfig, FilterEngine, SystemLimits};
use solar_fleet_daemon::collaborators::{backfill::BackfillService, db::Store, mqtt, tuya::TuyaController, ws};
use solar_fleet_daemon::lifecycle::{Lifecycle, PollerHandle};
use solar_fleet_daemon::processor::{self, NoopTuya, ProcessorConfig};
use solar_fleet_daemon::supervisor::{HealthMonitor, PollerTable, ReExecSignal, Supervisor};
use solar_infra_config::AppConfig;
use solar_infra_state::CentralState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "solar-fleet-daemon", about = "Acquisition and processing daemon for a residential solar fleet")]
struct Cli {
    /// Path to the configuration file (without extension; the `config` crate
    /// resolves `.toml`/`.json`/`.yaml` from this stem).
    #[arg(long, env = "SOLAR_CONFIG_PATH", default_value = "config")]
    config: String,

    /// SQLite path for the persistence collaborator.
    #[arg(long, env = "SOLAR_DB_PATH", default_value = "solar-fleet.sqlite3")]
    db_path: String,

    /// Host:port the UI HTTP/WebSocket server binds to.
    #[arg(long, env = "SOLAR_UI_BIND", default_value = "0.0.0.0:8080")]
    ui_bind: String,

    #[arg(long, env = "SOLAR_MQTT_HOST")]
    mqtt_host: Option<String>,
    #[arg(long, env = "SOLAR_MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "SOLAR_TUYA_ENABLED", default_value_t = false)]
    tuya_enabled: bool,
    #[arg(long, env = "SOLAR_TUYA_ENDPOINT")]
    tuya_endpoint: Option<String>,
    #[arg(long, env = "SOLAR_TUYA_TOKEN")]
    tuya_token: Option<String>,
}

/// Requests a process re-exec, preserving argv (spec.md §4.6, §6). Setting
/// the flag only signals intent; the main task performs the actual `exec`
/// after giving every task a chance to wind down cleanly.
struct ReExecRequest {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: tokio::sync::Notify,
}

impl ReExecSignal for ReExecRequest {
    fn request_reexec(&self, reason: &str) {
        *self.reason.lock().expect("reexec reason lock poisoned") = Some(reason.to_string());
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

fn reexec_self() -> ! {
    let exe = std::env::current_exe().expect("current_exe must resolve");
    let args: Vec<String> = std::env::args().skip(1).collect();
    let error = std::process::Command::new(exe).args(args).exec();
    panic!("re-exec failed: {error}");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    info!(instances = config.instances.len(), "configuration loaded");

    let mut plugin_registry_mut = solar_core_plugin::registry::PluginRegistry::new();
    solar_core_drivers::register(&mut plugin_registry_mut);
    let plugin_registry = Arc::new(plugin_registry_mut);

    let (central_state, report_rx) = CentralState::new(100);
    let central_state = Arc::new(central_state);
    let report_tx = central_state.report_sender();

    let poll_interval = Duration::from_secs(config.poll_interval_seconds);
    let lifecycle = Arc::new(Lifecycle::new(
        Arc::clone(&plugin_registry),
        &config.instances,
        poll_interval,
        config.reconnect_max_attempts,
        Arc::clone(&central_state),
        report_tx,
    ));

    let global_stop = CancellationToken::new();

    let poller_table: PollerTable = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
    for instance_id in lifecycle.known_instance_ids() {
        let handle = lifecycle.spawn_poller(instance_id)?;
        poller_table.lock().await.insert(instance_id.to_string(), handle);
    }

    let tz: chrono_tz::Tz = config
        .timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid timezone '{}'", config.timezone))?;

    let limits = SystemLimits {
        pv_installed_capacity_w: config.installed_pv_capacity_watts,
        inverter_max_ac_power_w: config.inverter_max_ac_watts,
        battery_max_charge_power_w: config.battery_max_charge_watts,
        battery_max_discharge_power_w: config.battery_max_discharge_watts,
        battery_usable_capacity_kwh: config.battery_usable_capacity_kwh,
        poll_interval_seconds: config.poll_interval_seconds as f64,
    };
    let daily_caps = DailyCaps {
        pv_daily_yield_kwh: config.energy_daily_caps.get("pv_daily_yield_kwh").copied(),
        grid_daily_import_kwh: config.energy_daily_caps.get("grid_daily_import_kwh").copied(),
        grid_daily_export_kwh: config.energy_daily_caps.get("grid_daily_export_kwh").copied(),
        load_daily_energy_kwh: config.energy_daily_caps.get("load_daily_energy_kwh").copied(),
        battery_daily_charge_kwh: config.energy_daily_caps.get("battery_daily_charge_kwh").copied(),
        battery_daily_discharge_kwh: config.energy_daily_caps.get("battery_daily_discharge_kwh").copied(),
    };
    let filter_engine = FilterEngine::new(FilterConfig::default(), limits, daily_caps, tz);

    let store = Arc::new(Store::open(&cli.db_path)?);
    let backfill = Arc::new(BackfillService {
        registry: Arc::clone(&plugin_registry),
        instance_configs: lifecycle
            .known_instance_ids()
            .filter_map(|id| lifecycle.instance_configs.get(id).cloned())
            .collect(),
        store: Arc::clone(&store),
    });

    let tuya: Arc<dyn processor::TuyaTrigger> = if cli.tuya_enabled {
        let (Some(endpoint), Some(token)) = (cli.tuya_endpoint.clone(), cli.tuya_token.clone()) else {
            anyhow::bail!("--tuya-enabled requires --tuya-endpoint and --tuya-token");
        };
        Arc::new(TuyaController::new(solar_fleet_daemon::collaborators::tuya::TuyaConfig {
            device_endpoint: endpoint,
            device_token: token,
            on_threshold_c: 55.0,
            off_threshold_c: 45.0,
            cool_down: Duration::from_secs(300),
        }))
    } else {
        Arc::new(NoopTuya)
    };

    let processor_config = ProcessorConfig {
        battery_usable_capacity_kwh: config.battery_usable_capacity_kwh,
        tuya_enabled: cli.tuya_enabled,
    };

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(processor::run(
        Arc::clone(&central_state),
        report_rx,
        filter_engine,
        processor_config,
        backfill,
        tuya,
        global_stop.clone(),
    )));

    let reexec = Arc::new(ReExecRequest {
        requested: AtomicBool::new(false),
        reason: Mutex::new(None),
        notify: tokio::sync::Notify::new(),
    });

    let supervisor = Supervisor {
        lifecycle: Arc::clone(&lifecycle),
        state: Arc::clone(&central_state),
        pollers: Arc::clone(&poller_table),
        watchdog_timeout: Duration::from_secs(config.watchdog_timeout_seconds),
        watchdog_grace: Duration::from_secs(config.watchdog_grace_seconds),
        max_reload_attempts: config.max_reload_attempts,
        reexec: Arc::clone(&reexec) as Arc<dyn ReExecSignal>,
    };
    tasks.push(tokio::spawn({
        let stop = global_stop.clone();
        async move { supervisor.run(stop).await }
    }));

    let health_monitor = HealthMonitor {
        lifecycle: Arc::clone(&lifecycle),
        state: Arc::clone(&central_state),
        pollers: Arc::clone(&poller_table),
    };
    tasks.push(tokio::spawn({
        let stop = global_stop.clone();
        async move { health_monitor.run(stop).await }
    }));

    tasks.push(tokio::spawn({
        let store = Arc::clone(&store);
        let state = Arc::clone(&central_state);
        let stop = global_stop.clone();
        async move { solar_fleet_daemon::collaborators::db::run(store, state, stop).await }
    }));

    if let Some(mqtt_host) = cli.mqtt_host.clone() {
        let mqtt_config = mqtt::MqttConfig {
            host: mqtt_host,
            port: cli.mqtt_port,
            client_id: "solar-fleet-daemon".to_string(),
            base_topic: "solar/fleet".to_string(),
            stale_timeout: Duration::from_secs(config.mqtt_stale_timeout_seconds),
        };
        let state = Arc::clone(&central_state);
        let stop = global_stop.clone();
        tasks.push(tokio::spawn(async move { mqtt::run(mqtt_config, state, stop).await }));
    }

    let ui_router = ws::router(Arc::clone(&central_state));
    let ui_bind = cli.ui_bind.clone();
    let ui_stop = global_stop.clone();
    tasks.push(tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&ui_bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "failed to bind ui listener");
                return;
            }
        };
        info!(bind = %ui_bind, "ui server listening");
        let serve = axum::serve(listener, ui_router).with_graceful_shutdown(async move {
            ui_stop.cancelled().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "ui server error");
        }
    }));

    wait_for_shutdown_or_reexec(&global_stop, &reexec).await;

    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(10), task).await;
    }

    if reexec.requested.load(Ordering::SeqCst) {
        let reason = reexec.reason.lock().expect("reexec reason lock poisoned").clone();
        warn!(reason = ?reason, "re-executing process as last-resort recovery");
        reexec_self();
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_or_reexec(stop: &CancellationToken, reexec: &Arc<ReExecRequest>) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = reexec.notify.notified() => info!("re-exec requested, shutting down before restart"),
    }

    stop.cancel();
}
