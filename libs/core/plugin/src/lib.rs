//! The device plugin capability set.
//!
//! A plugin owns exactly one physical device: its transport, its decoding,
//! and its own sanity checks. It never retries across cycles — that is the
//! poller's job (apps/daemon/src/poller.rs) — and it never talks to any
//! other plugin. Everything a poller needs from a plugin is on
//! [`DevicePlugin`].

pub mod registry;
pub mod tcp_probe;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use solar_domain_models::{DataPacket, DeviceCategory};
use thiserror::Error;

/// Errors a plugin can report. These never cross a poll cycle boundary as
/// panics; a plugin that hits one of these returns `Err` (for `connect`) or
/// logs and returns `None` from a read (spec.md §7 error taxonomy).
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("transport timeout: {0}")]
    Timeout(String),

    #[error("frame validation failed: {0}")]
    FrameInvalid(String),

    #[error("data sanity check failed: {0}")]
    DataSanity(String),

    #[error("not connected")]
    NotConnected,

    #[error("unsupported operation")]
    Unsupported,
}

/// A single physical device: one Modbus inverter, one BMS, one meter.
///
/// Implementors must not retry across cycles and must not block the
/// executor — every method is async and should suspend at I/O, never spin.
#[async_trait]
pub trait DevicePlugin: Send + Sync {
    /// Stable short identifier, e.g. `"modbus_inverter"`. Used as the
    /// `plugin_type` string that the config and the registry key off of.
    fn name(&self) -> &str;

    /// Human label for logs and UI, e.g. `"Growatt Hybrid Inverter"`.
    fn pretty_name(&self) -> &str;

    /// The device category this instance reports as, used by the merge
    /// pass to decide BMS-overlay precedence.
    fn category(&self) -> DeviceCategory;

    /// Attempts to establish a transport session. On success, leaves the
    /// plugin in a connected state. For IP transports, implementors should
    /// probe reachability first (see [`tcp_probe`]) before opening a
    /// framed session.
    async fn connect(&mut self) -> Result<(), PluginError>;

    /// Releases transport resources. Safe to call when not connected.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Current human-readable connection status, e.g. `"Connecting... (2)"`
    /// or `"Connected"`. The poller publishes this to central state right
    /// after every transition so a stalled reconnect loop is visible
    /// immediately, before the next dynamic read ever completes.
    fn connection_status(&self) -> &str;

    fn set_connection_status(&mut self, status: &str);

    /// One-shot identity read. Must include `static_device_category`.
    async fn read_static_data(&mut self) -> Result<DataPacket, PluginError>;

    /// Full telemetry read. `None` signals "read failed this cycle" without
    /// forcing a reconnect; `Err` with [`PluginError::DataSanity`] signals a
    /// failure severe enough that the poller should force a reconnect.
    async fn read_dynamic_data(&mut self) -> Result<Option<DataPacket>, PluginError>;

    /// Yesterday's cumulative energy totals for the backfill collaborator.
    /// Plugins that can't produce this return `Ok(None)`.
    async fn read_yesterday_energy_summary(&mut self) -> Result<Option<BTreeMap<String, f64>>, PluginError> {
        Ok(None)
    }

    /// Human-readable detail from the last failing operation, for
    /// diagnostics only — the poller never parses this.
    fn last_error_message(&self) -> Option<&str>;
}

/// Parameters every plugin instance is constructed from, regardless of
/// transport. Driver-specific extras (register maps, unit IDs) live in each
/// driver's own config struct; this is the shared envelope the registry
/// dispatches on.
#[derive(Debug, Clone)]
pub struct PluginInstanceConfig {
    pub instance_id: String,
    pub plugin_type: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub serial_device: Option<String>,
    pub unit_id: Option<u8>,
    pub connect_timeout: Duration,
    pub extra: BTreeMap<String, String>,
}
