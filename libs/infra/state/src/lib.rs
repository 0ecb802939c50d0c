//! =================================================================
//! CENTRAL STATE — per-concern locks, report channel, dispatch channel.
//!
//! Every lock here guards exactly one concern and nothing is ever held
//! across an I/O suspension point: the snapshot, the per-plugin cache, the
//! liveness table, and the restart-in-progress set each have their own
//! lock, so a slow snapshot reader never blocks a poller's liveness update.
//! =================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use solar_domain_models::{DataPacket, DeviceCategory, StandardKey, Value, Wrapped, WrappedPacket};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, RwLock as AsyncRwLock};

pub type InstanceId = String;

/// What a poller hands to the processor over the report channel. `data` is
/// the flat, unwrapped packet the plugin produced this cycle — the
/// processor does the `{value, unit}` wrapping as part of its own cache
/// update step, after applying the "meaningful" test.
#[derive(Debug, Clone)]
pub struct ReportEnvelope {
    pub instance_id: InstanceId,
    pub category: DeviceCategory,
    pub connected: bool,
    /// The plugin's current connection status text, e.g. `"Connecting...
    /// (2)"` or `"Connected"`. Unlike `data`, this is carried every cycle
    /// regardless of whether the read was meaningful, since a connection
    /// transition is itself worth surfacing.
    pub connection_status: String,
    /// `None` means "read failed this cycle" — the cache entry is left
    /// untouched but the liveness failure counter still advances.
    pub data: Option<DataPacket>,
}

/// A plugin instance's latest wrapped dynamic snapshot plus the static
/// fields learned once after connect. Persists across read failures.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub data: WrappedPacket,
    pub category: Option<DeviceCategory>,
    pub connected: bool,
    pub connection_status: String,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Per-instance liveness bookkeeping (spec.md §3 "Liveness records").
#[derive(Debug, Clone)]
pub struct Liveness {
    /// Watchdog clock: last cycle that completed successfully.
    pub last_successful_cycle: Option<DateTime<Utc>>,
    /// MQTT-availability clock: last cycle with an actual meaningful read.
    /// Deliberately not reset on reinitialize, so a quick recovery doesn't
    /// cause a visible availability blip (spec.md §4.6).
    pub last_data_read: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub reload_attempts: u32,
    pub poller_started_at: DateTime<Utc>,
}

impl Liveness {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_successful_cycle: None,
            last_data_read: None,
            consecutive_failures: 0,
            reload_attempts: 0,
            poller_started_at: now,
        }
    }
}

/// The processor's one outgoing package per cycle: the merged+filtered
/// snapshot plus each plugin's own unmerged view, for consumers that want
/// per-instance detail (e.g. the MQTT per-instance state topic).
#[derive(Debug, Clone, Default)]
pub struct DispatchPackage {
    pub merged_data: WrappedPacket,
    pub per_plugin_data: BTreeMap<InstanceId, WrappedPacket>,
}

pub struct CentralState {
    snapshot: AsyncRwLock<WrappedPacket>,
    plugin_cache: AsyncMutex<HashMap<InstanceId, CacheEntry>>,
    liveness: StdRwLock<HashMap<InstanceId, Liveness>>,
    restart_in_progress: Mutex<HashSet<InstanceId>>,
    /// Held across a poller's stop+join during Reinitialize (spec.md §4.6)
    /// to serialize lifecycle changes for a single instance.
    pub reload_lock: AsyncMutex<()>,
    report_tx: mpsc::Sender<ReportEnvelope>,
    dispatch_tx: watch::Sender<DispatchPackage>,
}

impl CentralState {
    /// Builds a fresh `CentralState` plus the report channel's receiving
    /// half, which the caller hands to the processor task. The report
    /// channel has bounded capacity (spec.md §5): senders never block
    /// beyond `try_send`, receivers await.
    pub fn new(report_channel_capacity: usize) -> (Self, mpsc::Receiver<ReportEnvelope>) {
        let (report_tx, report_rx) = mpsc::channel(report_channel_capacity);
        let (dispatch_tx, _dispatch_rx) = watch::channel(DispatchPackage::default());

        let state = Self {
            snapshot: AsyncRwLock::new(WrappedPacket::new()),
            plugin_cache: AsyncMutex::new(HashMap::new()),
            liveness: StdRwLock::new(HashMap::new()),
            restart_in_progress: Mutex::new(HashSet::new()),
            reload_lock: AsyncMutex::new(()),
            report_tx,
            dispatch_tx,
        };
        (state, report_rx)
    }

    pub fn report_sender(&self) -> mpsc::Sender<ReportEnvelope> {
        self.report_tx.clone()
    }

    /// Subscribes to the dispatch channel. `watch` is itself the
    /// size-1-latest-wins primitive spec.md §5 REDESIGN FLAGS calls for: a
    /// new `send` simply replaces the held value, so no explicit drain is
    /// needed before publishing.
    pub fn dispatch_subscribe(&self) -> watch::Receiver<DispatchPackage> {
        self.dispatch_tx.subscribe()
    }

    pub fn publish_dispatch(&self, package: DispatchPackage) {
        let _ = self.dispatch_tx.send(package);
    }

    pub async fn snapshot(&self) -> WrappedPacket {
        self.snapshot.read().await.clone()
    }

    pub async fn replace_snapshot(&self, snapshot: WrappedPacket) {
        *self.snapshot.write().await = snapshot;
    }

    pub async fn cache_get(&self, instance_id: &str) -> Option<CacheEntry> {
        self.plugin_cache.lock().await.get(instance_id).cloned()
    }

    pub async fn cache_snapshot(&self) -> HashMap<InstanceId, CacheEntry> {
        self.plugin_cache.lock().await.clone()
    }

    /// Overwrites one instance's cache entry. The caller (the processor) is
    /// responsible for only calling this on a "meaningful" read — stale
    /// reads leave the cache untouched (spec.md §3 invariant).
    pub async fn cache_update(&self, instance_id: &str, entry: CacheEntry) {
        self.plugin_cache.lock().await.insert(instance_id.to_string(), entry);
    }

    pub fn liveness_snapshot(&self) -> HashMap<InstanceId, Liveness> {
        self.liveness.read().expect("liveness lock poisoned").clone()
    }

    pub fn liveness_get(&self, instance_id: &str) -> Option<Liveness> {
        self.liveness.read().expect("liveness lock poisoned").get(instance_id).cloned()
    }

    pub fn liveness_ensure(&self, instance_id: &str, now: DateTime<Utc>) {
        self.liveness
            .write()
            .expect("liveness lock poisoned")
            .entry(instance_id.to_string())
            .or_insert_with(|| Liveness::new(now));
    }

    pub fn record_cycle_success(&self, instance_id: &str, now: DateTime<Utc>, meaningful: bool) {
        let mut table = self.liveness.write().expect("liveness lock poisoned");
        let entry = table.entry(instance_id.to_string()).or_insert_with(|| Liveness::new(now));
        entry.last_successful_cycle = Some(now);
        entry.consecutive_failures = 0;
        if meaningful {
            entry.last_data_read = Some(now);
        }
    }

    pub fn record_cycle_failure(&self, instance_id: &str, now: DateTime<Utc>) {
        let mut table = self.liveness.write().expect("liveness lock poisoned");
        let entry = table.entry(instance_id.to_string()).or_insert_with(|| Liveness::new(now));
        entry.consecutive_failures += 1;
    }

    /// Updates only the MQTT-availability clock, for the "read succeeded but
    /// the cycle failed its stagnation/state tests" case (spec.md §4.2 step
    /// 6) — the link is alive, the data is just paused.
    pub fn record_data_read_only(&self, instance_id: &str, now: DateTime<Utc>) {
        let mut table = self.liveness.write().expect("liveness lock poisoned");
        let entry = table.entry(instance_id.to_string()).or_insert_with(|| Liveness::new(now));
        entry.last_data_read = Some(now);
    }

    /// Writes one instance's connection-status key straight into the
    /// snapshot, bypassing the processor cycle, so a reconnect attempt's
    /// `"Connecting... (n)"` is visible immediately rather than on the next
    /// merge (spec.md §4.2 step 1).
    pub async fn publish_connection_status(&self, instance_id: &str, status: &str) {
        let key = connection_status_key(instance_id);
        self.snapshot.write().await.insert(key, Wrapped::new(Value::Text(status.to_string())));
    }

    /// Applies the Reinitialize counter reset (spec.md §4.6): failure count
    /// and the watchdog clock go back to zero, but the MQTT-availability
    /// clock is left exactly as it was.
    pub fn reset_liveness_for_reinit(&self, instance_id: &str, now: DateTime<Utc>) {
        let mut table = self.liveness.write().expect("liveness lock poisoned");
        let entry = table.entry(instance_id.to_string()).or_insert_with(|| Liveness::new(now));
        entry.consecutive_failures = 0;
        entry.last_successful_cycle = None;
        entry.reload_attempts += 1;
        entry.poller_started_at = now;
    }

    /// Atomically adds `instance_id` to the restart-in-progress set. Returns
    /// `false` if it was already a member — the caller must then skip doing
    /// restart work for this instance (spec.md §8 property 6: single-holder
    /// membership).
    pub fn try_begin_restart(&self, instance_id: &str) -> bool {
        self.restart_in_progress.lock().expect("restart set poisoned").insert(instance_id.to_string())
    }

    pub fn end_restart(&self, instance_id: &str) {
        self.restart_in_progress.lock().expect("restart set poisoned").remove(instance_id);
    }

    pub fn is_restart_in_progress(&self, instance_id: &str) -> bool {
        self.restart_in_progress.lock().expect("restart set poisoned").contains(instance_id)
    }
}

/// Resolves a per-plugin connection status key, e.g.
/// `"inverter_1_core_plugin_connection_status"`.
pub fn connection_status_key(instance_id: &str) -> StandardKey {
    StandardKey::scoped(instance_id, solar_domain_models::keys::k::CORE_PLUGIN_CONNECTION_STATUS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-27T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn snapshot_replace_is_visible_to_readers() {
        let (state, _rx) = CentralState::new(100);
        let mut packet = WrappedPacket::new();
        packet.insert(StandardKey::from("battery_state_of_charge_percent"), solar_domain_models::Wrapped::new(solar_domain_models::Value::Number(80.0)));
        state.replace_snapshot(packet.clone()).await;
        assert_eq!(state.snapshot().await, packet);
    }

    #[test]
    fn restart_set_is_single_holder() {
        let (state, _rx) = CentralState::new(10);
        assert!(state.try_begin_restart("inv1"));
        assert!(!state.try_begin_restart("inv1"));
        state.end_restart("inv1");
        assert!(state.try_begin_restart("inv1"));
    }

    #[test]
    fn reinit_preserves_mqtt_clock_but_resets_watchdog_clock() {
        let (state, _rx) = CentralState::new(10);
        let t0 = now();
        state.record_cycle_success("inv1", t0, true);
        let before = state.liveness_get("inv1").unwrap();
        assert!(before.last_data_read.is_some());
        assert!(before.last_successful_cycle.is_some());

        let t1 = t0 + chrono::Duration::seconds(30);
        state.reset_liveness_for_reinit("inv1", t1);
        let after = state.liveness_get("inv1").unwrap();
        assert_eq!(after.last_successful_cycle, None);
        assert_eq!(after.last_data_read, before.last_data_read);
        assert_eq!(after.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn dispatch_channel_holds_only_the_latest_package() {
        let (state, _rx) = CentralState::new(10);
        let mut receiver = state.dispatch_subscribe();

        let mut first = DispatchPackage::default();
        first.merged_data.insert(StandardKey::from("a"), solar_domain_models::Wrapped::new(solar_domain_models::Value::Number(1.0)));
        state.publish_dispatch(first);

        let mut second = DispatchPackage::default();
        second.merged_data.insert(StandardKey::from("a"), solar_domain_models::Wrapped::new(solar_domain_models::Value::Number(2.0)));
        state.publish_dispatch(second);

        receiver.changed().await.unwrap();
        let latest = receiver.borrow_and_update().clone();
        assert_eq!(
            latest.merged_data.get(&StandardKey::from("a")),
            Some(&solar_domain_models::Wrapped::new(solar_domain_models::Value::Number(2.0)))
        );
    }
}
