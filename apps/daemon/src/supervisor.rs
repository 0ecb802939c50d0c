//! Lifecycle supervision: the watchdog that reinitializes stalled pollers
//! and escalates to process re-exec, plus the health monitor that recreates
//! any poller task missing entirely (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use solar_infra_state::CentralState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::lifecycle::{Lifecycle, PollerHandle};

const SUPERVISOR_TICK: Duration = Duration::from_secs(15);
const HEALTH_MONITOR_TICK: Duration = Duration::from_secs(60);

/// Signals the main task to re-exec the process as the last-resort recovery
/// action, once an instance has burned through its reload budget.
pub trait ReExecSignal: Send + Sync {
    fn request_reexec(&self, reason: &str);
}

/// Shared poller handle table. A `tokio::sync::Mutex` rather than the
/// finer-grained locks on `CentralState`: both the supervisor and the
/// health monitor need to replace an entry as one atomic step (remove the
/// old handle, insert the new one), so a single lock is the simplest
/// correct design here.
pub type PollerTable = Arc<tokio::sync::Mutex<HashMap<String, PollerHandle>>>;

pub struct Supervisor {
    pub lifecycle: Arc<Lifecycle>,
    pub state: Arc<CentralState>,
    pub pollers: PollerTable,
    pub watchdog_timeout: Duration,
    pub watchdog_grace: Duration,
    pub max_reload_attempts: u32,
    pub reexec: Arc<dyn ReExecSignal>,
}

impl Supervisor {
    #[instrument(skip(self))]
    pub async fn run(&self, stop: CancellationToken) {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(self.watchdog_grace) => {}
        }

        let mut ticker = tokio::time::interval(SUPERVISOR_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if self.sweep().await {
                        break;
                    }
                }
            }
        }
    }

    /// One watchdog pass over every known instance. Returns `true` if a
    /// re-exec was triggered, so the caller can stop ticking.
    async fn sweep(&self) -> bool {
        let now = chrono::Utc::now();

        for instance_id in self.lifecycle.known_instance_ids().map(str::to_string).collect::<Vec<_>>() {
            let liveness = match self.state.liveness_get(&instance_id) {
                Some(l) => l,
                None => continue,
            };

            let never_succeeded_past_grace = liveness.last_successful_cycle.is_none()
                && now.signed_duration_since(liveness.poller_started_at)
                    > chrono::Duration::from_std(self.watchdog_grace + self.watchdog_timeout).unwrap();

            let stalled_since_last_success = liveness
                .last_successful_cycle
                .map(|t| now.signed_duration_since(t) > chrono::Duration::from_std(self.watchdog_timeout).unwrap())
                .unwrap_or(false);

            if !never_succeeded_past_grace && !stalled_since_last_success {
                continue;
            }

            if self.state.is_restart_in_progress(&instance_id) {
                continue;
            }

            warn!(instance = %instance_id, "poller stalled");

            if liveness.consecutive_failures >= self.max_reload_attempts {
                error!(instance = %instance_id, failures = liveness.consecutive_failures, "reload budget exhausted, requesting process re-exec");
                self.reexec.request_reexec(&format!("instance '{instance_id}' exceeded max_reload_attempts"));
                return true;
            }

            if !self.state.try_begin_restart(&instance_id) {
                continue;
            }
            self.reinitialize_one(&instance_id).await;
            self.state.end_restart(&instance_id);
        }

        false
    }

    async fn reinitialize_one(&self, instance_id: &str) {
        let mut table = self.pollers.lock().await;
        let Some(old) = table.remove(instance_id) else {
            warn!(instance = %instance_id, "no live poller handle to reinitialize, spawning fresh");
            match self.lifecycle.spawn_poller(instance_id) {
                Ok(handle) => {
                    table.insert(instance_id.to_string(), handle);
                }
                Err(e) => error!(instance = %instance_id, error = %e, "failed to spawn replacement poller"),
            }
            return;
        };

        match self.lifecycle.reinitialize(instance_id, old).await {
            Ok(handle) => {
                table.insert(instance_id.to_string(), handle);
                info!(instance = %instance_id, "poller reinitialized");
            }
            Err(e) => error!(instance = %instance_id, error = %e, "reinitialize failed"),
        }
    }
}

pub struct HealthMonitor {
    pub lifecycle: Arc<Lifecycle>,
    pub state: Arc<CentralState>,
    pub pollers: PollerTable,
}

impl HealthMonitor {
    #[instrument(skip(self))]
    pub async fn run(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(HEALTH_MONITOR_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// Recreates a poller for any configured instance whose task has exited
    /// without the supervisor noticing — e.g. a panic inside the task.
    async fn sweep(&self) {
        let missing: Vec<String> = {
            let table = self.pollers.lock().await;
            self.lifecycle
                .known_instance_ids()
                .filter(|id| table.get(*id).map(|h| h.join.is_finished()).unwrap_or(true))
                .map(str::to_string)
                .collect()
        };

        for instance_id in missing {
            if self.state.is_restart_in_progress(&instance_id) {
                continue;
            }
            if !self.state.try_begin_restart(&instance_id) {
                continue;
            }

            warn!(instance = %instance_id, "poller task missing, spawning a fresh one");
            match self.lifecycle.spawn_poller(&instance_id) {
                Ok(handle) => {
                    self.pollers.lock().await.insert(instance_id.clone(), handle);
                }
                Err(e) => error!(instance = %instance_id, error = %e, "failed to respawn missing poller"),
            }

            self.state.end_restart(&instance_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingReExec(std::sync::Mutex<Vec<String>>);

    impl ReExecSignal for RecordingReExec {
        fn request_reexec(&self, reason: &str) {
            self.0.lock().unwrap().push(reason.to_string());
        }
    }

    #[test]
    fn reexec_signal_records_reason() {
        let signal = RecordingReExec(std::sync::Mutex::new(Vec::new()));
        signal.request_reexec("test");
        assert_eq!(signal.0.lock().unwrap().as_slice(), &["test".to_string()]);
    }
}
