//! Per-key state the energy filter carries between cycles: a pending spike
//! candidate, a pending decrease candidate, and the timestamp of the last
//! accepted value (used to bound the elapsed-time estimate).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use solar_domain_models::StandardKey;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeCandidate {
    pub value: f64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecreaseCandidate {
    pub value: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u32,
}

/// All mutable filter state, keyed by standard key. Lives as long as the
/// processor does; survives across cycles but not across a process restart.
#[derive(Debug, Clone, Default)]
pub struct FilterState {
    pub(crate) potential_spikes: BTreeMap<StandardKey, SpikeCandidate>,
    pub(crate) potential_decreases: BTreeMap<StandardKey, DecreaseCandidate>,
    pub(crate) last_energy_timestamps: BTreeMap<StandardKey, DateTime<Utc>>,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears every trace of pending state for one key — called on a
    /// confirmed daily reset or a confirmed decrease correction.
    pub fn clear_key(&mut self, key: &StandardKey) {
        self.potential_spikes.remove(key);
        self.potential_decreases.remove(key);
    }

    /// Clears all state for all keys, e.g. when a plugin is reinitialized.
    pub fn clear_all(&mut self) {
        self.potential_spikes.clear();
        self.potential_decreases.clear();
        self.last_energy_timestamps.clear();
    }

    /// FIFO-prunes the spike table down to half of `max_size` once it grows
    /// past `max_size`. `BTreeMap` iterates in key order, which is a stable
    /// but otherwise arbitrary eviction order — good enough for a leak guard.
    pub(crate) fn cleanup_spikes(&mut self, max_size: usize) {
        if self.potential_spikes.len() <= max_size {
            return;
        }
        let keep_from = self.potential_spikes.len() - max_size / 2;
        let stale: Vec<StandardKey> = self
            .potential_spikes
            .keys()
            .take(keep_from)
            .cloned()
            .collect();
        for key in &stale {
            self.potential_spikes.remove(key);
        }
        tracing::debug!(pruned = stale.len(), "FILTER: pruned spike history");
    }

    pub(crate) fn cleanup_decreases(&mut self, max_age_seconds: f64, now: DateTime<Utc>) {
        let stale: Vec<StandardKey> = self
            .potential_decreases
            .iter()
            .filter(|(_, candidate)| {
                (now - candidate.first_seen).num_seconds() as f64 > max_age_seconds
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.potential_decreases.remove(key);
        }
        if !stale.is_empty() {
            tracing::debug!(pruned = stale.len(), "FILTER: pruned decrease-correction history");
        }
    }
}
