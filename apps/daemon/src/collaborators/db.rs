//! Persistence layer: every 60 s, reads the central snapshot, extracts a
//! small set of scalar series plus the six daily energy totals, and appends
//! them to a local SQLite store (spec.md §6).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use solar_domain_models::{keys::k, StandardKey, Value};
use solar_infra_state::CentralState;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

const SCALAR_SERIES: &[&str] = &[
    k::BATTERY_STATE_OF_CHARGE_PERCENT,
    k::PV_TOTAL_DC_POWER_WATTS,
    k::BATTERY_POWER_WATTS,
    k::LOAD_TOTAL_POWER_WATTS,
    k::GRID_TOTAL_ACTIVE_POWER_WATTS,
];

const DAILY_ENERGY_SERIES: &[&str] = k::DAILY_ENERGY_KEYS;

pub struct Store {
    conn: AsyncMutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS telemetry_samples (
                recorded_at_ms_utc INTEGER NOT NULL,
                series_key TEXT NOT NULL,
                value REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_telemetry_samples_key_time
                ON telemetry_samples (series_key, recorded_at_ms_utc);",
        )?;
        Ok(Self { conn: AsyncMutex::new(conn) })
    }

    pub async fn insert_sample(&self, recorded_at_ms_utc: i64, series_key: &str, value: f64) -> rusqlite::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO telemetry_samples (recorded_at_ms_utc, series_key, value) VALUES (?1, ?2, ?3)",
            (recorded_at_ms_utc, series_key, value),
        )?;
        Ok(())
    }
}

#[instrument(skip(store, state, stop))]
pub async fn run(store: Arc<Store>, state: Arc<CentralState>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => sample_once(&store, &state).await,
        }
    }
}

async fn sample_once(store: &Arc<Store>, state: &Arc<CentralState>) {
    let snapshot = state.snapshot().await;
    let now_ms = Utc::now().timestamp_millis();

    for series_key in SCALAR_SERIES.iter().chain(DAILY_ENERGY_SERIES.iter()) {
        let Some(value) = snapshot.get(&StandardKey::from(*series_key)).and_then(|w| match &w.value {
            Value::Number(n) => Some(*n),
            _ => None,
        }) else {
            continue;
        };

        if let Err(e) = store.insert_sample(now_ms, series_key, value).await {
            error!(series = series_key, error = %e, "failed to persist sample");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inserts_are_queryable() {
        let store = Store::open(":memory:").unwrap();
        store.insert_sample(1_000, k::BATTERY_STATE_OF_CHARGE_PERCENT, 87.5).await.unwrap();

        let conn = store.conn.lock().await;
        let value: f64 = conn
            .query_row(
                "SELECT value FROM telemetry_samples WHERE series_key = ?1",
                [k::BATTERY_STATE_OF_CHARGE_PERCENT],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, 87.5);
    }
}
