//! Plug controller (ancillary): cools the inverter enclosure by switching a
//! Tuya smart plug, driven once per cycle from the inverter temperature
//! (spec.md §6). Hysteresis and cool-down live entirely here — the
//! processor only ever calls in with the current reading.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};

use crate::processor::TuyaTrigger;

pub struct TuyaConfig {
    pub device_endpoint: String,
    pub device_token: String,
    pub on_threshold_c: f64,
    pub off_threshold_c: f64,
    pub cool_down: Duration,
}

struct TuyaState {
    plug_on: bool,
    last_switch_at: Option<tokio::time::Instant>,
}

pub struct TuyaController {
    config: TuyaConfig,
    client: Client,
    state: AsyncMutex<TuyaState>,
}

impl TuyaController {
    pub fn new(config: TuyaConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            state: AsyncMutex::new(TuyaState { plug_on: false, last_switch_at: None }),
        }
    }

    async fn switch(&self, on: bool) {
        let endpoint = format!("{}/switch", self.config.device_endpoint);
        let result = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.config.device_token)
            .json(&serde_json::json!({ "on": on }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => debug!(on, "plug switched"),
            Ok(response) => warn!(status = %response.status(), "plug switch rejected"),
            Err(e) => warn!(error = %e, "plug switch request failed"),
        }
    }
}

#[async_trait]
impl TuyaTrigger for TuyaController {
    #[instrument(skip(self))]
    async fn handle_temperature(&self, temperature_c: f64) {
        let mut state = self.state.lock().await;

        let cooling_down = state
            .last_switch_at
            .map(|at| at.elapsed() < self.config.cool_down)
            .unwrap_or(false);
        if cooling_down {
            return;
        }

        let desired = if temperature_c >= self.config.on_threshold_c {
            true
        } else if temperature_c <= self.config.off_threshold_c {
            false
        } else {
            state.plug_on
        };

        if desired == state.plug_on {
            return;
        }

        drop(state);
        self.switch(desired).await;

        let mut state = self.state.lock().await;
        state.plug_on = desired;
        state.last_switch_at = Some(tokio::time::Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TuyaConfig {
        TuyaConfig {
            device_endpoint: "http://127.0.0.1:0".to_string(),
            device_token: "test-token".to_string(),
            on_threshold_c: 55.0,
            off_threshold_c: 45.0,
            cool_down: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn stays_off_within_hysteresis_band() {
        let controller = TuyaController::new(config());
        controller.handle_temperature(50.0).await;
        assert!(!controller.state.lock().await.plug_on);
    }
}
