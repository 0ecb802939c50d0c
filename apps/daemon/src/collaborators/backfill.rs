//! Backfill: on the first processed packet only, reads each configured
//! plugin's `read_yesterday_energy_summary()` and seeds it into the
//! persistence store (spec.md §4.4 step 10, §4.1).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use solar_core_plugin::registry::PluginRegistry;
use solar_core_plugin::PluginInstanceConfig;
use tracing::{instrument, warn};

use crate::collaborators::db::Store;
use crate::processor::BackfillTrigger;

pub struct BackfillService {
    pub registry: Arc<PluginRegistry>,
    pub instance_configs: Vec<PluginInstanceConfig>,
    pub store: Arc<Store>,
}

#[async_trait]
impl BackfillTrigger for BackfillService {
    #[instrument(skip(self))]
    async fn trigger_backfill(&self) {
        for config in &self.instance_configs {
            let mut plugin = match self.registry.build(config) {
                Ok(plugin) => plugin,
                Err(e) => {
                    warn!(instance = %config.instance_id, error = %e, "backfill: failed to build plugin");
                    continue;
                }
            };

            if let Err(e) = plugin.connect().await {
                warn!(instance = %config.instance_id, error = %e, "backfill: connect failed");
                continue;
            }

            match plugin.read_yesterday_energy_summary().await {
                Ok(Some(summary)) => {
                    let now_ms = Utc::now().timestamp_millis();
                    for (series_key, value) in summary {
                        if let Err(e) = self.store.insert_sample(now_ms, series_key.as_str(), value).await {
                            warn!(instance = %config.instance_id, series = %series_key, error = %e, "backfill: failed to persist sample");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(instance = %config.instance_id, error = %e, "backfill: yesterday summary read failed"),
            }

            plugin.disconnect().await;
        }
    }
}
