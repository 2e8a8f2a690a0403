//! Delays matched requests by a random amount

use crate::error::PluginError;
use crate::plugin::hooks::{PluginResult, ProxyPlugin, RequestArgs};
use crate::plugin::log::MessageType;
use crate::plugin::registry::PluginContext;
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LatencyConfig {
    #[serde(default)]
    pub min_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_max_ms() -> u64 {
    5000
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            min_ms: 0,
            max_ms: default_max_ms(),
        }
    }
}

pub struct LatencyPlugin {
    config: LatencyConfig,
}

impl LatencyPlugin {
    pub fn new(config: LatencyConfig) -> Result<Self, PluginError> {
        if config.min_ms > config.max_ms {
            return Err(PluginError::Config(format!(
                "minMs ({}) must not exceed maxMs ({})",
                config.min_ms, config.max_ms
            )));
        }
        Ok(Self { config })
    }

    pub fn factory(ctx: &PluginContext<'_>) -> Result<Arc<dyn ProxyPlugin>, PluginError> {
        let config = if ctx.config.is_null() {
            LatencyConfig::default()
        } else {
            LatencyConfig::deserialize(ctx.config)?
        };
        Ok(Arc::new(Self::new(config)?))
    }

    fn pick_delay(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.config.min_ms..=self.config.max_ms);
        Duration::from_millis(ms)
    }
}

#[async_trait]
impl ProxyPlugin for LatencyPlugin {
    async fn before_request(&self, args: &mut RequestArgs<'_>) -> PluginResult {
        let delay = self.pick_delay();
        args.log(
            format!("Delaying request for {}ms", delay.as_millis()),
            MessageType::Chaos,
        );

        tokio::select! {
            _ = args.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    #[test]
    fn test_delay_stays_in_range() {
        let plugin = LatencyPlugin::new(LatencyConfig {
            min_ms: 10,
            max_ms: 20,
        })
        .unwrap();
        for _ in 0..100 {
            let delay = plugin.pick_delay();
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_inverted_range_rejected() {
        let ctx_config = json!({"minMs": 50, "maxMs": 10});
        let ctx = PluginContext {
            name: "latency",
            config: &ctx_config,
            base_dir: Path::new("."),
        };
        assert!(matches!(
            LatencyPlugin::factory(&ctx),
            Err(PluginError::Config(_))
        ));
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let ctx = PluginContext {
            name: "latency",
            config: &serde_json::Value::Null,
            base_dir: Path::new("."),
        };
        assert!(LatencyPlugin::factory(&ctx).is_ok());
    }
}
