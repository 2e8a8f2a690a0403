//! Plugins shipped with the proxy

pub mod latency;
pub mod mock_response;

pub use latency::{LatencyConfig, LatencyPlugin};
pub use mock_response::{MockResponseConfig, MockResponsePlugin};

use super::registry::PluginRegistry;

pub fn register(registry: &mut PluginRegistry) {
    registry.register("latency", LatencyPlugin::factory);
    registry.register("mock-response", MockResponsePlugin::factory);
}
