use super::schema::ProxyConfig;

/// Command-line overrides layered on top of the loaded configuration
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub ip_address: Option<String>,
    /// Replaces the configured watch patterns when non-empty
    pub urls_to_watch: Vec<String>,
    /// Only ever turns recording on
    pub record: bool,
    pub timeout: Option<u64>,
    pub watch_pids: Vec<u32>,
    pub watch_process_names: Vec<String>,
}

impl CliOverrides {
    pub fn is_empty(&self) -> bool {
        self.port.is_none()
            && self.ip_address.is_none()
            && self.urls_to_watch.is_empty()
            && !self.record
            && self.timeout.is_none()
            && self.watch_pids.is_empty()
            && self.watch_process_names.is_empty()
    }

    /// Apply every override that was given
    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ip) = &self.ip_address {
            config.ip_address = ip.clone();
        }
        if !self.urls_to_watch.is_empty() {
            config.urls_to_watch = self.urls_to_watch.clone();
        }
        if self.record {
            config.record = true;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = Some(timeout);
        }
        if !self.watch_pids.is_empty() {
            config.watch_pids = self.watch_pids.clone();
        }
        if !self.watch_process_names.is_empty() {
            config.watch_process_names = self.watch_process_names.clone();
        }

        if !self.is_empty() {
            tracing::debug!("Applied command-line overrides");
        }
    }
}
