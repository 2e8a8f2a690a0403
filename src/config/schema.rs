use crate::watch::HeaderRule;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ip_address")]
    pub ip_address: String,
    #[serde(default)]
    pub urls_to_watch: Vec<String>,
    #[serde(default)]
    pub filter_by_headers: Vec<HeaderRule>,
    #[serde(default)]
    pub watch_pids: Vec<u32>,
    #[serde(default)]
    pub watch_process_names: Vec<String>,
    /// Inactivity timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub record: bool,
    #[serde(default = "default_true")]
    pub install_cert: bool,
    #[serde(default = "default_true")]
    pub as_system_proxy: bool,
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
    #[serde(default = "default_stdio_chunk_size")]
    pub stdio_chunk_size: usize,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub urls_to_watch: Option<Vec<String>>,
    /// Plugin-specific settings, parsed by the plugin itself
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl PluginEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            urls_to_watch: None,
            config: None,
        }
    }

    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls_to_watch = Some(urls.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ip_address: default_ip_address(),
            urls_to_watch: Vec::new(),
            filter_by_headers: Vec::new(),
            watch_pids: Vec::new(),
            watch_process_names: Vec::new(),
            timeout: None,
            record: false,
            install_cert: true,
            as_system_proxy: true,
            cert_dir: None,
            stdio_chunk_size: default_stdio_chunk_size(),
            plugins: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    8000
}

fn default_ip_address() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stdio_chunk_size() -> usize {
    8192
}
