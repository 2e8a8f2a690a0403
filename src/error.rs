use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),

    #[error("Invalid watch pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("Plugin '{0}' has no URLs to watch")]
    NoUrlsToWatch(String),

    #[error("No plugins enabled")]
    NoPlugins,

    #[error("Plugin '{name}' rejected its configuration: {reason}")]
    PluginConfig { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind listener on {address}: {reason}")]
    BindFailed { address: String, reason: String },

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
}

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    #[error("Invalid certificate: {0}")]
    Invalid(String),

    #[error("Could not resolve a certificate directory")]
    NoStorageDir,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failure raised by a plugin hook. Always contained at the call site.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),

    #[error("Plugin I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Plugin serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plugin configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
