pub mod certs;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod plugin;
pub mod proxy;
pub mod stdio;
pub mod watch;
pub mod watcher;
