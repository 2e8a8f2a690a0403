//! Tracing subscriber setup

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "intercept-proxy.log";

/// Where log lines go
#[derive(Debug, Clone)]
pub enum LogTarget {
    /// Terminal (stderr), used when proxying network traffic
    Terminal,
    /// Daily rolling file in a directory; stdout is left to the relayed protocol
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub debug: bool,
    pub json: bool,
    pub target: LogTarget,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            json: false,
            target: LogTarget::Terminal,
        }
    }
}

fn env_filter(debug: bool) -> EnvFilter {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env();
    match format!("intercept_proxy={level}").parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Default directory for log files in stdio mode
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("intercept-proxy").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Install the global subscriber.
///
/// The returned guard flushes file output on drop and must be held for the
/// lifetime of the process.
pub fn init(options: &LogOptions) -> Option<WorkerGuard> {
    let filter = env_filter(options.debug);

    match &options.target {
        LogTarget::Terminal => {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr);
            let result = if options.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            if let Err(e) = result {
                eprintln!("Logging already initialized: {e}");
            }
            None
        }
        LogTarget::File(dir) => {
            let (writer, guard) = file_writer(dir);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer);
            let result = if options.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            if let Err(e) = result {
                eprintln!("Logging already initialized: {e}");
            }
            Some(guard)
        }
    }
}

fn file_writer(dir: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    tracing_appender::non_blocking(appender)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_log_to_terminal() {
        let options = LogOptions::default();
        assert!(!options.debug);
        assert!(matches!(options.target, LogTarget::Terminal));
    }

    #[test]
    fn test_log_dir_is_app_specific() {
        let dir = default_log_dir();
        assert!(dir.ends_with("logs"));
    }
}
