use anyhow::Context;
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use intercept_proxy::certs::{CertificateAuthority, CertificateCache};
use intercept_proxy::config::{self, CliOverrides, ProxyConfig};
use intercept_proxy::logging::{self, LogOptions, LogTarget};
use intercept_proxy::metrics::Metrics;
use intercept_proxy::plugin::{
    spawn_log_dispatch, GlobalStore, PluginRegistry, RequestLogger, RunMode,
};
use intercept_proxy::proxy::{spawn_terminal_reader, InterceptEngine, ProxyServer, KEY_HELP};
use intercept_proxy::stdio::StdioInterceptor;
use intercept_proxy::watch::WatchSet;

#[derive(Parser, Debug)]
#[command(name = "intercept-proxy", version)]
#[command(about = "Intercept HTTP(S) and stdio traffic and run it through a plugin chain", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Port to listen on
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Address to listen on
    #[arg(long, global = true)]
    ip_address: Option<String>,

    /// URL patterns to watch, replacing the configured ones
    #[arg(short, long, value_delimiter = ',', global = true)]
    urls_to_watch: Vec<String>,

    /// Start recording immediately
    #[arg(long, global = true)]
    record: bool,

    /// Shut down after this many seconds without intercepted requests
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// Only intercept traffic from these process ids
    #[arg(long, value_delimiter = ',', global = true)]
    watch_pids: Vec<u32>,

    /// Only intercept traffic from processes with these names
    #[arg(long, value_delimiter = ',', global = true)]
    watch_process_names: Vec<String>,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            port: self.port,
            ip_address: self.ip_address.clone(),
            urls_to_watch: self.urls_to_watch.clone(),
            record: self.record,
            timeout: self.timeout,
            watch_pids: self.watch_pids.clone(),
            watch_process_names: self.watch_process_names.clone(),
        }
    }

    /// Relative paths in plugin configuration resolve against the config file
    fn base_dir(&self) -> anyhow::Result<PathBuf> {
        match self.config.as_deref().and_then(Path::parent) {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.to_path_buf()),
            _ => std::env::current_dir().context("Failed to resolve working directory"),
        }
    }
}

#[derive(Debug, Clone, clap::Subcommand)]
enum Command {
    /// Run the HTTP(S) proxy (default)
    Run,
    /// Wrap a child process and intercept its stdio
    Stdio {
        /// Command and arguments to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Manage the certificate cache
    Cert {
        #[command(subcommand)]
        action: CertAction,
    },
}

#[derive(Debug, Clone, clap::Subcommand)]
enum CertAction {
    /// Print the root certificate path, creating the root if needed
    Path,
    /// Delete cached leaf certificates
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let command = args.command.clone().unwrap_or(Command::Run);

    // stdout carries the child's protocol in stdio mode
    let target = match command {
        Command::Stdio { .. } => LogTarget::File(logging::default_log_dir()),
        _ => LogTarget::Terminal,
    };
    let _log_guard = logging::init(&LogOptions {
        debug: args.debug,
        json: args.json_logs,
        target,
    });

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => config::load_from_env_or_file().context("Failed to load configuration")?,
    };
    args.overrides().apply(&mut config);
    config::validate(&config)?;

    match command {
        Command::Run => {
            run_proxy(config, &args.base_dir()?).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stdio { command } => run_stdio(config, &args.base_dir()?, &command).await,
        Command::Cert { action } => {
            run_cert(&config, action)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_proxy(config: ProxyConfig, base_dir: &Path) -> anyhow::Result<()> {
    let global = WatchSet::parse(&config.urls_to_watch)?;
    let loaded = PluginRegistry::with_builtins().load(
        &config.plugins,
        global,
        RunMode::Network,
        base_dir,
    )?;

    let cache = CertificateCache::resolve(config.cert_dir.as_deref())?;
    let authority = CertificateAuthority::load_or_create(cache)
        .context("Failed to load the root certificate")?;
    if authority.created_root() && config.install_cert {
        warn!(
            "Created a new root certificate. Trust {} to intercept HTTPS traffic",
            authority.root_path().display()
        );
    }

    let address = format!("{}:{}", config.ip_address, config.port);
    let as_system_proxy = config.as_system_proxy;

    let engine = Arc::new(InterceptEngine::new(config, loaded));
    if engine.start().await.is_cancelled() {
        return Ok(());
    }

    let server = Arc::new(ProxyServer::new(engine.clone(), Some(Arc::new(authority)))?);
    let listener = server.bind().await?;
    if as_system_proxy {
        info!("Point HTTP_PROXY and HTTPS_PROXY at http://{}", address);
    }

    if std::io::stdin().is_terminal() {
        spawn_terminal_reader(engine.command_sender());
        info!("{}", KEY_HELP);
    }

    let server_handle = tokio::spawn(server.serve(listener));

    let shutdown = engine.shutdown_token();
    tokio::select! {
        _ = shutdown_signal() => engine.shutdown().await,
        _ = shutdown.cancelled() => {}
    }

    info!("Shutting down intercept proxy");
    match tokio::time::timeout(Duration::from_secs(10), server_handle).await {
        Ok(Ok(Ok(()))) => info!("Graceful shutdown completed"),
        Ok(Ok(Err(e))) => error!("Proxy server error: {}", e),
        Ok(Err(e)) => error!("Proxy server task failed: {}", e),
        Err(_) => error!("Shutdown timeout exceeded"),
    }
    debug!("Final metrics:\n{}", engine.metrics().gather_text());

    Ok(())
}

async fn run_stdio(
    config: ProxyConfig,
    base_dir: &Path,
    command: &[String],
) -> anyhow::Result<ExitCode> {
    let (program, program_args) = command.split_first().context("No command to run")?;

    let global = WatchSet::parse(&config.urls_to_watch)?;
    let loaded = PluginRegistry::with_builtins().load(
        &config.plugins,
        global,
        RunMode::Stdio,
        base_dir,
    )?;

    let metrics = Arc::new(Metrics::new());
    let plugins = loaded.plugins.with_metrics(metrics.clone());
    let store = GlobalStore::new();
    let (logger, log_rx) = RequestLogger::new();
    let cancel = CancellationToken::new();

    spawn_log_dispatch(plugins.clone(), store.clone(), log_rx, cancel.clone());
    plugins.initialize(&store, &logger, &cancel).await;
    plugins.options_loaded(&config, &store, &cancel).await;

    let signals = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let interceptor = StdioInterceptor::new(plugins, store, logger, metrics)
        .with_chunk_size(config.stdio_chunk_size);
    let outcome = interceptor
        .run_process(program, program_args, cancel.clone())
        .await
        .with_context(|| format!("Failed to run '{program}'"))?;

    signals.abort();
    cancel.cancel();
    info!(
        "Session finished with {} exchange(s) logged",
        outcome.logs.len()
    );

    let code = outcome
        .status
        .and_then(|status| status.code())
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1);
    Ok(ExitCode::from(code))
}

fn run_cert(config: &ProxyConfig, action: CertAction) -> anyhow::Result<()> {
    let cache = CertificateCache::resolve(config.cert_dir.as_deref())?;
    match action {
        CertAction::Path => {
            let authority = CertificateAuthority::load_or_create(cache)?;
            println!("{}", authority.root_path().display());
        }
        CertAction::Clear => {
            cache.clear();
            info!("Cleared leaf certificates in {}", cache.leaf_dir().display());
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
