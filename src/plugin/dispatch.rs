//! Sequential plugin chains
//!
//! Every hook runs against the loaded plugins one at a time, in configuration
//! order, awaiting each before the next starts. A plugin that errors or panics
//! is logged and skipped; the chain goes on. Only cancellation stops a chain.
//! Plugins are never skipped because the exchange was already answered; they
//! read [`ResponseState`] and decide for themselves.

use super::hooks::*;
use super::log::{RequestLog, RequestLogger, StdioRequestLog};
use super::state::{GlobalStore, ResponseState, SessionStore};
use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::proxy::Exchange;
use crate::stdio::{StdioSession, StdioStream, StdioWrite};
use crate::watch::WatchSet;
use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Initialize,
    OptionsLoaded,
    BeforeRequest,
    BeforeResponse,
    AfterResponse,
    AfterRequestLog,
    AfterRecordingStop,
    MockRequest,
    BeforeStdin,
    AfterStdout,
    AfterStderr,
    AfterStdioRequestLog,
    AfterStdioRecordingStop,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a single hook invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Completed,
    Faulted,
    Cancelled,
}

/// How a whole chain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Completed,
    Cancelled,
}

impl ChainOutcome {
    pub fn is_cancelled(self) -> bool {
        self == ChainOutcome::Cancelled
    }
}

/// A loaded plugin: its hooks plus the addresses it cares about
#[derive(Clone)]
pub struct Plugin {
    name: String,
    watch: Arc<WatchSet>,
    hooks: Arc<dyn ProxyPlugin>,
}

impl Plugin {
    pub fn new(name: impl Into<String>, watch: WatchSet, hooks: Arc<dyn ProxyPlugin>) -> Self {
        Self {
            name: name.into(),
            watch: Arc::new(watch),
            hooks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn watch(&self) -> &WatchSet {
        &self.watch
    }

    pub fn hooks(&self) -> &Arc<dyn ProxyPlugin> {
        &self.hooks
    }

    pub fn watches(&self, url: &str) -> bool {
        self.watch.is_watched(url)
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("watch", &self.watch.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Ordered plugin list with a method per hook
#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: Vec<Plugin>,
    metrics: Option<Arc<Metrics>>,
}

impl PluginSet {
    pub fn new(plugins: Vec<Plugin>) -> Self {
        Self {
            plugins,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(Plugin::name).collect()
    }

    /// Run one hook with fault isolation: errors and panics are logged and
    /// swallowed, cancellation wins over a hook still in flight.
    async fn invoke<F>(
        &self,
        plugin: &Plugin,
        hook: Hook,
        cancel: &CancellationToken,
        call: F,
    ) -> HookOutcome
    where
        F: Future<Output = PluginResult>,
    {
        if cancel.is_cancelled() {
            return HookOutcome::Cancelled;
        }

        trace!("Invoking {} on plugin '{}'", hook, plugin.name());
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("{} on plugin '{}' cancelled", hook, plugin.name());
                return HookOutcome::Cancelled;
            }
            result = AssertUnwindSafe(call).catch_unwind() => result,
        };

        let outcome = match result {
            Ok(Ok(())) => HookOutcome::Completed,
            Ok(Err(e)) => {
                error!(plugin = plugin.name(), hook = %hook, "Plugin hook failed: {}", e);
                HookOutcome::Faulted
            }
            Err(panic) => {
                error!(
                    plugin = plugin.name(),
                    hook = %hook,
                    "Plugin hook panicked: {}",
                    panic_message(panic.as_ref())
                );
                HookOutcome::Faulted
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_plugin_hook(started.elapsed(), outcome == HookOutcome::Faulted);
        }
        outcome
    }

    pub async fn initialize(
        &self,
        global: &GlobalStore,
        logger: &RequestLogger,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            let args = InitArgs {
                plugin: plugin.name(),
                global,
                logger,
                cancel,
            };
            let call = plugin.hooks().initialize(&args);
            if self.invoke(plugin, Hook::Initialize, cancel, call).await == HookOutcome::Cancelled {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    pub async fn options_loaded(
        &self,
        config: &ProxyConfig,
        global: &GlobalStore,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            let args = OptionsArgs {
                plugin: plugin.name(),
                config,
                global,
            };
            let call = plugin.hooks().options_loaded(&args);
            if self.invoke(plugin, Hook::OptionsLoaded, cancel, call).await
                == HookOutcome::Cancelled
            {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn before_request(
        &self,
        exchange: &mut Exchange,
        session: &mut SessionStore,
        global: &GlobalStore,
        response_state: &mut ResponseState,
        logger: &RequestLogger,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            if !plugin.watches(exchange.url()) {
                trace!("Plugin '{}' does not watch {}", plugin.name(), exchange.url());
                continue;
            }
            let mut args = RequestArgs {
                plugin: plugin.name(),
                exchange: &mut *exchange,
                session: &mut *session,
                global,
                response_state: &mut *response_state,
                logger,
                cancel,
            };
            let call = plugin.hooks().before_request(&mut args);
            if self.invoke(plugin, Hook::BeforeRequest, cancel, call).await
                == HookOutcome::Cancelled
            {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    pub async fn before_response(
        &self,
        exchange: &mut Exchange,
        session: &mut SessionStore,
        global: &GlobalStore,
        response_state: &mut ResponseState,
        logger: &RequestLogger,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            if !plugin.watches(exchange.url()) {
                continue;
            }
            let mut args = ResponseArgs {
                plugin: plugin.name(),
                exchange: &mut *exchange,
                session: &mut *session,
                global,
                response_state: &mut *response_state,
                logger,
                cancel,
            };
            let call = plugin.hooks().before_response(&mut args);
            if self.invoke(plugin, Hook::BeforeResponse, cancel, call).await
                == HookOutcome::Cancelled
            {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    pub async fn after_response(
        &self,
        exchange: &Exchange,
        session: &mut SessionStore,
        global: &GlobalStore,
        answered: bool,
        logger: &RequestLogger,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            if !plugin.watches(exchange.url()) {
                continue;
            }
            let mut args = CompletedArgs {
                plugin: plugin.name(),
                exchange,
                session: &mut *session,
                global,
                answered,
                logger,
                cancel,
            };
            let call = plugin.hooks().after_response(&mut args);
            if self.invoke(plugin, Hook::AfterResponse, cancel, call).await
                == HookOutcome::Cancelled
            {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    /// Fired for every log emission, independent of plugin watch sets
    pub async fn after_request_log(
        &self,
        log: &RequestLog,
        global: &GlobalStore,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            let args = RequestLogArgs {
                plugin: plugin.name(),
                log,
                global,
            };
            let call = plugin.hooks().after_request_log(&args);
            if self.invoke(plugin, Hook::AfterRequestLog, cancel, call).await
                == HookOutcome::Cancelled
            {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    pub async fn after_recording_stop(
        &self,
        logs: &[RequestLog],
        global: &GlobalStore,
        logger: &RequestLogger,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            let args = RecordingStopArgs {
                plugin: plugin.name(),
                logs,
                global,
                logger,
            };
            let call = plugin.hooks().after_recording_stop(&args);
            if self.invoke(plugin, Hook::AfterRecordingStop, cancel, call).await
                == HookOutcome::Cancelled
            {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    pub async fn mock_request(
        &self,
        global: &GlobalStore,
        logger: &RequestLogger,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            let args = MockRequestArgs {
                plugin: plugin.name(),
                global,
                logger,
                cancel,
            };
            let call = plugin.hooks().mock_request(&args);
            if self.invoke(plugin, Hook::MockRequest, cancel, call).await
                == HookOutcome::Cancelled
            {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    /// Run the chunk hook matching `stream` (BeforeStdin, AfterStdout or AfterStderr)
    #[allow(clippy::too_many_arguments)]
    pub async fn stdio_chunk(
        &self,
        session: &StdioSession,
        stream: StdioStream,
        chunk: &Bytes,
        store: &mut SessionStore,
        global: &GlobalStore,
        response_state: &mut ResponseState,
        writes: &mut Vec<StdioWrite>,
        logger: &RequestLogger,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        let hook = match stream {
            StdioStream::Stdin => Hook::BeforeStdin,
            StdioStream::Stdout => Hook::AfterStdout,
            StdioStream::Stderr => Hook::AfterStderr,
        };

        for plugin in &self.plugins {
            let mut args = StdioArgs {
                plugin: plugin.name(),
                session,
                stream,
                chunk,
                store: &mut *store,
                global,
                response_state: &mut *response_state,
                writes: &mut *writes,
                logger,
                cancel,
            };
            let hooks = plugin.hooks();
            let call = async {
                match stream {
                    StdioStream::Stdin => hooks.before_stdin(&mut args).await,
                    StdioStream::Stdout => hooks.after_stdout(&mut args).await,
                    StdioStream::Stderr => hooks.after_stderr(&mut args).await,
                }
            };
            if self.invoke(plugin, hook, cancel, call).await == HookOutcome::Cancelled {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    pub async fn after_stdio_request_log(
        &self,
        session: &StdioSession,
        log: &StdioRequestLog,
        global: &GlobalStore,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            let args = StdioLogArgs {
                plugin: plugin.name(),
                session,
                log,
                global,
            };
            let call = plugin.hooks().after_stdio_request_log(&args);
            if self.invoke(plugin, Hook::AfterStdioRequestLog, cancel, call).await
                == HookOutcome::Cancelled
            {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }

    pub async fn after_stdio_recording_stop(
        &self,
        session: &StdioSession,
        logs: &[StdioRequestLog],
        global: &GlobalStore,
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        for plugin in &self.plugins {
            let args = StdioRecordingStopArgs {
                plugin: plugin.name(),
                session,
                logs,
                global,
            };
            let call = plugin.hooks().after_stdio_recording_stop(&args);
            if self.invoke(plugin, Hook::AfterStdioRecordingStop, cancel, call).await
                == HookOutcome::Cancelled
            {
                return ChainOutcome::Cancelled;
            }
        }
        ChainOutcome::Completed
    }
}

impl fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.plugins.iter()).finish()
    }
}

/// Drain the logger's queue into the `AfterRequestLog` chain until the queue
/// closes or `cancel` fires.
pub fn spawn_log_dispatch(
    plugins: PluginSet,
    global: GlobalStore,
    mut rx: mpsc::UnboundedReceiver<RequestLog>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let log = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                log = rx.recv() => log,
            };
            let Some(log) = log else { break };
            if plugins.after_request_log(&log, &global, &cancel).await.is_cancelled() {
                break;
            }
        }
        debug!("Request log dispatch stopped");
    })
}
