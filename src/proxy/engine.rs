//! Exchange lifecycle for network traffic
//!
//! The engine is transport agnostic: the listener hands it [`Exchange`]s at
//! three points (request observed, response received, response finalized) and
//! asks it whether a CONNECT target should be decrypted. Everything plugins
//! see flows through here.

use super::commands::ProxyCommand;
use super::exchange::{Exchange, InterceptedResponse};
use super::process::{ProcessFilter, ProcessResolver, SystemProcessResolver};
use super::timeout::InactivityTimer;
use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::plugin::{
    spawn_log_dispatch, ChainOutcome, CorrelationKey, GlobalStore, LoadedPlugins, LogContext,
    MessageType, PluginSet, RequestLog, RequestLogger, ResponseState, SessionStore,
};
use crate::watch::{HeaderFilter, WatchSet};
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use http::header::VIA;
use http::{HeaderValue, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const VIA_MARKER: &str = concat!("1.1 intercept-proxy/", env!("CARGO_PKG_VERSION"));

/// What the listener should do with a request after [`InterceptEngine::on_request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDisposition {
    /// Not of interest; forward without involving plugins
    Ignored,
    /// Intercepted and not answered; forward upstream
    Forward,
    /// A plugin answered; send `exchange.response` back without contacting upstream
    Answered,
    /// The chain was cut short by shutdown; `exchange.response` holds a 503
    Aborted,
}

impl RequestDisposition {
    pub fn is_intercepted(self) -> bool {
        self != RequestDisposition::Ignored
    }

    /// Whether the request goes to its origin
    pub fn forwards(self) -> bool {
        matches!(self, RequestDisposition::Ignored | RequestDisposition::Forward)
    }
}

/// Per-exchange state that lives in the session map
#[derive(Debug, Default)]
struct ExchangeSession {
    store: SessionStore,
    response_state: ResponseState,
}

/// Removes a session from the map when dropped
struct SessionCleanup<'a> {
    engine: &'a InterceptEngine,
    key: CorrelationKey,
}

impl Drop for SessionCleanup<'_> {
    fn drop(&mut self) {
        self.engine.remove_session(self.key);
    }
}

pub struct InterceptEngine {
    config: Arc<ProxyConfig>,
    watch: WatchSet,
    hosts: WatchSet,
    header_filter: HeaderFilter,
    process_filter: ProcessFilter,
    resolver: Arc<dyn ProcessResolver>,
    plugins: PluginSet,
    sessions: DashMap<CorrelationKey, Arc<Mutex<ExchangeSession>>>,
    global: GlobalStore,
    logger: Arc<RequestLogger>,
    log_rx: StdMutex<Option<mpsc::UnboundedReceiver<RequestLog>>>,
    metrics: Arc<Metrics>,
    timer: OnceLock<InactivityTimer>,
    commands: mpsc::UnboundedSender<ProxyCommand>,
    command_rx: StdMutex<Option<mpsc::UnboundedReceiver<ProxyCommand>>>,
    connection_ids: AtomicU64,
    shutdown: CancellationToken,
}

impl InterceptEngine {
    pub fn new(config: ProxyConfig, loaded: LoadedPlugins) -> Self {
        let metrics = Arc::new(Metrics::new());
        let (logger, log_rx) = RequestLogger::new();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let hosts = loaded.watch.hosts();
        debug!(
            "Watching {} URL pattern(s), {} host pattern(s)",
            loaded.watch.len(),
            hosts.len()
        );

        Self {
            header_filter: HeaderFilter::new(config.filter_by_headers.clone()),
            process_filter: ProcessFilter::new(
                config.watch_pids.clone(),
                config.watch_process_names.clone(),
            ),
            config: Arc::new(config),
            watch: loaded.watch,
            hosts,
            resolver: Arc::new(SystemProcessResolver),
            plugins: loaded.plugins.with_metrics(metrics.clone()),
            sessions: DashMap::new(),
            global: GlobalStore::new(),
            logger,
            log_rx: StdMutex::new(Some(log_rx)),
            metrics,
            timer: OnceLock::new(),
            commands,
            command_rx: StdMutex::new(Some(command_rx)),
            connection_ids: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ProcessResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.plugins = self.plugins.clone().with_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    /// Start background work and run the startup hooks.
    ///
    /// Spawns the `AfterRequestLog` dispatcher and the command loop, runs
    /// `Initialize` then `OptionsLoaded`, and applies `record` and `timeout`.
    pub async fn start(self: &Arc<Self>) -> ChainOutcome {
        let log_rx = self.log_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(rx) = log_rx {
            spawn_log_dispatch(
                self.plugins.clone(),
                self.global.clone(),
                rx,
                self.shutdown.clone(),
            );
        }

        let command_rx = self
            .command_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rx) = command_rx {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.run_commands(rx).await });
        }

        if self
            .plugins
            .initialize(&self.global, &self.logger, &self.shutdown)
            .await
            .is_cancelled()
        {
            return ChainOutcome::Cancelled;
        }
        if self
            .plugins
            .options_loaded(&self.config, &self.global, &self.shutdown)
            .await
            .is_cancelled()
        {
            return ChainOutcome::Cancelled;
        }

        if self.config.record {
            self.start_recording();
        }

        if let Some(secs) = self.config.timeout {
            let commands = self.commands.clone();
            let timer = InactivityTimer::start(
                Duration::from_secs(secs),
                self.shutdown.clone(),
                move || {
                    let _ = commands.send(ProxyCommand::Shutdown);
                },
            );
            let _ = self.timer.set(timer);
        }

        info!(
            "Interception engine started with plugins: {}",
            self.plugins.names().join(", ")
        );
        ChainOutcome::Completed
    }

    async fn run_commands(&self, mut rx: mpsc::UnboundedReceiver<ProxyCommand>) {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = rx.recv() => command,
            };
            let Some(command) = command else { break };
            self.execute(command).await;
        }
        debug!("Command loop stopped");
    }

    /// Route a command into the engine
    pub async fn execute(&self, command: ProxyCommand) {
        debug!("Executing command: {}", command);
        match command {
            ProxyCommand::StartRecording => {
                self.start_recording();
            }
            ProxyCommand::StopRecording => {
                self.stop_recording().await;
            }
            ProxyCommand::MockRequest => {
                self.mock_request().await;
            }
            ProxyCommand::Shutdown => self.shutdown().await,
        }
    }

    pub fn command_sender(&self) -> mpsc::UnboundedSender<ProxyCommand> {
        self.commands.clone()
    }

    pub fn start_recording(&self) -> bool {
        let started = self.logger.start_recording();
        if started {
            info!("Recording started");
        } else {
            warn!("Already recording");
        }
        started
    }

    /// Stop recording and hand the captured logs to `AfterRecordingStop`
    pub async fn stop_recording(&self) -> Option<Vec<RequestLog>> {
        let Some(logs) = self.logger.stop_recording() else {
            warn!("Not recording");
            return None;
        };
        info!("Recording stopped with {} log entries", logs.len());
        self.plugins
            .after_recording_stop(&logs, &self.global, &self.logger, &self.shutdown)
            .await;
        Some(logs)
    }

    pub async fn mock_request(&self) -> ChainOutcome {
        self.plugins
            .mock_request(&self.global, &self.logger, &self.shutdown)
            .await
    }

    /// Stop the proxy: flush an active recording, then cancel everything
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self.logger.is_recording() {
            self.stop_recording().await;
        }
        info!("Shutting down interception engine");
        self.shutdown.cancel();
    }

    /// Decide, from the host alone, whether to decrypt a CONNECT tunnel
    pub async fn should_decrypt(&self, host: &str, client: Option<SocketAddr>) -> bool {
        if !self.hosts.is_watched(host) {
            return false;
        }
        self.process_allowed(client).await
    }

    async fn process_allowed(&self, client: Option<SocketAddr>) -> bool {
        if self.process_filter.is_empty() {
            return true;
        }
        let Some(client) = client else {
            return false;
        };

        let resolver = self.resolver.clone();
        let resolved = tokio::task::spawn_blocking(move || resolver.resolve(client))
            .await
            .ok()
            .flatten();

        match resolved {
            Some(process) => {
                let allowed = self.process_filter.matches(&process);
                debug!(
                    "Client {} is {} ({}), watched: {}",
                    client, process.name, process.pid, allowed
                );
                allowed
            }
            None => {
                debug!("Could not resolve process for {}", client);
                false
            }
        }
    }

    async fn should_intercept(&self, exchange: &Exchange) -> bool {
        if !self.watch.is_watched(exchange.url()) {
            return false;
        }
        if !self.header_filter.includes(&exchange.request.headers) {
            debug!("{} filtered out by headers", exchange.url());
            return false;
        }
        // decrypted tunnels were already checked against the process filter
        exchange.is_decrypted() || self.process_allowed(exchange.client()).await
    }

    fn log_exchange(&self, exchange: &Exchange, message: impl Into<String>, kind: MessageType) {
        let request = &exchange.request;
        self.logger.log(
            message,
            kind,
            LogContext::exchange(exchange.key(), request.method.as_str(), &request.url),
        );
    }

    /// Request observed. Runs `BeforeRequest` for intercepted exchanges.
    #[instrument(skip_all, fields(correlation = %exchange.key()))]
    pub async fn on_request(&self, exchange: &mut Exchange) -> RequestDisposition {
        if !self.should_intercept(exchange).await {
            return RequestDisposition::Ignored;
        }

        if let Some(timer) = self.timer.get() {
            timer.reset();
        }

        let key = exchange.key();
        let session = Arc::new(Mutex::new(ExchangeSession::default()));
        if self.sessions.insert(key, session.clone()).is_none() {
            self.metrics.active_sessions.inc();
        }
        self.metrics.requests_intercepted.inc();

        self.log_exchange(
            exchange,
            format!("{} {}", exchange.request.method, exchange.url()),
            MessageType::InterceptedRequest,
        );
        self.log_exchange(
            exchange,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            MessageType::Timestamp,
        );

        let mut guard = session.lock().await;
        let ExchangeSession {
            store,
            response_state,
        } = &mut *guard;

        let outcome = self
            .plugins
            .before_request(
                exchange,
                store,
                &self.global,
                response_state,
                &self.logger,
                &self.shutdown,
            )
            .await;
        if outcome.is_cancelled() {
            // later plugins never ran, so forwarding could bypass a mock
            self.log_exchange(
                exchange,
                "Proxy shutting down, request not forwarded",
                MessageType::Warning,
            );
            exchange.respond(InterceptedResponse::text(
                StatusCode::SERVICE_UNAVAILABLE,
                "Proxy shutting down",
            ));
            return RequestDisposition::Aborted;
        }

        if response_state.has_been_set() {
            if exchange.response.is_none() {
                self.log_exchange(
                    exchange,
                    "Exchange marked answered without a response",
                    MessageType::Warning,
                );
                exchange.respond(InterceptedResponse::text(
                    StatusCode::BAD_GATEWAY,
                    "Answered by a plugin without a response",
                ));
            }
            self.metrics.requests_answered.inc();
            return RequestDisposition::Answered;
        }

        exchange
            .request
            .headers
            .append(VIA, HeaderValue::from_static(VIA_MARKER));
        self.log_exchange(exchange, "Pass through", MessageType::PassedThrough);
        self.metrics.requests_passed_through.inc();
        RequestDisposition::Forward
    }

    /// Upstream response received. Runs `BeforeResponse` unless a plugin
    /// already answered the exchange.
    #[instrument(skip_all, fields(correlation = %exchange.key()))]
    pub async fn on_response(&self, exchange: &mut Exchange) {
        let Some(session) = self.session(exchange.key()) else {
            return;
        };
        if !self.watch.is_watched(exchange.url()) {
            return;
        }

        let mut guard = session.lock().await;
        let ExchangeSession {
            store,
            response_state,
        } = &mut *guard;
        if response_state.has_been_set() {
            return;
        }

        self.plugins
            .before_response(
                exchange,
                store,
                &self.global,
                response_state,
                &self.logger,
                &self.shutdown,
            )
            .await;
    }

    /// Response finalized. Runs `AfterResponse`, then drops the session.
    #[instrument(skip_all, fields(correlation = %exchange.key()))]
    pub async fn on_response_complete(&self, exchange: &Exchange) {
        let key = exchange.key();
        let Some(session) = self.session(key) else {
            return;
        };
        let _cleanup = SessionCleanup { engine: self, key };

        if !self.watch.is_watched(exchange.url()) {
            debug!("{} no longer watched", exchange.url());
            return;
        }

        let status = exchange
            .response
            .as_ref()
            .map(|r| r.status.as_u16().to_string())
            .unwrap_or_else(|| "-".to_string());
        self.log_exchange(
            exchange,
            format!("{} {}", status, exchange.url()),
            MessageType::InterceptedResponse,
        );

        let mut guard = session.lock().await;
        let answered = guard.response_state.has_been_set();
        self.plugins
            .after_response(
                exchange,
                &mut guard.store,
                &self.global,
                answered,
                &self.logger,
                &self.shutdown,
            )
            .await;
        drop(guard);

        self.log_exchange(
            exchange,
            format!("{} {}", exchange.request.method, exchange.url()),
            MessageType::FinishedProcessingRequest,
        );
    }

    fn session(&self, key: CorrelationKey) -> Option<Arc<Mutex<ExchangeSession>>> {
        self.sessions.get(&key).map(|entry| entry.value().clone())
    }

    fn remove_session(&self, key: CorrelationKey) {
        if self.sessions.remove(&key).is_some() {
            self.metrics.active_sessions.dec();
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, key: CorrelationKey) -> bool {
        self.sessions.contains_key(&key)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn watch(&self) -> &WatchSet {
        &self.watch
    }

    pub fn hosts(&self) -> &WatchSet {
        &self.hosts
    }

    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    pub fn global(&self) -> &GlobalStore {
        &self.global
    }

    pub fn logger(&self) -> &Arc<RequestLogger> {
        &self.logger
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::exchange::InterceptedRequest;
    use crate::proxy::process::{MockProcessResolver, ProcessInfo};
    use http::Method;

    fn engine(config: ProxyConfig, patterns: &[&str]) -> InterceptEngine {
        let loaded = LoadedPlugins {
            plugins: PluginSet::default(),
            watch: WatchSet::parse(patterns.iter().copied()).unwrap(),
        };
        InterceptEngine::new(config, loaded)
    }

    #[tokio::test]
    async fn test_tunnel_decision_uses_host_set() {
        let engine = engine(
            ProxyConfig::default(),
            &["https://api.example.com/*", "!https://api.example.com/admin/*"],
        );
        assert!(engine.should_decrypt("api.example.com", None).await);
        assert!(!engine.should_decrypt("other.example.com", None).await);
    }

    #[tokio::test]
    async fn test_process_filter_fails_closed() {
        let config = ProxyConfig {
            watch_process_names: vec!["curl".into()],
            ..ProxyConfig::default()
        };

        let mut resolver = MockProcessResolver::new();
        resolver.expect_resolve().returning(|addr| {
            (addr.port() == 1000).then(|| ProcessInfo {
                pid: 1,
                name: "curl".into(),
            })
        });
        let engine =
            engine(config, &["https://api.example.com/*"]).with_resolver(Arc::new(resolver));

        let curl: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let unknown: SocketAddr = "127.0.0.1:2000".parse().unwrap();
        assert!(engine.should_decrypt("api.example.com", Some(curl)).await);
        assert!(!engine.should_decrypt("api.example.com", Some(unknown)).await);
        assert!(!engine.should_decrypt("api.example.com", None).await);
    }

    #[tokio::test]
    async fn test_unwatched_request_is_ignored_without_session() {
        let engine = engine(ProxyConfig::default(), &["https://api.example.com/*"]);
        let mut exchange = Exchange::new(
            CorrelationKey::new(1, 0),
            InterceptedRequest::new(Method::GET, "https://elsewhere.test/"),
        );
        assert_eq!(engine.on_request(&mut exchange).await, RequestDisposition::Ignored);
        assert_eq!(engine.session_count(), 0);
        assert!(exchange.request.headers.get(VIA).is_none());
    }

    #[tokio::test]
    async fn test_passed_through_request_gets_via_marker() {
        let engine = engine(ProxyConfig::default(), &["https://api.example.com/*"]);
        let mut exchange = Exchange::new(
            CorrelationKey::new(1, 0),
            InterceptedRequest::new(Method::GET, "https://api.example.com/users"),
        );
        assert_eq!(engine.on_request(&mut exchange).await, RequestDisposition::Forward);
        assert_eq!(exchange.request.headers[VIA], VIA_MARKER);
        assert_eq!(engine.session_count(), 1);

        engine.on_response_complete(&exchange).await;
        assert_eq!(engine.session_count(), 0);
    }
}
