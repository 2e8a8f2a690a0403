use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;
use std::time::Instant;

pub struct Metrics {
    registry: Registry,

    // Exchange metrics
    pub requests_total: IntCounter,
    pub requests_intercepted: IntCounter,
    pub requests_passed_through: IntCounter,
    pub requests_answered: IntCounter,
    pub upstream_errors: IntCounter,
    pub request_duration: Histogram,
    pub active_sessions: IntGauge,

    // Connection metrics
    pub active_connections: IntGauge,
    pub tunnels_decrypted: IntCounter,
    pub tunnels_blind: IntCounter,
    pub tls_errors: IntCounter,

    // Plugin metrics
    pub plugin_hooks_total: IntCounter,
    pub plugin_faults_total: IntCounter,
    pub plugin_hook_duration: Histogram,

    // Stdio metrics
    pub stdio_chunks_total: IntCounter,
    pub stdio_chunks_consumed: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric creation failed")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("metric creation failed")
}

fn histogram(name: &str, help: &str) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help)).expect("metric creation failed")
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = counter(
            "intercept_proxy_requests_total",
            "Total number of requests seen by the proxy",
        );
        let requests_intercepted = counter(
            "intercept_proxy_requests_intercepted_total",
            "Requests that matched the watch set and header filter",
        );
        let requests_passed_through = counter(
            "intercept_proxy_requests_passed_through_total",
            "Intercepted requests forwarded upstream",
        );
        let requests_answered = counter(
            "intercept_proxy_requests_answered_total",
            "Intercepted requests answered by a plugin",
        );
        let upstream_errors = counter(
            "intercept_proxy_upstream_errors_total",
            "Upstream requests that failed",
        );
        let request_duration = histogram(
            "intercept_proxy_request_duration_seconds",
            "Request duration in seconds",
        );
        let active_sessions = gauge(
            "intercept_proxy_active_sessions",
            "Exchanges with live session state",
        );

        let active_connections = gauge(
            "intercept_proxy_active_connections",
            "Number of active client connections",
        );
        let tunnels_decrypted = counter(
            "intercept_proxy_tunnels_decrypted_total",
            "CONNECT tunnels terminated with a minted certificate",
        );
        let tunnels_blind = counter(
            "intercept_proxy_tunnels_blind_total",
            "CONNECT tunnels relayed without decryption",
        );
        let tls_errors = counter(
            "intercept_proxy_tls_errors_total",
            "TLS handshakes that failed",
        );

        let plugin_hooks_total = counter(
            "intercept_proxy_plugin_hooks_total",
            "Total number of plugin hook invocations",
        );
        let plugin_faults_total = counter(
            "intercept_proxy_plugin_faults_total",
            "Plugin hooks that returned an error or panicked",
        );
        let plugin_hook_duration = histogram(
            "intercept_proxy_plugin_hook_duration_seconds",
            "Plugin hook duration in seconds",
        );

        let stdio_chunks_total = counter(
            "intercept_proxy_stdio_chunks_total",
            "Chunks read from any stdio stream",
        );
        let stdio_chunks_consumed = counter(
            "intercept_proxy_stdio_chunks_consumed_total",
            "Stdio chunks consumed by a plugin instead of forwarded",
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(requests_total.clone()),
            Box::new(requests_intercepted.clone()),
            Box::new(requests_passed_through.clone()),
            Box::new(requests_answered.clone()),
            Box::new(upstream_errors.clone()),
            Box::new(request_duration.clone()),
            Box::new(active_sessions.clone()),
            Box::new(active_connections.clone()),
            Box::new(tunnels_decrypted.clone()),
            Box::new(tunnels_blind.clone()),
            Box::new(tls_errors.clone()),
            Box::new(plugin_hooks_total.clone()),
            Box::new(plugin_faults_total.clone()),
            Box::new(plugin_hook_duration.clone()),
            Box::new(stdio_chunks_total.clone()),
            Box::new(stdio_chunks_consumed.clone()),
        ];
        for collector in collectors {
            if let Err(e) = registry.register(collector) {
                tracing::warn!("Failed to register metric: {e}");
            }
        }

        Self {
            registry,
            requests_total,
            requests_intercepted,
            requests_passed_through,
            requests_answered,
            upstream_errors,
            request_duration,
            active_sessions,
            active_connections,
            tunnels_decrypted,
            tunnels_blind,
            tls_errors,
            plugin_hooks_total,
            plugin_faults_total,
            plugin_hook_duration,
            stdio_chunks_total,
            stdio_chunks_consumed,
        }
    }

    pub fn record_tunnel(&self, decrypted: bool) {
        if decrypted {
            self.tunnels_decrypted.inc();
        } else {
            self.tunnels_blind.inc();
        }
    }

    pub fn record_plugin_hook(&self, duration: std::time::Duration, faulted: bool) {
        self.plugin_hooks_total.inc();
        self.plugin_hook_duration.observe(duration.as_secs_f64());
        if faulted {
            self.plugin_faults_total.inc();
        }
    }

    pub fn record_stdio_chunk(&self, consumed: bool) {
        self.stdio_chunks_total.inc();
        if consumed {
            self.stdio_chunks_consumed.inc();
        }
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of every registered metric
    pub fn gather_text(&self) -> String {
        use prometheus::Encoder;
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(e) = encoder.encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

pub struct RequestTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.requests_total.inc();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        self.metrics
            .request_duration
            .observe(self.start.elapsed().as_secs_f64());
    }

    pub fn fail(self) {
        self.metrics.upstream_errors.inc();
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text_contains_registered_metrics() {
        let metrics = Metrics::new();
        metrics.record_tunnel(true);
        metrics.record_plugin_hook(std::time::Duration::from_millis(3), true);

        let text = metrics.gather_text();
        assert!(text.contains("intercept_proxy_tunnels_decrypted_total 1"));
        assert!(text.contains("intercept_proxy_plugin_faults_total 1"));
    }

    #[test]
    fn test_request_timer_counts() {
        let metrics = Arc::new(Metrics::new());
        RequestTimer::new(metrics.clone()).finish();
        RequestTimer::new(metrics.clone()).fail();
        assert_eq!(metrics.requests_total.get(), 2);
        assert_eq!(metrics.upstream_errors.get(), 1);
    }
}
