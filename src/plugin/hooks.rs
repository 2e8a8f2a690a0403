//! The hook surface every plugin implements
//!
//! All hooks have no-op defaults, so a plugin only overrides what it cares
//! about. Hooks receive borrowed views of the exchange and the stores; they
//! must not hold on to them past their own invocation.

use super::log::{LogContext, MessageType, RequestLog, RequestLogger, StdioRequestLog};
use super::state::{GlobalStore, ResponseState, SessionStore};
use crate::config::ProxyConfig;
use crate::error::PluginError;
use crate::proxy::Exchange;
use crate::stdio::{StdioSession, StdioStream, StdioTarget, StdioWrite};
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub type PluginResult = Result<(), PluginError>;

/// Passed once per plugin before traffic flows
pub struct InitArgs<'a> {
    pub plugin: &'a str,
    pub global: &'a GlobalStore,
    pub logger: &'a RequestLogger,
    pub cancel: &'a CancellationToken,
}

/// Passed once per plugin after every plugin has initialized
pub struct OptionsArgs<'a> {
    pub plugin: &'a str,
    pub config: &'a ProxyConfig,
    pub global: &'a GlobalStore,
}

/// `BeforeRequest` arguments
pub struct RequestArgs<'a> {
    pub plugin: &'a str,
    pub exchange: &'a mut Exchange,
    pub session: &'a mut SessionStore,
    pub global: &'a GlobalStore,
    pub response_state: &'a mut ResponseState,
    pub logger: &'a RequestLogger,
    pub cancel: &'a CancellationToken,
}

/// `BeforeResponse` arguments
pub struct ResponseArgs<'a> {
    pub plugin: &'a str,
    pub exchange: &'a mut Exchange,
    pub session: &'a mut SessionStore,
    pub global: &'a GlobalStore,
    pub response_state: &'a mut ResponseState,
    pub logger: &'a RequestLogger,
    pub cancel: &'a CancellationToken,
}

/// `AfterResponse` arguments. The response is final by now.
pub struct CompletedArgs<'a> {
    pub plugin: &'a str,
    pub exchange: &'a Exchange,
    pub session: &'a mut SessionStore,
    pub global: &'a GlobalStore,
    /// Whether a plugin answered instead of the upstream
    pub answered: bool,
    pub logger: &'a RequestLogger,
    pub cancel: &'a CancellationToken,
}

macro_rules! exchange_logging {
    ($args:ident) => {
        impl $args<'_> {
            /// Emit a log attributed to this plugin and exchange
            pub fn log(&self, message: impl Into<String>, message_type: MessageType) -> RequestLog {
                let request = &self.exchange.request;
                let context =
                    LogContext::exchange(self.exchange.key(), request.method.as_str(), &request.url)
                        .with_plugin(self.plugin);
                self.logger.log(message, message_type, context)
            }
        }
    };
}

exchange_logging!(RequestArgs);
exchange_logging!(ResponseArgs);
exchange_logging!(CompletedArgs);

pub struct RequestLogArgs<'a> {
    pub plugin: &'a str,
    pub log: &'a RequestLog,
    pub global: &'a GlobalStore,
}

pub struct RecordingStopArgs<'a> {
    pub plugin: &'a str,
    pub logs: &'a [RequestLog],
    pub global: &'a GlobalStore,
    pub logger: &'a RequestLogger,
}

pub struct MockRequestArgs<'a> {
    pub plugin: &'a str,
    pub global: &'a GlobalStore,
    pub logger: &'a RequestLogger,
    pub cancel: &'a CancellationToken,
}

/// Arguments for the per-chunk stdio hooks
pub struct StdioArgs<'a> {
    pub plugin: &'a str,
    pub session: &'a StdioSession,
    pub stream: StdioStream,
    pub chunk: &'a Bytes,
    pub store: &'a mut SessionStore,
    pub global: &'a GlobalStore,
    pub response_state: &'a mut ResponseState,
    pub writes: &'a mut Vec<StdioWrite>,
    pub logger: &'a RequestLogger,
    pub cancel: &'a CancellationToken,
}

impl StdioArgs<'_> {
    /// Queue bytes for the child's stdin
    pub fn send_to_child(&mut self, payload: impl Into<Bytes>) {
        self.writes.push(StdioWrite {
            target: StdioTarget::Child,
            payload: payload.into(),
        });
    }

    /// Queue bytes for the parent's stdout, as if the child had written them
    pub fn respond(&mut self, payload: impl Into<Bytes>) {
        self.writes.push(StdioWrite {
            target: StdioTarget::ParentStdout,
            payload: payload.into(),
        });
    }

    pub fn respond_stderr(&mut self, payload: impl Into<Bytes>) {
        self.writes.push(StdioWrite {
            target: StdioTarget::ParentStderr,
            payload: payload.into(),
        });
    }

    /// Consume the chunk and answer it on the parent's stdout
    pub fn answer(&mut self, payload: impl Into<Bytes>) {
        self.response_state.set();
        self.respond(payload);
    }

    pub fn log(&self, message: impl Into<String>, message_type: MessageType) -> RequestLog {
        let context = LogContext {
            key: Some(self.session.key),
            method: None,
            url: None,
            plugin: Some(self.plugin),
        };
        self.logger.log(message, message_type, context)
    }
}

pub struct StdioLogArgs<'a> {
    pub plugin: &'a str,
    pub session: &'a StdioSession,
    pub log: &'a StdioRequestLog,
    pub global: &'a GlobalStore,
}

pub struct StdioRecordingStopArgs<'a> {
    pub plugin: &'a str,
    pub session: &'a StdioSession,
    pub logs: &'a [StdioRequestLog],
    pub global: &'a GlobalStore,
}

/// A unit of extension logic reacting to lifecycle events
#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    async fn initialize(&self, _args: &InitArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn options_loaded(&self, _args: &OptionsArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn before_request(&self, _args: &mut RequestArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn before_response(&self, _args: &mut ResponseArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn after_response(&self, _args: &mut CompletedArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn after_request_log(&self, _args: &RequestLogArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn after_recording_stop(&self, _args: &RecordingStopArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn mock_request(&self, _args: &MockRequestArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn before_stdin(&self, _args: &mut StdioArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn after_stdout(&self, _args: &mut StdioArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn after_stderr(&self, _args: &mut StdioArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn after_stdio_request_log(&self, _args: &StdioLogArgs<'_>) -> PluginResult {
        Ok(())
    }

    async fn after_stdio_recording_stop(&self, _args: &StdioRecordingStopArgs<'_>) -> PluginResult {
        Ok(())
    }
}
