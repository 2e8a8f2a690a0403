//! Categorized request logs and the recording buffer
//!
//! Every log emitted while handling traffic goes through [`RequestLogger`]. It
//! is mirrored to `tracing`, appended to the recording buffer when recording is
//! active, and queued for the `AfterRequestLog` plugin chain.

use super::state::CorrelationKey;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Normal,
    InterceptedRequest,
    PassedThrough,
    Warning,
    Tip,
    Failed,
    Chaos,
    Mocked,
    InterceptedResponse,
    FinishedProcessingRequest,
    Skipped,
    Processed,
    Timestamp,
}

impl MessageType {
    fn label(self) -> &'static str {
        match self {
            MessageType::Normal => "log",
            MessageType::InterceptedRequest => "req",
            MessageType::PassedThrough => "api",
            MessageType::Warning => "warn",
            MessageType::Tip => "tip",
            MessageType::Failed => "fail",
            MessageType::Chaos => "oops",
            MessageType::Mocked => "mock",
            MessageType::InterceptedResponse => "res",
            MessageType::FinishedProcessingRequest => "done",
            MessageType::Skipped => "skip",
            MessageType::Processed => "proc",
            MessageType::Timestamp => "time",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single categorized log entry tied to an exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    /// Global emission order
    pub sequence: u64,
    pub message: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<CorrelationKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Where a log entry came from
#[derive(Debug, Clone, Copy, Default)]
pub struct LogContext<'a> {
    pub key: Option<CorrelationKey>,
    pub method: Option<&'a str>,
    pub url: Option<&'a str>,
    pub plugin: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    pub fn exchange(key: CorrelationKey, method: &'a str, url: &'a str) -> Self {
        Self {
            key: Some(key),
            method: Some(method),
            url: Some(url),
            plugin: None,
        }
    }

    pub fn with_plugin(mut self, plugin: &'a str) -> Self {
        self.plugin = Some(plugin);
        self
    }
}

/// One stdin message paired with the output chunk that followed it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioRequestLog {
    pub key: CorrelationKey,
    #[serde(with = "lossy_bytes")]
    pub stdin: Option<Bytes>,
    #[serde(with = "lossy_bytes")]
    pub stdout: Option<Bytes>,
    #[serde(with = "lossy_bytes")]
    pub stderr: Option<Bytes>,
    pub request_timestamp: Option<DateTime<Utc>>,
    pub response_timestamp: Option<DateTime<Utc>>,
}

impl StdioRequestLog {
    pub fn is_request_only(&self) -> bool {
        self.stdin.is_some() && self.stdout.is_none() && self.stderr.is_none()
    }
}

mod lossy_bytes {
    use bytes::Bytes;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&String::from_utf8_lossy(bytes)),
            None => serializer.serialize_none(),
        }
    }
}

#[derive(Debug, Default)]
struct Recording {
    next_sequence: u64,
    active: bool,
    entries: Vec<RequestLog>,
}

pub struct RequestLogger {
    recording: Mutex<Recording>,
    dispatch: mpsc::UnboundedSender<RequestLog>,
}

impl RequestLogger {
    /// Create a logger and the receiving end of its dispatch queue
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RequestLog>) {
        let (dispatch, rx) = mpsc::unbounded_channel();
        let logger = Arc::new(Self {
            recording: Mutex::new(Recording::default()),
            dispatch,
        });
        (logger, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        // entries are plain data, a panicked writer cannot leave them torn
        self.recording.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn log(
        &self,
        message: impl Into<String>,
        message_type: MessageType,
        context: LogContext<'_>,
    ) -> RequestLog {
        let message = message.into();

        let entry = {
            let mut recording = self.lock();
            let sequence = recording.next_sequence;
            recording.next_sequence += 1;

            let entry = RequestLog {
                sequence,
                message,
                message_type,
                plugin: context.plugin.map(str::to_string),
                key: context.key,
                method: context.method.map(str::to_string),
                url: context.url.map(str::to_string),
                timestamp: Utc::now(),
            };
            if recording.active {
                recording.entries.push(entry.clone());
            }
            entry
        };

        mirror(&entry);

        // a closed queue only means no one listens for AfterRequestLog anymore
        let _ = self.dispatch.send(entry.clone());
        entry
    }

    /// Begin buffering logs. Returns false when already recording.
    pub fn start_recording(&self) -> bool {
        let mut recording = self.lock();
        if recording.active {
            return false;
        }
        recording.active = true;
        recording.entries.clear();
        true
    }

    /// Stop buffering and take every log captured since the start.
    /// Returns `None` when not recording.
    pub fn stop_recording(&self) -> Option<Vec<RequestLog>> {
        let mut recording = self.lock();
        if !recording.active {
            return None;
        }
        recording.active = false;
        Some(std::mem::take(&mut recording.entries))
    }

    pub fn is_recording(&self) -> bool {
        self.lock().active
    }
}

fn mirror(entry: &RequestLog) {
    let key = entry.key.map(|k| k.to_string()).unwrap_or_default();
    let plugin = entry.plugin.as_deref().unwrap_or("");
    match entry.message_type {
        MessageType::Failed => {
            tracing::error!(kind = %entry.message_type, correlation = %key, plugin = %plugin, "{}", entry.message)
        }
        MessageType::Warning => {
            tracing::warn!(kind = %entry.message_type, correlation = %key, plugin = %plugin, "{}", entry.message)
        }
        MessageType::Timestamp | MessageType::Skipped => {
            tracing::debug!(kind = %entry.message_type, correlation = %key, plugin = %plugin, "{}", entry.message)
        }
        _ => tracing::info!(kind = %entry.message_type, correlation = %key, plugin = %plugin, "{}", entry.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logs_reach_dispatch_queue_in_order() {
        let (logger, mut rx) = RequestLogger::new();
        logger.log("first", MessageType::Normal, LogContext::default());
        logger.log("second", MessageType::Tip, LogContext::default());

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.message, "first");
        assert_eq!(b.message, "second");
        assert!(a.sequence < b.sequence);
    }

    #[test]
    fn test_recording_captures_only_while_active() {
        let (logger, _rx) = RequestLogger::new();
        logger.log("before", MessageType::Normal, LogContext::default());
        assert!(logger.stop_recording().is_none());

        assert!(logger.start_recording());
        assert!(!logger.start_recording());
        logger.log("during", MessageType::Normal, LogContext::default());
        let logs = logger.stop_recording().unwrap();
        logger.log("after", MessageType::Normal, LogContext::default());

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "during");
        assert!(!logger.is_recording());
    }

    #[test]
    fn test_logging_survives_closed_queue() {
        let (logger, rx) = RequestLogger::new();
        drop(rx);
        let entry = logger.log(
            "orphan",
            MessageType::Warning,
            LogContext::exchange(CorrelationKey::new(1, 0), "GET", "https://a.test/"),
        );
        assert_eq!(entry.url.as_deref(), Some("https://a.test/"));
    }

    #[test]
    fn test_message_type_serializes_camel_case() {
        let json = serde_json::to_string(&MessageType::FinishedProcessingRequest).unwrap();
        assert_eq!(json, "\"finishedProcessingRequest\"");
    }
}
