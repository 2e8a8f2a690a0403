//! Stdio interception
//!
//! Wraps a child process and relays its three standard streams through the
//! plugin chain. Plugins observe every chunk, may consume it, and may inject
//! bytes towards either side.

pub mod gate;
pub mod session;

pub use gate::WriteGate;
pub use session::{spawn_stdin_reader, StdioInterceptor, StdioOutcome};

use crate::plugin::CorrelationKey;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

/// Identity of a wrapped child process
#[derive(Debug, Clone)]
pub struct StdioSession {
    pub key: CorrelationKey,
    pub command: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub started: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdioStream {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for StdioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StdioStream::Stdin => "stdin",
            StdioStream::Stdout => "stdout",
            StdioStream::Stderr => "stderr",
        })
    }
}

/// Destination of bytes a plugin asks to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioTarget {
    Child,
    ParentStdout,
    ParentStderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioWrite {
    pub target: StdioTarget,
    pub payload: Bytes,
}
