//! Serialized writes to one outgoing stream
//!
//! Forwarded chunks and plugin-injected payloads for the same destination come
//! from different tasks. Each write holds the gate for the whole
//! `write_all` + `flush`, so payloads never interleave.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Parent-side writer with the concrete type erased
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct WriteGate<W> {
    name: &'static str,
    writer: Arc<Mutex<Option<W>>>,
}

impl<W> Clone for WriteGate<W> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            writer: self.writer.clone(),
        }
    }
}

impl<W: AsyncWrite + Send + Unpin> WriteGate<W> {
    pub fn new(name: &'static str, writer: W) -> Self {
        Self {
            name,
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Write and flush `bytes` as one uninterrupted unit
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, format!("{} is closed", self.name))
        })?;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Shut the writer down. Later writes fail with `BrokenPipe`.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}
