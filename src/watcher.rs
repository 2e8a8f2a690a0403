//! Debounced file watching
//!
//! `notify` delivers raw filesystem events on its own thread. They are funneled
//! into a single task that waits for the burst to settle (each new event resets
//! the wait) and then publishes one [`FileChanged`] on a channel.

use notify::{EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChanged {
    pub path: PathBuf,
}

pub struct FileWatcher;

impl FileWatcher {
    /// Watch `path` until `cancel` fires or the receiver is dropped.
    ///
    /// The parent directory is watched rather than the file itself so editors
    /// that replace the file on save are still observed.
    pub fn spawn(
        path: &Path,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> notify::Result<mpsc::Receiver<FileChanged>> {
        let path = path.to_path_buf();
        let file_name = path.file_name().map(|n| n.to_os_string());
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("File watch error: {}", e);
                    return;
                }
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            let relevant = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if relevant {
                let _ = raw_tx.send(());
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            // keep the OS watcher alive for as long as the task runs
            let _watcher = watcher;

            'outer: loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = raw_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                    }
                }

                // wait, then reset on next event
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'outer,
                        event = raw_rx.recv() => {
                            if event.is_none() {
                                break 'outer;
                            }
                        }
                        _ = tokio::time::sleep(debounce) => break,
                    }
                }

                debug!("Watched file changed: {}", path.display());
                if tx.send(FileChanged { path: path.clone() }).await.is_err() {
                    break;
                }
            }
            debug!("Stopped watching {}", path.display());
        });

        Ok(rx)
    }
}
