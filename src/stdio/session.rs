//! Child-process relay with plugin interception
//!
//! One session per child. Three loops (stdin, stdout, stderr) run
//! concurrently, each passing its chunks through the matching hook before
//! forwarding them. Stdin chunks are paired with the next output chunk into a
//! [`StdioRequestLog`].

use super::gate::{BoxedWriter, WriteGate};
use super::{StdioSession, StdioStream, StdioTarget, StdioWrite};
use crate::error::{Result, TransportError};
use crate::metrics::Metrics;
use crate::plugin::{
    CorrelationKey, GlobalStore, LogContext, MessageType, PluginSet, RequestLogger,
    ResponseState, SessionStore, StdioRequestLog,
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::io::Read;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 8192;
pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// How a wrapped child ended
#[derive(Debug)]
pub struct StdioOutcome {
    pub session: StdioSession,
    /// `None` when the exit status could not be collected
    pub status: Option<ExitStatus>,
    pub logs: Vec<StdioRequestLog>,
}

/// A stdin chunk still waiting for its stdout reply
#[derive(Debug)]
struct Pending {
    stdin: Bytes,
    at: DateTime<Utc>,
    /// stderr written while waiting, kept with the request
    stderr: Option<BytesMut>,
    stderr_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Exchanges {
    pending: Option<Pending>,
    logs: Vec<StdioRequestLog>,
    next_sequence: u64,
}

impl Exchanges {
    fn next_key(&mut self, session: CorrelationKey) -> CorrelationKey {
        let key = CorrelationKey::new(session.connection(), self.next_sequence);
        self.next_sequence += 1;
        key
    }

    /// Record a stdin chunk. A still unanswered predecessor is closed first:
    /// returned when it collected stderr, kept as request-only otherwise.
    fn request(&mut self, session: CorrelationKey, chunk: Bytes) -> Option<StdioRequestLog> {
        let closed = self.close_pending(session);
        self.pending = Some(Pending {
            stdin: chunk,
            at: Utc::now(),
            stderr: None,
            stderr_at: None,
        });
        closed
    }

    /// Record an output chunk. Stdout completes the pending request; stderr
    /// is attached to it and waits for the stdout reply.
    fn reply(
        &mut self,
        session: CorrelationKey,
        stream: StdioStream,
        chunk: Bytes,
    ) -> Option<StdioRequestLog> {
        match (stream, self.pending.as_mut()) {
            (StdioStream::Stderr, Some(pending)) => {
                pending
                    .stderr
                    .get_or_insert_with(BytesMut::new)
                    .extend_from_slice(&chunk);
                pending.stderr_at.get_or_insert_with(Utc::now);
                None
            }
            (StdioStream::Stdout, Some(_)) => {
                let pending = self.pending.take()?;
                let log = StdioRequestLog {
                    key: self.next_key(session),
                    stdin: Some(pending.stdin),
                    stdout: Some(chunk),
                    stderr: pending.stderr.map(BytesMut::freeze),
                    request_timestamp: Some(pending.at),
                    response_timestamp: Some(Utc::now()),
                };
                self.logs.push(log.clone());
                Some(log)
            }
            (_, _) => {
                let (stdout, stderr) = match stream {
                    StdioStream::Stderr => (None, Some(chunk)),
                    _ => (Some(chunk), None),
                };
                let log = StdioRequestLog {
                    key: self.next_key(session),
                    stdin: None,
                    stdout,
                    stderr,
                    request_timestamp: None,
                    response_timestamp: Some(Utc::now()),
                };
                self.logs.push(log);
                None
            }
        }
    }

    /// Close the pending request without a stdout reply
    fn close_pending(&mut self, session: CorrelationKey) -> Option<StdioRequestLog> {
        let pending = self.pending.take()?;
        let key = self.next_key(session);
        let Some(stderr) = pending.stderr else {
            self.logs.push(request_only(key, pending.stdin, pending.at));
            return None;
        };
        let log = StdioRequestLog {
            key,
            stdin: Some(pending.stdin),
            stdout: None,
            stderr: Some(stderr.freeze()),
            request_timestamp: Some(pending.at),
            response_timestamp: pending.stderr_at,
        };
        self.logs.push(log.clone());
        Some(log)
    }

    fn finish(&mut self, session: CorrelationKey) -> Vec<StdioRequestLog> {
        self.close_pending(session);
        std::mem::take(&mut self.logs)
    }
}

fn request_only(key: CorrelationKey, stdin: Bytes, at: DateTime<Utc>) -> StdioRequestLog {
    StdioRequestLog {
        key,
        stdin: Some(stdin),
        stdout: None,
        stderr: None,
        request_timestamp: Some(at),
        response_timestamp: None,
    }
}

/// State shared by the three loops of one session
struct SessionContext {
    session: StdioSession,
    plugins: PluginSet,
    global: GlobalStore,
    logger: Arc<RequestLogger>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    store: Mutex<SessionStore>,
    exchanges: StdMutex<Exchanges>,
    child_in: WriteGate<ChildStdin>,
    parent_out: WriteGate<BoxedWriter>,
    parent_err: WriteGate<BoxedWriter>,
}

impl SessionContext {
    fn exchanges(&self) -> std::sync::MutexGuard<'_, Exchanges> {
        self.exchanges.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn handle_chunk(&self, stream: StdioStream, chunk: Bytes) {
        let kind = match stream {
            StdioStream::Stdin => MessageType::InterceptedRequest,
            _ => MessageType::InterceptedResponse,
        };
        self.logger.log(
            format!("{} {} bytes", stream, chunk.len()),
            kind,
            LogContext {
                key: Some(self.session.key),
                ..LogContext::default()
            },
        );

        let mut state = ResponseState::new();
        let mut writes = Vec::new();
        {
            let mut store = self.store.lock().await;
            self.plugins
                .stdio_chunk(
                    &self.session,
                    stream,
                    &chunk,
                    &mut store,
                    &self.global,
                    &mut state,
                    &mut writes,
                    &self.logger,
                    &self.cancel,
                )
                .await;
        }
        let consumed = state.has_been_set();
        self.metrics.record_stdio_chunk(consumed);

        let mut completed = Vec::new();
        if stream == StdioStream::Stdin {
            let mut exchanges = self.exchanges();
            // recorded before the child can possibly reply
            completed.extend(exchanges.request(self.session.key, chunk.clone()));
            if consumed {
                let writes = writes.iter().filter(|w| w.target != StdioTarget::Child);
                for w in writes {
                    let stream = match w.target {
                        StdioTarget::ParentStderr => StdioStream::Stderr,
                        _ => StdioStream::Stdout,
                    };
                    completed.extend(exchanges.reply(self.session.key, stream, w.payload.clone()));
                }
            }
        }

        if consumed {
            debug!("{} chunk consumed by a plugin", stream);
        } else {
            self.forward(stream, &chunk).await;
        }
        for write in writes {
            self.apply(write).await;
        }

        if stream != StdioStream::Stdin {
            completed.extend(self.exchanges().reply(self.session.key, stream, chunk));
        }
        for log in completed {
            self.plugins
                .after_stdio_request_log(&self.session, &log, &self.global, &self.cancel)
                .await;
        }
    }

    async fn forward(&self, stream: StdioStream, chunk: &[u8]) {
        let result = match stream {
            StdioStream::Stdin => self.child_in.write(chunk).await,
            StdioStream::Stdout => self.parent_out.write(chunk).await,
            StdioStream::Stderr => self.parent_err.write(chunk).await,
        };
        if let Err(e) = result {
            warn!("Failed to forward {}: {}", stream, e);
        }
    }

    async fn apply(&self, write: StdioWrite) {
        let result = match write.target {
            StdioTarget::Child => self.child_in.write(&write.payload).await,
            StdioTarget::ParentStdout => self.parent_out.write(&write.payload).await,
            StdioTarget::ParentStderr => self.parent_err.write(&write.payload).await,
        };
        if let Err(e) = result {
            warn!("Failed to write plugin payload to {:?}: {}", write.target, e);
        }
    }
}

async fn relay_stdin(ctx: Arc<SessionContext>, mut input: mpsc::Receiver<Bytes>) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            chunk = input.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            debug!("Parent stdin closed");
            ctx.child_in.close().await;
            break;
        };
        ctx.handle_chunk(StdioStream::Stdin, chunk).await;
    }
}

async fn relay_output<R>(ctx: Arc<SessionContext>, stream: StdioStream, mut reader: R, chunk_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; chunk_size];
    loop {
        let read = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            read = reader.read(&mut buffer) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Child {} read failed: {}", stream, e);
                break;
            }
        };
        ctx.handle_chunk(stream, Bytes::copy_from_slice(&buffer[..n])).await;
    }
    debug!("Child {} closed", stream);
}

/// Read the parent's stdin on a dedicated thread.
///
/// The read blocks, so it never runs on the runtime. The thread ends at EOF,
/// on a read error, or once the receiver is dropped.
pub fn spawn_stdin_reader(chunk_size: usize) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buffer = vec![0u8; chunk_size.max(1)];
        loop {
            let n = match stdin.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Reading stdin failed: {}", e);
                    break;
                }
            };
            if tx.blocking_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                break;
            }
        }
    });
    rx
}

/// Spawns children and relays their streams through the plugin chain
pub struct StdioInterceptor {
    plugins: PluginSet,
    global: GlobalStore,
    logger: Arc<RequestLogger>,
    metrics: Arc<Metrics>,
    chunk_size: usize,
    grace: Duration,
}

impl StdioInterceptor {
    pub fn new(
        plugins: PluginSet,
        global: GlobalStore,
        logger: Arc<RequestLogger>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            plugins,
            global,
            logger,
            metrics,
            chunk_size: DEFAULT_CHUNK_SIZE,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// How long output loops may drain after the child exits, and how long a
    /// signalled child gets before it is killed
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run `command` wired to the process's own stdio until it exits
    pub async fn run_process(
        &self,
        command: &str,
        args: &[String],
        shutdown: CancellationToken,
    ) -> Result<StdioOutcome> {
        let stdin = spawn_stdin_reader(self.chunk_size);
        self.run(command, args, stdin, tokio::io::stdout(), tokio::io::stderr(), shutdown)
            .await
    }

    /// Spawn `command` and relay until it exits or `shutdown` fires
    pub async fn run<O, E>(
        &self,
        command: &str,
        args: &[String],
        stdin: mpsc::Receiver<Bytes>,
        stdout: O,
        stderr: E,
        shutdown: CancellationToken,
    ) -> Result<StdioOutcome>
    where
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::SpawnFailed(format!("{command}: {e}")))?;

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(child_stdin), Some(child_stdout), Some(child_stderr)) = pipes else {
            return Err(TransportError::SpawnFailed(format!("{command}: stdio not piped")).into());
        };

        let session = StdioSession {
            key: CorrelationKey::new(NEXT_SESSION.fetch_add(1, Ordering::Relaxed), 0),
            command: command.to_string(),
            args: args.to_vec(),
            pid: child.id(),
            started: Utc::now(),
        };
        info!(
            correlation = %session.key,
            "Started '{}' (pid {})",
            command,
            session.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
        );

        let ctx = Arc::new(SessionContext {
            session,
            plugins: self.plugins.clone(),
            global: self.global.clone(),
            logger: self.logger.clone(),
            metrics: self.metrics.clone(),
            cancel: CancellationToken::new(),
            store: Mutex::new(SessionStore::new()),
            exchanges: StdMutex::new(Exchanges::default()),
            child_in: WriteGate::new("child stdin", child_stdin),
            parent_out: WriteGate::new("parent stdout", Box::new(stdout) as BoxedWriter),
            parent_err: WriteGate::new("parent stderr", Box::new(stderr) as BoxedWriter),
        });
        self.metrics.active_sessions.inc();

        let stdin_task = tokio::spawn(relay_stdin(ctx.clone(), stdin));
        let mut outputs = JoinSet::new();
        outputs.spawn(relay_output(
            ctx.clone(),
            StdioStream::Stdout,
            child_stdout,
            self.chunk_size,
        ));
        outputs.spawn(relay_output(
            ctx.clone(),
            StdioStream::Stderr,
            child_stderr,
            self.chunk_size,
        ));

        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = shutdown.cancelled() => terminate(&mut child, self.grace).await,
        };
        info!(
            correlation = %ctx.session.key,
            "'{}' exited with {}",
            ctx.session.command,
            status.map(|s| s.to_string()).unwrap_or_else(|| "unknown status".into())
        );

        let drained = tokio::time::timeout(self.grace, async {
            while outputs.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!("Output loops still busy after grace period");
        }
        ctx.cancel.cancel();
        while outputs.join_next().await.is_some() {}
        let _ = stdin_task.await;
        ctx.child_in.close().await;

        let logs = ctx.exchanges().finish(ctx.session.key);
        // the session scope is cancelled by now; the final handoff gets its own
        self.plugins
            .after_stdio_recording_stop(&ctx.session, &logs, &self.global, &CancellationToken::new())
            .await;
        self.metrics.active_sessions.dec();

        Ok(StdioOutcome {
            session: ctx.session.clone(),
            status,
            logs,
        })
    }
}

/// SIGTERM, then kill once `grace` runs out
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGTERM to pid {}", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to pid {} failed: {}", pid, e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            warn!("Child did not exit within {:?}, killing it", grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill child: {}", e);
            }
            child.wait().await.ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_pairs_with_next_output() {
        let session = CorrelationKey::new(9, 0);
        let mut exchanges = Exchanges::default();

        exchanges.request(session, Bytes::from_static(b"ping\n"));
        let log = exchanges
            .reply(session, StdioStream::Stdout, Bytes::from_static(b"pong\n"))
            .unwrap();
        assert_eq!(log.stdin.as_deref(), Some(&b"ping\n"[..]));
        assert_eq!(log.stdout.as_deref(), Some(&b"pong\n"[..]));
        assert!(log.request_timestamp.is_some());
        assert!(log.response_timestamp.is_some());
    }

    #[test]
    fn test_superseded_stdin_is_request_only() {
        let session = CorrelationKey::new(9, 0);
        let mut exchanges = Exchanges::default();

        exchanges.request(session, Bytes::from_static(b"one\n"));
        exchanges.request(session, Bytes::from_static(b"two\n"));
        let logs = exchanges.finish(session);

        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(StdioRequestLog::is_request_only));
        assert_eq!(logs[0].stdin.as_deref(), Some(&b"one\n"[..]));
        assert_eq!(logs[1].stdin.as_deref(), Some(&b"two\n"[..]));
    }

    #[test]
    fn test_unsolicited_output_is_logged_but_not_paired() {
        let session = CorrelationKey::new(9, 0);
        let mut exchanges = Exchanges::default();

        let paired = exchanges.reply(session, StdioStream::Stderr, Bytes::from_static(b"boot\n"));
        assert!(paired.is_none());

        let logs = exchanges.finish(session);
        assert_eq!(logs.len(), 1);
        assert!(logs[0].stdin.is_none());
        assert_eq!(logs[0].stderr.as_deref(), Some(&b"boot\n"[..]));
    }

    #[test]
    fn test_stderr_before_reply_stays_with_request() {
        let session = CorrelationKey::new(9, 0);
        let mut exchanges = Exchanges::default();

        exchanges.request(session, Bytes::from_static(b"{\"id\":1}\n"));
        let early = exchanges.reply(session, StdioStream::Stderr, Bytes::from_static(b"handling 1\n"));
        assert!(early.is_none());

        let log = exchanges
            .reply(session, StdioStream::Stdout, Bytes::from_static(b"{\"result\":1}\n"))
            .unwrap();
        assert_eq!(log.stdin.as_deref(), Some(&b"{\"id\":1}\n"[..]));
        assert_eq!(log.stdout.as_deref(), Some(&b"{\"result\":1}\n"[..]));
        assert_eq!(log.stderr.as_deref(), Some(&b"handling 1\n"[..]));

        let logs = exchanges.finish(session);
        assert_eq!(logs, vec![log]);
    }

    #[test]
    fn test_stderr_only_reply_is_closed_by_next_request() {
        let session = CorrelationKey::new(9, 0);
        let mut exchanges = Exchanges::default();

        assert!(exchanges.request(session, Bytes::from_static(b"bad\n")).is_none());
        exchanges.reply(session, StdioStream::Stderr, Bytes::from_static(b"parse error\n"));

        let closed = exchanges.request(session, Bytes::from_static(b"next\n")).unwrap();
        assert_eq!(closed.stdin.as_deref(), Some(&b"bad\n"[..]));
        assert_eq!(closed.stderr.as_deref(), Some(&b"parse error\n"[..]));
        assert!(closed.stdout.is_none());
        assert!(closed.response_timestamp.is_some());

        let logs = exchanges.finish(session);
        assert_eq!(logs.len(), 2);
        assert!(logs[1].is_request_only());
    }
}
