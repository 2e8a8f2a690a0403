//! Integration tests for stdio interception
//!
//! Wraps `cat`, which echoes stdin to stdout, so every forwarded chunk comes
//! back as output and consumed chunks visibly never reach the child.

#![cfg(unix)]

use async_trait::async_trait;
use bytes::Bytes;
use intercept_proxy::metrics::Metrics;
use intercept_proxy::plugin::{
    GlobalStore, Plugin, PluginResult, PluginSet, ProxyPlugin, RequestLogger, StdioArgs,
    StdioLogArgs, StdioRecordingStopArgs,
};
use intercept_proxy::stdio::StdioInterceptor;
use intercept_proxy::watch::WatchSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Seen {
    paired: usize,
    final_logs: Option<usize>,
}

/// Answers `ping` itself instead of letting the child see it
struct Responder {
    seen: Arc<Mutex<Seen>>,
}

#[async_trait]
impl ProxyPlugin for Responder {
    async fn before_stdin(&self, args: &mut StdioArgs<'_>) -> PluginResult {
        if args.chunk.as_ref() == b"ping\n" {
            args.answer("pong\n");
        }
        Ok(())
    }

    async fn after_stdio_request_log(&self, _args: &StdioLogArgs<'_>) -> PluginResult {
        self.seen.lock().unwrap().paired += 1;
        Ok(())
    }

    async fn after_stdio_recording_stop(&self, args: &StdioRecordingStopArgs<'_>) -> PluginResult {
        self.seen.lock().unwrap().final_logs = Some(args.logs.len());
        Ok(())
    }
}

fn interceptor(seen: &Arc<Mutex<Seen>>) -> StdioInterceptor {
    let plugins = PluginSet::new(vec![Plugin::new(
        "responder",
        WatchSet::default(),
        Arc::new(Responder { seen: seen.clone() }),
    )]);
    let (logger, _rx) = RequestLogger::new();
    StdioInterceptor::new(plugins, GlobalStore::new(), logger, Arc::new(Metrics::new()))
        .with_grace(Duration::from_millis(500))
}

fn collect<R: AsyncRead + Send + Unpin + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut out = Vec::new();
        let _ = reader.read_to_end(&mut out).await;
        out
    })
}

fn outputs() -> ((DuplexStream, DuplexStream), (DuplexStream, DuplexStream)) {
    (tokio::io::duplex(64 * 1024), tokio::io::duplex(64 * 1024))
}

#[tokio::test]
async fn test_forwarded_stdin_round_trips_through_child() {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let ((out_w, out_r), (err_w, err_r)) = outputs();
    let stdout = collect(out_r);
    let stderr = collect(err_r);

    let (tx, rx) = mpsc::channel(4);
    tx.send(Bytes::from_static(b"hello\n")).await.unwrap();
    drop(tx);

    let outcome = interceptor(&seen)
        .run("cat", &[], rx, out_w, err_w, CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.status.unwrap().success());
    assert_eq!(stdout.await.unwrap(), b"hello\n");
    assert!(stderr.await.unwrap().is_empty());

    assert_eq!(outcome.logs.len(), 1);
    assert_eq!(outcome.logs[0].stdin.as_deref(), Some(&b"hello\n"[..]));
    assert_eq!(outcome.logs[0].stdout.as_deref(), Some(&b"hello\n"[..]));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.paired, 1);
    assert_eq!(seen.final_logs, Some(1));
}

#[tokio::test]
async fn test_consumed_stdin_never_reaches_child() {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let ((out_w, out_r), (err_w, _err_r)) = outputs();
    let stdout = collect(out_r);

    let (tx, rx) = mpsc::channel(4);
    tx.send(Bytes::from_static(b"ping\n")).await.unwrap();
    tx.send(Bytes::from_static(b"echo\n")).await.unwrap();
    drop(tx);

    let outcome = interceptor(&seen)
        .run("cat", &[], rx, out_w, err_w, CancellationToken::new())
        .await
        .unwrap();

    // the child only ever saw "echo"; "ping" was answered by the plugin
    assert_eq!(stdout.await.unwrap(), b"pong\necho\n");

    let pairs: Vec<_> = outcome
        .logs
        .iter()
        .map(|l| (l.stdin.clone().unwrap(), l.stdout.clone().unwrap()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            (Bytes::from_static(b"ping\n"), Bytes::from_static(b"pong\n")),
            (Bytes::from_static(b"echo\n"), Bytes::from_static(b"echo\n")),
        ]
    );
    assert_eq!(seen.lock().unwrap().paired, 2);
}

#[tokio::test]
async fn test_shutdown_terminates_child() {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let ((out_w, _out_r), (err_w, _err_r)) = outputs();
    let (_tx, rx) = mpsc::channel(4);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        }
    });

    let started = std::time::Instant::now();
    let outcome = interceptor(&seen)
        .run("sleep", &["30".to_string()], rx, out_w, err_w, shutdown)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!outcome.status.map(|s| s.success()).unwrap_or(false));
    assert!(outcome.logs.is_empty());
    assert_eq!(seen.lock().unwrap().final_logs, Some(0));
}

#[tokio::test]
async fn test_missing_command_fails_to_spawn() {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let ((out_w, _out_r), (err_w, _err_r)) = outputs();
    let (_tx, rx) = mpsc::channel(4);

    let result = interceptor(&seen)
        .run(
            "/nonexistent/intercept-proxy-child",
            &[],
            rx,
            out_w,
            err_w,
            CancellationToken::new(),
        )
        .await;
    assert!(result.is_err());
    assert_eq!(seen.lock().unwrap().final_logs, None);
}

#[tokio::test]
async fn test_stderr_chatter_does_not_steal_the_reply() {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let ((out_w, out_r), (err_w, err_r)) = outputs();
    let stdout = collect(out_r);
    let stderr = collect(err_r);

    let (tx, rx) = mpsc::channel(4);
    tx.send(Bytes::from_static(b"hi\n")).await.unwrap();
    drop(tx);

    let script = r#"read line; echo working >&2; sleep 0.3; echo "$line""#;
    let outcome = interceptor(&seen)
        .run(
            "sh",
            &["-c".to_string(), script.to_string()],
            rx,
            out_w,
            err_w,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stdout.await.unwrap(), b"hi\n");
    assert_eq!(stderr.await.unwrap(), b"working\n");

    assert_eq!(outcome.logs.len(), 1);
    let log = &outcome.logs[0];
    assert_eq!(log.stdin.as_deref(), Some(&b"hi\n"[..]));
    assert_eq!(log.stdout.as_deref(), Some(&b"hi\n"[..]));
    assert_eq!(log.stderr.as_deref(), Some(&b"working\n"[..]));
    assert_eq!(seen.lock().unwrap().paired, 1);
}
