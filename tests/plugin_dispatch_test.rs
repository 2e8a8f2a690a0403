//! Integration tests for plugin dispatch
//!
//! Tests verify that:
//! - Hooks run sequentially in registration order
//! - Answering an exchange does not stop later plugins
//! - The answered state never reverts within an exchange
//! - Plugin errors are contained and the chain continues
//! - Plugins only see requests their watch set covers
//! - Recording hands off exactly the entries logged while active

use async_trait::async_trait;
use http::{Method, StatusCode};
use intercept_proxy::error::PluginError;
use intercept_proxy::plugin::{
    CorrelationKey, GlobalStore, LogContext, MessageType, Plugin, PluginResult, PluginSet,
    ProxyPlugin, RequestArgs, RequestLogger, ResponseState, SessionStore,
};
use intercept_proxy::proxy::{Exchange, InterceptedRequest, InterceptedResponse};
use intercept_proxy::watch::WatchSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

type Calls = Arc<Mutex<Vec<String>>>;

/// Records its tag and what it saw, optionally answering the exchange
struct Recorder {
    tag: &'static str,
    calls: Calls,
    answer: bool,
}

#[async_trait]
impl ProxyPlugin for Recorder {
    async fn before_request(&self, args: &mut RequestArgs<'_>) -> PluginResult {
        self.calls.lock().unwrap().push(format!(
            "{}:{}",
            self.tag,
            args.response_state.has_been_set()
        ));
        if self.answer {
            args.response_state.set();
            args.exchange
                .respond(InterceptedResponse::text(StatusCode::OK, self.tag));
        }
        Ok(())
    }
}

struct Fails;

#[async_trait]
impl ProxyPlugin for Fails {
    async fn before_request(&self, _args: &mut RequestArgs<'_>) -> PluginResult {
        Err(PluginError::Failed("refusing".into()))
    }
}

fn recorder(tag: &'static str, calls: &Calls, answer: bool) -> Arc<dyn ProxyPlugin> {
    Arc::new(Recorder {
        tag,
        calls: calls.clone(),
        answer,
    })
}

fn everything() -> WatchSet {
    WatchSet::parse(["*"]).unwrap()
}

fn exchange(url: &str) -> Exchange {
    Exchange::new(
        CorrelationKey::new(1, 0),
        InterceptedRequest::new(Method::GET, url),
    )
}

async fn run_before_request(set: &PluginSet, exchange: &mut Exchange) -> ResponseState {
    let (logger, _rx) = RequestLogger::new();
    let mut session = SessionStore::new();
    let mut state = ResponseState::new();
    set.before_request(
        exchange,
        &mut session,
        &GlobalStore::new(),
        &mut state,
        &logger,
        &CancellationToken::new(),
    )
    .await;
    state
}

#[tokio::test]
async fn test_answering_does_not_stop_later_plugins() {
    let calls = Calls::default();
    let set = PluginSet::new(vec![
        Plugin::new("a", everything(), recorder("a", &calls, true)),
        Plugin::new("b", everything(), recorder("b", &calls, false)),
        Plugin::new("c", everything(), recorder("c", &calls, false)),
    ]);

    let mut exchange = exchange("https://api.test/users");
    let state = run_before_request(&set, &mut exchange).await;

    // b and c ran, and saw the exchange already answered
    assert_eq!(*calls.lock().unwrap(), vec!["a:false", "b:true", "c:true"]);
    assert!(state.has_been_set());
    assert!(exchange.response.is_some());
}

#[tokio::test]
async fn test_answered_state_is_monotonic() {
    let calls = Calls::default();
    let set = PluginSet::new(vec![
        Plugin::new("first", everything(), recorder("first", &calls, true)),
        Plugin::new("second", everything(), recorder("second", &calls, true)),
        Plugin::new("third", everything(), recorder("third", &calls, false)),
    ]);

    let state = run_before_request(&set, &mut exchange("https://api.test/")).await;
    assert!(state.has_been_set());
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["first:false", "second:true", "third:true"]
    );
}

#[tokio::test]
async fn test_failing_plugin_is_isolated() {
    let calls = Calls::default();
    let set = PluginSet::new(vec![
        Plugin::new("before", everything(), recorder("before", &calls, false)),
        Plugin::new("fails", everything(), Arc::new(Fails)),
        Plugin::new("after", everything(), recorder("after", &calls, false)),
    ]);

    let state = run_before_request(&set, &mut exchange("https://api.test/")).await;
    assert!(!state.has_been_set());
    assert_eq!(*calls.lock().unwrap(), vec!["before:false", "after:false"]);
}

#[tokio::test]
async fn test_plugins_only_see_their_watch_set() {
    let calls = Calls::default();
    let set = PluginSet::new(vec![
        Plugin::new(
            "api",
            WatchSet::parse(["https://api.test/*"]).unwrap(),
            recorder("api", &calls, false),
        ),
        Plugin::new(
            "cdn",
            WatchSet::parse(["https://cdn.test/*"]).unwrap(),
            recorder("cdn", &calls, false),
        ),
    ]);

    run_before_request(&set, &mut exchange("https://cdn.test/logo.png")).await;
    assert_eq!(*calls.lock().unwrap(), vec!["cdn:false"]);
}

#[tokio::test]
async fn test_cancelled_chain_stops_before_next_plugin() {
    let calls = Calls::default();
    let set = PluginSet::new(vec![Plugin::new("a", everything(), recorder("a", &calls, false))]);
    let (logger, _rx) = RequestLogger::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = set
        .before_request(
            &mut exchange("https://api.test/"),
            &mut SessionStore::new(),
            &GlobalStore::new(),
            &mut ResponseState::new(),
            &logger,
            &cancel,
        )
        .await;
    assert!(outcome.is_cancelled());
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_recording_drain_is_atomic() {
    let (logger, _rx) = RequestLogger::new();
    logger.log("before", MessageType::Normal, LogContext::default());

    assert!(logger.start_recording());
    for i in 0..5 {
        logger.log(format!("entry {i}"), MessageType::Normal, LogContext::default());
    }
    let drained = logger.stop_recording().unwrap();
    logger.log("after", MessageType::Normal, LogContext::default());

    let messages: Vec<_> = drained.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(
        messages,
        vec!["entry 0", "entry 1", "entry 2", "entry 3", "entry 4"]
    );
    assert!(drained.windows(2).all(|w| w[0].sequence < w[1].sequence));

    // a new accumulation starts empty
    assert!(logger.start_recording());
    assert!(logger.stop_recording().unwrap().is_empty());
}

#[tokio::test]
async fn test_session_store_is_private_to_exchange() {
    struct Counter;

    #[async_trait]
    impl ProxyPlugin for Counter {
        async fn before_request(&self, args: &mut RequestArgs<'_>) -> PluginResult {
            let seen = args
                .session
                .get("count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            args.session.insert("count", (seen + 1).into());
            args.global.update("total", |v| {
                (v.and_then(|v| v.as_u64()).unwrap_or(0) + 1).into()
            });
            Ok(())
        }
    }

    let set = PluginSet::new(vec![Plugin::new("counter", everything(), Arc::new(Counter))]);
    let (logger, _rx) = RequestLogger::new();
    let global = GlobalStore::new();
    let cancel = CancellationToken::new();

    let mut first = SessionStore::new();
    let mut second = SessionStore::new();
    for session in [&mut first, &mut second] {
        set.before_request(
            &mut exchange("https://api.test/"),
            session,
            &global,
            &mut ResponseState::new(),
            &logger,
            &cancel,
        )
        .await;
    }

    assert_eq!(first.get("count").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(second.get("count").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(global.get("total").and_then(|v| v.as_u64()), Some(2));
}
