//! Network interception
//!
//! [`InterceptEngine`] owns the exchange lifecycle and plugin dispatch;
//! [`ProxyServer`] is the HTTP(S) listener feeding it.

pub mod commands;
pub mod engine;
pub mod exchange;
pub mod process;
pub mod server;
pub mod timeout;

pub use commands::{spawn_terminal_reader, ProxyCommand, KEY_HELP};
pub use engine::{InterceptEngine, RequestDisposition};
pub use exchange::{Body, Exchange, InterceptedRequest, InterceptedResponse, Payload};
pub use process::{ProcessFilter, ProcessInfo, ProcessResolver, SystemProcessResolver};
pub use server::ProxyServer;
pub use timeout::InactivityTimer;
