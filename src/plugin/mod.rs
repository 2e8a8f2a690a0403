//! Plugin dispatch contract
//!
//! Plugins implement [`ProxyPlugin`]; the engine and the stdio session drive
//! them through [`PluginSet`], which owns ordering and fault isolation.

pub mod builtin;
pub mod dispatch;
pub mod hooks;
pub mod log;
pub mod registry;
pub mod state;

pub use dispatch::{spawn_log_dispatch, ChainOutcome, Hook, HookOutcome, Plugin, PluginSet};
pub use hooks::{
    CompletedArgs, InitArgs, MockRequestArgs, OptionsArgs, PluginResult, ProxyPlugin,
    RecordingStopArgs, RequestArgs, RequestLogArgs, ResponseArgs, StdioArgs, StdioLogArgs,
    StdioRecordingStopArgs,
};
pub use log::{LogContext, MessageType, RequestLog, RequestLogger, StdioRequestLog};
pub use registry::{LoadedPlugins, PluginContext, PluginFactory, PluginRegistry, RunMode};
pub use state::{CorrelationKey, GlobalStore, ResponseState, SessionStore};
