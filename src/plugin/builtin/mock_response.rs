//! Answers matched requests from a JSON mocks file
//!
//! The first mock whose URL pattern and method match wins. The file is
//! re-read whenever it changes on disk.

use crate::error::PluginError;
use crate::plugin::hooks::{InitArgs, PluginResult, ProxyPlugin, RequestArgs};
use crate::plugin::log::MessageType;
use crate::plugin::registry::PluginContext;
use crate::proxy::exchange::{Body, InterceptedResponse, Payload};
use crate::watch::WatchPattern;
use crate::watcher::{FileWatcher, DEFAULT_DEBOUNCE};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponseConfig {
    #[serde(default = "default_mocks_file")]
    pub mocks_file: PathBuf,
    #[serde(default = "default_watch")]
    pub watch: bool,
}

fn default_mocks_file() -> PathBuf {
    PathBuf::from("mocks.json")
}

fn default_watch() -> bool {
    true
}

impl Default for MockResponseConfig {
    fn default() -> Self {
        Self {
            mocks_file: default_mocks_file(),
            watch: default_watch(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MocksFile {
    #[serde(default)]
    mocks: Vec<MockDefinition>,
}

#[derive(Debug, Deserialize)]
struct MockDefinition {
    request: MockRequestMatch,
    #[serde(default)]
    response: MockResponseDefinition,
}

#[derive(Debug, Deserialize)]
struct MockRequestMatch {
    url: String,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MockResponseDefinition {
    #[serde(default = "default_status")]
    status_code: u16,
    #[serde(default)]
    headers: Vec<MockHeader>,
    #[serde(default)]
    body: Value,
}

impl Default for MockResponseDefinition {
    fn default() -> Self {
        Self {
            status_code: default_status(),
            headers: Vec::new(),
            body: Value::Null,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MockHeader {
    name: String,
    value: String,
}

fn default_status() -> u16 {
    200
}

/// A compiled mock, ready to be matched against requests
#[derive(Debug, Clone)]
pub struct Mock {
    url: WatchPattern,
    method: Option<Method>,
    response: InterceptedResponse,
}

impl Mock {
    fn matches(&self, method: &Method, url: &str) -> bool {
        self.method.as_ref().map_or(true, |m| m == method) && self.url.is_match(url)
    }

    fn compile(definition: MockDefinition) -> Result<Self, PluginError> {
        let url = WatchPattern::parse(&definition.request.url)
            .map_err(|e| PluginError::Config(e.to_string()))?;
        let method = definition
            .request
            .method
            .map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()))
            .transpose()
            .map_err(|e| PluginError::Config(format!("Invalid mock method: {e}")))?;

        let spec = definition.response;
        let status = StatusCode::from_u16(spec.status_code)
            .map_err(|e| PluginError::Config(format!("Invalid mock status: {e}")))?;

        let mut headers = HeaderMap::new();
        for header in spec.headers {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| PluginError::Config(format!("Invalid mock header name: {e}")))?;
            let value = HeaderValue::from_str(&header.value)
                .map_err(|e| PluginError::Config(format!("Invalid mock header value: {e}")))?;
            headers.append(name, value);
        }

        let body = match spec.body {
            Value::Null => Body::Empty,
            Value::String(text) => Body::Raw(Bytes::from(text)),
            value => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                Body::Structured(value)
            }
        };

        Ok(Self {
            url,
            method,
            response: InterceptedResponse {
                status,
                headers,
                body: Payload::new(body),
            },
        })
    }
}

fn load_mocks(path: &Path) -> Result<Vec<Mock>, PluginError> {
    let contents = std::fs::read_to_string(path)?;
    let file: MocksFile = serde_json::from_str(&contents)?;
    file.mocks.into_iter().map(Mock::compile).collect()
}

pub struct MockResponsePlugin {
    path: PathBuf,
    watch: bool,
    mocks: Arc<RwLock<Vec<Mock>>>,
}

impl MockResponsePlugin {
    pub fn new(config: MockResponseConfig, base_dir: &Path) -> Self {
        let path = if config.mocks_file.is_absolute() {
            config.mocks_file
        } else {
            base_dir.join(config.mocks_file)
        };

        let mocks = match load_mocks(&path) {
            Ok(mocks) => {
                info!("Loaded {} mock(s) from {}", mocks.len(), path.display());
                mocks
            }
            Err(e) => {
                warn!("No mocks loaded from {}: {}", path.display(), e);
                Vec::new()
            }
        };

        Self {
            path,
            watch: config.watch,
            mocks: Arc::new(RwLock::new(mocks)),
        }
    }

    pub fn factory(ctx: &PluginContext<'_>) -> Result<Arc<dyn ProxyPlugin>, PluginError> {
        let config = if ctx.config.is_null() {
            MockResponseConfig::default()
        } else {
            MockResponseConfig::deserialize(ctx.config)?
        };
        Ok(Arc::new(Self::new(config, ctx.base_dir)))
    }

    pub async fn mock_count(&self) -> usize {
        self.mocks.read().await.len()
    }

    async fn find(&self, method: &Method, url: &str) -> Option<InterceptedResponse> {
        self.mocks
            .read()
            .await
            .iter()
            .find(|mock| mock.matches(method, url))
            .map(|mock| mock.response.clone())
    }
}

#[async_trait]
impl ProxyPlugin for MockResponsePlugin {
    async fn initialize(&self, args: &InitArgs<'_>) -> PluginResult {
        if !self.watch {
            return Ok(());
        }

        let mut changes = match FileWatcher::spawn(&self.path, DEFAULT_DEBOUNCE, args.cancel.clone())
        {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Cannot watch {}: {}", self.path.display(), e);
                return Ok(());
            }
        };

        let mocks = self.mocks.clone();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                match load_mocks(&change.path) {
                    Ok(fresh) => {
                        info!("Reloaded {} mock(s) from {}", fresh.len(), change.path.display());
                        *mocks.write().await = fresh;
                    }
                    Err(e) => warn!(
                        "Keeping previous mocks, {} failed to load: {}",
                        change.path.display(),
                        e
                    ),
                }
            }
        });
        Ok(())
    }

    async fn before_request(&self, args: &mut RequestArgs<'_>) -> PluginResult {
        if args.response_state.has_been_set() {
            debug!("Exchange {} already answered", args.exchange.key());
            return Ok(());
        }

        let method = args.exchange.request.method.clone();
        let Some(response) = self.find(&method, args.exchange.url()).await else {
            return Ok(());
        };

        let status = response.status;
        args.exchange.respond(response);
        args.response_state.set();
        args.log(format!("{} {}", status.as_u16(), args.exchange.url()), MessageType::Mocked);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_mocks(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("mocks.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_first_matching_mock_wins() {
        let dir = TempDir::new().unwrap();
        write_mocks(
            dir.path(),
            r#"{"mocks": [
                {"request": {"url": "https://api.test/users/*", "method": "GET"},
                 "response": {"statusCode": 200, "body": {"id": 1}}},
                {"request": {"url": "https://api.test/*"},
                 "response": {"statusCode": 418, "body": "teapot"}}
            ]}"#,
        );
        let plugin = MockResponsePlugin::new(
            MockResponseConfig {
                watch: false,
                ..MockResponseConfig::default()
            },
            dir.path(),
        );
        assert_eq!(plugin.mock_count().await, 2);

        let users = plugin.find(&Method::GET, "https://api.test/users/7").await.unwrap();
        assert_eq!(users.status, StatusCode::OK);
        assert_eq!(users.body.body().as_json(), Some(&serde_json::json!({"id": 1})));
        assert_eq!(users.headers[CONTENT_TYPE], "application/json");

        // method mismatch on the first mock falls through to the second
        let post = plugin.find(&Method::POST, "https://api.test/users/7").await.unwrap();
        assert_eq!(post.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(post.body.to_bytes(), Bytes::from_static(b"teapot"));

        assert!(plugin.find(&Method::GET, "https://other.test/").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_means_no_mocks() {
        let dir = TempDir::new().unwrap();
        let plugin = MockResponsePlugin::new(MockResponseConfig::default(), dir.path());
        assert_eq!(plugin.mock_count().await, 0);
    }

    #[test]
    fn test_invalid_status_rejected() {
        let definition: MockDefinition = serde_json::from_str(
            r#"{"request": {"url": "https://a.test/*"}, "response": {"statusCode": 1000}}"#,
        )
        .unwrap();
        assert!(Mock::compile(definition).is_err());
    }
}
