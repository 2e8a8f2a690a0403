//! One request/response pair as seen by the plugin chain

use crate::plugin::CorrelationKey;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use serde_json::Value;
use std::net::SocketAddr;

/// Message body, resolved once when the message enters the proxy
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Raw(Bytes),
    Structured(Value),
}

impl Body {
    /// Structured when the content type is JSON and the bytes parse, raw otherwise
    pub fn from_wire(headers: &HeaderMap, bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Body::Empty;
        }
        if is_json(headers) {
            if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                return Body::Structured(value);
            }
        }
        Body::Raw(bytes)
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Body::Empty => Bytes::new(),
            Body::Raw(bytes) => bytes.clone(),
            Body::Structured(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .unwrap_or_default(),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Structured(value) => Some(value),
            _ => None,
        }
    }

    /// Lossy UTF-8 view of the body
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            essence == "application/json" || essence.ends_with("+json")
        })
        .unwrap_or(false)
}

/// A body together with the bytes it was read from.
///
/// The original bytes are forwarded as long as nobody asked for mutable
/// access, so untouched JSON keeps its exact formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    body: Body,
    wire: Option<Bytes>,
}

impl Payload {
    pub fn from_wire(headers: &HeaderMap, bytes: Bytes) -> Self {
        Self {
            body: Body::from_wire(headers, bytes.clone()),
            wire: Some(bytes),
        }
    }

    pub fn new(body: Body) -> Self {
        Self { body, wire: None }
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        self.wire = None;
        &mut self.body
    }

    pub fn set(&mut self, body: Body) {
        self.wire = None;
        self.body = body;
    }

    pub fn is_modified(&self) -> bool {
        self.wire.is_none()
    }

    pub fn to_bytes(&self) -> Bytes {
        match &self.wire {
            Some(bytes) => bytes.clone(),
            None => self.body.to_bytes(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new(Body::Empty)
    }
}

#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    /// Absolute URL including scheme
    pub url: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Payload,
}

impl InterceptedRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Payload::default(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = Payload::from_wire(&self.headers, bytes.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Payload,
}

impl InterceptedResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Payload::default(),
        }
    }

    pub fn from_wire(status: StatusCode, headers: HeaderMap, bytes: Bytes) -> Self {
        let body = Payload::from_wire(&headers, bytes);
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response carrying a JSON document
    pub fn json(status: StatusCode, value: Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: Payload::new(Body::Structured(value)),
        }
    }

    /// Plain-text response
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status,
            headers,
            body: Payload::new(Body::Raw(Bytes::from(text.into()))),
        }
    }
}

/// A request/response pair flowing through the engine
#[derive(Debug, Clone)]
pub struct Exchange {
    key: CorrelationKey,
    client: Option<SocketAddr>,
    /// Whether the request arrived inside a decrypted tunnel
    decrypted: bool,
    pub request: InterceptedRequest,
    pub response: Option<InterceptedResponse>,
}

impl Exchange {
    pub fn new(key: CorrelationKey, request: InterceptedRequest) -> Self {
        Self {
            key,
            client: None,
            decrypted: false,
            request,
            response: None,
        }
    }

    pub fn with_client(mut self, client: SocketAddr) -> Self {
        self.client = Some(client);
        self
    }

    pub fn decrypted(mut self, decrypted: bool) -> Self {
        self.decrypted = decrypted;
        self
    }

    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn client(&self) -> Option<SocketAddr> {
        self.client
    }

    pub fn is_decrypted(&self) -> bool {
        self.decrypted
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    /// Answer the exchange without contacting the upstream
    pub fn respond(&mut self, response: InterceptedResponse) {
        self.response = Some(response);
    }
}
