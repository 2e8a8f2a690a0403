//! HTTP(S) listener
//!
//! Plain requests are handled directly. CONNECT tunnels to watched hosts are
//! terminated with a leaf certificate from the local authority and the inner
//! requests flow through the same exchange path; every other tunnel is
//! relayed byte for byte.

use super::engine::InterceptEngine;
use super::exchange::{Exchange, InterceptedRequest, InterceptedResponse, Payload};
use crate::certs::CertificateAuthority;
use crate::error::{ProxyError, Result, TransportError};
use crate::metrics::RequestTimer;
use crate::plugin::CorrelationKey;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::Authority;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

pub type ProxyBody = BoxBody<Bytes, Infallible>;

// RFC 7230 section 6.1
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One client connection, plain or inside a decrypted tunnel
struct ClientConnection {
    id: u64,
    client: SocketAddr,
    sequence: AtomicU64,
    /// `host:port` of the tunnel this connection was decrypted from
    tunnel: Option<Authority>,
}

impl ClientConnection {
    fn plain(id: u64, client: SocketAddr) -> Self {
        Self {
            id,
            client,
            sequence: AtomicU64::new(0),
            tunnel: None,
        }
    }

    fn decrypted(id: u64, client: SocketAddr, tunnel: Authority) -> Self {
        Self {
            tunnel: Some(tunnel),
            ..Self::plain(id, client)
        }
    }

    fn next_key(&self) -> CorrelationKey {
        CorrelationKey::new(self.id, self.sequence.fetch_add(1, Ordering::Relaxed))
    }

    /// Absolute URL of a request received on this connection
    fn absolute_url(&self, uri: &Uri, headers: &HeaderMap) -> Option<String> {
        if uri.scheme().is_some() {
            return Some(uri.to_string());
        }
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        match &self.tunnel {
            Some(tunnel) if tunnel.port_u16() == Some(443) || tunnel.port_u16().is_none() => {
                Some(format!("https://{}{}", tunnel.host(), path))
            }
            Some(tunnel) => Some(format!("https://{}{}", tunnel, path)),
            None => {
                let host = headers.get(HOST)?.to_str().ok()?;
                Some(format!("http://{}{}", host, path))
            }
        }
    }
}

pub struct ProxyServer {
    engine: Arc<InterceptEngine>,
    authority: Option<Arc<CertificateAuthority>>,
    client: reqwest::Client,
}

impl ProxyServer {
    /// Without an authority every CONNECT is relayed blind
    pub fn new(
        engine: Arc<InterceptEngine>,
        authority: Option<Arc<CertificateAuthority>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| TransportError::Upstream(e.to_string()))?;

        Ok(Self {
            engine,
            authority,
            client,
        })
    }

    pub fn engine(&self) -> &Arc<InterceptEngine> {
        &self.engine
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let config = self.engine.config();
        let address = format!("{}:{}", config.ip_address, config.port);
        TcpListener::bind(&address).await.map_err(|e| {
            ProxyError::from(TransportError::BindFailed {
                address,
                reason: e.to_string(),
            })
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections until the engine shuts down
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let shutdown = self.engine.shutdown_token();
        info!("Proxy listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, client) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move { server.serve_plain(stream, client).await });
        }

        info!("Proxy listener stopped");
        Ok(())
    }

    async fn serve_plain(self: Arc<Self>, stream: TcpStream, client: SocketAddr) {
        let connection = Arc::new(ClientConnection::plain(
            self.engine.next_connection_id(),
            client,
        ));
        trace!("Connection {} from {}", connection.id, client);

        let server = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            let connection = connection.clone();
            async move { Ok::<_, Infallible>(server.handle(req, connection).await) }
        });
        self.serve_connection(TokioIo::new(stream), service).await;
    }

    async fn serve_connection<I, S>(&self, io: I, service: S)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
        S: hyper::service::Service<Request<Incoming>, Response = Response<ProxyBody>>
            + Send
            + 'static,
        S::Future: Send + 'static,
        S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let metrics = self.engine.metrics();
        metrics.active_connections.inc();

        let shutdown = self.engine.shutdown_token();
        let builder = ConnBuilder::new(TokioExecutor::new());
        let connection = builder.serve_connection_with_upgrades(io, service);
        tokio::select! {
            result = connection => {
                if let Err(e) = result {
                    debug!("Connection closed with error: {}", e);
                }
            }
            _ = shutdown.cancelled() => {}
        }

        metrics.active_connections.dec();
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        connection: Arc<ClientConnection>,
    ) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req, connection).await;
        }
        self.handle_exchange(req, connection).await
    }

    /// Requests inside a decrypted tunnel. Nested tunnels are refused.
    async fn handle_decrypted(
        self: Arc<Self>,
        req: Request<Incoming>,
        connection: Arc<ClientConnection>,
    ) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Nested CONNECT not supported");
        }
        self.handle_exchange(req, connection).await
    }

    async fn handle_connect(
        self: Arc<Self>,
        req: Request<Incoming>,
        connection: Arc<ClientConnection>,
    ) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            return text_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
        };

        let decrypt = self.authority.is_some()
            && self
                .engine
                .should_decrypt(authority.host(), Some(connection.client))
                .await;
        self.engine.metrics().record_tunnel(decrypt);
        debug!(
            "CONNECT {} ({})",
            authority,
            if decrypt { "decrypting" } else { "blind" }
        );

        let server = self.clone();
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!("Upgrade failed for {}: {}", authority, e);
                    return;
                }
            };
            let result = if decrypt {
                server
                    .decrypt_tunnel(upgraded, authority.clone(), connection.client)
                    .await
            } else {
                blind_tunnel(upgraded, &authority).await
            };
            if let Err(e) = result {
                debug!("Tunnel to {} closed: {}", authority, e);
            }
        });

        Response::new(Empty::<Bytes>::new().boxed())
    }

    async fn decrypt_tunnel(
        self: Arc<Self>,
        upgraded: Upgraded,
        authority: Authority,
        client: SocketAddr,
    ) -> Result<()> {
        let ca = self
            .authority
            .as_ref()
            .ok_or_else(|| TransportError::Tls("no certificate authority loaded".into()))?;
        let config = ca.server_config(bare_host(authority.host()))?;

        let stream = match TlsAcceptor::from(config)
            .accept(TokioIo::new(upgraded))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.engine.metrics().tls_errors.inc();
                return Err(TransportError::Tls(e.to_string()).into());
            }
        };

        let connection = Arc::new(ClientConnection::decrypted(
            self.engine.next_connection_id(),
            client,
            authority,
        ));
        let server = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            let connection = connection.clone();
            async move { Ok::<_, Infallible>(server.handle_decrypted(req, connection).await) }
        });
        self.serve_connection(TokioIo::new(stream), service).await;
        Ok(())
    }

    async fn handle_exchange(
        self: Arc<Self>,
        req: Request<Incoming>,
        connection: Arc<ClientConnection>,
    ) -> Response<ProxyBody> {
        let Some(url) = connection.absolute_url(req.uri(), req.headers()) else {
            return text_response(StatusCode::BAD_REQUEST, "Request target has no host");
        };

        let (parts, body) = req.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body for {}: {}", url, e);
                return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let mut request = InterceptedRequest::new(parts.method, url);
        request.version = parts.version;
        request.body = Payload::from_wire(&parts.headers, bytes);
        request.headers = parts.headers;

        let exchange = Exchange::new(connection.next_key(), request)
            .with_client(connection.client)
            .decrypted(connection.tunnel.is_some());

        // detached, so a client hanging up cannot skip finalization
        let server = self.clone();
        match tokio::spawn(async move { server.process(exchange).await }).await {
            Ok(response) => response,
            Err(e) => {
                error!("Exchange task failed: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Exchange processing failed")
            }
        }
    }

    async fn process(&self, mut exchange: Exchange) -> Response<ProxyBody> {
        let timer = RequestTimer::new(self.engine.metrics().clone());
        let disposition = self.engine.on_request(&mut exchange).await;

        let mut failed = false;
        if disposition.forwards() {
            match self.forward(&exchange.request).await {
                Ok(response) => {
                    exchange.response = Some(response);
                    if disposition.is_intercepted() {
                        self.engine.on_response(&mut exchange).await;
                    }
                }
                Err(e) => {
                    warn!("{} {}: {}", exchange.request.method, exchange.url(), e);
                    exchange.respond(InterceptedResponse::text(
                        StatusCode::BAD_GATEWAY,
                        e.to_string(),
                    ));
                    failed = true;
                }
            }
        }

        if disposition.is_intercepted() {
            self.engine.on_response_complete(&exchange).await;
        }

        if failed {
            timer.fail();
        } else {
            timer.finish();
        }

        let response = exchange.response.take().unwrap_or_else(|| {
            InterceptedResponse::text(StatusCode::BAD_GATEWAY, "No response produced")
        });
        into_hyper(response)
    }

    /// Send a request to its origin and buffer the answer
    async fn forward(
        &self,
        request: &InterceptedRequest,
    ) -> std::result::Result<InterceptedResponse, TransportError> {
        let mut headers = strip_hop_by_hop(&request.headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        let response = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(headers)
            .body(request.body.to_bytes())
            .send()
            .await
            .map_err(|e| TransportError::Upstream(e.to_string()))?;

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Upstream(e.to_string()))?;

        Ok(InterceptedResponse::from_wire(status, headers, bytes))
    }
}

async fn blind_tunnel(upgraded: Upgraded, authority: &Authority) -> Result<()> {
    let host = bare_host(authority.host());
    let port = authority.port_u16().unwrap_or(443);
    let mut upstream = TcpStream::connect((host, port)).await?;
    let mut client = TokioIo::new(upgraded);
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    trace!("Tunnel to {} finished: {} bytes up, {} bytes down", authority, sent, received);
    Ok(())
}

/// `[::1]` to `::1`
fn bare_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: HashSet<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut kept = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) || listed.contains(name_str) {
            continue;
        }
        kept.append(name.clone(), value.clone());
    }
    kept
}

fn into_hyper(response: InterceptedResponse) -> Response<ProxyBody> {
    let body = response.body.to_bytes();
    let mut headers = response.headers;
    // the body may have been rewritten; hyper derives the framing
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);

    let mut out = Response::new(Full::new(body).boxed());
    *out.status_mut() = response.status;
    *out.headers_mut() = headers;
    out
}

fn text_response(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    into_hyper(InterceptedResponse::text(status, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_strip_hop_by_hop_honors_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let kept = strip_hop_by_hop(&headers);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept["accept"], "*/*");
    }

    #[test]
    fn test_absolute_url_forms() {
        let client: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("plain.test:8080"));

        let plain = ClientConnection::plain(1, client);
        let uri: Uri = "http://api.test/a?b=1".parse().unwrap();
        assert_eq!(plain.absolute_url(&uri, &headers).unwrap(), "http://api.test/a?b=1");
        let origin: Uri = "/x".parse().unwrap();
        assert_eq!(plain.absolute_url(&origin, &headers).unwrap(), "http://plain.test:8080/x");

        let tls = ClientConnection::decrypted(2, client, "api.test:443".parse().unwrap());
        assert_eq!(tls.absolute_url(&origin, &headers).unwrap(), "https://api.test/x");
        let odd = ClientConnection::decrypted(3, client, "api.test:8443".parse().unwrap());
        assert_eq!(odd.absolute_url(&origin, &headers).unwrap(), "https://api.test:8443/x");
    }

    #[test]
    fn test_correlation_keys_are_sequential_per_connection() {
        let connection = ClientConnection::plain(7, "127.0.0.1:1".parse().unwrap());
        assert_eq!(connection.next_key(), CorrelationKey::new(7, 0));
        assert_eq!(connection.next_key(), CorrelationKey::new(7, 1));
    }

    #[test]
    fn test_bare_host_strips_brackets() {
        assert_eq!(bare_host("[::1]"), "::1");
        assert_eq!(bare_host("example.com"), "example.com");
    }
}
