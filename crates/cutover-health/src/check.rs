//! Single-attempt health checks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Boxed future alias for check results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of one check attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    /// The endpoint reported healthy (2xx).
    Pass,
    /// The endpoint answered with an explicit failure (non-2xx).
    Fail(String),
    /// No answer: connection refused, TLS or HTTP handshake failure, or
    /// request timeout.
    NoResponse(String),
}

/// One health check attempt against a URL.
pub trait HealthCheck: Send + Sync {
    fn check<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, CheckResult>;
}

/// HTTP/1.1 `GET` check over hyper, for `http` and `https` targets.
#[derive(Debug, Clone)]
pub struct HttpCheck {
    user_agent: String,
    tls: Arc<rustls::ClientConfig>,
}

impl HttpCheck {
    /// A check that trusts the Mozilla root certificates for `https`.
    pub fn new() -> Result<Self, String> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("tls protocol version error: {e}"))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self::with_tls_config(Arc::new(config)))
    }

    /// A check using a pre-built client configuration for `https`.
    pub fn with_tls_config(tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            user_agent: concat!("cutover-health/", env!("CARGO_PKG_VERSION")).to_string(),
            tls,
        }
    }
}

impl HealthCheck for HttpCheck {
    fn check<'a>(&'a self, url: &'a str, timeout: Duration) -> BoxFuture<'a, CheckResult> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.http_check(url)).await {
                Ok(check) => check,
                Err(_) => {
                    debug!(%url, "health check timed out");
                    CheckResult::NoResponse(format!("{url} did not answer within {timeout:?}"))
                }
            }
        })
    }
}

impl HttpCheck {
    /// Perform a health check against `url` (`http[s]://host[:port]/path`).
    ///
    /// Returns `Pass` if the response is 2xx, `Fail` for any other status,
    /// or `NoResponse` if the connection or TLS handshake fails.
    async fn http_check(&self, url: &str) -> CheckResult {
        let uri: http::Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => return CheckResult::NoResponse(format!("invalid health url {url}: {e}")),
        };
        let secure = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            _ => return CheckResult::NoResponse(format!("unsupported scheme in {url}")),
        };
        let (Some(host), Some(authority)) = (uri.host(), uri.authority()) else {
            return CheckResult::NoResponse(format!("no host in {url}"));
        };
        let default_port = if secure { 443 } else { 80 };
        let address = format!("{host}:{}", uri.port_u16().unwrap_or(default_port));
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let request = Request {
            url,
            path: &path,
            host: authority.as_str(),
            user_agent: &self.user_agent,
        };

        let stream = match TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %url, "health check connection failed");
                return CheckResult::NoResponse(format!("connect {address}: {e}"));
            }
        };
        if !secure {
            return request.send(stream).await;
        }

        let server_name = match ServerName::try_from(host.trim_matches(['[', ']']).to_string()) {
            Ok(name) => name,
            Err(e) => return CheckResult::NoResponse(format!("invalid tls name {host}: {e}")),
        };
        let connector = TlsConnector::from(self.tls.clone());
        match connector.connect(server_name, stream).await {
            Ok(tls) => request.send(tls).await,
            Err(e) => {
                debug!(error = %e, %url, "health check tls handshake failed");
                CheckResult::NoResponse(format!("tls handshake {address}: {e}"))
            }
        }
    }
}

/// One `GET` over an established connection.
struct Request<'a> {
    url: &'a str,
    path: &'a str,
    host: &'a str,
    user_agent: &'a str,
}

impl Request<'_> {
    async fn send<S>(&self, stream: S) -> CheckResult
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let url = self.url;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %url, "health check handshake failed");
                return CheckResult::NoResponse(format!("handshake {}: {e}", self.host));
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(self.path)
            .header("host", self.host)
            .header("user-agent", self.user_agent)
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => return CheckResult::NoResponse(format!("building request: {e}")),
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    CheckResult::Pass
                } else {
                    debug!(status = %resp.status(), %url, "health check non-2xx");
                    CheckResult::Fail(format!("{url} returned {}", resp.status()))
                }
            }
            Err(e) => {
                debug!(error = %e, %url, "health check request failed");
                CheckResult::NoResponse(format!("request {url}: {e}"))
            }
        }
    }
}
