//! Weighted HTTP/1 proxy for one environment.
//!
//! `TrafficProxy` accepts client connections and forwards each request to
//! the revision [`Router::next_backend`] picks. The router is re-synced
//! from the state store on a fixed tick, so a split written by any
//! process takes effect here within one interval.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::router::Router;
use crate::stored::StoredTraffic;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub struct TrafficProxy {
    environment: String,
    listener: TcpListener,
    router: Router,
    source: StoredTraffic,
    sync_interval: Duration,
}

impl TrafficProxy {
    /// Bind `addr` for `environment`. Routing starts from the stored split.
    pub async fn bind(
        environment: &str,
        addr: SocketAddr,
        source: StoredTraffic,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind proxy for {environment} on {addr}"))?;
        let router = Router::new();
        source.sync_router(&router, environment)?;
        Ok(Self {
            environment: environment.to_string(),
            listener,
            router,
            source,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        })
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown signal. One task per connection.
    pub async fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let environment = self.environment;
        info!(%environment, addr = ?self.listener.local_addr().ok(), "traffic proxy listening");
        let mut ticker = tokio::time::interval(self.sync_interval);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    let (stream, peer_addr) = accept_result.context("accept failed")?;
                    let router = self.router.clone();
                    let environment = environment.clone();

                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let svc = service_fn(move |req: Request<Incoming>| {
                            let router = router.clone();
                            let environment = environment.clone();
                            async move { Ok::<_, Infallible>(forward(&router, &environment, req).await) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            debug!(%peer_addr, error = %e, "client connection error");
                        }
                    });
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.source.sync_router(&self.router, &environment) {
                        warn!(%environment, error = %e, "router sync failed, keeping last routes");
                    }
                }
                _ = shutdown.changed() => {
                    info!(%environment, "traffic proxy shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn forward(router: &Router, environment: &str, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(route) = router.next_backend(environment) else {
        return plain(StatusCode::SERVICE_UNAVAILABLE, "no revision is serving");
    };
    match send(&route.endpoint, req).await {
        Ok(response) => response.map(|body| body.boxed_unsync()),
        Err(e) => {
            warn!(%environment, revision = %route.revision, error = %e, "upstream request failed");
            plain(StatusCode::BAD_GATEWAY, "upstream unavailable")
        }
    }
}

/// Forward over a fresh connection to a plain-HTTP `endpoint`.
async fn send(endpoint: &str, mut req: Request<Incoming>) -> Result<Response<Incoming>, String> {
    let authority = endpoint
        .strip_prefix("http://")
        .ok_or_else(|| format!("cannot forward to {endpoint}: only http upstreams are proxied"))?
        .trim_end_matches('/');
    let stream = TcpStream::connect(authority)
        .await
        .map_err(|e| format!("connect {authority}: {e}"))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| format!("handshake {authority}: {e}"))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "upstream connection closed");
        }
    });

    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();
    *req.uri_mut() = path
        .parse()
        .map_err(|e: http::uri::InvalidUri| e.to_string())?;
    sender
        .send_request(req)
        .await
        .map_err(|e| format!("request to {authority}: {e}"))
}

fn plain(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use cutover_core::{RevisionId, TrafficSplit};
    use cutover_state::StateStore;

    use crate::TrafficBackend;

    /// Upstream answering every request with `body`.
    async fn upstream(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://127.0.0.1:{port}")
    }

    async fn get(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nhost: prod\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    async fn start(source: StoredTraffic) -> (SocketAddr, tokio::sync::watch::Sender<bool>) {
        let proxy = TrafficProxy::bind("prod", "127.0.0.1:0".parse().unwrap(), source)
            .await
            .unwrap()
            .with_sync_interval(Duration::from_millis(20));
        let addr = proxy.local_addr().unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(proxy.serve(rx));
        (addr, tx)
    }

    #[tokio::test]
    async fn follows_split_changes_in_the_store() {
        let store = StateStore::open_in_memory().unwrap();
        let traffic = StoredTraffic::new(store);
        let v1 = RevisionId::from("v1");
        let v2 = RevisionId::from("v2");
        traffic.attach("prod", &v1, &upstream("blue").await).await.unwrap();
        traffic.attach("prod", &v2, &upstream("green").await).await.unwrap();
        traffic.apply(&TrafficSplit::all_to("prod", &v1)).await.unwrap();

        let (addr, _shutdown) = start(traffic.clone()).await;
        assert!(get(addr).await.ends_with("blue"));

        traffic.apply(&TrafficSplit::all_to("prod", &v2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(get(addr).await.ends_with("green"));
    }

    #[tokio::test]
    async fn no_split_is_service_unavailable() {
        let store = StateStore::open_in_memory().unwrap();
        let (addr, _shutdown) = start(StoredTraffic::new(store)).await;
        assert!(get(addr).await.starts_with("HTTP/1.1 503"));
    }

    #[tokio::test]
    async fn dead_upstream_is_bad_gateway() {
        let store = StateStore::open_in_memory().unwrap();
        let traffic = StoredTraffic::new(store);
        let v1 = RevisionId::from("v1");
        traffic.attach("prod", &v1, "http://127.0.0.1:1").await.unwrap();
        traffic.apply(&TrafficSplit::all_to("prod", &v1)).await.unwrap();

        let (addr, _shutdown) = start(traffic).await;
        assert!(get(addr).await.starts_with("HTTP/1.1 502"));
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let proxy = TrafficProxy::bind("prod", "127.0.0.1:0".parse().unwrap(), StoredTraffic::new(store))
            .await
            .unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let server = tokio::spawn(proxy.serve(rx));
        tx.send(true).unwrap();
        assert!(server.await.unwrap().is_ok());
    }
}
