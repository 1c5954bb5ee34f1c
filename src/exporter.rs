//! HTTP exposition of the registry on `/metrics`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ListenerError;
use crate::registry::CollectorRegistry;

pub const METRICS_PATH: &str = "/metrics";
const CONTENT_TYPE: &str = "text/plain; version=0.0.4";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Running exposition endpoint.
pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind and start serving on `runtime`. Bind failures are returned
    /// immediately; everything after that is logged.
    pub fn start(
        registry: Arc<CollectorRegistry>,
        config: &ServerConfig,
        runtime: &Handle,
    ) -> Result<Self, ListenerError> {
        let addr = format!("{}:{}", config.host, config.port);
        let std_listener = std::net::TcpListener::bind(&addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(accept_loop(listener, registry, shutdown_rx));
        info!(%local_addr, path = METRICS_PATH, "metrics endpoint listening");

        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the accept loop to stop without waiting for it.
    pub fn signal_stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop accepting, let in-flight scrapes finish, then return.
    pub async fn stop(self) -> Result<(), ListenerError> {
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| ListenerError::Server(e.to_string()))?;
        info!(local_addr = %self.local_addr, "metrics endpoint stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<CollectorRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let registry = Arc::clone(&registry);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, registry, shutdown).await {
                            debug!(%peer, error = %e, "metrics connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "metrics accept error"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        error!("metrics connections did not drain in time, aborting them");
        connections.abort_all();
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    registry: Arc<CollectorRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), hyper::Error> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        async move { Ok::<_, hyper::Error>(handle_request(&req, &registry)) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);
    tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    }
}

fn handle_request(req: &Request<Incoming>, registry: &CollectorRegistry) -> Response<Full<Bytes>> {
    if req.uri().path() != METRICS_PATH {
        return text_response(StatusCode::NOT_FOUND, Bytes::from_static(b"not found"));
    }
    match registry.encode_text() {
        Ok(body) => text_response(StatusCode::OK, Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                Bytes::from_static(b"metrics unavailable"),
            )
        }
    }
}

fn text_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(CONTENT_TYPE),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::LabelValues;
    use crate::registry::{MetricDefinition, MetricKind};
    use crate::schema::LabelSchema;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_scrape_and_stop() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let registry = Arc::new(CollectorRegistry::new().unwrap());
        registry.reconfigure(vec![MetricDefinition::new(
            "scrape_hits",
            "hits",
            MetricKind::Counter,
            LabelSchema::from_variables(["user"]),
        )]);
        registry
            .record("scrape_hits", 1.0, &LabelValues::new(["alice"]))
            .unwrap();

        let server = MetricsServer::start(Arc::clone(&registry), &local_config(), runtime.handle()).unwrap();
        let base = format!("http://{}", server.local_addr());

        let body = reqwest::blocking::get(format!("{base}{METRICS_PATH}"))
            .unwrap()
            .text()
            .unwrap();
        assert!(body.contains(r#"scrape_hits{user="alice"} 1"#), "{body}");

        let missing = reqwest::blocking::get(format!("{base}/other")).unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        runtime.block_on(server.stop()).unwrap();
        assert!(reqwest::blocking::get(format!("{base}{METRICS_PATH}")).is_err());
    }

    #[test]
    fn test_bind_conflict_is_an_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let registry = Arc::new(CollectorRegistry::new().unwrap());
        let first = MetricsServer::start(Arc::clone(&registry), &local_config(), runtime.handle()).unwrap();

        let taken = ServerConfig {
            port: first.local_addr().port(),
            ..local_config()
        };
        assert!(MetricsServer::start(registry, &taken, runtime.handle()).is_err());
        runtime.block_on(first.stop()).unwrap();
    }
}
