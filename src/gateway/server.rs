//! HTTP server for the rate limit service.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::service::RateLimitService;
use crate::error::Result;

/// How long in-flight connections get to finish after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP server answering rate limit decisions.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The service every connection is bound to
    service: Arc<RateLimitService>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, service: Arc<RateLimitService>) -> Self {
        Self { addr, service }
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;
        self.serve_listener(listener, signal).await
    }

    /// Serve connections from an already bound listener until `signal` resolves.
    ///
    /// Open connections are drained for a bounded time after the signal.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server for rate limit decisions"
        );

        let graceful = GracefulShutdown::new();
        tokio::pin!(signal);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = &mut signal => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            };
            let _ = stream.set_nodelay(true);

            let service = Arc::clone(&self.service);
            let svc = service_fn(move |req: Request<Incoming>| {
                let service = Arc::clone(&service);
                async move { Ok::<_, Infallible>(service.handle(req, Some(peer)).await) }
            });

            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
            let conn = graceful.watch(conn);

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(peer = %peer, error = %e, "Connection closed with error");
                }
            });
        }

        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections drained");
            }
            _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
                warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Timed out draining connections");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitingConfig;
    use crate::ratelimit::{RateLimitPolicy, SystemClock};
    use tokio::sync::oneshot;

    async fn start(max_requests: u32) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let config = RateLimitingConfig {
            max_requests,
            local_fallback: true,
            ..RateLimitingConfig::default()
        };
        let policy = Arc::new(RateLimitPolicy::from_config(&config, Arc::new(SystemClock)));
        let service = Arc::new(RateLimitService::new(policy, "/api/health"));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = HttpServer::new(addr, service);
        let handle = tokio::spawn(server.serve_listener(listener, async {
            let _ = rx.await;
        }));

        (addr, tx, handle)
    }

    #[tokio::test]
    async fn test_serves_decisions_over_tcp() {
        let (addr, tx, handle) = start(2).await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/api/v0/posts", addr);

        let first = client.get(&url).send().await.unwrap();
        assert_eq!(first.status().as_u16(), 200);
        assert_eq!(first.headers()["x-ratelimit-limit"], "2");
        assert_eq!(first.headers()["x-ratelimit-remaining"], "1");

        client.get(&url).send().await.unwrap();
        let third = client.get(&url).send().await.unwrap();
        assert_eq!(third.status().as_u16(), 429);

        let health = client
            .get(format!("http://{}/api/health", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status().as_u16(), 200);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_without_connections() {
        let (_addr, tx, handle) = start(5).await;

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;

        assert!(result.unwrap().unwrap().is_ok());
    }
}
