//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admission, AdmissionState};
use crate::config::FailurePolicy;
use crate::error::Result;
use crate::ratelimit::DecisionEngine;
use crate::store::CounterStore;

/// Body of the demonstration endpoint.
pub const GREETING: &str = "Hello, world!";

/// Build the router with every route behind the admission middleware.
pub fn router<S: CounterStore + 'static>(state: AdmissionState<S>) -> Router {
    Router::new()
        .route("/", get(hello))
        .layer(from_fn_with_state(state, admission::<S>))
}

async fn hello() -> &'static str {
    GREETING
}

/// HTTP server fronting the decision engine.
pub struct HttpServer<S: CounterStore + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared middleware state
    state: AdmissionState<S>,
}

impl<S: CounterStore + 'static> HttpServer<S> {
    /// Create a new HTTP server.
    pub fn new(
        addr: SocketAddr,
        engine: Arc<DecisionEngine<S>>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            addr,
            state: AdmissionState::new(engine, failure_policy),
        }
    }

    /// The configured listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            failure_policy = ?self.state.failure_policy(),
            "Starting HTTP server with graceful shutdown"
        );

        let app = router(self.state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::PolicyTable;
    use crate::store::MemoryCounterStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn engine() -> Arc<DecisionEngine<MemoryCounterStore>> {
        Arc::new(DecisionEngine::new(
            Arc::new(MemoryCounterStore::connected()),
            Arc::new(PolicyTable::default()),
        ))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let server = HttpServer::new(addr, engine(), FailurePolicy::Closed);
        assert_eq!(server.addr(), addr);
    }

    #[tokio::test]
    async fn test_serves_over_tcp_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(addr, engine(), FailurePolicy::Closed);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(server.serve_on(listener, async {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with(GREETING));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
