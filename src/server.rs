//! HTTP gateway server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::admission::{AdmissionController, AdmissionLayer, StatsSnapshot};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::ClientKeyResolver;

/// HTTP server fronting every route with admission control.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission controller instance
    controller: Arc<AdmissionController>,
    /// How client keys are derived from requests
    resolver: ClientKeyResolver,
}

impl GatewayServer {
    /// Create a new gateway server.
    pub fn new(
        addr: SocketAddr,
        controller: Arc<AdmissionController>,
        resolver: ClientKeyResolver,
    ) -> Self {
        Self {
            addr,
            controller,
            resolver,
        }
    }

    /// Build the router with the admission layer applied.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/admission/stats", get(stats))
            .fallback(not_found)
            .with_state(self.controller.clone())
            .layer(AdmissionLayer::new(
                self.controller.clone(),
                self.resolver.clone(),
            ))
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind listener");
            TurnstileError::Io(e)
        })?;

        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router();

        info!(
            addr = %listener.local_addr().unwrap_or(self.addr),
            "Starting HTTP gateway with admission control"
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

async fn health() -> &'static str {
    "turnstile is healthy"
}

async fn stats(State(controller): State<Arc<AdmissionController>>) -> Json<StatsSnapshot> {
    Json(controller.stats().snapshot())
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    use super::*;
    use crate::clock::SystemClock;
    use crate::config::TurnstileConfig;
    use crate::store::InMemoryStore;

    fn create_test_server(limit: u64) -> GatewayServer {
        let mut config = TurnstileConfig::default();
        config.admission.limit = limit;
        let settings = config.admission_settings().unwrap();

        let controller = Arc::new(AdmissionController::from_settings(
            Arc::new(InMemoryStore::new()),
            Arc::new(SystemClock),
            &settings,
        ));
        GatewayServer::new(
            "127.0.0.1:0".parse().unwrap(),
            controller,
            ClientKeyResolver::default(),
        )
    }

    fn get_from(uri: &str, ip: &str) -> Request<Body> {
        let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let addr: SocketAddr = format!("{}:50000", ip).parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let router = create_test_server(10).router();

        let response = router.oneshot(get_from("/health", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "turnstile is healthy");
    }

    #[tokio::test]
    async fn test_not_found_is_json() {
        let router = create_test_server(10).router();

        let response = router.oneshot(get_from("/nope", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, r#"{"error":"not found"}"#);
    }

    #[tokio::test]
    async fn test_stats_reflect_decisions() {
        let router = create_test_server(2).router();

        for _ in 0..2 {
            router.clone().oneshot(get_from("/health", "1.2.3.4")).await.unwrap();
        }
        let limited = router.clone().oneshot(get_from("/health", "1.2.3.4")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = router.oneshot(get_from("/admission/stats", "5.6.7.8")).await.unwrap();
        let stats: StatsSnapshot = serde_json::from_str(&body_string(response).await).unwrap();

        // The stats request itself was admitted before the snapshot was taken.
        assert_eq!(stats.admitted, 3);
        assert_eq!(stats.rejected_rate, 1);
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let server = create_test_server(10);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_on(listener, async move {
            let _ = rx.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("turnstile is healthy"));

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
