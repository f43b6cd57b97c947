//! HTTP endpoint serving the metrics feed

use crate::assembler::Assembler;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const LANDING_PAGE: &str = "<html>\
<head><title>Accelerator Exporter</title></head>\
<body>\
<h1>Accelerator Exporter</h1>\
<p><a href=\"/metrics\">Metrics</a></p>\
</body>\
</html>";

/// Create the Axum application
///
/// `/` serves a landing page, `/health` a liveness probe, and every other
/// path the metrics feed.
pub fn create_app(assembler: Arc<Assembler>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .fallback(metrics_handler)
        .with_state(assembler)
}

async fn index_handler() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

async fn health_handler() -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
        .into_response()
}

/// Assemble a scrape off the async runtime
async fn metrics_handler(State(assembler): State<Arc<Assembler>>) -> Response {
    match tokio::task::spawn_blocking(move || assembler.scrape()).await {
        Ok(Ok(metrics)) => (StatusCode::OK, [("content-type", CONTENT_TYPE)], metrics).into_response(),
        Ok(Err(e)) => {
            warn!("Failed to assemble metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to assemble metrics").into_response()
        }
        Err(e) => {
            error!("Scrape task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to assemble metrics").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MetricCatalog;
    use accel_telemetry::mock::MockLibrary;
    use accel_telemetry::topology::discover;
    use accel_telemetry::{DiscoveryLimits, MetricStore, TelemetrySource};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn assembler() -> Arc<Assembler> {
        let source = TelemetrySource::new(Arc::new(MockLibrary::new(1, 1)), 1);
        let topology = discover(&source, &DiscoveryLimits::default()).unwrap();
        let store = Arc::new(MetricStore::new());
        store.reset_generation(Arc::new(topology));
        Arc::new(Assembler::new(store, &MetricCatalog::default()).unwrap())
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let response = metrics_handler(State(assembler())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], CONTENT_TYPE);

        let body = body_text(response).await;
        assert!(body.contains("accel_device_type{"));
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "healthy");
    }

    async fn get(address: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(address).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_routes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let app = create_app(assembler());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let landing = get(address, "/").await;
        assert!(landing.starts_with("HTTP/1.1 200"));
        assert!(landing.contains("<h1>Accelerator Exporter</h1>"));

        let health = get(address, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains("healthy"));

        for path in ["/metrics", "/anything/else"] {
            let metrics = get(address, path).await;
            assert!(metrics.starts_with("HTTP/1.1 200"));
            assert!(metrics.contains("accel_driver_ver{"));
        }

        server.abort();
    }
}
