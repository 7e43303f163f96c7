use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};

use crate::config::HttpConfig;
use crate::metrics::Metrics;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
/// Bound on serving one exposition request; slow readers get 408.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Metrics exposition endpoint: `GET /metrics` in Prometheus text format.
pub struct HttpServer {
    listener: TcpListener,
    metrics: Arc<Metrics>,
}

impl HttpServer {
    pub async fn bind(config: &HttpConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind metrics endpoint {addr}"))?;
        info!(addr = %addr, "metrics endpoint listening");

        Ok(Self { listener, metrics })
    }

    /// Serves until the shutdown signal flips, then drains gracefully.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .layer(TimeoutLayer::new(HTTP_TIMEOUT))
            .with_state(self.metrics);

        axum::serve(self.listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .context("metrics endpoint terminated unexpectedly")
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            error!(error = %err, "can't render metrics");
            let mut response = Response::new(Body::from(err.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    #[tokio::test]
    async fn metrics_endpoint_serves_text_exposition() {
        let metrics = Arc::new(Metrics::new().expect("build metrics"));
        metrics.inc_total_requests("192.0.2.5".parse::<IpAddr>().unwrap());
        metrics.inc_limited_requests();

        let config = HttpConfig {
            host: "127.0.0.1".to_string(),
            port: "0".to_string(),
        };
        let server = HttpServer::bind(&config, metrics).await.expect("bind");
        let addr = server.listener.local_addr().expect("addr");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(server.serve(shutdown_rx));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("send request");

        let mut body = String::new();
        timeout(Duration::from_secs(2), stream.read_to_string(&mut body))
            .await
            .expect("response in time")
            .expect("read response");

        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("text/plain; version=0.0.4"));
        assert!(body.contains("masquerade_dns_requests_limited_total 1"));
        assert!(body.contains("masquerade_dns_requests_processed_total{remote_ip=\"192.0.2.5\"} 1"));

        shutdown_tx.send(true).expect("signal shutdown");
        timeout(Duration::from_secs(5), task)
            .await
            .expect("shutdown in time")
            .expect("join server")
            .expect("serve result");
    }
}
