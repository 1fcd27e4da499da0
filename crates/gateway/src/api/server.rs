//! HTTP API server implementation

use crate::api::routes;
use crate::app::AppState;
use anyhow::{Context, Result};
use axum::{http::Method, Router};
use config::ServerConfig;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

/// HTTP API server
pub struct ApiServer {
    app: Router,
    addr: SocketAddr,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(state: Arc<AppState>) -> Result<Self> {
        let server = &state.config.server;
        let addr: SocketAddr = format!("{}:{}", server.host, server.port)
            .parse()
            .context("Invalid server host/port configuration")?;

        let app = router(state);
        info!("API server configured for {}", addr);

        Ok(Self { app, addr })
    }

    /// Serve until `shutdown` is cancelled, letting in-flight requests finish
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .context("Failed to bind to server address")?;

        info!("API server listening on {}", self.addr);

        axum::serve(listener, self.app.clone())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("API server error")?;

        info!("API server stopped");
        Ok(())
    }
}

/// Routes wrapped in tracing, timeout and CORS layers
pub fn router(state: Arc<AppState>) -> Router {
    let server = state.config.server.clone();

    routes::create_routes()
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(server.request_timeout_seconds)))
        .layer(cors_layer(&server))
        .with_state(state)
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    if !server.cors_enabled {
        return CorsLayer::new();
    }
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn test_cors_headers_on_layered_router() {
        let app = router(test_support::state());
        let request = Request::builder()
            .uri("/healthz")
            .header(header::ORIGIN, "http://localhost:3000")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let state = test_support::state();
        let mut config = state.config.clone();
        config.server.host = "not a host".to_string();
        let state = Arc::new(AppState::new(config).unwrap());
        assert!(ApiServer::new(state).is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let state = test_support::state();
        let mut config = state.config.clone();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        let server = ApiServer::new(Arc::new(AppState::new(config).unwrap())).unwrap();

        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move { server.run(token).await })
        };
        token.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
