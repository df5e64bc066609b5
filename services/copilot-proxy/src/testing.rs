//! Shared fixtures for the service's unit tests

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use common::Secret;
use copilot_auth::ExchangeResponse;
use copilot_token::{TokenManager, TokenSource};
use tokio::net::TcpListener;

/// Token source that always hands out the same token.
pub(crate) struct FixedSource(pub &'static str);

impl TokenSource for FixedSource {
    fn fetch<'a>(
        &'a self,
        _credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = copilot_auth::Result<ExchangeResponse>> + Send + 'a>> {
        Box::pin(async move {
            Ok(ExchangeResponse {
                token: self.0.to_string(),
                expires_at: 1_700_001_500,
                refresh_in: 1500,
            })
        })
    }
}

pub(crate) async fn test_tokens(token: &'static str) -> Arc<TokenManager> {
    Arc::new(
        TokenManager::start(Secret::new("gho_test".to_string()), Arc::new(FixedSource(token)))
            .await
            .unwrap(),
    )
}

/// Mock upstream that echoes method, path, query, headers and body as JSON.
pub(crate) async fn start_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = axum::Router::new().fallback(|request: axum::http::Request<Body>| async move {
        let mut headers_map = serde_json::Map::new();
        for (name, value) in request.headers() {
            headers_map.insert(
                name.to_string(),
                serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
            );
        }
        let method = request.method().to_string();
        let path = request.uri().path().to_string();
        let query = request.uri().query().unwrap_or("").to_string();
        let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
            .await
            .unwrap();
        let body = serde_json::json!({
            "echoed_headers": headers_map,
            "method": method,
            "path": path,
            "query": query,
            "body": String::from_utf8_lossy(&body_bytes),
        });
        (
            StatusCode::OK,
            [("x-upstream-echo", "true")],
            axum::Json(body),
        )
    });

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}
