//! HTTP surface: routes, shared state and the proxy handler
//!
//! Every request that is not `/health` or `/metrics` is forwarded to the
//! Copilot API. Forwarding failures become JSON errors; upstream statuses,
//! error statuses included, are relayed to the client unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::error::UpstreamError;
use crate::forward::{Forwarder, is_hop_by_hop, upstream_path};
use crate::metrics;
use crate::relay::{ClientBody, relay};

/// Upstream path for both model listing aliases.
const MODELS_PATH: &str = "/models";

/// Counters reported on `/health`.
#[derive(Clone)]
pub struct ServerStats {
    pub started_at: Instant,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub forwarder: Arc<Forwarder>,
    pub stats: ServerStats,
    pub prometheus: PrometheusHandle,
    pub max_body_bytes: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/models", any(models_handler))
        .route(MODELS_PATH, any(models_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

/// JSON error body: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Reports 503 once the current token has expired, which only happens
/// when refreshes have been failing for a while.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let token = state.forwarder.tokens().current();
    let now = tokio::time::Instant::now();
    let expires_in = token.expires_in(now).as_secs();

    let (status_code, status) = if expires_in > 0 {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": state.stats.started_at.elapsed().as_secs(),
        "requests_served": state.stats.requests_total.load(Ordering::Relaxed),
        "errors_total": state.stats.errors_total.load(Ordering::Relaxed),
        "token": {
            "refresh_in_seconds": token.refresh_in(now).as_secs(),
            "expires_in_seconds": expires_in,
        },
    });

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn models_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    proxy_request(&state, request, new_request_id(), Some(MODELS_PATH)).await
}

async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    proxy_request(&state, request, new_request_id(), None).await
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[derive(Deserialize)]
struct CompletionRequest {
    model: Option<String>,
}

/// Model named by an inbound `/v1/chat/completions` request, if any.
fn requested_model(inbound_path: &str, body: &[u8]) -> Option<String> {
    if inbound_path != "/v1/chat/completions" {
        return None;
    }
    serde_json::from_slice::<CompletionRequest>(body).ok()?.model
}

/// Forward one request and relay the response.
///
/// `path_override` replaces the inbound path; otherwise the inbound path
/// goes through `upstream_path`.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &AppState,
    request: Request<Body>,
    request_id: String,
    path_override: Option<&'static str>,
) -> Response {
    let started = Instant::now();
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);

    let (parts, body) = request.into_parts();
    let method = parts.method;
    let path = match path_override {
        Some(path) => path,
        None => upstream_path(parts.uri.path()),
    };

    let reject = |status: StatusCode, message: &str| {
        state.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        metrics::record_request(status.as_u16(), method.as_str(), started.elapsed().as_secs_f64());
        error_response(status, message, &request_id)
    };

    if let Some(len) = declared_length(&parts.headers)
        && len > state.max_body_bytes
    {
        warn!(content_length = len, limit = state.max_body_bytes, "request body too large");
        return reject(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("request body exceeds {} bytes", state.max_body_bytes),
        );
    }

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return reject(StatusCode::BAD_REQUEST, &format!("invalid request body: {e}"));
        }
    };

    if let Some(model) = requested_model(parts.uri.path(), &body) {
        info!(%model, "chat completion requested");
    }

    let upstream = match state
        .forwarder
        .forward(method.clone(), path, parts.uri.query(), &parts.headers, body)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            metrics::record_upstream_error(e.kind());
            error!(error = %e, "upstream request failed");
            let status = match e {
                UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                UpstreamError::Connect(_) | UpstreamError::Request(_) => StatusCode::BAD_GATEWAY,
            };
            return reject(status, &e.to_string());
        }
    };

    let status = upstream.status();
    metrics::record_request(status.as_u16(), method.as_str(), started.elapsed().as_secs_f64());
    if status.is_success() {
        debug!(status = status.as_u16(), "relaying upstream response");
    } else {
        warn!(status = status.as_u16(), "upstream returned error status");
    }

    relay_response(upstream, &request_id).await
}

/// Start relaying `upstream` on its own task and hand back the response.
///
/// Success responses stream chunk by chunk; anything else is read whole and
/// sent in one piece. The task ends when the body is done, the upstream
/// fails, or the client goes away.
async fn relay_response(upstream: reqwest::Response, request_id: &str) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let (mut target, client) = ClientBody::channel(status.is_success());
    let client_gone = target.client_gone();

    tokio::spawn(
        async move {
            let outcome = tokio::select! {
                result = relay(&mut target, status, &headers, upstream.bytes_stream()) => Some(result),
                _ = client_gone => None,
            };
            match outcome {
                Some(Ok(stats)) => {
                    debug!(bytes = stats.bytes, writes = stats.writes, "relay complete");
                }
                Some(Err(e)) => {
                    warn!(error = %e, stage = e.stage(), "relay stopped early");
                    metrics::record_stream_error(e.stage());
                    target.abort(&e).await;
                }
                None => {
                    debug!("client disconnected, dropping upstream body");
                    metrics::record_stream_error("write");
                }
            }
        }
        .in_current_span(),
    );

    let Ok((status, headers)) = client.head.await else {
        return error_response(
            StatusCode::BAD_GATEWAY,
            "upstream response ended before headers were relayed",
            request_id,
        );
    };

    let mut response = Response::new(client.body);
    *response.status_mut() = status;
    for (name, value) in &headers {
        if !is_hop_by_hop(name.as_str()) {
            response.headers_mut().append(name.clone(), value.clone());
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{start_echo_server, test_tokens};
    use bytes::Bytes;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    #[test]
    fn model_is_read_only_from_local_completions_path() {
        let body = br#"{"model":"gpt-4o","messages":[]}"#;
        assert_eq!(
            requested_model("/v1/chat/completions", body).as_deref(),
            Some("gpt-4o")
        );
        assert_eq!(requested_model("/chat/completions", body), None);
        assert_eq!(requested_model("/v1/embeddings", body), None);
        assert_eq!(requested_model("/v1/chat/completions", b"not json"), None);
        assert_eq!(requested_model("/v1/chat/completions", b"{}"), None);
    }

    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    async fn test_app_state(upstream_url: &str, timeout: Duration) -> AppState {
        let tokens = test_tokens("tid=proxy-token").await;
        AppState {
            forwarder: Arc::new(
                Forwarder::new(reqwest::Client::new(), upstream_url, tokens, timeout).unwrap(),
            ),
            stats: ServerStats::new(),
            prometheus: test_prometheus_handle(),
            max_body_bytes: 1024 * 1024,
        }
    }

    async fn send(app: Router, request: Request<Body>) -> Response {
        app.oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_token_schedule() {
        let state = test_app_state("http://unused.invalid", Duration::from_secs(5)).await;
        state.stats.requests_total.fetch_add(3, Ordering::Relaxed);

        let response = send(build_router(state), get_request("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["requests_served"], 3);
        assert!(json["uptime_seconds"].is_u64());

        let expires_in = json["token"]["expires_in_seconds"].as_u64().unwrap();
        let refresh_in = json["token"]["refresh_in_seconds"].as_u64().unwrap();
        assert!(expires_in > 1400 && expires_in <= 1500, "got {expires_in}");
        assert_eq!(expires_in - refresh_in, 60);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_app_state("http://unused.invalid", Duration::from_secs(5)).await;
        let response = send(build_router(state), get_request("/metrics")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"), "got {content_type}");
    }

    #[tokio::test]
    async fn proxy_injects_token_and_client_headers() {
        let upstream = start_echo_server().await;
        let state = test_app_state(&upstream, Duration::from_secs(5)).await;

        let request = Request::builder()
            .uri("/v1/embeddings")
            .method("POST")
            .header("authorization", "Bearer caller-key")
            .header("x-request-tag", "kept")
            .body(Body::from(r#"{"input":"hi"}"#))
            .unwrap();
        let response = send(build_router(state), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-upstream-echo"], "true");

        let json = json_body(response).await;
        let headers = &json["echoed_headers"];
        assert_eq!(json["path"], "/v1/embeddings", "other paths are not rewritten");
        assert_eq!(json["body"], r#"{"input":"hi"}"#);
        assert_eq!(headers["authorization"], "Bearer tid=proxy-token");
        assert_eq!(headers["x-request-tag"], "kept");
        assert_eq!(headers["editor-version"], "vscode/1.98.1");
        assert_eq!(headers["editor-plugin-version"], "copilot-chat/0.26.7");
        assert_eq!(headers["x-github-api-version"], "2025-04-01");
        assert_eq!(headers["openai-intent"], "conversation-panel");
        assert_eq!(
            headers["x-vscode-user-agent-library-version"],
            "electron-fetch"
        );
        assert_eq!(headers["user-agent"], copilot_auth::USER_AGENT);
    }

    #[tokio::test]
    async fn chat_completions_path_is_aliased() {
        let upstream = start_echo_server().await;
        let state = test_app_state(&upstream, Duration::from_secs(5)).await;

        let request = Request::builder()
            .uri("/v1/chat/completions")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"model":"gpt-4o","messages":[]}"#))
            .unwrap();
        let json = json_body(send(build_router(state), request).await).await;
        assert_eq!(json["path"], "/chat/completions");
        assert_eq!(json["method"], "POST");
    }

    #[tokio::test]
    async fn both_model_routes_reach_upstream_models() {
        let upstream = start_echo_server().await;
        for uri in ["/v1/models", "/models?filter=chat"] {
            let state = test_app_state(&upstream, Duration::from_secs(5)).await;
            let json = json_body(send(build_router(state), get_request(uri)).await).await;
            assert_eq!(json["path"], "/models", "for {uri}");
        }

        let state = test_app_state(&upstream, Duration::from_secs(5)).await;
        let json = json_body(send(build_router(state), get_request("/models?filter=chat")).await).await;
        assert_eq!(json["query"], "filter=chat");
    }

    #[tokio::test]
    async fn hop_by_hop_request_headers_are_stripped() {
        let upstream = start_echo_server().await;
        let state = test_app_state(&upstream, Duration::from_secs(5)).await;

        let request = Request::builder()
            .uri("/v1/test")
            .header("proxy-authorization", "Basic secret")
            .header("te", "trailers")
            .header("x-custom", "kept")
            .body(Body::empty())
            .unwrap();
        let json = json_body(send(build_router(state), request).await).await;
        let headers = &json["echoed_headers"];
        assert!(headers.get("proxy-authorization").is_none());
        assert!(headers.get("te").is_none());
        assert_eq!(headers["x-custom"], "kept");
    }

    #[tokio::test]
    async fn hop_by_hop_response_headers_are_stripped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().fallback(|| async {
                (
                    StatusCode::OK,
                    [
                        ("x-legit-header", "keep-me"),
                        ("proxy-authenticate", "Basic realm=test"),
                    ],
                    "ok",
                )
            });
            axum::serve(listener, app).await.unwrap();
        });

        let state = test_app_state(&format!("http://{addr}"), Duration::from_secs(5)).await;
        let response = send(build_router(state), get_request("/anything")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-legit-header"], "keep-me");
        assert!(response.headers().get("proxy-authenticate").is_none());
    }

    #[tokio::test]
    async fn upstream_error_status_passes_through_unchanged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().fallback(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "30")],
                    axum::Json(serde_json::json!({
                        "error": {"type": "rate_limit_error", "message": "slow down"}
                    })),
                )
            });
            axum::serve(listener, app).await.unwrap();
        });

        let state = test_app_state(&format!("http://{addr}"), Duration::from_secs(5)).await;
        let errors_total = state.stats.errors_total.clone();
        let response = send(build_router(state), get_request("/v1/chat/completions")).await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "30");
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "rate_limit_error");
        assert_eq!(
            errors_total.load(Ordering::Relaxed),
            0,
            "upstream statuses are not proxy errors"
        );
    }

    #[tokio::test]
    async fn dead_upstream_returns_502_with_request_id() {
        let state = test_app_state("http://127.0.0.1:1", Duration::from_secs(5)).await;
        let errors_total = state.stats.errors_total.clone();
        let response = send(build_router(state), get_request("/v1/models")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(json["error"]["message"].is_string());
        let request_id = json["error"]["request_id"].as_str().unwrap();
        assert!(request_id.starts_with("req_"), "got {request_id}");
        assert_eq!(request_id.len(), 4 + 32);
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn slow_upstream_returns_504() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(socket);
                });
            }
        });

        let state = test_app_state(&format!("http://{addr}"), Duration::from_millis(50)).await;
        let response = send(build_router(state), get_request("/v1/slow")).await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("timeout")
        );
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_forwarding() {
        let upstream = start_echo_server().await;
        let mut state = test_app_state(&upstream, Duration::from_secs(5)).await;
        state.max_body_bytes = 16;

        let request = Request::builder()
            .uri("/v1/chat/completions")
            .method("POST")
            .header("content-length", "17")
            .body(Body::from(vec![b'x'; 17]))
            .unwrap();
        let response = send(build_router(state), request).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let json = json_body(response).await;
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
    }

    #[tokio::test]
    async fn undeclared_oversized_body_is_rejected() {
        let upstream = start_echo_server().await;
        let mut state = test_app_state(&upstream, Duration::from_secs(5)).await;
        state.max_body_bytes = 16;

        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"0123456789")),
        ]);
        let request = Request::builder()
            .uri("/v1/chat/completions")
            .method("POST")
            .body(Body::from_stream(chunks))
            .unwrap();
        let response = send(build_router(state), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn streamed_events_reach_client_before_upstream_finishes() {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
        let event_rx = Arc::new(std::sync::Mutex::new(Some(event_rx)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().fallback(move || {
                let event_rx = event_rx.clone();
                async move {
                    let rx = event_rx.lock().unwrap().take().unwrap();
                    (
                        StatusCode::OK,
                        [("content-type", "text/event-stream")],
                        Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx)),
                    )
                }
            });
            axum::serve(listener, app).await.unwrap();
        });

        let state = test_app_state(&format!("http://{addr}"), Duration::from_secs(5)).await;
        event_tx
            .send(Ok(Bytes::from_static(b"data: first\n\n")))
            .await
            .unwrap();

        let response = send(build_router(state), get_request("/v1/chat/completions")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut body = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("first event must arrive while upstream is still open")
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"data: first\n\n");

        event_tx
            .send(Ok(Bytes::from_static(b"data: [DONE]\n\n")))
            .await
            .unwrap();
        drop(event_tx);

        let mut rest = Vec::new();
        while let Some(chunk) = body.next().await {
            rest.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(rest, b"data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn metrics_record_proxied_requests() {
        use std::sync::OnceLock;
        static GLOBAL_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

        let handle = GLOBAL_HANDLE
            .get_or_init(|| {
                metrics_exporter_prometheus::PrometheusBuilder::new()
                    .install_recorder()
                    .expect("failed to install test Prometheus recorder")
            })
            .clone();

        let upstream = start_echo_server().await;
        let mut state = test_app_state(&upstream, Duration::from_secs(5)).await;
        state.prometheus = handle;

        let response = send(build_router(state.clone()), get_request("/v1/models")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(build_router(state), get_request("/metrics")).await;
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let rendered = String::from_utf8(body.to_vec()).unwrap();
        assert!(rendered.contains("proxy_requests_total"), "{rendered}");
        assert!(
            rendered.contains("proxy_request_duration_seconds"),
            "{rendered}"
        );
    }
}
