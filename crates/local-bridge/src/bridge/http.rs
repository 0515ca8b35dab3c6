use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::bridge::{
    outbound::Outbound,
    telemetry,
    tunnel::{
        self,
        envelope::{self, ResponseEnvelope},
        registry::Registry,
        rendezvous::{InboundRequest, Rendezvous, RendezvousError},
    },
};

/// Response headers that only describe the tunnel hop; the broker frames the body itself.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

#[derive(Clone)]
pub struct ApiState {
    pub rendezvous: Arc<Rendezvous>,
    pub registry: Arc<Registry>,
    pub outbound: Arc<Outbound>,
    pub prom: Option<telemetry::SharedPrometheusHandle>,
}

pub fn router(state: ApiState, max_body_bytes: usize) -> Router {
    let shared = Arc::new(state);

    let ops = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/clients", get(clients))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/preview/{user}/{component}", any(preview))
        .route("/preview/{user}/{component}/", any(preview))
        .route("/preview/{user}/{component}/{*path}", any(preview))
        .route("/handle-client-req", post(handle_client_req))
        .merge(ops)
        .with_state(shared)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    listener: tokio::net::TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    })
    .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<ApiState>>) -> Response {
    match &st.prom {
        Some(prom) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            prom.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

async fn clients(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.registry.snapshot().await))
}

async fn preview(
    State(st): State<Arc<ApiState>>,
    Path(params): Path<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user = params.get("user").map(|s| s.trim()).unwrap_or("");
    if user.is_empty() {
        return (StatusCode::BAD_REQUEST, "user is required").into_response();
    }
    let component = params.get("component").map(|s| s.trim()).unwrap_or("");
    if component.is_empty() {
        return (StatusCode::BAD_REQUEST, "component is required").into_response();
    }

    let key = tunnel::client_key(user, component);
    tracing::debug!(key=%key, method=%method, uri=%uri, "preview: request");

    let req = InboundRequest {
        method: method.as_str().to_string(),
        subpath: params.get("path").cloned().unwrap_or_default(),
        raw_query: uri.query().map(str::to_string),
        headers,
        body,
    };

    match st.rendezvous.forward(&key, req).await {
        Ok(resp) => response_from_envelope(resp),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &RendezvousError) -> Response {
    let (status, msg) = match err {
        RendezvousError::ClientNotFound(_) => (StatusCode::NOT_FOUND, "component key not found"),
        RendezvousError::DispatchFailed(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to forward request to client",
        ),
        RendezvousError::Timeout(_) => {
            (StatusCode::GATEWAY_TIMEOUT, "client did not respond in time")
        }
        RendezvousError::Abandoned => (
            StatusCode::BAD_GATEWAY,
            "pending request closed without a response",
        ),
    };
    (status, msg).into_response()
}

/// Replays a tunnel response: status, one value per header name, body bytes as-is.
pub fn response_from_envelope(env: ResponseEnvelope) -> Response {
    let status = u16::try_from(env.status_code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok());
    let Some(status) = status else {
        tracing::warn!(request_id=%env.request_id, status_code=env.status_code, "preview: invalid status from client");
        return (
            StatusCode::BAD_GATEWAY,
            "client returned an invalid status code",
        )
            .into_response();
    };

    let mut resp = Response::new(Body::from(env.body));
    *resp.status_mut() = status;
    for (k, v) in env.headers {
        if SKIPPED_RESPONSE_HEADERS
            .iter()
            .any(|s| k.eq_ignore_ascii_case(s))
        {
            continue;
        }
        match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
            (Ok(name), Ok(value)) => {
                resp.headers_mut().insert(name, value);
            }
            _ => tracing::debug!(header=%k, "preview: skipping invalid response header"),
        }
    }
    resp
}

async fn handle_client_req(State(st): State<Arc<ApiState>>, body: Bytes) -> Response {
    let env = match envelope::decode_request(&body) {
        Ok(e) => e,
        Err(err) => {
            tracing::debug!(err=%err, "outbound: invalid request body");
            return respond_with_error(StatusCode::BAD_REQUEST, "invalid request body");
        }
    };

    match st.outbound.call(&env).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => {
            tracing::warn!(domain=%env.domain, path=%env.path, err=%err, "outbound: proxy call failed");
            respond_with_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn respond_with_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (
        status,
        Json(ResponseEnvelope::error(status.as_u16(), msg)),
    )
        .into_response()
}
