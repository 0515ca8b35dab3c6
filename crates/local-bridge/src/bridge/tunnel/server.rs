use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{
        ConnectInfo, Path, Query, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::bridge::tunnel::{
    self, listener, pending::PendingTable, registry::Registry, transport::WsSink,
};

#[derive(Debug, Clone)]
pub struct TunnelState {
    pub registry: Arc<Registry>,
    pub pending: Arc<PendingTable>,
}

/// Optional registration parameters: where the client's local service lives.
#[derive(Debug, Default, Deserialize)]
pub struct RegisterParams {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub port: String,
}

pub fn router(state: TunnelState) -> Router {
    Router::new()
        .route("/ws/{user}/{component}", get(handle_ws))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    Path((user, component)): Path<(String, String)>,
    Query(params): Query<RegisterParams>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(st): State<Arc<TunnelState>>,
) -> Response {
    if user.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "user is required").into_response();
    }
    if component.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "component is required").into_response();
    }

    let key = tunnel::client_key(&user, &component);
    tracing::debug!(key=%key, client=%remote, "tunnel: websocket upgrade");

    ws.on_upgrade(move |socket| serve_socket(st, key, remote, params, socket))
}

async fn serve_socket(
    st: Arc<TunnelState>,
    key: String,
    remote: SocketAddr,
    params: RegisterParams,
    socket: WebSocket,
) {
    let (sink, stream) = socket.split();
    let conn = st.registry.new_conn(
        &key,
        Arc::new(WsSink::new(sink)),
        remote.to_string(),
        params.domain,
        params.port,
    );

    if let Some(prev) = st.registry.register(conn.clone()).await {
        tracing::info!(key=%key, conn_id=prev.id, remote=%prev.remote, "tunnel: connection superseded");
    }
    tracing::info!(
        key=%key,
        conn_id=conn.id,
        client=%remote,
        domain=%conn.domain,
        port=%conn.port,
        "tunnel: client connected"
    );

    listener::run(conn, stream, &st.registry, &st.pending).await;
}
