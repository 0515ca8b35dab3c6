use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::http::HeaderMap;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

use crate::bridge::telemetry;
use crate::bridge::tunnel::{
    envelope::{RequestEnvelope, ResponseEnvelope},
    pending::PendingTable,
    registry::{ClientConn, Registry},
    transport::TransportError,
};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("client not found: {0}")]
    ClientNotFound(String),
    #[error("dispatch failed: {0}")]
    DispatchFailed(#[from] TransportError),
    #[error("client did not respond within {0:?}")]
    Timeout(Duration),
    #[error("pending slot closed without a response")]
    Abandoned,
}

impl RendezvousError {
    fn outcome(&self) -> &'static str {
        match self {
            RendezvousError::ClientNotFound(_) => "not_found",
            RendezvousError::DispatchFailed(_) => "dispatch_failed",
            RendezvousError::Timeout(_) => "timeout",
            RendezvousError::Abandoned => "abandoned",
        }
    }
}

/// A public request as received on the ingress side, before it becomes an envelope.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    /// Path below the client's preview prefix, without the leading slash.
    pub subpath: String,
    pub raw_query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Pairs public requests with tunnel responses.
pub struct Rendezvous {
    registry: Arc<Registry>,
    pending: Arc<PendingTable>,
    timeout: Duration,
}

impl Rendezvous {
    pub fn new(registry: Arc<Registry>, pending: Arc<PendingTable>, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_RESPONSE_TIMEOUT
        } else {
            timeout
        };
        Self {
            registry,
            pending,
            timeout,
        }
    }

    pub async fn forward(
        &self,
        key: &str,
        req: InboundRequest,
    ) -> Result<ResponseEnvelope, RendezvousError> {
        let started = Instant::now();
        let res = self.forward_inner(key, req).await;

        let outcome = match &res {
            Ok(_) => "delivered",
            Err(err) => err.outcome(),
        };
        metrics::counter!(telemetry::REQUESTS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        res
    }

    async fn forward_inner(
        &self,
        key: &str,
        req: InboundRequest,
    ) -> Result<ResponseEnvelope, RendezvousError> {
        let conn = self
            .registry
            .lookup(key)
            .await
            .ok_or_else(|| RendezvousError::ClientNotFound(key.to_string()))?;

        // The slot must exist before the envelope leaves, or a fast reply would be unroutable.
        let (id, rx) = self.pending.create();
        let _slot = SlotGuard {
            pending: &self.pending,
            id: &id,
        };

        let env = build_envelope(id.clone(), &req, &conn);
        tracing::debug!(
            key=%key,
            conn_id=conn.id,
            request_id=%id,
            method=%env.method,
            path=%env.path,
            "tunnel: dispatching request"
        );

        // One deadline covers the write too: a client that stops reading stalls the socket.
        let deadline = Instant::now() + self.timeout;
        match tokio::time::timeout_at(deadline, conn.send(&env)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(key=%key, request_id=%id, err=%err, "tunnel: failed to send request to client");
                return Err(err.into());
            }
            Err(_) => {
                tracing::warn!(
                    key=%key,
                    request_id=%id,
                    timeout=%humantime::format_duration(self.timeout),
                    "tunnel: request write stalled"
                );
                return Err(RendezvousError::Timeout(self.timeout));
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(RendezvousError::Abandoned),
            Err(_) => {
                tracing::warn!(
                    key=%key,
                    request_id=%id,
                    timeout=%humantime::format_duration(self.timeout),
                    "tunnel: client did not respond in time"
                );
                Err(RendezvousError::Timeout(self.timeout))
            }
        }
    }
}

/// Removes the pending slot when the waiter stops waiting, including when the caller's future
/// is dropped mid-wait.
struct SlotGuard<'a> {
    pending: &'a PendingTable,
    id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// Flattens an inbound request into the wire envelope. Repeated header names and query keys
/// keep their first value only.
pub fn build_envelope(id: String, req: &InboundRequest, conn: &ClientConn) -> RequestEnvelope {
    let mut path = format!("/{}", req.subpath);
    let raw_query = req.raw_query.as_deref().unwrap_or("");
    if !raw_query.is_empty() {
        path.push('?');
        path.push_str(raw_query);
    }

    let mut headers = HashMap::with_capacity(req.headers.keys_len());
    for name in req.headers.keys() {
        if let Some(v) = req.headers.get(name) {
            headers.insert(
                name.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            );
        }
    }

    RequestEnvelope {
        request_id: id,
        method: req.method.clone(),
        path,
        headers,
        query: first_query_values(raw_query),
        body: String::from_utf8_lossy(&req.body).into_owned(),
        port: conn.port.clone(),
        domain: conn.domain.clone(),
    }
}

fn first_query_values(raw_query: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if raw_query.is_empty() {
        return out;
    }
    let Some(pairs) = parse_query_pairs(raw_query) else {
        return out;
    };
    for (k, v) in pairs {
        out.entry(k).or_insert(v);
    }
    out
}

fn parse_query_pairs(raw_query: &str) -> Option<Vec<(String, String)>> {
    let uri: axum::http::Uri = format!("/?{raw_query}").parse().ok()?;
    axum::extract::Query::<Vec<(String, String)>>::try_from_uri(&uri)
        .ok()
        .map(|q| q.0)
}
