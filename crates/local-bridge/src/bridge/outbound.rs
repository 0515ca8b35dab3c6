//! Plain pass-through: turn a request envelope into a real HTTP call and capture the result.
//!
//! Tunnel clients post envelopes here when the target they need is only reachable from the
//! broker's network.

use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use reqwest::{
    Method, Url,
    header::{HeaderName, HeaderValue},
};
use thiserror::Error;

use crate::bridge::tunnel::envelope::{RequestEnvelope, ResponseEnvelope};

/// Request headers that describe the original hop and are recomputed by the client.
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding"];

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("failed to create request: {0}")]
    InvalidRequest(String),
    #[error("failed to make request: {0}")]
    Request(#[source] reqwest::Error),
    #[error("failed to read response body: {0}")]
    ReadBody(#[source] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct Outbound {
    client: reqwest::Client,
}

impl Outbound {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("outbound: build http client")?;
        Ok(Self { client })
    }

    pub async fn call(&self, env: &RequestEnvelope) -> Result<ResponseEnvelope, OutboundError> {
        let url = target_url(env)?;
        let method = if env.method.trim().is_empty() {
            Method::GET
        } else {
            Method::from_bytes(env.method.trim().as_bytes())
                .map_err(|_| OutboundError::InvalidRequest(format!("bad method {:?}", env.method)))?
        };

        tracing::info!(method=%method, url=%url, "outbound: proxy call");

        let mut rb = self.client.request(method, url).body(env.body.clone());
        for (k, v) in &env.headers {
            if SKIPPED_REQUEST_HEADERS
                .iter()
                .any(|s| k.eq_ignore_ascii_case(s))
            {
                continue;
            }
            match (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                (Ok(name), Ok(value)) => rb = rb.header(name, value),
                _ => tracing::debug!(header=%k, "outbound: skipping invalid header"),
            }
        }

        let resp = rb.send().await.map_err(OutboundError::Request)?;

        let status_code = i64::from(resp.status().as_u16());
        let mut headers = HashMap::with_capacity(resp.headers().keys_len());
        for name in resp.headers().keys() {
            if let Some(v) = resp.headers().get(name) {
                headers.insert(
                    name.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                );
            }
        }

        let body = resp.bytes().await.map_err(OutboundError::ReadBody)?;

        Ok(ResponseEnvelope {
            request_id: env.request_id.clone(),
            status_code,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// `http://{domain}[:{port}]{path}` plus the query map, unless `path` already carries a query.
pub fn target_url(env: &RequestEnvelope) -> Result<Url, OutboundError> {
    let domain = env.domain.trim();
    if domain.is_empty() {
        return Err(OutboundError::InvalidRequest("missing domain".into()));
    }

    let path = env.path.trim();
    let sep = if path.starts_with('/') { "" } else { "/" };
    let port = env.port.trim();
    let raw = if port.is_empty() {
        format!("http://{domain}{sep}{path}")
    } else {
        format!("http://{domain}:{port}{sep}{path}")
    };

    let mut url = Url::parse(&raw)
        .map_err(|err| OutboundError::InvalidRequest(format!("{raw}: {err}")))?;

    if url.query().is_none() && !env.query.is_empty() {
        let mut pairs = env.query.iter().collect::<Vec<_>>();
        pairs.sort();
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(url)
}
