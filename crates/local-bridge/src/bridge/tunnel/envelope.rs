use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One public HTTP request, as written to the tunnel client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub method: String,
    /// Request path including the raw query string, if any.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub domain: String,
}

/// The tunnel client's answer to a [`RequestEnvelope`], matched by `request_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub request_id: String,
    /// Kept wide so an out-of-range status reaches the caller as a bad gateway instead of
    /// failing the whole frame.
    #[serde(default, deserialize_with = "lenient_status")]
    pub status_code: i64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl ResponseEnvelope {
    /// Error-shaped envelope used by the outbound proxy when it cannot produce a real response.
    pub fn error(status_code: u16, msg: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            status_code: status_code.into(),
            headers: HashMap::new(),
            body: msg.into(),
        }
    }
}

pub fn encode_request(env: &RequestEnvelope) -> Result<String, EnvelopeError> {
    Ok(serde_json::to_string(env)?)
}

pub fn decode_request(b: &[u8]) -> Result<RequestEnvelope, EnvelopeError> {
    Ok(serde_json::from_slice(b)?)
}

#[cfg(test)]
pub fn encode_response(env: &ResponseEnvelope) -> Result<String, EnvelopeError> {
    Ok(serde_json::to_string(env)?)
}

pub fn decode_response(b: &[u8]) -> Result<ResponseEnvelope, EnvelopeError> {
    Ok(serde_json::from_slice(b)?)
}

/// `null` reads as 0; integers outside `i64` are clamped.
fn lenient_status<'de, D>(d: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wide {
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match Option::<Wide>::deserialize(d)? {
        None => 0,
        Some(Wide::Signed(n)) => n,
        Some(Wide::Unsigned(n)) => i64::try_from(n).unwrap_or(i64::MAX),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_wire_field_names() {
        let env = RequestEnvelope {
            request_id: "r1".into(),
            method: "GET".into(),
            path: "/status?x=1".into(),
            headers: HashMap::from([("accept".into(), "*/*".into())]),
            query: HashMap::from([("x".into(), "1".into())]),
            body: String::new(),
            port: "3000".into(),
            domain: "localhost".into(),
        };

        let s = encode_request(&env).unwrap();
        let v: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["request_id"], "r1");
        assert_eq!(v["method"], "GET");
        assert_eq!(v["path"], "/status?x=1");
        assert_eq!(v["headers"]["accept"], "*/*");
        assert_eq!(v["query"]["x"], "1");
        assert_eq!(v["body"], "");
        assert_eq!(v["port"], "3000");
        assert_eq!(v["domain"], "localhost");
    }

    #[test]
    fn response_decodes_with_missing_optional_fields() {
        let env = decode_response(br#"{"request_id":"r9","status_code":204}"#).unwrap();
        assert_eq!(env.request_id, "r9");
        assert_eq!(env.status_code, 204);
        assert!(env.headers.is_empty());
        assert_eq!(env.body, "");
    }

    #[test]
    fn response_rejects_non_json_and_wrong_shapes() {
        assert!(decode_response(b"hello").is_err());
        assert!(decode_response(br#"{"request_id":"r1","status_code":"ok"}"#).is_err());
        assert!(decode_response(br#"{"request_id":"r1","headers":{"a":1}}"#).is_err());
    }

    #[test]
    fn response_keeps_out_of_range_status() {
        let env = decode_response(br#"{"request_id":"r","status_code":70000}"#).unwrap();
        assert_eq!(env.status_code, 70000);
        let env = decode_response(br#"{"request_id":"r","status_code":-1}"#).unwrap();
        assert_eq!(env.status_code, -1);
        let env = decode_response(br#"{"request_id":"r","status_code":null}"#).unwrap();
        assert_eq!(env.status_code, 0);
        let env = decode_response(br#"{"request_id":"r","status_code":18446744073709551615}"#)
            .unwrap();
        assert_eq!(env.status_code, i64::MAX);
    }

    #[test]
    fn request_decode_fills_missing_fields() {
        assert!(decode_request(b"nope").is_err());
        let env = decode_request(br#"{"method":"POST","body":"x","domain":"localhost"}"#).unwrap();
        assert_eq!(env.request_id, "");
        assert_eq!(env.method, "POST");
        assert_eq!(env.body, "x");
        assert_eq!(env.domain, "localhost");
        assert!(env.port.is_empty());
    }
}
