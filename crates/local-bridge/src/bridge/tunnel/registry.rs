use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::RwLock;

use crate::bridge::telemetry;
use crate::bridge::tunnel::{
    envelope::{self, RequestEnvelope},
    transport::{TransportError, TunnelSink},
};

/// One registered tunnel connection.
pub struct ClientConn {
    pub id: u64,
    pub key: String,
    pub remote: String,
    /// Target host/port announced by the client at registration; stamped into every envelope.
    pub domain: String,
    pub port: String,
    pub started_at_unix_ms: u64,
    sink: Arc<dyn TunnelSink>,
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl ClientConn {
    pub async fn send(&self, env: &RequestEnvelope) -> Result<(), TransportError> {
        let text =
            envelope::encode_request(env).map_err(|err| TransportError::Write(err.to_string()))?;
        self.sink.send_text(text).await
    }

    pub async fn close(&self) {
        self.sink.close().await;
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientSnapshot {
    pub key: String,
    pub conn_id: u64,
    pub remote: String,
    pub domain: String,
    pub port: String,
    pub started_at_unix_ms: u64,
}

/// Active tunnel connections, at most one per client key.
pub struct Registry {
    id_seq: AtomicU64,
    clients: RwLock<HashMap<String, Arc<ClientConn>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            id_seq: AtomicU64::new(1),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Builds a connection handle with a fresh identity. It is not registered yet.
    pub fn new_conn(
        &self,
        key: &str,
        sink: Arc<dyn TunnelSink>,
        remote: String,
        domain: String,
        port: String,
    ) -> Arc<ClientConn> {
        Arc::new(ClientConn {
            id: self.id_seq.fetch_add(1, Ordering::Relaxed),
            key: key.to_string(),
            remote,
            domain: domain.trim().to_string(),
            port: port.trim().to_string(),
            started_at_unix_ms: telemetry::now_unix_ms(),
            sink,
        })
    }

    /// Installs `conn` for its key, replacing any previous connection. The superseded
    /// connection is returned but not closed; its listener keeps running until its socket ends.
    pub async fn register(&self, conn: Arc<ClientConn>) -> Option<Arc<ClientConn>> {
        let mut st = self.clients.write().await;
        let prev = st.insert(conn.key.clone(), conn);
        let n = st.len();
        drop(st);

        metrics::gauge!(telemetry::TUNNEL_CLIENTS).set(n as f64);
        prev
    }

    pub async fn lookup(&self, key: &str) -> Option<Arc<ClientConn>> {
        self.clients.read().await.get(key).cloned()
    }

    /// Removes the entry for `key` only while it still points at connection `conn_id`.
    pub async fn unregister(&self, key: &str, conn_id: u64) -> bool {
        let mut st = self.clients.write().await;
        let removed = if st.get(key).is_some_and(|c| c.id == conn_id) {
            st.remove(key).is_some()
        } else {
            false
        };
        let n = st.len();
        drop(st);

        if removed {
            metrics::gauge!(telemetry::TUNNEL_CLIENTS).set(n as f64);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<ClientSnapshot> {
        let st = self.clients.read().await;
        let mut out = st
            .values()
            .map(|c| ClientSnapshot {
                key: c.key.clone(),
                conn_id: c.id,
                remote: c.remote.clone(),
                domain: c.domain.clone(),
                port: c.port.clone(),
                started_at_unix_ms: c.started_at_unix_ms,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;

    /// Records every frame written to it; optionally fails every write.
    pub(crate) struct FakeSink {
        pub(crate) tx: Option<mpsc::UnboundedSender<String>>,
    }

    #[async_trait]
    impl TunnelSink for FakeSink {
        async fn send_text(&self, text: String) -> Result<(), TransportError> {
            match &self.tx {
                Some(tx) => tx.send(text).map_err(|_| TransportError::Closed),
                None => Err(TransportError::Write("broken pipe".into())),
            }
        }

        async fn close(&self) {}
    }

    pub(crate) fn sink_pair() -> (Arc<dyn TunnelSink>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(FakeSink { tx: Some(tx) }), rx)
    }

    pub(crate) fn broken_sink() -> Arc<dyn TunnelSink> {
        Arc::new(FakeSink { tx: None })
    }

    fn conn(reg: &Registry, key: &str) -> Arc<ClientConn> {
        let (sink, _rx) = sink_pair();
        reg.new_conn(key, sink, "127.0.0.1:5000".into(), "".into(), "".into())
    }

    #[tokio::test]
    async fn register_last_write_wins() {
        let reg = Registry::new();
        let c1 = conn(&reg, "alice-app");
        let c2 = conn(&reg, "alice-app");
        assert_ne!(c1.id, c2.id);

        assert!(reg.register(c1.clone()).await.is_none());
        let prev = reg.register(c2.clone()).await.expect("superseded conn");
        assert_eq!(prev.id, c1.id);

        let got = reg.lookup("alice-app").await.expect("lookup");
        assert_eq!(got.id, c2.id);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn lookup_unknown_key_is_none() {
        let reg = Registry::new();
        assert!(reg.lookup("nobody-here").await.is_none());
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_connection() {
        let reg = Registry::new();
        let old = conn(&reg, "alice-app");
        let new = conn(&reg, "alice-app");
        reg.register(old.clone()).await;
        reg.register(new.clone()).await;

        assert!(!reg.unregister("alice-app", old.id).await);
        assert_eq!(reg.lookup("alice-app").await.map(|c| c.id), Some(new.id));

        assert!(reg.unregister("alice-app", new.id).await);
        assert!(reg.lookup("alice-app").await.is_none());
    }

    #[tokio::test]
    async fn unregister_does_not_touch_other_keys() {
        let reg = Registry::new();
        let a = conn(&reg, "alice-app");
        let b = conn(&reg, "bob-app");
        reg.register(a.clone()).await;
        reg.register(b.clone()).await;

        assert!(reg.unregister("alice-app", a.id).await);
        assert!(!reg.unregister("alice-app", b.id).await);
        assert_eq!(reg.lookup("bob-app").await.map(|c| c.id), Some(b.id));

        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].key, "bob-app");
        assert_eq!(snap[0].remote, "127.0.0.1:5000");
    }
}
