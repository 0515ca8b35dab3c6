use std::sync::Arc;

use axum::extract::ws::Message;
use futures_util::{Stream, StreamExt};

use crate::bridge::telemetry;
use crate::bridge::tunnel::{
    envelope::{self, ResponseEnvelope},
    pending::PendingTable,
    registry::{ClientConn, Registry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// Close frame or end of stream.
    Closed,
    ReadFailed,
    Malformed,
}

/// Read loop for one registered connection.
///
/// Every inbound frame must be a response envelope; it is routed to the pending table by
/// `request_id`. The first read or decode failure ends the loop and drops this connection from
/// the registry, unless a newer connection has taken the key in the meantime.
pub async fn run<S, E>(
    conn: Arc<ClientConn>,
    mut inbound: S,
    registry: &Registry,
    pending: &PendingTable,
) -> ListenerExit
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let exit = loop {
        let msg = match inbound.next().await {
            Some(Ok(m)) => m,
            Some(Err(err)) => {
                tracing::debug!(key=%conn.key, conn_id=conn.id, err=%err, "tunnel: read failed");
                break ListenerExit::ReadFailed;
            }
            None => break ListenerExit::Closed,
        };

        let decoded = match msg {
            Message::Text(t) => envelope::decode_response(t.as_str().as_bytes()),
            Message::Binary(b) => envelope::decode_response(&b),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break ListenerExit::Closed,
        };

        match decoded {
            Ok(resp) => route(&conn, pending, resp),
            Err(err) => {
                tracing::warn!(key=%conn.key, conn_id=conn.id, err=%err, "tunnel: dropping connection");
                break ListenerExit::Malformed;
            }
        }
    };

    let removed = registry.unregister(&conn.key, conn.id).await;
    conn.close().await;
    tracing::info!(
        key=%conn.key,
        conn_id=conn.id,
        remote=%conn.remote,
        exit=?exit,
        unregistered=removed,
        "tunnel: client disconnected"
    );
    exit
}

fn route(conn: &ClientConn, pending: &PendingTable, resp: ResponseEnvelope) {
    let id = resp.request_id.clone();
    if pending.deliver(&id, resp) {
        tracing::debug!(key=%conn.key, request_id=%id, "tunnel: response delivered");
    } else {
        metrics::counter!(telemetry::UNROUTABLE_RESPONSES_TOTAL).increment(1);
        tracing::debug!(key=%conn.key, request_id=%id, "tunnel: unroutable response");
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;
    use crate::bridge::tunnel::registry::tests::sink_pair;

    fn text(s: &str) -> Result<Message, std::io::Error> {
        Ok(Message::Text(s.to_string().into()))
    }

    async fn registered(reg: &Registry, key: &str) -> Arc<ClientConn> {
        let (sink, _rx) = sink_pair();
        let c = reg.new_conn(key, sink, String::new(), String::new(), String::new());
        reg.register(c.clone()).await;
        c
    }

    #[tokio::test]
    async fn routes_responses_then_unregisters_on_close() {
        let reg = Registry::new();
        let pending = PendingTable::new();
        let conn = registered(&reg, "alice-app").await;

        let (id, rx) = pending.create();
        let frame = format!(r#"{{"request_id":"{id}","status_code":200,"body":"hi"}}"#);
        let inbound = stream::iter(vec![
            text(r#"{"request_id":"nobody","status_code":200}"#),
            Ok(Message::Ping(Default::default())),
            text(&frame),
        ]);

        let exit = run(conn, inbound, &reg, &pending).await;
        assert_eq!(exit, ListenerExit::Closed);

        let got = rx.await.unwrap();
        assert_eq!(got.status_code, 200);
        assert_eq!(got.body, "hi");
        assert_eq!(pending.len(), 0);
        assert!(reg.lookup("alice-app").await.is_none());
    }

    #[tokio::test]
    async fn binary_frames_are_decoded_too() {
        let reg = Registry::new();
        let pending = PendingTable::new();
        let conn = registered(&reg, "alice-app").await;

        let (id, rx) = pending.create();
        let frame = format!(r#"{{"request_id":"{id}","status_code":202}}"#);
        let inbound = stream::iter(vec![Ok::<_, std::io::Error>(Message::Binary(
            frame.into_bytes().into(),
        ))]);

        run(conn, inbound, &reg, &pending).await;
        assert_eq!(rx.await.unwrap().status_code, 202);
    }

    #[tokio::test]
    async fn malformed_frame_terminates_only_this_connection() {
        let reg = Registry::new();
        let pending = PendingTable::new();
        let conn = registered(&reg, "alice-app").await;
        let _other = registered(&reg, "bob-app").await;

        let (other_id, _other_rx) = pending.create();
        let (late_id, late_rx) = pending.create();
        let late = format!(r#"{{"request_id":"{late_id}","status_code":200}}"#);
        let inbound = stream::iter(vec![text("not json"), text(&late)]);

        let exit = run(conn, inbound, &reg, &pending).await;
        assert_eq!(exit, ListenerExit::Malformed);

        // Frames after the bad one are never read.
        drop(late_rx);
        assert!(pending.remove(&late_id));
        assert!(pending.remove(&other_id));

        assert!(reg.lookup("alice-app").await.is_none());
        assert!(reg.lookup("bob-app").await.is_some());
    }

    #[tokio::test]
    async fn out_of_range_status_is_delivered_not_fatal() {
        let reg = Registry::new();
        let pending = PendingTable::new();
        let conn = registered(&reg, "alice-app").await;

        let (bad_id, bad_rx) = pending.create();
        let (next_id, next_rx) = pending.create();
        let bad = format!(r#"{{"request_id":"{bad_id}","status_code":70000}}"#);
        let next = format!(r#"{{"request_id":"{next_id}","status_code":200}}"#);
        let inbound = stream::iter(vec![text(&bad), text(&next)]);

        let exit = run(conn, inbound, &reg, &pending).await;
        assert_eq!(exit, ListenerExit::Closed);
        assert_eq!(bad_rx.await.unwrap().status_code, 70000);
        assert_eq!(next_rx.await.unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn read_error_terminates() {
        let reg = Registry::new();
        let pending = PendingTable::new();
        let conn = registered(&reg, "alice-app").await;

        let inbound = stream::iter(vec![Err::<Message, _>(std::io::Error::other("reset"))]);
        let exit = run(conn, inbound, &reg, &pending).await;
        assert_eq!(exit, ListenerExit::ReadFailed);
        assert_eq!(reg.len().await, 0);
    }

    #[tokio::test]
    async fn superseded_listener_exit_keeps_newer_connection() {
        let reg = Registry::new();
        let pending = PendingTable::new();
        let old = registered(&reg, "alice-app").await;
        let new = registered(&reg, "alice-app").await;

        let inbound = stream::iter(Vec::<Result<Message, std::io::Error>>::new());
        run(old, inbound, &reg, &pending).await;

        assert_eq!(reg.lookup("alice-app").await.map(|c| c.id), Some(new.id));
    }
}
