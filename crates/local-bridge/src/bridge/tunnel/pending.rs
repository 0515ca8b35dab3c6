use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::oneshot;

use crate::bridge::telemetry;
use crate::bridge::tunnel::envelope::ResponseEnvelope;

struct PendingSlot {
    tx: oneshot::Sender<ResponseEnvelope>,
    created: Instant,
}

/// In-flight requests awaiting a response envelope, keyed by request id.
///
/// A slot leaves the table exactly once: either [`PendingTable::deliver`] takes it and hands the
/// response over, or the waiter drops it through [`PendingTable::remove`]. Whichever comes second
/// finds nothing and does nothing.
pub struct PendingTable {
    seq: AtomicU64,
    slots: DashMap<String, PendingSlot>,
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("len", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
            slots: DashMap::new(),
        }
    }

    pub fn create(&self) -> (String, oneshot::Receiver<ResponseEnvelope>) {
        let (tx, rx) = oneshot::channel();
        loop {
            let id = self.next_id();
            if let Entry::Vacant(v) = self.slots.entry(id.clone()) {
                drop(v.insert(PendingSlot {
                    tx,
                    created: Instant::now(),
                }));
                self.update_gauge();
                return (id, rx);
            }
        }
    }

    /// Hands `resp` to the waiter of `id`. Returns false when no slot matches.
    pub fn deliver(&self, id: &str, resp: ResponseEnvelope) -> bool {
        let Some((_, slot)) = self.slots.remove(id) else {
            return false;
        };
        self.update_gauge();
        metrics::histogram!(telemetry::RESPONSE_LATENCY_SECONDS)
            .record(slot.created.elapsed().as_secs_f64());
        // oneshot send never waits; a receiver that already gave up just drops the value.
        slot.tx.send(resp).is_ok()
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.slots.remove(id).is_some();
        if removed {
            self.update_gauge();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    fn next_id(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{nanos}-{n}")
    }

    fn update_gauge(&self) {
        metrics::gauge!(telemetry::PENDING_REQUESTS).set(self.slots.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;

    fn resp(id: &str, status: i64) -> ResponseEnvelope {
        ResponseEnvelope {
            request_id: id.into(),
            status_code: status,
            ..Default::default()
        }
    }

    #[test]
    fn create_yields_unique_ids() {
        let t = PendingTable::new();
        let mut ids = HashSet::new();
        let mut rxs = Vec::new();
        for _ in 0..1000 {
            let (id, rx) = t.create();
            assert!(ids.insert(id), "duplicate pending id");
            rxs.push(rx);
        }
        assert_eq!(t.len(), 1000);
    }

    #[test]
    fn create_is_unique_across_threads() {
        let t = Arc::new(PendingTable::new());
        let handles = (0..4)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || {
                    (0..250).map(|_| t.create()).map(|(id, _rx)| id).collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut ids = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(ids.insert(id));
            }
        }
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test]
    async fn deliver_hands_response_to_waiter_and_clears_slot() {
        let t = PendingTable::new();
        let (id, rx) = t.create();

        assert!(t.deliver(&id, resp(&id, 201)));
        assert_eq!(t.len(), 0);

        let got = rx.await.unwrap();
        assert_eq!(got.status_code, 201);
        assert_eq!(got.request_id, id);

        // The waiter's unconditional cleanup finds nothing.
        assert!(!t.remove(&id));
    }

    #[test]
    fn deliver_without_slot_is_noop() {
        let t = PendingTable::new();
        assert!(!t.deliver("missing", resp("missing", 200)));
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn deliver_after_remove_is_noop() {
        let t = PendingTable::new();
        let (id, _rx) = t.create();
        assert!(t.remove(&id));
        assert!(!t.deliver(&id, resp(&id, 200)));
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn duplicate_delivery_only_reaches_first() {
        let t = PendingTable::new();
        let (id, mut rx) = t.create();
        assert!(t.deliver(&id, resp(&id, 200)));
        assert!(!t.deliver(&id, resp(&id, 500)));
        assert_eq!(rx.try_recv().unwrap().status_code, 200);
    }

    #[test]
    fn deliver_to_abandoned_receiver_does_not_panic() {
        let t = PendingTable::new();
        let (id, rx) = t.create();
        drop(rx);
        assert!(!t.deliver(&id, resp(&id, 200)));
        assert_eq!(t.len(), 0);
    }
}
