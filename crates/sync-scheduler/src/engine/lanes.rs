use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use change_detection::EventAck;
use sync_types::{ChangeEvent, DocId};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One event waiting in a lane, with the broker ack it has to settle.
pub(crate) struct QueuedEvent {
    pub(crate) event: ChangeEvent,
    pub(crate) ack: Option<EventAck>,
}

/// Per-document serialization: a FIFO lane per doc id, workers pull one
/// event at a time from lanes that are neither empty nor busy. Within a lane
/// events apply strictly in arrival order; across lanes the worker pool
/// provides bounded parallelism. There is no global lock around applies,
/// only around the queue bookkeeping.
pub(crate) struct Lanes {
    state: Mutex<LaneState>,
    /// Woken when a lane becomes ready or everything drains.
    notify: Notify,
}

#[derive(Default)]
struct LaneState {
    queues: HashMap<DocId, VecDeque<QueuedEvent>>,
    ready: VecDeque<DocId>,
    busy: HashSet<DocId>,
}

impl Lanes {
    pub(crate) fn new() -> Self {
        Self { state: Mutex::new(LaneState::default()), notify: Notify::new() }
    }

    pub(crate) fn push(&self, doc_id: DocId, event: QueuedEvent) {
        let mut state = self.state.lock().unwrap();
        let queue = state.queues.entry(doc_id.clone()).or_default();
        queue.push_back(event);
        if queue.len() == 1 && !state.busy.contains(&doc_id) {
            state.ready.push_back(doc_id);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Claim the next event of a ready lane, marking the lane busy until
    /// [`Lanes::done`]. Returns `None` on cancellation.
    pub(crate) async fn next(
        &self,
        cancel: &CancellationToken,
    ) -> Option<(DocId, QueuedEvent)> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(doc_id) = state.ready.pop_front() {
                    let event = state
                        .queues
                        .get_mut(&doc_id)
                        .and_then(VecDeque::pop_front)
                        .expect("ready lanes are never empty");
                    state.busy.insert(doc_id.clone());
                    return Some((doc_id, event));
                }
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Release a lane after an apply. The lane re-enters the ready list if
    /// more events arrived meanwhile.
    pub(crate) fn done(&self, doc_id: &DocId) {
        let mut state = self.state.lock().unwrap();
        state.busy.remove(doc_id);
        match state.queues.get(doc_id) {
            Some(queue) if !queue.is_empty() => state.ready.push_back(doc_id.clone()),
            _ => {
                state.queues.remove(doc_id);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.busy.is_empty() && state.queues.values().all(VecDeque::is_empty)
    }

    /// Wait until every queued event has been applied; used by `sync_now`
    /// completion and the pre-resync drain.
    pub(crate) async fn wait_idle(&self, cancel: &CancellationToken) {
        loop {
            if self.is_idle() || cancel.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_idle() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = notified => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sync_types::{ChangeType, FileMetadata};
    use uuid::Uuid;

    use super::*;

    fn event(path: &str) -> QueuedEvent {
        QueuedEvent {
            event: ChangeEvent::new(ChangeType::Update, FileMetadata::new(path)),
            ack: None,
        }
    }

    #[tokio::test]
    async fn same_lane_events_come_out_in_order_and_serialized() {
        let lanes = Lanes::new();
        let cancel = CancellationToken::new();
        let doc = DocId::new(Uuid::nil(), "/a");
        lanes.push(doc.clone(), event("/a"));
        lanes.push(doc.clone(), event("/a"));

        let (first, _) = lanes.next(&cancel).await.unwrap();
        assert_eq!(first, doc);
        // the lane is busy: nothing else may be claimed even though an event
        // is queued
        assert!(!lanes.is_idle());
        {
            let state = lanes.state.lock().unwrap();
            assert!(state.ready.is_empty());
        }
        lanes.done(&doc);
        let (second, _) = lanes.next(&cancel).await.unwrap();
        assert_eq!(second, doc);
        lanes.done(&doc);
        assert!(lanes.is_idle());
    }

    #[tokio::test]
    async fn distinct_lanes_are_claimable_concurrently() {
        let lanes = Lanes::new();
        let cancel = CancellationToken::new();
        let doc_a = DocId::new(Uuid::nil(), "/a");
        let doc_b = DocId::new(Uuid::nil(), "/b");
        lanes.push(doc_a.clone(), event("/a"));
        lanes.push(doc_b.clone(), event("/b"));

        let (first, _) = lanes.next(&cancel).await.unwrap();
        let (second, _) = lanes.next(&cancel).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiting_workers() {
        let lanes = Arc::new(Lanes::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let lanes = lanes.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lanes.next(&cancel).await.is_none() })
        };
        cancel.cancel();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_idle_returns_once_lanes_drain() {
        let lanes = Arc::new(Lanes::new());
        let cancel = CancellationToken::new();
        let doc = DocId::new(Uuid::nil(), "/a");
        lanes.push(doc.clone(), event("/a"));

        let waiter = {
            let lanes = lanes.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lanes.wait_idle(&cancel).await })
        };
        let (claimed, _) = lanes.next(&cancel).await.unwrap();
        lanes.done(&claimed);
        waiter.await.unwrap();
        assert!(lanes.is_idle());
    }
}
