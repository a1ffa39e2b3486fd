//! Subscription multiplexing: one backend-level stream per distinct query,
//! fanned out to any number of logical subscribers.
//!
//! Per descriptor the lifecycle is Inactive -> Starting (first subscriber,
//! `open_stream` runs in a spawned pump task) -> Active (snapshots fanned
//! out) -> Closed (last subscriber gone, pump aborted and the backend stream
//! dropped) or Failed (terminal backend error, broadcast once to every
//! subscriber). A subscribe after Closed or Failed starts a fresh cycle.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::error::Error;
use crate::query::QueryDescriptor;
use crate::value::Document;

/// One event of a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A point-in-time materialization of the query's matching documents.
    Snapshot(Vec<Document>),
    /// Terminal stream failure; the subscription delivers nothing after this.
    Error(Error),
}

/// Owns the active backend streams and their subscriber sets.
///
/// Lock order is hub map first, then per-entry state, everywhere; neither
/// lock is ever held across an await.
pub struct SubscriptionHub {
    backend: Arc<dyn Backend>,
    active: Mutex<HashMap<QueryDescriptor, Arc<Shared>>>,
    // Handed to each entry so teardown can detach itself from `active`.
    self_ref: Weak<SubscriptionHub>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Active,
    Failed,
    Closed,
}

struct Shared {
    hub: Weak<SubscriptionHub>,
    descriptor: QueryDescriptor,
    state: Mutex<State>,
}

struct State {
    phase: Phase,
    next_id: u64,
    /// Kept in subscription order; snapshots are delivered in this order.
    subscribers: Vec<(u64, mpsc::UnboundedSender<SubscriptionEvent>)>,
    /// Last snapshot broadcast, replayed to late joiners so they never start
    /// behind an earlier subscriber.
    latest: Option<Vec<Document>>,
    pump: Option<JoinHandle<()>>,
}

impl SubscriptionHub {
    pub fn new(backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            backend,
            active: Mutex::new(HashMap::new()),
            self_ref: me.clone(),
        })
    }

    /// Subscribes to live snapshots for `descriptor`.
    ///
    /// Structurally equal descriptors share one backend stream; the map lock
    /// serializes concurrent subscribes so a race cannot open two.
    pub fn subscribe(&self, descriptor: QueryDescriptor) -> Subscription {
        let mut active = self.active.lock().unwrap();

        if let Some(shared) = active.get(&descriptor) {
            if let Some(subscription) = Shared::try_attach(shared) {
                return subscription;
            }
            // Entry is terminal but not yet detached; replace it.
            active.remove(&descriptor);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            hub: self.self_ref.clone(),
            descriptor: descriptor.clone(),
            state: Mutex::new(State {
                phase: Phase::Starting,
                next_id: 1,
                subscribers: vec![(0, tx)],
                latest: None,
                pump: None,
            }),
        });
        active.insert(descriptor, shared.clone());
        drop(active);

        debug!(
            "opening stream for collection {}",
            shared.descriptor.collection_path
        );
        let backend = self.backend.clone();
        let pump_shared = shared.clone();
        let handle = tokio::spawn(async move { pump(backend, pump_shared).await });

        // The first unsubscribe may have raced us here; if the entry already
        // closed, the pump must not outlive it.
        let mut state = shared.state.lock().unwrap();
        if matches!(state.phase, Phase::Closed | Phase::Failed) {
            handle.abort();
        } else {
            state.pump = Some(handle);
        }
        drop(state);

        Subscription {
            shared,
            id: 0,
            rx,
        }
    }

    /// Number of descriptors with a live backend stream. Test hook and
    /// observability aid.
    pub fn active_streams(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

impl Shared {
    fn try_attach(shared: &Arc<Shared>) -> Option<Subscription> {
        let mut state = shared.state.lock().unwrap();
        if matches!(state.phase, Phase::Failed | Phase::Closed) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id;
        state.next_id += 1;
        if let Some(latest) = &state.latest {
            let _ = tx.send(SubscriptionEvent::Snapshot(latest.clone()));
        }
        state.subscribers.push((id, tx));
        Some(Subscription {
            shared: shared.clone(),
            id,
            rx,
        })
    }

    /// Delivers one snapshot to every subscriber, in subscription order.
    fn broadcast(&self, documents: Vec<Document>) {
        let mut state = self.state.lock().unwrap();
        state.latest = Some(documents.clone());
        for (_, tx) in &state.subscribers {
            // A send failure means the receiver is mid-drop; its Drop impl
            // prunes the entry.
            let _ = tx.send(SubscriptionEvent::Snapshot(documents.clone()));
        }
    }

    fn mark_active(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Starting {
            state.phase = Phase::Active;
        }
    }

    /// Terminal failure: detach, broadcast the error once, drop all senders.
    fn fail(&self, error: Error) {
        warn!(
            "stream for collection {} failed: {error}",
            self.descriptor.collection_path
        );
        self.detach_from_hub();
        let mut state = self.state.lock().unwrap();
        state.phase = Phase::Failed;
        state.pump = None;
        let error = Error::Subscription(error.to_string());
        for (_, tx) in state.subscribers.drain(..) {
            let _ = tx.send(SubscriptionEvent::Error(error.clone()));
        }
    }

    /// The backend ended the stream without an error; tear down so a later
    /// subscribe starts a fresh cycle.
    fn close_from_pump(&self) {
        debug!(
            "stream for collection {} ended",
            self.descriptor.collection_path
        );
        self.detach_from_hub();
        let mut state = self.state.lock().unwrap();
        state.phase = Phase::Closed;
        state.pump = None;
        state.subscribers.clear();
    }

    fn detach_from_hub(&self) {
        if let Some(hub) = self.hub.upgrade() {
            let mut active = hub.active.lock().unwrap();
            if let Some(entry) = active.get(&self.descriptor) {
                if std::ptr::eq(Arc::as_ptr(entry), self) {
                    active.remove(&self.descriptor);
                }
            }
        }
    }
}

async fn pump(backend: Arc<dyn Backend>, shared: Arc<Shared>) {
    let mut stream = match backend.open_stream(&shared.descriptor).await {
        Ok(stream) => stream,
        Err(error) => {
            shared.fail(error);
            return;
        }
    };
    shared.mark_active();

    while let Some(item) = stream.next().await {
        match item {
            Ok(documents) => shared.broadcast(documents),
            Err(error) => {
                shared.fail(error);
                return;
            }
        }
    }
    shared.close_from_pump();
}

/// A caller's handle on a shared live query.
///
/// Yields [`SubscriptionEvent`]s until dropped or until a terminal error.
/// Dropping it never interrupts other subscribers of the same descriptor;
/// dropping the last one aborts the pump, which drops (and thereby closes)
/// the backend stream.
pub struct Subscription {
    shared: Arc<Shared>,
    id: u64,
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let hub = self.shared.hub.upgrade();
        let mut active = hub.as_ref().map(|h| h.active.lock().unwrap());

        let mut state = self.shared.state.lock().unwrap();
        state.subscribers.retain(|(id, _)| *id != self.id);
        if state.subscribers.is_empty()
            && matches!(state.phase, Phase::Starting | Phase::Active)
        {
            state.phase = Phase::Closed;
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            if let Some(active) = active.as_mut() {
                if let Some(entry) = active.get(&self.shared.descriptor) {
                    if Arc::ptr_eq(entry, &self.shared) {
                        active.remove(&self.shared.descriptor);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::query::QueryBuilder;
    use crate::value::fields_from_json;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(sub: &mut Subscription) -> SubscriptionEvent {
        timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("timed out waiting for event")
            .expect("subscription ended unexpectedly")
    }

    fn snapshot_ids(event: SubscriptionEvent) -> Vec<String> {
        match event {
            SubscriptionEvent::Snapshot(docs) => docs.into_iter().map(|d| d.id).collect(),
            SubscriptionEvent::Error(e) => panic!("unexpected error event: {e}"),
        }
    }

    #[tokio::test]
    async fn equal_descriptors_share_one_stream() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = SubscriptionHub::new(backend.clone());
        let descriptor = QueryBuilder::new("rooms").build().unwrap();

        let mut a = hub.subscribe(descriptor.clone());
        let mut b = hub.subscribe(descriptor.clone());

        // Both receive the initial (empty) snapshot from the single stream.
        assert_eq!(snapshot_ids(next_event(&mut a).await), Vec::<String>::new());
        assert_eq!(snapshot_ids(next_event(&mut b).await), Vec::<String>::new());
        assert_eq!(hub.active_streams(), 1);
        assert_eq!(backend.watcher_count(), 1);

        backend
            .create_or_replace("rooms", "r1", &fields_from_json(json!({"n": 1})).unwrap())
            .await
            .unwrap();

        assert_eq!(snapshot_ids(next_event(&mut a).await), vec!["r1"]);
        assert_eq!(snapshot_ids(next_event(&mut b).await), vec!["r1"]);

        // Dropping one subscriber leaves the other receiving uninterrupted.
        drop(a);
        assert_eq!(hub.active_streams(), 1);
        backend
            .create_or_replace("rooms", "r2", &fields_from_json(json!({"n": 2})).unwrap())
            .await
            .unwrap();
        assert_eq!(snapshot_ids(next_event(&mut b).await), vec!["r1", "r2"]);

        // Dropping the last closes the backend stream. The pump abort drops
        // the stream asynchronously, so poll briefly for the watcher to go.
        drop(b);
        assert_eq!(hub.active_streams(), 0);
        timeout(Duration::from_secs(1), async {
            while backend.watcher_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backend watcher was not released");
    }

    #[tokio::test]
    async fn distinct_descriptors_get_distinct_streams() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = SubscriptionHub::new(backend.clone());

        let _a = hub.subscribe(QueryBuilder::new("rooms").build().unwrap());
        let _b = hub.subscribe(QueryBuilder::new("users").build().unwrap());
        assert_eq!(hub.active_streams(), 2);
    }

    #[tokio::test]
    async fn late_joiner_receives_latest_snapshot() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .create_or_replace("rooms", "r1", &fields_from_json(json!({"n": 1})).unwrap())
            .await
            .unwrap();
        let hub = SubscriptionHub::new(backend.clone());
        let descriptor = QueryBuilder::new("rooms").build().unwrap();

        let mut a = hub.subscribe(descriptor.clone());
        assert_eq!(snapshot_ids(next_event(&mut a).await), vec!["r1"]);

        let mut b = hub.subscribe(descriptor);
        assert_eq!(snapshot_ids(next_event(&mut b).await), vec!["r1"]);
    }

    #[tokio::test]
    async fn open_stream_failure_is_broadcast_once_then_restartable() {
        struct FailingBackend;

        #[async_trait::async_trait]
        impl Backend for FailingBackend {
            async fn fetch_one(&self, c: &str, id: &str) -> crate::Result<Document> {
                Err(Error::not_found(c, id))
            }
            async fn fetch_all(&self, _: &str) -> crate::Result<Vec<Document>> {
                Ok(Vec::new())
            }
            async fn run_query(&self, _: &QueryDescriptor) -> crate::Result<Vec<Document>> {
                Ok(Vec::new())
            }
            async fn create_or_replace(
                &self,
                _: &str,
                _: &str,
                _: &crate::value::Fields,
            ) -> crate::Result<()> {
                Ok(())
            }
            async fn merge(
                &self,
                _: &str,
                _: &str,
                _: &crate::value::Fields,
            ) -> crate::Result<()> {
                Ok(())
            }
            async fn delete(&self, _: &str, _: &str) -> crate::Result<()> {
                Ok(())
            }
            async fn open_stream(
                &self,
                _: &QueryDescriptor,
            ) -> crate::Result<crate::backend::BackendStream> {
                Err(Error::Backend("listen rejected".into()))
            }
        }

        let hub = SubscriptionHub::new(Arc::new(FailingBackend));
        let descriptor = QueryBuilder::new("rooms").build().unwrap();

        let mut sub = hub.subscribe(descriptor.clone());
        match next_event(&mut sub).await {
            SubscriptionEvent::Error(Error::Subscription(msg)) => {
                assert!(msg.contains("listen rejected"));
            }
            other => panic!("expected subscription error, got {other:?}"),
        }
        // Terminal: the stream ends after the single error event.
        assert!(timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .is_none());
        assert_eq!(hub.active_streams(), 0);

        // A fresh subscribe starts a new cycle (and fails again, freshly).
        let mut again = hub.subscribe(descriptor);
        assert!(matches!(
            next_event(&mut again).await,
            SubscriptionEvent::Error(Error::Subscription(_))
        ));
    }

    #[tokio::test]
    async fn snapshots_are_delivered_in_subscription_order() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = SubscriptionHub::new(backend.clone());
        let descriptor = QueryBuilder::new("rooms").build().unwrap();

        let mut subs: Vec<_> = (0..4).map(|_| hub.subscribe(descriptor.clone())).collect();

        // Draining the initial snapshot from each subscriber proves the
        // single stream fans out to all of them.
        for sub in &mut subs {
            assert_eq!(snapshot_ids(next_event(sub).await), Vec::<String>::new());
        }
        assert_eq!(hub.active_streams(), 1);

        backend
            .create_or_replace("rooms", "r1", &fields_from_json(json!({"n": 1})).unwrap())
            .await
            .unwrap();

        // Nobody observes a snapshot older than one an earlier subscriber
        // already saw.
        for sub in &mut subs {
            assert_eq!(snapshot_ids(next_event(sub).await), vec!["r1"]);
        }
    }
}
