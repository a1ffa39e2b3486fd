//! In-process reference driver.
//!
//! Collections live in nested ordered maps under one mutex; queries are
//! evaluated locally through [`crate::evaluate`]. Change streams are driven
//! by re-evaluating registered watchers after every mutation, sending a fresh
//! snapshot only when the matching set actually changed.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use crate::backend::{Backend, BackendStream};
use crate::error::{Error, Result};
use crate::evaluate::apply_query;
use crate::query::QueryDescriptor;
use crate::value::{Document, Fields};

#[derive(Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, BTreeMap<String, Fields>>,
    watchers: Vec<Watcher>,
    next_watcher: u64,
}

struct Watcher {
    id: u64,
    descriptor: QueryDescriptor,
    last: Vec<Document>,
    tx: mpsc::UnboundedSender<Result<Vec<Document>>>,
}

impl Inner {
    fn documents_of(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-evaluates every watcher on `collection` after a mutation.
    fn notify(&mut self, collection: &str) {
        let candidates = self.documents_of(collection);
        for watcher in &mut self.watchers {
            if watcher.descriptor.collection_path != collection {
                continue;
            }
            let snapshot = apply_query(candidates.clone(), &watcher.descriptor);
            if snapshot != watcher.last {
                watcher.last = snapshot.clone();
                let _ = watcher.tx.send(Ok(snapshot));
            }
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered change watchers. Test hook.
    pub fn watcher_count(&self) -> usize {
        self.inner.lock().unwrap().watchers.len()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_one(&self, collection: &str, id: &str) -> Result<Document> {
        let inner = self.inner.lock().unwrap();
        inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document::new(id, fields.clone()))
            .ok_or_else(|| Error::not_found(collection, id))
    }

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>> {
        Ok(self.inner.lock().unwrap().documents_of(collection))
    }

    async fn run_query(&self, descriptor: &QueryDescriptor) -> Result<Vec<Document>> {
        let candidates = self
            .inner
            .lock()
            .unwrap()
            .documents_of(&descriptor.collection_path);
        Ok(apply_query(candidates, descriptor))
    }

    async fn create_or_replace(&self, collection: &str, id: &str, fields: &Fields) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields.clone());
        inner.notify(collection);
        Ok(())
    }

    async fn merge(&self, collection: &str, id: &str, fields: &Fields) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        for (name, value) in fields {
            existing.insert(name.clone(), value.clone());
        }
        inner.notify(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();
        if removed {
            inner.notify(collection);
        }
        Ok(())
    }

    async fn open_stream(&self, descriptor: &QueryDescriptor) -> Result<BackendStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();

        let initial = apply_query(
            inner.documents_of(&descriptor.collection_path),
            descriptor,
        );
        let _ = tx.send(Ok(initial.clone()));

        let id = inner.next_watcher;
        inner.next_watcher += 1;
        inner.watchers.push(Watcher {
            id,
            descriptor: descriptor.clone(),
            last: initial,
            tx,
        });
        drop(inner);

        Ok(Box::pin(WatchStream {
            rx,
            _guard: WatcherGuard {
                inner: self.inner.clone(),
                id,
            },
        }))
    }
}

struct WatchStream {
    rx: mpsc::UnboundedReceiver<Result<Vec<Document>>>,
    _guard: WatcherGuard,
}

impl Stream for WatchStream {
    type Item = Result<Vec<Document>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Unregisters the watcher when the stream is dropped.
struct WatcherGuard {
    inner: Arc<Mutex<Inner>>,
    id: u64,
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.watchers.retain(|w| w.id != self.id);
    }
}
