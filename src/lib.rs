//! Backend-agnostic document database client.
//!
//! A declarative query description ([`QueryDescriptor`]) is executed against
//! any [`Backend`] driver; results come back as canonical [`Document`]s with
//! dynamically-typed [`Value`] fields. Live queries are multiplexed: all
//! subscribers of structurally equal descriptors share one backend-level
//! change stream, opened on first subscribe and closed when the last
//! subscriber goes away.
//!
//! Two drivers ship with the crate: [`firestore::FirestoreBackend`] over the
//! Firestore v1 REST API, and [`memory::MemoryBackend`], an in-process store
//! useful for tests and local development. Drivers are chosen at composition
//! time:
//!
//! ```no_run
//! use std::sync::Arc;
//! use docstore::{Docstore, Operator};
//!
//! # async fn demo() -> docstore::Result<()> {
//! let db = Docstore::new(Arc::new(docstore::memory::MemoryBackend::new()));
//!
//! let query = db
//!     .query("users")
//!     .filter("age", Operator::GtEq, 18i64)?
//!     .order_by("age")
//!     .limit(20)
//!     .build()?;
//! let adults = db.run_query(&query).await?;
//! # let _ = adults;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod evaluate;
pub mod firestore;
pub mod memory;
pub mod query;
pub mod subscription;
pub mod value;

use std::sync::Arc;

pub use crate::backend::{Backend, BackendStream};
pub use crate::error::{Error, Result};
pub use crate::query::{Filter, Operator, QueryBuilder, QueryDescriptor};
pub use crate::subscription::{Subscription, SubscriptionEvent};
pub use crate::value::{fields_from_json, Document, Fields, Value};

use crate::subscription::SubscriptionHub;

/// The client facade: one backend driver plus the shared subscription hub.
pub struct Docstore {
    backend: Arc<dyn Backend>,
    hub: Arc<SubscriptionHub>,
}

impl Docstore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let hub = SubscriptionHub::new(backend.clone());
        Self { backend, hub }
    }

    /// Starts a query against `collection`.
    pub fn query(&self, collection: impl Into<String>) -> QueryBuilder {
        QueryBuilder::new(collection)
    }

    /// Fetches one document; a miss is [`Error::NotFound`].
    pub async fn get(&self, collection: &str, id: &str) -> Result<Document> {
        self.backend.fetch_one(collection, id).await
    }

    /// Fetches every document of a collection.
    pub async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        self.backend.fetch_all(collection).await
    }

    pub async fn run_query(&self, descriptor: &QueryDescriptor) -> Result<Vec<Document>> {
        self.backend.run_query(descriptor).await
    }

    /// Writes a document with full-overwrite semantics.
    pub async fn put(&self, collection: &str, id: &str, fields: &Fields) -> Result<()> {
        self.backend.create_or_replace(collection, id, fields).await
    }

    /// Merge-writes a document: absent fields survive.
    pub async fn patch(&self, collection: &str, id: &str, fields: &Fields) -> Result<()> {
        self.backend.merge(collection, id, fields).await
    }

    /// Deletes a document; deleting a missing one succeeds.
    pub async fn remove(&self, collection: &str, id: &str) -> Result<()> {
        self.backend.delete(collection, id).await
    }

    /// Subscribes to live snapshots; equal descriptors share one backend
    /// stream.
    pub fn subscribe(&self, descriptor: QueryDescriptor) -> Subscription {
        self.hub.subscribe(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use futures::StreamExt;
    use serde_json::json;

    fn store() -> Docstore {
        Docstore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn put_get_query_scenario() {
        let db = store();
        db.put("test", "t1", &fields_from_json(json!({ "name": "a", "age": 10 })).unwrap())
            .await
            .unwrap();

        let doc = db.get("test", "t1").await.unwrap();
        assert_eq!(doc.id, "t1");
        assert_eq!(doc.field("name"), Some(&Value::String("a".into())));
        assert_eq!(doc.field("age"), Some(&Value::Integer(10)));

        let descriptor = db
            .query("test")
            .filter("age", Operator::Gt, 5i64)
            .unwrap()
            .build()
            .unwrap();
        let results = db.run_query(&descriptor).await.unwrap();
        assert!(results.iter().any(|d| d.id == "t1"));
    }

    #[tokio::test]
    async fn patch_merges_and_remove_is_idempotent() {
        let db = store();
        db.put("test", "t1", &fields_from_json(json!({ "a": 0, "b": 2 })).unwrap())
            .await
            .unwrap();
        db.patch("test", "t1", &fields_from_json(json!({ "a": 1 })).unwrap())
            .await
            .unwrap();

        let doc = db.get("test", "t1").await.unwrap();
        assert_eq!(doc.field("a"), Some(&Value::Integer(1)));
        assert_eq!(doc.field("b"), Some(&Value::Integer(2)));

        db.remove("test", "nope").await.unwrap();
        db.remove("test", "t1").await.unwrap();
        assert!(db.get("test", "t1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn subscribe_delivers_snapshots() {
        let db = store();
        let descriptor = db.query("rooms").build().unwrap();
        let mut sub = db.subscribe(descriptor);

        match sub.next().await.unwrap() {
            SubscriptionEvent::Snapshot(docs) => assert!(docs.is_empty()),
            other => panic!("expected snapshot, got {other:?}"),
        }

        db.put("rooms", "r1", &fields_from_json(json!({ "n": 1 })).unwrap())
            .await
            .unwrap();
        match sub.next().await.unwrap() {
            SubscriptionEvent::Snapshot(docs) => {
                assert_eq!(docs.len(), 1);
                assert_eq!(docs[0].id, "r1");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }
}
