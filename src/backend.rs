use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::query::QueryDescriptor;
use crate::value::{Document, Fields};

/// A live change-notification stream: each item is a full snapshot of the
/// query's matching documents, already normalized. An `Err` item is terminal.
/// Dropping the stream closes the backend-level subscription.
pub type BackendStream = Pin<Box<dyn Stream<Item = Result<Vec<Document>>> + Send>>;

/// The capability set a concrete document-store driver implements.
///
/// Everything above this trait is backend-agnostic; the driver owns the wire
/// protocol, its consistency guarantees, timeouts, and any transient-transport
/// retries. Operations on distinct documents may run concurrently with no
/// ordering guarantee; this layer imposes no per-document lock.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetches a single document; a miss is [`crate::Error::NotFound`].
    async fn fetch_one(&self, collection: &str, id: &str) -> Result<Document>;

    /// Fetches every document of a collection.
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>>;

    /// Executes a query: filters apply conjunctively, results are ordered by
    /// the descriptor's `order_by` field ascending (ties broken by document
    /// id ascending) and truncated to its `limit`.
    async fn run_query(&self, descriptor: &QueryDescriptor) -> Result<Vec<Document>>;

    /// Writes a document with full-overwrite semantics.
    async fn create_or_replace(&self, collection: &str, id: &str, fields: &Fields) -> Result<()>;

    /// Merge-writes a document: given fields are overwritten or created,
    /// absent fields are left untouched; the document is created if missing.
    async fn merge(&self, collection: &str, id: &str, fields: &Fields) -> Result<()>;

    /// Deletes a document. Idempotent: deleting a missing document succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Opens a change-notification stream for the query.
    async fn open_stream(&self, descriptor: &QueryDescriptor) -> Result<BackendStream>;
}
