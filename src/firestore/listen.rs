//! The `:listen` endpoint: incremental framing of the streamed JSON body and
//! aggregation of watch changes into whole query snapshots.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use log::debug;
use reqwest_middleware::ClientWithMiddleware;

use super::models::{ListenRequest, ListenResponse, TargetChangeType};
use super::{convert, FirestoreError};
use crate::error::Result as StoreResult;
use crate::evaluate::apply_query;
use crate::query::QueryDescriptor;
use crate::value::Document;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Frames the streamed response body into individual `ListenResponse`
/// messages. The server streams one long JSON array; the framing skips the
/// array punctuation and cuts out each top-level object.
pub struct ListenStream {
    inner: ByteStream,
    buffer: BytesMut,
}

impl ListenStream {
    pub fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }
}

impl Stream for ListenStream {
    type Item = Result<ListenResponse, FirestoreError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            trim_framing(&mut self.buffer);

            if let Some(&first) = self.buffer.first() {
                if first != b'{' {
                    return Poll::Ready(Some(Err(FirestoreError::Api(format!(
                        "unexpected byte 0x{first:02x} in listen stream"
                    )))));
                }
            }

            if let Some(len) = find_object_boundary(&self.buffer) {
                let bytes = self.buffer.split_to(len);
                match serde_json::from_slice::<ListenResponse>(&bytes) {
                    Ok(msg) => return Poll::Ready(Some(Ok(msg))),
                    Err(e) => return Poll::Ready(Some(Err(FirestoreError::Serialization(e)))),
                }
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(FirestoreError::Request(e))));
                }
                Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        return Poll::Ready(Some(Err(FirestoreError::Api(
                            "listen stream ended with incomplete JSON".into(),
                        ))));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Drops whitespace and array punctuation between objects.
fn trim_framing(buffer: &mut BytesMut) {
    let skip = buffer
        .iter()
        .take_while(|b| b.is_ascii_whitespace() || matches!(b, b',' | b'[' | b']'))
        .count();
    if skip > 0 {
        let _ = buffer.split_to(skip);
    }
}

/// Length of the first complete top-level JSON object, if any.
fn find_object_boundary(buf: &[u8]) -> Option<usize> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut started = false;

    for (i, &b) in buf.iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'{' | b'[' => {
                started = true;
                depth += 1;
            }
            b'}' | b']' => {
                if started {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
            }
            b'"' => {
                if started {
                    in_string = true;
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) async fn listen_request(
    client: &ClientWithMiddleware,
    database: &str,
    request: &ListenRequest,
) -> Result<ListenStream, FirestoreError> {
    let url = format!("{database}/documents:listen");

    let response = client.post(&url).json(request).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(FirestoreError::Api(format!("Listen failed {status}: {text}")));
    }

    let stream = stream::unfold(response, |mut resp| async move {
        match resp.chunk().await {
            Ok(Some(bytes)) => Some((Ok(bytes), resp)),
            Ok(None) => None,
            Err(e) => Some((Err(e), resp)),
        }
    });

    Ok(ListenStream::new(Box::pin(stream)))
}

/// Folds the watch-change messages of one query target into whole snapshots.
///
/// Documents accumulate across `documentChange`/`documentDelete`/
/// `documentRemove` messages; a snapshot is emitted at each consistency point
/// (a `CURRENT` or `NO_CHANGE` target change) when the set moved. `RESET`
/// drops the accumulated state. The descriptor's ordering and limit are
/// re-imposed locally so snapshot order is deterministic.
pub struct WatchStream<S> {
    inner: S,
    descriptor: QueryDescriptor,
    documents: BTreeMap<String, Document>,
    current: bool,
    dirty: bool,
    emitted_initial: bool,
}

impl<S> WatchStream<S> {
    pub fn new(inner: S, descriptor: QueryDescriptor) -> Self {
        Self {
            inner,
            descriptor,
            documents: BTreeMap::new(),
            current: false,
            dirty: false,
            emitted_initial: false,
        }
    }

    /// Applies one message; `Ok(true)` means a snapshot boundary was reached.
    fn apply(&mut self, response: ListenResponse) -> StoreResult<bool> {
        if let Some(change) = response.document_change {
            let document = convert::decode_document(change.document)?;
            self.documents.insert(document.id.clone(), document);
            self.dirty = true;
        }
        if let Some(delete) = response.document_delete {
            self.remove_by_name(&delete.document);
        }
        if let Some(remove) = response.document_remove {
            self.remove_by_name(&remove.document);
        }
        if let Some(filter) = response.filter {
            // Count mismatches would require a re-query to reconcile; the
            // consistency points still keep snapshots coherent.
            debug!("existence filter for target {}: {:?}", filter.target_id, filter.count);
        }
        if let Some(target_change) = response.target_change {
            match target_change.target_change_type {
                Some(TargetChangeType::Reset) => {
                    self.documents.clear();
                    self.current = false;
                    self.dirty = true;
                }
                Some(TargetChangeType::Current) => {
                    self.current = true;
                    return Ok(self.at_boundary());
                }
                Some(TargetChangeType::NoChange) | None => {
                    return Ok(self.at_boundary());
                }
                Some(TargetChangeType::Add) | Some(TargetChangeType::Remove) => {}
            }
        }
        Ok(false)
    }

    fn at_boundary(&self) -> bool {
        self.current && (self.dirty || !self.emitted_initial)
    }

    fn remove_by_name(&mut self, name: &str) {
        let id = name.rsplit('/').next().unwrap_or(name);
        if self.documents.remove(id).is_some() {
            self.dirty = true;
        }
    }

    fn snapshot(&mut self) -> Vec<Document> {
        self.dirty = false;
        self.emitted_initial = true;
        apply_query(self.documents.values().cloned().collect(), &self.descriptor)
    }
}

impl<S> Stream for WatchStream<S>
where
    S: Stream<Item = Result<ListenResponse, FirestoreError>> + Unpin,
{
    type Item = StoreResult<Vec<Document>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(response))) => match this.apply(response) {
                    Ok(true) => return Poll::Ready(Some(Ok(this.snapshot()))),
                    Ok(false) => {}
                    Err(e) => return Poll::Ready(Some(Err(e))),
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
