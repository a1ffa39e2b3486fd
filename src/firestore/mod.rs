//! Firestore driver: a [`Backend`] over the Firestore v1 REST API.
//!
//! Documents are written with `PATCH` — without an `updateMask` for full
//! replacement, with one for merge writes. Queries go through `:runQuery`
//! with a structured query; change streams through `:listen`, framed and
//! aggregated in [`listen`].

pub mod convert;
pub mod listen;
pub mod models;

mod middleware;


use async_trait::async_trait;
use reqwest::{header, Client};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use thiserror::Error;

pub use yup_oauth2::ServiceAccountKey;

use self::listen::{listen_request, WatchStream};
use self::middleware::AuthMiddleware;
use self::models::{
    CollectionSelector, CompositeFilter, CompositeOperator, Direction, FieldFilter, FieldOperator,
    FieldReference, FilterType, ListDocumentsResponse, ListenRequest, Order, QueryFilter,
    QueryTarget, RunQueryRequest, RunQueryResponse, StructuredQuery, Target, WireDocument,
};
use crate::backend::{Backend, BackendStream};
use crate::error::{Error, Result};
use crate::query::{Operator, QueryDescriptor};
use crate::value::{Document, Fields};

const FIRESTORE_V1_API: &str =
    "https://firestore.googleapis.com/v1/projects/{project_id}/databases/(default)/documents";

/// Driver-internal errors; flattened to [`Error::Backend`] at the trait
/// boundary so the backend's original message survives.
#[derive(Error, Debug)]
pub enum FirestoreError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<FirestoreError> for Error {
    fn from(e: FirestoreError) -> Self {
        Error::Backend(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetails,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetails {
    code: u16,
    message: String,
}

async fn error_message(response: reqwest::Response, context: &str) -> String {
    let status = response.status();
    match response.json::<ApiErrorResponse>().await {
        Ok(body) => format!("{} (code: {})", body.error.message, body.error.code),
        Err(_) => format!("{context}: {status}"),
    }
}

/// A Firestore-backed [`Backend`].
pub struct FirestoreBackend {
    client: ClientWithMiddleware,
    base_url: String,
}

impl FirestoreBackend {
    /// Connects to the production endpoint with service-account auth.
    pub fn new(key: ServiceAccountKey) -> Self {
        let project_id = key.project_id.clone().unwrap_or_default();
        let base_url = FIRESTORE_V1_API.replace("{project_id}", &project_id);

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .with(AuthMiddleware::new(key))
            .build();

        Self { client, base_url }
    }

    /// Connects to a custom base URL without auth, for the emulator and for
    /// tests. `base_url` must end in `/documents`.
    pub fn unauthenticated(base_url: impl Into<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, id)
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    /// The `.../projects/{p}/databases/{d}` prefix, i.e. the base URL without
    /// the trailing `/documents`.
    fn database_url(&self) -> &str {
        self.base_url
            .rsplit_once("/documents")
            .map(|(head, _)| head)
            .unwrap_or(&self.base_url)
    }

    /// The `projects/{p}/databases/{d}` resource name the wire protocol wants
    /// in request bodies, as opposed to the full request URL.
    fn database_resource(&self) -> &str {
        let database = self.database_url();
        database
            .find("/projects/")
            .map(|at| &database[at + 1..])
            .unwrap_or(database)
    }

    async fn write(&self, url: String, fields: &Fields, merge: bool) -> Result<()> {
        let body = serde_json::to_vec(&serde_json::json!({
            "fields": convert::encode_fields(fields)
        }))
        .map_err(FirestoreError::from)?;

        let mut request = self
            .client
            .patch(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);
        if merge {
            let mask: Vec<(&str, &str)> = fields
                .keys()
                .map(|field| ("updateMask.fieldPaths", field.as_str()))
                .collect();
            request = request.query(&mask);
        }

        let response = request.send().await.map_err(FirestoreError::from)?;
        if !response.status().is_success() {
            return Err(Error::Backend(
                error_message(response, "Write document failed").await,
            ));
        }
        Ok(())
    }

    fn structured_query(descriptor: &QueryDescriptor) -> StructuredQuery {
        let filters: Vec<QueryFilter> = descriptor
            .filters
            .iter()
            .map(|filter| QueryFilter {
                filter_type: FilterType::FieldFilter(FieldFilter {
                    field: FieldReference {
                        field_path: filter.field.clone(),
                    },
                    op: wire_operator(filter.operator),
                    value: convert::encode_value(&filter.value),
                }),
            })
            .collect();

        let where_clause = match filters.len() {
            0 => None,
            1 => filters.into_iter().next(),
            _ => Some(QueryFilter {
                filter_type: FilterType::CompositeFilter(CompositeFilter {
                    op: CompositeOperator::And,
                    filters,
                }),
            }),
        };

        // Ordering by `__name__` last makes ties deterministic on document id.
        let order_by = descriptor.order_by.as_ref().map(|field| {
            vec![
                Order {
                    field: FieldReference {
                        field_path: field.clone(),
                    },
                    direction: Direction::Ascending,
                },
                Order {
                    field: FieldReference {
                        field_path: "__name__".to_string(),
                    },
                    direction: Direction::Ascending,
                },
            ]
        });

        StructuredQuery {
            from: Some(vec![CollectionSelector {
                collection_id: descriptor.collection_path.clone(),
                all_descendants: None,
            }]),
            where_clause,
            order_by,
            limit: descriptor.limit.map(|l| l as i32),
        }
    }
}

fn wire_operator(operator: Operator) -> FieldOperator {
    match operator {
        Operator::Eq => FieldOperator::Equal,
        Operator::NotEq => FieldOperator::NotEqual,
        Operator::Lt => FieldOperator::LessThan,
        Operator::LtEq => FieldOperator::LessThanOrEqual,
        Operator::Gt => FieldOperator::GreaterThan,
        Operator::GtEq => FieldOperator::GreaterThanOrEqual,
        Operator::ArrayContains => FieldOperator::ArrayContains,
        Operator::ArrayContainsAny => FieldOperator::ArrayContainsAny,
        Operator::In => FieldOperator::In,
        Operator::NotIn => FieldOperator::NotIn,
    }
}

#[async_trait]
impl Backend for FirestoreBackend {
    async fn fetch_one(&self, collection: &str, id: &str) -> Result<Document> {
        let response = self
            .client
            .get(self.document_url(collection, id))
            .send()
            .await
            .map_err(FirestoreError::from)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(collection, id));
        }
        if !response.status().is_success() {
            return Err(Error::Backend(
                error_message(response, "Get document failed").await,
            ));
        }

        let doc: WireDocument = response.json().await.map_err(FirestoreError::from)?;
        convert::decode_document(doc)
    }

    async fn fetch_all(&self, collection: &str) -> Result<Vec<Document>> {
        let url = self.collection_url(collection);
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(&url);
            if let Some(token) = page_token.take() {
                request = request.query(&[("pageToken", token)]);
            }

            let response = request.send().await.map_err(FirestoreError::from)?;
            if !response.status().is_success() {
                return Err(Error::Backend(
                    error_message(response, "List documents failed").await,
                ));
            }

            let page: ListDocumentsResponse =
                response.json().await.map_err(FirestoreError::from)?;
            for doc in page.documents {
                documents.push(convert::decode_document(doc)?);
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(documents)
    }

    async fn run_query(&self, descriptor: &QueryDescriptor) -> Result<Vec<Document>> {
        let url = format!("{}:runQuery", self.base_url);
        let request = RunQueryRequest {
            structured_query: Self::structured_query(descriptor),
        };

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&request).map_err(FirestoreError::from)?)
            .send()
            .await
            .map_err(FirestoreError::from)?;

        if !response.status().is_success() {
            return Err(Error::Backend(
                error_message(response, "Run query failed").await,
            ));
        }

        let responses: Vec<RunQueryResponse> =
            response.json().await.map_err(FirestoreError::from)?;

        let mut documents = Vec::new();
        for item in responses {
            if let Some(doc) = item.document {
                documents.push(convert::decode_document(doc)?);
            }
        }
        Ok(documents)
    }

    async fn create_or_replace(&self, collection: &str, id: &str, fields: &Fields) -> Result<()> {
        self.write(self.document_url(collection, id), fields, false)
            .await
    }

    async fn merge(&self, collection: &str, id: &str, fields: &Fields) -> Result<()> {
        self.write(self.document_url(collection, id), fields, true)
            .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.document_url(collection, id))
            .send()
            .await
            .map_err(FirestoreError::from)?;

        // Firestore treats deleting a missing document as success; a 404 from
        // a proxy in between still counts as gone.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Error::Backend(
                error_message(response, "Delete document failed").await,
            ));
        }
        Ok(())
    }

    async fn open_stream(&self, descriptor: &QueryDescriptor) -> Result<BackendStream> {
        let database = self.database_resource().to_string();
        let request = ListenRequest {
            database: database.clone(),
            add_target: Some(Target {
                query: QueryTarget {
                    parent: format!("{database}/documents"),
                    structured_query: Self::structured_query(descriptor),
                },
                target_id: 1,
            }),
        };

        let stream = listen_request(&self.client, self.database_url(), &request)
            .await
            .map_err(Error::from)?;
        Ok(Box::pin(WatchStream::new(stream, descriptor.clone())))
    }
}
