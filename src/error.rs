use thiserror::Error;

/// Errors surfaced by the client and by backend drivers.
///
/// `Clone` is required so a terminal stream failure can be broadcast to every
/// current subscriber of a shared subscription; driver-internal errors that
/// carry non-clonable sources are flattened into `Backend` at the trait
/// boundary, keeping the backend's original message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A filter violated the operator/value arity rules at build time.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    /// A single-document fetch missed.
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    /// A backend-native value fell outside the canonical variant set.
    #[error("unsupported value type: {0}")]
    UnsupportedValueType(String),
    /// Any adapter-level transport, auth, or quota failure.
    #[error("backend error: {0}")]
    Backend(String),
    /// Terminal failure of a change-notification stream, delivered once to
    /// each subscriber before the subscription tears down.
    #[error("subscription failed: {0}")]
    Subscription(String),
}

impl Error {
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
