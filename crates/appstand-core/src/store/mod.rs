//! Narrow persistence interfaces required by the registry core.
//!
//! The registry does not own a database. It talks to a document store and
//! an object store through the traits below, supplied by the caller at
//! assembly time. Errors are classified as not-found, revision conflict, or
//! backend failure; the registry layer translates the first two into its
//! own taxonomy and propagates the last unwrapped.
//!
//! The in-memory implementations in [`memory`] back the test-suite and the
//! development server profile.

mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

pub use memory::{MemoryDocumentStore, MemoryObjectStore};

/// Classified storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document, namespace or object does not exist.
    #[error("not found: {id}")]
    NotFound {
        /// Identifier that missed.
        id: String,
    },

    /// Optimistic revision check failed, or a create hit an existing id.
    /// The caller must re-read before retrying.
    #[error("revision conflict on {id}")]
    Conflict {
        /// Identifier that conflicted.
        id: String,
    },

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Shorthand for [`StoreError::Conflict`].
    #[must_use]
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }
}

/// A stored document with its identifier and revision.
#[derive(Debug, Clone)]
pub struct Document {
    /// Document id, unique within its namespace.
    pub id: String,
    /// Opaque revision token used for optimistic concurrency.
    pub rev: String,
    /// The document body.
    pub body: Value,
}

/// Sort direction for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Ascending (default).
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// A filter + sort + limit + skip selector, the only query shape the core
/// needs.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Equality constraints on top-level fields. A constraint against an
    /// array field matches when the array contains the value.
    pub selector: Vec<(String, Value)>,
    /// Optional sort field.
    pub sort: Option<(String, SortOrder)>,
    /// Optional row cap.
    pub limit: Option<usize>,
    /// Rows to skip before collecting.
    pub skip: usize,
}

impl Query {
    /// A query selecting documents where `field == value`.
    #[must_use]
    pub fn selecting(field: &str, value: impl Into<Value>) -> Self {
        Self {
            selector: vec![(field.to_owned(), value.into())],
            ..Self::default()
        }
    }

    /// Adds an equality constraint.
    #[must_use]
    pub fn and(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.selector.push((field.to_owned(), value.into()));
        self
    }

    /// Sets the sort field and order.
    #[must_use]
    pub fn sorted_by(mut self, field: &str, order: SortOrder) -> Self {
        self.sort = Some((field.to_owned(), order));
        self
    }

    /// Caps the number of returned rows.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `skip` rows.
    #[must_use]
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }
}

/// Document store abstraction: namespaced JSON documents with optimistic
/// revision-checked writes, equality queries and design-document
/// installation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Whether the namespace exists.
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, StoreError>;

    /// Creates the namespace. Creating an existing namespace is an error.
    async fn create_namespace(&self, namespace: &str) -> Result<(), StoreError>;

    /// Fetches a document by id.
    async fn get(&self, namespace: &str, id: &str) -> Result<Document, StoreError>;

    /// Writes a document. `rev` must be `None` for a create (conflicts when
    /// the id exists) and the current revision for an update (conflicts
    /// when stale). Returns the new revision.
    async fn put(
        &self,
        namespace: &str,
        id: &str,
        rev: Option<&str>,
        body: Value,
    ) -> Result<String, StoreError>;

    /// Deletes a document at the given revision.
    async fn delete(&self, namespace: &str, id: &str, rev: &str) -> Result<(), StoreError>;

    /// Declares an index over the given top-level fields. Idempotent.
    async fn create_index(
        &self,
        namespace: &str,
        name: &str,
        fields: &[&str],
    ) -> Result<(), StoreError>;

    /// Installs or updates a design document. The body is stored verbatim;
    /// an unchanged body is left untouched.
    async fn install_design_doc(
        &self,
        namespace: &str,
        name: &str,
        body: Value,
    ) -> Result<(), StoreError>;

    /// Runs a filter + sort + limit + skip query.
    async fn query(&self, namespace: &str, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// All documents in the namespace, design documents included, up to
    /// `limit` rows in id order.
    async fn all_docs(&self, namespace: &str, limit: usize) -> Result<Vec<Document>, StoreError>;
}

/// A stored object with the headers served alongside it.
#[derive(Debug, Clone)]
pub struct ObjectBlob {
    /// MIME type recorded at write time.
    pub content_type: String,
    /// Digest-derived etag.
    pub etag: String,
    /// Content length in bytes.
    pub content_length: u64,
    /// The object bytes.
    pub data: Bytes,
}

/// Object store abstraction: opaque bytes under `(prefix, key)` where keys
/// are hex-encoded sha-256 digests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether the prefix (container) exists.
    async fn prefix_exists(&self, prefix: &str) -> Result<bool, StoreError>;

    /// Creates the prefix. Idempotent.
    async fn create_prefix(&self, prefix: &str) -> Result<(), StoreError>;

    /// Stores an object. Overwrites silently; content-addressed keys make
    /// overwrites byte-identical.
    async fn put(
        &self,
        prefix: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<(), StoreError>;

    /// Fetches an object with its headers.
    async fn get(&self, prefix: &str, key: &str) -> Result<ObjectBlob, StoreError>;

    /// Removes an object. Removing a missing object is an error.
    async fn remove(&self, prefix: &str, key: &str) -> Result<(), StoreError>;
}
