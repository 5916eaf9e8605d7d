//! Error taxonomy for the registry core.
//!
//! Every error carries an HTTP-style status code so the thin HTTP adapter
//! can surface it without re-classifying. Validation failures are reported
//! synchronously and never retried; ingestion failures of any kind collapse
//! into [`RegistryError::Unprocessable`] carrying the archive URL and the
//! underlying cause; infrastructure errors from the stores propagate
//! unwrapped through [`RegistryError::Store`].

use thiserror::Error;

use crate::store::StoreError;

/// A wrapped ingestion cause.
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the registry core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The application options are malformed (bad slug, missing editor,
    /// unknown type). The message lists the offending fields.
    #[error("invalid application: {0}")]
    AppInvalid(String),

    /// An application already exists at `(space, slug)`.
    #[error("application already exists")]
    AppAlreadyExists,

    /// No application at `(space, slug)`.
    #[error("application was not found")]
    AppNotFound,

    /// The slug in the request path does not match the one in the body.
    #[error("application slug does not match the one specified in the body")]
    AppSlugMismatch,

    /// An application's editor is immutable after creation.
    #[error("application editor can not change")]
    AppEditorMismatch,

    /// The version options are malformed (bad version string, bad URL, bad
    /// sha-256). The message lists the offending fields.
    #[error("invalid version: {0}")]
    VersionInvalid(String),

    /// No version at `(space, slug, version)`.
    #[error("version was not found")]
    VersionNotFound,

    /// A version already exists at `(space, slug, version)`.
    #[error("version already exists")]
    VersionAlreadyExists,

    /// The downloaded manifest declares a slug other than the application's.
    #[error("version slug does not match the application")]
    VersionSlugMismatch,

    /// The channel string is not one of the three known channels.
    #[error(r#"invalid version channel: should be "stable", "beta" or "dev""#)]
    ChannelInvalid,

    /// No editor registered under the given name.
    #[error("editor was not found")]
    EditorNotFound,

    /// An editor already exists under the given name.
    #[error("editor already exists")]
    EditorExists,

    /// Token missing, expired, malformed, or out of scope.
    #[error("unauthorized")]
    Unauthorized,

    /// Catch-all for ingestion failures: network errors, digest mismatch,
    /// missing or inconsistent manifest, truncated archive.
    #[error("could not process version from {url}: {cause}")]
    Unprocessable {
        /// The archive URL the client supplied.
        url: String,
        /// The underlying failure.
        #[source]
        cause: BoxedCause,
    },

    /// Infrastructure error from the document or object store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    /// Builds an [`RegistryError::Unprocessable`] from any cause.
    pub fn unprocessable(url: impl Into<String>, cause: impl Into<BoxedCause>) -> Self {
        Self::Unprocessable {
            url: url.into(),
            cause: cause.into(),
        }
    }

    /// The HTTP-style status code for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AppInvalid(_)
            | Self::AppSlugMismatch
            | Self::AppEditorMismatch
            | Self::VersionInvalid(_)
            | Self::VersionSlugMismatch
            | Self::ChannelInvalid => 400,
            Self::Unauthorized => 401,
            Self::AppNotFound | Self::VersionNotFound | Self::EditorNotFound => 404,
            Self::AppAlreadyExists | Self::VersionAlreadyExists | Self::EditorExists => 409,
            Self::Unprocessable { .. } => 422,
            Self::Store(err) => match err {
                StoreError::NotFound { .. } => 404,
                StoreError::Conflict { .. } => 409,
                StoreError::Backend(_) => 500,
            },
        }
    }

    /// Whether this error is a lookup miss.
    ///
    /// The adapter serves misses with a short cache-control so transient
    /// errors do not poison downstream caches; everything else is no-cache.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status_code() == 404
    }
}
