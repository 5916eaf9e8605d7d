//! # appstand-core
//!
//! Core library for appstand - a registry for distributable applications
//! published by trusted editors.
//!
//! Each application is identified by a slug inside a space and carries an
//! ordered set of versions across three release channels (stable, beta,
//! dev). Publishing a version hands the registry a remote archive URL plus a
//! sha-256 digest; the registry downloads the archive, verifies the digest,
//! walks the gzipped tar, checks the embedded manifest against the supplied
//! options and stores the version document together with selected binary
//! attachments (icon, screenshots).
//!
//! ## Architecture
//!
//! - **Stores**: persistence goes through the narrow [`store::DocumentStore`]
//!   and [`store::ObjectStore`] traits. In-memory implementations back the
//!   tests and the development profile.
//! - **Spaces**: physically separate namespaces, declared at startup and
//!   bootstrapped by [`space::SpaceRegistry`]. Virtual spaces overlay
//!   per-app overrides on a source space and synthesise modified tarballs.
//! - **No globals**: a [`registry::Registry`] value owns the collaborating
//!   services and is passed through call chains.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use appstand_core::cache::MemoryCache;
//! use appstand_core::registry::Registry;
//! use appstand_core::space::SpaceRegistry;
//! use appstand_core::store::{MemoryDocumentStore, MemoryObjectStore};
//!
//! # async fn example() -> Result<(), appstand_core::error::RegistryError> {
//! let docs = Arc::new(MemoryDocumentStore::new());
//! let blobs = Arc::new(MemoryObjectStore::new());
//! let cache = Arc::new(MemoryCache::new());
//!
//! let mut spaces = SpaceRegistry::new("registry");
//! spaces.declare_space("")?;
//! spaces.declare_virtual_space("partner", "")?;
//! spaces.bootstrap(docs.as_ref(), blobs.as_ref()).await?;
//!
//! let registry = Registry::new(docs, blobs, cache, spaces);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod archive;
pub mod auth;
pub mod cache;
pub mod error;
pub mod ingest;
pub mod manifest;
pub mod registry;
pub mod space;
pub mod store;
pub mod version;
pub mod virt;

pub use error::RegistryError;
pub use registry::Registry;
pub use space::SpaceRegistry;
pub use version::{Channel, VersionString};
