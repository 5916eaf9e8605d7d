//! Spaces and virtual spaces.
//!
//! A space is a physical namespace: two document namespaces (apps and
//! versions) and one object-storage prefix. A virtual space is a derived
//! view over one source space, with an override document namespace and a
//! private object-storage prefix for regenerated tarballs.
//!
//! The registry of declared spaces is built at startup and read-only
//! afterwards; lookups are unsynchronised. A name is never simultaneously
//! a space and a virtual space.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::info;

use crate::error::RegistryError;
use crate::store::{DocumentStore, ObjectStore};

static SPACE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("space name regex is valid"));

/// Alias accepted for the unnamed default space.
const DEFAULT_SPACE_ALIAS: &str = "__default__";

const APPS_SUFFIX: &str = "apps";
const VERSIONS_SUFFIX: &str = "versions";
const EDITORS_SUFFIX: &str = "editors";
const OVERRIDES_SUFFIX: &str = "overrides";
const ASSETS_SUFFIX: &str = "assets";

/// Indexes installed on every apps namespace.
const APP_INDEXES: [(&str, &[&str]); 5] = [
    ("by-slug", &["slug"]),
    ("by-type", &["type", "slug", "category"]),
    ("by-editor", &["editor", "slug", "category"]),
    ("by-category", &["category", "slug", "editor"]),
    ("by-created_at", &["created_at", "slug", "category", "editor"]),
];

/// Indexes installed on every versions namespace.
const VERSION_INDEXES: [(&str, &[&str]); 2] = [
    ("by-version", &["version", "slug", "type"]),
    ("by-slug", &["slug", "version"]),
];

/// Apps scanned per space at startup when re-ensuring channel views.
const APP_SCAN_LIMIT: usize = 2000;

/// A physical namespace.
#[derive(Debug, Clone)]
pub struct Space {
    name: String,
    prefix: String,
}

impl Space {
    /// The space name; empty for the default space.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Document namespace holding the app documents.
    #[must_use]
    pub fn apps_namespace(&self) -> String {
        format!("{}-{APPS_SUFFIX}", self.prefix)
    }

    /// Document namespace holding the version documents.
    #[must_use]
    pub fn versions_namespace(&self) -> String {
        format!("{}-{VERSIONS_SUFFIX}", self.prefix)
    }

    /// Object-storage prefix for this space's attachments.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        self.prefix.clone()
    }
}

/// A derived view over one source space.
#[derive(Debug, Clone)]
pub struct VirtualSpace {
    name: String,
    source: String,
    prefix: String,
}

impl VirtualSpace {
    /// The virtual space name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the source space this view overlays.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Document namespace holding the per-app override documents.
    #[must_use]
    pub fn overrides_namespace(&self) -> String {
        format!("{}-{OVERRIDES_SUFFIX}", self.prefix)
    }

    /// Object-storage prefix holding regenerated tarballs.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        self.prefix.clone()
    }
}

/// The set of declared spaces and virtual spaces, plus the global
/// namespaces derived from one prefix.
#[derive(Debug)]
pub struct SpaceRegistry {
    global_prefix: String,
    spaces: HashMap<String, Space>,
    virtual_spaces: HashMap<String, VirtualSpace>,
}

impl SpaceRegistry {
    /// Creates an empty registry with the given global prefix (e.g.
    /// `registry`).
    #[must_use]
    pub fn new(global_prefix: impl Into<String>) -> Self {
        Self {
            global_prefix: global_prefix.into(),
            spaces: HashMap::new(),
            virtual_spaces: HashMap::new(),
        }
    }

    /// Declares a space. The empty name (or `__default__`) is the default
    /// space.
    ///
    /// # Errors
    ///
    /// Rejects invalid names, duplicates, and names already taken by a
    /// virtual space.
    pub fn declare_space(&mut self, name: &str) -> Result<(), RegistryError> {
        let name = if name.trim() == DEFAULT_SPACE_ALIAS {
            ""
        } else {
            name.trim()
        };
        if !name.is_empty() && !SPACE_NAME_REGEX.is_match(name) {
            return Err(RegistryError::AppInvalid(format!(
                "space name {name:?} contains invalid characters"
            )));
        }
        if self.spaces.contains_key(name) || self.virtual_spaces.contains_key(name) {
            return Err(RegistryError::AppInvalid(format!(
                "space {name:?} already registered"
            )));
        }
        let prefix = if name.is_empty() {
            self.global_prefix.clone()
        } else {
            format!("{}-{name}", self.global_prefix)
        };
        self.spaces.insert(
            name.to_owned(),
            Space {
                name: name.to_owned(),
                prefix,
            },
        );
        Ok(())
    }

    /// Declares a virtual space over `source`.
    ///
    /// # Errors
    ///
    /// Rejects invalid names, duplicates, collisions with space names, and
    /// unknown source spaces.
    pub fn declare_virtual_space(&mut self, name: &str, source: &str) -> Result<(), RegistryError> {
        if !SPACE_NAME_REGEX.is_match(name) {
            return Err(RegistryError::AppInvalid(format!(
                "virtual space name {name:?} contains invalid characters"
            )));
        }
        if self.spaces.contains_key(name) || self.virtual_spaces.contains_key(name) {
            return Err(RegistryError::AppInvalid(format!(
                "virtual space {name:?} collides with an existing space"
            )));
        }
        if !self.spaces.contains_key(source) {
            return Err(RegistryError::AppInvalid(format!(
                "virtual space {name:?} references unknown space {source:?}"
            )));
        }
        self.virtual_spaces.insert(
            name.to_owned(),
            VirtualSpace {
                name: name.to_owned(),
                source: source.to_owned(),
                prefix: format!("{}-{name}", self.global_prefix),
            },
        );
        Ok(())
    }

    /// Looks up a physical space.
    #[must_use]
    pub fn space(&self, name: &str) -> Option<&Space> {
        self.spaces.get(name)
    }

    /// Looks up a virtual space.
    #[must_use]
    pub fn virtual_space(&self, name: &str) -> Option<&VirtualSpace> {
        self.virtual_spaces.get(name)
    }

    /// All declared physical spaces.
    pub fn spaces(&self) -> impl Iterator<Item = &Space> {
        self.spaces.values()
    }

    /// All declared virtual spaces.
    pub fn virtual_spaces(&self) -> impl Iterator<Item = &VirtualSpace> {
        self.virtual_spaces.values()
    }

    /// The virtual spaces derived from `source`, i.e. the subscribers to
    /// its publishes.
    #[must_use]
    pub fn virtual_spaces_of(&self, source: &str) -> Vec<&VirtualSpace> {
        self.virtual_spaces
            .values()
            .filter(|vs| vs.source == source)
            .collect()
    }

    /// Global document namespace for editor records.
    #[must_use]
    pub fn editors_namespace(&self) -> String {
        format!("{}-{EDITORS_SUFFIX}", self.global_prefix)
    }

    /// Global object-storage prefix for shared assets (override icons).
    #[must_use]
    pub fn assets_prefix(&self) -> String {
        format!("{}-{ASSETS_SUFFIX}", self.global_prefix)
    }

    /// Ensures every declared namespace, index and storage prefix exists.
    /// Run once at startup, before the registry serves traffic.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn bootstrap(
        &self,
        docs: &dyn DocumentStore,
        blobs: &dyn ObjectStore,
    ) -> Result<(), RegistryError> {
        for space in self.spaces.values() {
            for namespace in [space.apps_namespace(), space.versions_namespace()] {
                ensure_namespace(docs, &namespace).await?;
            }
            for (name, fields) in APP_INDEXES {
                docs.create_index(&space.apps_namespace(), name, fields).await?;
            }
            for (name, fields) in VERSION_INDEXES {
                docs.create_index(&space.versions_namespace(), name, fields).await?;
            }
            ensure_prefix(blobs, &space.storage_prefix()).await?;

            // Re-ensure the per-app channel views; they are versioned with
            // the installing code and refreshed when their body changes.
            for doc in docs.all_docs(&space.apps_namespace(), APP_SCAN_LIMIT).await? {
                if doc.id.starts_with("_design") {
                    continue;
                }
                install_channel_views(docs, space, &doc.id).await?;
            }
        }

        for virtual_space in self.virtual_spaces.values() {
            ensure_namespace(docs, &virtual_space.overrides_namespace()).await?;
            ensure_prefix(blobs, &virtual_space.storage_prefix()).await?;
        }

        ensure_namespace(docs, &self.editors_namespace()).await?;
        ensure_prefix(blobs, &self.assets_prefix()).await?;
        Ok(())
    }
}

/// Installs (or refreshes) the per-app channel views on a versions
/// namespace. The design document declares the materialised per-channel
/// lists; backends without server-side views satisfy the same contract
/// through the query path.
pub(crate) async fn install_channel_views(
    docs: &dyn DocumentStore,
    space: &Space,
    slug: &str,
) -> Result<(), RegistryError> {
    let body = json!({
        "language": "channels",
        "slug": slug,
        "views": {
            "dev": { "channels": ["stable", "beta", "dev"] },
            "beta": { "channels": ["stable", "beta"] },
            "stable": { "channels": ["stable"] },
        },
        "key": ["major", "minor", "patch", "channel_rank", "beta_counter", "created_at"],
    });
    docs.install_design_doc(
        &space.versions_namespace(),
        &format!("{VERSIONS_SUFFIX}-{slug}"),
        body,
    )
    .await?;
    Ok(())
}

async fn ensure_namespace(docs: &dyn DocumentStore, namespace: &str) -> Result<(), RegistryError> {
    if !docs.namespace_exists(namespace).await? {
        info!(%namespace, "creating document namespace");
        docs.create_namespace(namespace).await?;
    }
    Ok(())
}

async fn ensure_prefix(blobs: &dyn ObjectStore, prefix: &str) -> Result<(), RegistryError> {
    if !blobs.prefix_exists(prefix).await? {
        info!(%prefix, "creating storage prefix");
        blobs.create_prefix(prefix).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::store::{MemoryDocumentStore, MemoryObjectStore};

    use super::*;

    #[test]
    fn default_space_uses_the_global_prefix() {
        let mut registry = SpaceRegistry::new("registry");
        registry.declare_space("__default__").unwrap();
        let space = registry.space("").unwrap();
        assert_eq!(space.apps_namespace(), "registry-apps");
        assert_eq!(space.versions_namespace(), "registry-versions");
        assert_eq!(space.storage_prefix(), "registry");
    }

    #[test]
    fn named_space_namespaces_carry_the_name() {
        let mut registry = SpaceRegistry::new("registry");
        registry.declare_space("main").unwrap();
        let space = registry.space("main").unwrap();
        assert_eq!(space.apps_namespace(), "registry-main-apps");
        assert_eq!(space.storage_prefix(), "registry-main");
    }

    #[test]
    fn names_never_collide_between_kinds() {
        let mut registry = SpaceRegistry::new("registry");
        registry.declare_space("main").unwrap();
        assert!(registry.declare_space("main").is_err());
        assert!(registry.declare_virtual_space("main", "main").is_err());

        registry.declare_virtual_space("partner", "main").unwrap();
        assert!(registry.declare_space("partner").is_err());
        assert!(registry.declare_virtual_space("partner", "main").is_err());
    }

    #[test]
    fn virtual_space_requires_known_source() {
        let mut registry = SpaceRegistry::new("registry");
        assert!(registry.declare_virtual_space("partner", "missing").is_err());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut registry = SpaceRegistry::new("registry");
        assert!(registry.declare_space("Главный").is_err());
        assert!(registry.declare_space("9nine").is_err());
        assert!(registry.declare_space("with space").is_err());
        registry.declare_space("ok_name-2").unwrap();
    }

    #[tokio::test]
    async fn bootstrap_creates_everything_idempotently() {
        let docs = MemoryDocumentStore::new();
        let blobs = MemoryObjectStore::new();
        let mut registry = SpaceRegistry::new("registry");
        registry.declare_space("main").unwrap();
        registry.declare_virtual_space("partner", "main").unwrap();

        registry.bootstrap(&docs, &blobs).await.unwrap();
        // A second run must not fail on already-created state.
        registry.bootstrap(&docs, &blobs).await.unwrap();

        use crate::store::DocumentStore as _;
        use crate::store::ObjectStore as _;
        assert!(docs.namespace_exists("registry-main-apps").await.unwrap());
        assert!(docs.namespace_exists("registry-main-versions").await.unwrap());
        assert!(docs.namespace_exists("registry-partner-overrides").await.unwrap());
        assert!(docs.namespace_exists("registry-editors").await.unwrap());
        assert!(blobs.prefix_exists("registry-main").await.unwrap());
        assert!(blobs.prefix_exists("registry-partner").await.unwrap());
        assert!(blobs.prefix_exists("registry-assets").await.unwrap());
    }

    #[test]
    fn subscribers_are_grouped_by_source() {
        let mut registry = SpaceRegistry::new("registry");
        registry.declare_space("main").unwrap();
        registry.declare_space("other").unwrap();
        registry.declare_virtual_space("partner", "main").unwrap();
        registry.declare_virtual_space("reseller", "main").unwrap();
        registry.declare_virtual_space("mirror", "other").unwrap();

        let mut names: Vec<_> = registry
            .virtual_spaces_of("main")
            .iter()
            .map(|vs| vs.name())
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["partner", "reseller"]);
    }
}
