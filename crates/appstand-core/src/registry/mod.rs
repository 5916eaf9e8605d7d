//! Application and version documents, and the registry facade.
//!
//! [`Registry`] is the composition root of the core: it owns the document
//! store, the object store, the cache, the space registry, the download
//! pipeline and the editor vault, and exposes the operations the HTTP
//! adapter calls. There are no process-wide singletons; everything flows
//! through this value.

mod apps;
mod attachments;
mod list;
mod versions;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use apps::AppOptions;
pub(crate) use apps::validate_slug;
pub use list::{AppsListOptions, AppsPage, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};

use crate::archive::AppKind;
use crate::auth::EditorVault;
use crate::cache::Cache;
use crate::ingest::{Downloader, IngestConfig};
use crate::space::SpaceRegistry;
use crate::store::{DocumentStore, ObjectStore};

/// A registered application within one space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    /// Application slug; also the document identity.
    pub slug: String,
    /// Application kind, immutable after creation.
    #[serde(rename = "type")]
    pub kind: AppKind,
    /// Owning editor, immutable after creation.
    pub editor: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Display name substituted by a virtual-space override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Channel-grouped version strings, attached on single-app reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<AppVersions>,
    /// Maintenance flag from a virtual-space override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_activated: Option<bool>,
    /// Maintenance options from a virtual-space override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_options: Option<Value>,
}

/// Version strings grouped by channel. The lists are cumulative: a stable
/// version is visible from all three channels, a beta from beta and dev.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersions {
    /// Stable versions only.
    pub stable: Vec<String>,
    /// Stable and beta versions.
    pub beta: Vec<String>,
    /// Everything.
    pub dev: Vec<String>,
}

/// One published artefact of an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    /// Application slug; must match the owning [`App`].
    pub slug: String,
    /// Editor, stamped from the owning [`App`] at creation.
    pub editor: String,
    /// Kind, stamped from the owning [`App`] at creation.
    #[serde(rename = "type")]
    pub kind: AppKind,
    /// The version string.
    pub version: String,
    /// The manifest, opaque apart from injected parameters.
    pub manifest: Value,
    /// Creation timestamp; tie-breaker for channel ordering.
    pub created_at: DateTime<Utc>,
    /// Source archive URL.
    pub url: String,
    /// Bytes observed during download, stored as a decimal string.
    #[serde(with = "size_string")]
    pub size: u64,
    /// Declared and verified sha-256 over the archive, lowercase hex.
    pub sha256: String,
    /// Single shared top-level directory of the archive, or empty.
    pub tar_prefix: String,
    /// Attachment filename to content digest.
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
}

/// Document id of an app. Derived from the slug; never exposed to clients.
pub(crate) fn app_id(slug: &str) -> String {
    slug.to_owned()
}

/// Document id of a version.
pub(crate) fn version_id(slug: &str, version: &str) -> String {
    format!("{slug}-{version}")
}

/// The assembled registry service.
pub struct Registry {
    pub(crate) docs: Arc<dyn DocumentStore>,
    pub(crate) blobs: Arc<dyn ObjectStore>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) spaces: SpaceRegistry,
    downloader: Downloader,
    vault: EditorVault,
}

impl Registry {
    /// Assembles a registry over the given collaborators with the default
    /// ingest tunables.
    #[must_use]
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        blobs: Arc<dyn ObjectStore>,
        cache: Arc<dyn Cache>,
        spaces: SpaceRegistry,
    ) -> Self {
        let vault = EditorVault::new(Arc::clone(&docs), spaces.editors_namespace());
        Self {
            docs,
            blobs,
            cache,
            spaces,
            downloader: Downloader::new(IngestConfig::default()),
            vault,
        }
    }

    /// Replaces the ingest tunables (size ceiling, timeout, retry policy).
    #[must_use]
    pub fn with_ingest_config(mut self, config: IngestConfig) -> Self {
        self.downloader = Downloader::new(config);
        self
    }

    /// The declared spaces and virtual spaces.
    #[must_use]
    pub fn spaces(&self) -> &SpaceRegistry {
        &self.spaces
    }

    /// The editor vault.
    #[must_use]
    pub fn vault(&self) -> &EditorVault {
        &self.vault
    }

    /// The download pipeline.
    #[must_use]
    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }
}

mod size_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(size: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&size.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn version_size_round_trips_as_decimal_string() {
        let version = Version {
            slug: "notes".into(),
            editor: "acme".into(),
            kind: AppKind::Webapp,
            version: "1.0.0".into(),
            manifest: json!({"slug": "notes"}),
            created_at: Utc::now(),
            url: "https://apps.example/notes.tar.gz".into(),
            size: 2048,
            sha256: "ab".repeat(32),
            tar_prefix: "notes".into(),
            attachments: BTreeMap::new(),
        };
        let value = serde_json::to_value(&version).unwrap();
        assert_eq!(value["size"], json!("2048"));
        assert_eq!(value["type"], json!("webapp"));

        let back: Version = serde_json::from_value(value).unwrap();
        assert_eq!(back.size, 2048);
        assert_eq!(back.kind, AppKind::Webapp);
    }

    #[test]
    fn app_serialization_hides_empty_optionals() {
        let app = App {
            slug: "notes".into(),
            kind: AppKind::Webapp,
            editor: "acme".into(),
            created_at: Utc::now(),
            name: None,
            versions: None,
            maintenance_activated: None,
            maintenance_options: None,
        };
        let value = serde_json::to_value(&app).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("name"));
        assert!(!object.contains_key("versions"));
        assert!(!object.contains_key("maintenance_activated"));
    }
}
