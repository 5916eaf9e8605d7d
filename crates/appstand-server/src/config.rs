//! Server configuration, loaded from a TOML file.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use appstand_core::ingest::{IngestConfig, RetryPolicy};
use appstand_core::space::SpaceRegistry;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:8081`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Global namespace prefix for document and object storage.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Declared physical spaces. The empty string (or `__default__`) is
    /// the default space.
    #[serde(default)]
    pub spaces: Vec<String>,

    /// Declared virtual spaces.
    #[serde(default)]
    pub virtual_spaces: Vec<VirtualSpaceConfig>,

    /// Download pipeline tunables.
    #[serde(default)]
    pub ingest: IngestSection,
}

/// One virtual space declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualSpaceConfig {
    /// Virtual space name.
    pub name: String,
    /// Source space it overlays.
    pub source: String,
}

/// The `[ingest]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestSection {
    /// Archive size ceiling in bytes.
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size: u64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Total fetch attempts.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Pause between attempts, in milliseconds.
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            max_archive_size: default_max_archive_size(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: 0,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8081".to_owned()
}

fn default_prefix() -> String {
    "registry".to_owned()
}

fn default_max_archive_size() -> u64 {
    appstand_core::ingest::MAX_ARCHIVE_SIZE
}

fn default_request_timeout_secs() -> u64 {
    appstand_core::ingest::REQUEST_TIMEOUT.as_secs()
}

fn default_retry_attempts() -> u32 {
    RetryPolicy::default().attempts
}

impl ServerConfig {
    /// Loads and parses the configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?;
        toml::from_str(&raw).context("parsing configuration")
    }

    /// A configuration with the default space only, for running without a
    /// file.
    #[must_use]
    pub fn default_with_spaces() -> Self {
        Self {
            listen: default_listen(),
            prefix: default_prefix(),
            spaces: vec![String::new()],
            virtual_spaces: Vec::new(),
            ingest: IngestSection::default(),
        }
    }

    /// Builds the space registry from the declarations.
    pub fn space_registry(&self) -> anyhow::Result<SpaceRegistry> {
        let mut registry = SpaceRegistry::new(&self.prefix);
        for space in &self.spaces {
            registry
                .declare_space(space)
                .with_context(|| format!("declaring space {space:?}"))?;
        }
        for virtual_space in &self.virtual_spaces {
            registry
                .declare_virtual_space(&virtual_space.name, &virtual_space.source)
                .with_context(|| format!("declaring virtual space {:?}", virtual_space.name))?;
        }
        Ok(registry)
    }

    /// The ingest tunables as the core expects them.
    #[must_use]
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            max_archive_size: self.ingest.max_archive_size,
            request_timeout: Duration::from_secs(self.ingest.request_timeout_secs),
            retry: RetryPolicy {
                attempts: self.ingest.retry_attempts,
                backoff: Duration::from_millis(self.ingest.retry_backoff_ms),
            },
        }
    }
}
