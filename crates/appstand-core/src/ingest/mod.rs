//! Version ingestion pipeline.
//!
//! Publishing hands the registry a URL and a declared sha-256. The pipeline
//! fetches the archive with a bounded body and a configurable retry policy,
//! verifies the digest over the downloaded bytes, walks the archive for its
//! manifest, checks manifest consistency against the supplied options, and
//! re-walks the buffered copy to harvest icon and screenshot attachments.
//!
//! Every failure in this path surfaces as
//! [`RegistryError::Unprocessable`] carrying the archive URL and the
//! underlying cause. Network fetches are retried; nothing after the digest
//! check is.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::archive::{self, RawAttachment};
use crate::error::RegistryError;
use crate::manifest::{self, ManifestError, ManifestInfo};
use crate::registry::Version;
use crate::version::VersionString;

/// Hard ceiling on a downloaded application archive.
pub const MAX_ARCHIVE_SIZE: u64 = 20 * 1024 * 1024;

/// Per-request client timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Options supplied by the publishing client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionOptions {
    /// Version string being published.
    #[serde(default)]
    pub version: String,
    /// Remote archive URL.
    #[serde(default)]
    pub url: String,
    /// Declared sha-256 over the archive bytes, lowercase hex.
    #[serde(default)]
    pub sha256: String,
    /// Opaque parameters merged into the stored manifest.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Icon path override, relative to the archive root.
    #[serde(default)]
    pub icon: Option<String>,
    /// Screenshot path overrides, relative to the archive root.
    #[serde(default)]
    pub screenshots: Option<Vec<String>>,
}

/// Fetch retry policy. The default matches the historical behaviour:
/// three attempts, no backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::ZERO,
        }
    }
}

/// Tunables of the download pipeline.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Body ceiling in bytes; the body is truncated past it.
    pub max_archive_size: u64,
    /// Client timeout per request.
    pub request_timeout: Duration,
    /// Fetch retry policy.
    pub retry: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_archive_size: MAX_ARCHIVE_SIZE,
            request_timeout: REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// A downloaded, verified version that has not been persisted yet.
#[derive(Debug)]
pub struct PendingVersion {
    /// The assembled version document.
    pub version: Version,
    /// Harvested attachments, in memory.
    pub attachments: Vec<RawAttachment>,
}

/// The download pipeline. One instance is shared across publishes; the
/// underlying HTTP client pools connections.
pub struct Downloader {
    client: reqwest::Client,
    config: IngestConfig,
}

impl Downloader {
    /// Builds a downloader with the given tunables.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialised, which is a
    /// deployment problem, not a runtime condition.
    #[must_use]
    pub fn new(config: IngestConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("http client construction");
        Self { client, config }
    }

    /// Validates the syntactic fields of the options: version string, URL,
    /// and declared sha-256.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionInvalid`] naming the offending fields.
    pub fn validate_options(opts: &VersionOptions) -> Result<VersionString, RegistryError> {
        let mut fields = Vec::new();
        let version = VersionString::parse(&opts.version);
        if version.is_err() {
            fields.push("version");
        }
        if opts.url.is_empty() || reqwest::Url::parse(&opts.url).is_err() {
            fields.push("url");
        }
        if opts.sha256.len() != 64 || !opts.sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
            fields.push("sha256");
        }
        if fields.is_empty() {
            version
        } else {
            Err(RegistryError::VersionInvalid(format!(
                "the following fields are missing or erroneous: {}",
                fields.join(", ")
            )))
        }
    }

    /// Runs the full pipeline and returns the populated version with its
    /// in-memory attachments, ready for persistence.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionInvalid`] on malformed options,
    /// [`RegistryError::Unprocessable`] on every downstream failure.
    pub async fn download_version(
        &self,
        opts: &VersionOptions,
    ) -> Result<PendingVersion, RegistryError> {
        let version = Self::validate_options(opts)?;
        let (body, content_type) = self.fetch_with_retry(&opts.url).await?;

        let computed = archive::hex_digest(&body);
        if computed != opts.sha256.to_lowercase() {
            debug!(url = %opts.url, declared = %opts.sha256, %computed, "digest mismatch");
            return Err(RegistryError::unprocessable(
                &opts.url,
                "checksum does not match the calculated one".to_string(),
            ));
        }

        let outcome = archive::scan(&body, &content_type)
            .map_err(|err| RegistryError::unprocessable(&opts.url, err))?;

        let (kind, manifest_bytes) = match (outcome.kind, outcome.manifest.as_deref()) {
            (Some(kind), Some(bytes)) => (kind, bytes),
            _ => return Err(RegistryError::unprocessable(&opts.url, ManifestError::Missing)),
        };

        let mut manifest_value: Value = serde_json::from_slice(manifest_bytes)
            .map_err(|err| RegistryError::unprocessable(&opts.url, ManifestError::NotJson(err)))?;
        let info = ManifestInfo::from_bytes(manifest_bytes)
            .map_err(|err| RegistryError::unprocessable(&opts.url, err))?;

        manifest::check_consistency(&info, &version, outcome.package_version.as_deref())
            .map_err(|err| RegistryError::unprocessable(&opts.url, err))?;

        if let Some(parameters) = &opts.parameters {
            match manifest_value.as_object_mut() {
                Some(object) => {
                    object.insert("parameters".to_owned(), parameters.clone());
                },
                None => {
                    return Err(RegistryError::unprocessable(
                        &opts.url,
                        "manifest is not a JSON object".to_string(),
                    ));
                },
            }
        }

        let icon_path = resolve_icon(opts, &info);
        let screenshot_paths = resolve_screenshots(opts, &info);

        // Second pass over the buffered archive. Any error here aborts the
        // publish; partial attachments are discarded with the error.
        let mut attachments = archive::collect_attachments(
            &body,
            &content_type,
            &outcome.tar_prefix,
            icon_path.as_deref(),
            &screenshot_paths,
        )
        .map_err(|err| RegistryError::unprocessable(&opts.url, err))?;

        // The archive itself is kept as an attachment under the basename
        // of its URL, so the registry can serve and regenerate it without
        // re-fetching.
        let sha256 = opts.sha256.to_lowercase();
        let archive_size = body.len() as u64;
        attachments.push(RawAttachment {
            filename: tarball_filename(&opts.url),
            content_type: "application/gzip",
            size: archive_size,
            digest: sha256.clone(),
            data: body,
        });

        let attachment_digests: BTreeMap<String, String> = attachments
            .iter()
            .map(|att| (att.filename.clone(), att.digest.clone()))
            .collect();

        info!(
            url = %opts.url,
            version = %version,
            size = outcome.consumed,
            attachments = attachments.len(),
            "downloaded version"
        );

        Ok(PendingVersion {
            version: Version {
                slug: info.slug,
                editor: info.editor,
                kind,
                version: version.as_str().to_owned(),
                manifest: manifest_value,
                created_at: Utc::now(),
                url: opts.url.clone(),
                size: outcome.consumed,
                sha256,
                tar_prefix: outcome.tar_prefix,
                attachments: attachment_digests,
            },
            attachments,
        })
    }

    /// GET with bounded body and retry on transport errors and non-200
    /// responses. Returns the buffered body and the response content type.
    async fn fetch_with_retry(&self, url: &str) -> Result<(Vec<u8>, String), RegistryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once(url).await {
                Ok(result) => return Ok(result),
                Err(err) if attempt < self.config.retry.attempts => {
                    warn!(%url, attempt, error = %err, "fetch failed, retrying");
                    if !self.config.retry.backoff.is_zero() {
                        tokio::time::sleep(self.config.retry.backoff).await;
                    }
                },
                Err(err) => return Err(RegistryError::unprocessable(url, err)),
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<(Vec<u8>, String), FetchError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        // The body is truncated at the ceiling rather than rejected; an
        // oversized archive then fails the digest check or the tar walk.
        let cap = self.config.max_archive_size as usize;
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let room = cap - body.len();
            if chunk.len() >= room {
                body.extend_from_slice(&chunk[..room]);
                break;
            }
            body.extend_from_slice(&chunk);
        }
        Ok((body, content_type))
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("could not reach version on specified url: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server responded with code {0}")]
    Status(u16),
}

fn resolve_icon(opts: &VersionOptions, info: &ManifestInfo) -> Option<String> {
    let path = opts
        .icon
        .as_deref()
        .filter(|icon| !icon.is_empty())
        .unwrap_or(&info.icon);
    if path.is_empty() {
        None
    } else {
        Some(normalize(path))
    }
}

fn resolve_screenshots(opts: &VersionOptions, info: &ManifestInfo) -> Vec<String> {
    let declared = match &opts.screenshots {
        Some(overrides) => overrides.clone(),
        None => info.all_screenshots(),
    };
    let mut paths = Vec::with_capacity(declared.len());
    for shot in declared {
        let normalized = normalize(&shot);
        if !paths.contains(&normalized) {
            paths.push(normalized);
        }
    }
    paths
}

/// Anchors a manifest-relative path at the archive root.
fn normalize(path: &str) -> String {
    crate::archive::clean_path(path)
}

/// Filename under which the archive itself is attached: the basename of
/// the URL path.
pub(crate) fn tarball_filename(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
                .map(ToOwned::to_owned)
        })
        .unwrap_or_else(|| "tarball".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(version: &str, url: &str, sha256: &str) -> VersionOptions {
        VersionOptions {
            version: version.to_owned(),
            url: url.to_owned(),
            sha256: sha256.to_owned(),
            ..VersionOptions::default()
        }
    }

    #[test]
    fn validate_accepts_well_formed_options() {
        let opts = options("1.0.0", "https://apps.example/a.tar.gz", &"a".repeat(64));
        let version = Downloader::validate_options(&opts).unwrap();
        assert_eq!(version.as_str(), "1.0.0");
    }

    #[test]
    fn validate_lists_every_bad_field() {
        let opts = options("nope", "not a url", "xyz");
        let err = Downloader::validate_options(&opts).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("version"), "{text}");
        assert!(text.contains("url"), "{text}");
        assert!(text.contains("sha256"), "{text}");
    }

    #[test]
    fn icon_option_overrides_manifest() {
        let mut opts = options("1.0.0", "https://x", &"a".repeat(64));
        let info = ManifestInfo {
            icon: "icon.svg".to_owned(),
            ..ManifestInfo::default()
        };
        assert_eq!(resolve_icon(&opts, &info).as_deref(), Some("/icon.svg"));

        opts.icon = Some("override/logo.png".to_owned());
        assert_eq!(resolve_icon(&opts, &info).as_deref(), Some("/override/logo.png"));

        let info = ManifestInfo::default();
        opts.icon = None;
        assert_eq!(resolve_icon(&opts, &info), None);
    }

    #[test]
    fn screenshot_overrides_replace_discovery() {
        let mut opts = options("1.0.0", "https://x", &"a".repeat(64));
        let mut info = ManifestInfo {
            screenshots: vec!["one.png".to_owned(), "two.png".to_owned()],
            ..ManifestInfo::default()
        };
        info.locales.insert(
            "fr".to_owned(),
            crate::manifest::LocaleInfo {
                screenshots: vec!["two.png".to_owned(), "trois.png".to_owned()],
            },
        );
        assert_eq!(
            resolve_screenshots(&opts, &info),
            vec!["/one.png", "/two.png", "/trois.png"]
        );

        opts.screenshots = Some(vec!["only.png".to_owned()]);
        assert_eq!(resolve_screenshots(&opts, &info), vec!["/only.png"]);
    }
}
