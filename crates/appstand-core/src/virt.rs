//! Virtual-space override engine.
//!
//! A virtual space overlays per-app overrides on a source space: a
//! replacement display name, a replacement icon (stored in the global
//! asset prefix), and a maintenance flag. Name and icon overrides
//! regenerate the latest tarball of each channel with the substitution
//! applied; the regenerated archive lives in the virtual space's private
//! storage prefix and is described by an overwritten version document in
//! its overrides namespace.
//!
//! Reads consult the override document first and fall through to the
//! source space. Setting or clearing the maintenance flag never triggers
//! regeneration.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use tempfile::SpooledTempFile;
use tracing::{debug, info};

use crate::archive::{clean_path, hex_digest};
use crate::error::RegistryError;
use crate::ingest::tarball_filename;
use crate::registry::{app_id, version_id, App, AppVersions, Registry, Version};
use crate::space::{Space, VirtualSpace};
use crate::store::{ObjectBlob, StoreError};
use crate::version::Channel;

const NAME_KEY: &str = "name";
const ICON_KEY: &str = "icon";
const MAINTENANCE_FLAG_KEY: &str = "maintenance_activated";
const MAINTENANCE_OPTIONS_KEY: &str = "maintenance_options";

/// Attachment name of a regenerated archive.
const TARBALL_KEY: &str = "tarball";

/// In-memory ceiling of the regeneration buffer before it spills to a
/// temporary file. The spill file is removed on drop, on every exit path.
const SPOOL_THRESHOLD: usize = 4 * 1024 * 1024;

impl Registry {
    fn source_space(&self, virtual_space: &VirtualSpace) -> Result<&Space, RegistryError> {
        self.spaces.space(virtual_space.source()).ok_or_else(|| {
            StoreError::Backend(format!(
                "virtual space {:?} references unknown source space {:?}",
                virtual_space.name(),
                virtual_space.source()
            ))
            .into()
        })
    }

    /// The override document of an app in a virtual space; empty when none
    /// has been written yet.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AppInvalid`] on a malformed slug.
    pub async fn find_override(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
    ) -> Result<Map<String, Value>, RegistryError> {
        crate::registry::validate_slug(slug)?;
        match self
            .docs
            .get(&virtual_space.overrides_namespace(), &app_id(slug))
            .await
        {
            Ok(doc) => Ok(doc.body.as_object().cloned().unwrap_or_default()),
            Err(StoreError::NotFound { .. }) => Ok(Map::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn put_override(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
        body: Map<String, Value>,
    ) -> Result<(), RegistryError> {
        let namespace = virtual_space.overrides_namespace();
        let id = app_id(slug);
        let rev = match self.docs.get(&namespace, &id).await {
            Ok(doc) => Some(doc.rev),
            Err(StoreError::NotFound { .. }) => None,
            Err(err) => return Err(err.into()),
        };
        self.docs
            .put(&namespace, &id, rev.as_deref(), Value::Object(body))
            .await?;
        Ok(())
    }

    /// Resolves an app through the virtual space, substituting the name
    /// and maintenance overrides.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AppNotFound`] when the source space has no such
    /// app.
    pub async fn virtual_find_app(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
    ) -> Result<App, RegistryError> {
        let source = self.source_space(virtual_space)?;
        let mut app = self.find_app(source, slug).await?;

        let overrides = self.find_override(virtual_space, slug).await?;
        if let Some(name) = overrides.get(NAME_KEY).and_then(Value::as_str) {
            app.name = Some(name.to_owned());
        }
        if overrides.get(MAINTENANCE_FLAG_KEY).and_then(Value::as_bool) == Some(true) {
            app.maintenance_activated = Some(true);
            app.maintenance_options = overrides.get(MAINTENANCE_OPTIONS_KEY).cloned();
        }
        Ok(app)
    }

    /// Resolves a version through the virtual space: the overwritten
    /// document wins over the source one.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionNotFound`] when neither side has it.
    pub async fn virtual_find_version(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
        version: &str,
    ) -> Result<Version, RegistryError> {
        if let Some((overwritten, _)) = self
            .overwritten_version(virtual_space, slug, version)
            .await?
        {
            return Ok(overwritten);
        }
        let source = self.source_space(virtual_space)?;
        self.find_version(source, slug, version).await
    }

    /// Latest in channel through the virtual space.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionNotFound`] when the channel is empty.
    pub async fn virtual_find_latest_version(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
        channel: Channel,
    ) -> Result<Version, RegistryError> {
        let source = self.source_space(virtual_space)?;
        let latest = self.find_latest_version(source, slug, channel).await?;
        if let Some((overwritten, _)) = self
            .overwritten_version(virtual_space, slug, &latest.version)
            .await?
        {
            return Ok(overwritten);
        }
        Ok(latest)
    }

    /// Channel-grouped version lists; identical to the source space since
    /// overrides never add or remove version strings.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn virtual_find_app_versions(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
    ) -> Result<AppVersions, RegistryError> {
        let source = self.source_space(virtual_space)?;
        self.find_app_versions(source, slug).await
    }

    /// Paginated app listing through the virtual space: the source page
    /// with name and maintenance overrides applied to each row.
    ///
    /// # Errors
    ///
    /// Propagates store failures and listing validation errors.
    pub async fn virtual_get_apps_list(
        &self,
        virtual_space: &VirtualSpace,
        opts: &crate::registry::AppsListOptions,
    ) -> Result<crate::registry::AppsPage, RegistryError> {
        let source = self.source_space(virtual_space)?;
        let mut page = self.get_apps_list(source, opts).await?;
        for app in &mut page.apps {
            let overrides = self.find_override(virtual_space, &app.slug).await?;
            if let Some(name) = overrides.get(NAME_KEY).and_then(Value::as_str) {
                app.name = Some(name.to_owned());
            }
            if overrides.get(MAINTENANCE_FLAG_KEY).and_then(Value::as_bool) == Some(true) {
                app.maintenance_activated = Some(true);
                app.maintenance_options = overrides.get(MAINTENANCE_OPTIONS_KEY).cloned();
            }
        }
        Ok(page)
    }

    /// Serves a version attachment through the virtual space. The icon
    /// override is served from the global asset store; a regenerated
    /// archive is served from the virtual space's own prefix; everything
    /// else falls through to the source space.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionNotFound`] when no attachment resolves.
    pub async fn virtual_find_version_attachment(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
        version: &str,
        filename: &str,
    ) -> Result<ObjectBlob, RegistryError> {
        if filename == "icon" {
            let overrides = self.find_override(virtual_space, slug).await?;
            if let Some(digest) = overrides.get(ICON_KEY).and_then(Value::as_str) {
                return self.get_asset(digest).await;
            }
        }

        if let Some((overwritten, _)) = self
            .overwritten_version(virtual_space, slug, version)
            .await?
        {
            if let Some(digest) = overwritten.attachments.get(TARBALL_KEY) {
                if filename == TARBALL_KEY || filename == tarball_filename(&overwritten.url) {
                    return Ok(self
                        .blobs
                        .get(&virtual_space.storage_prefix(), digest)
                        .await?);
                }
            }
        }

        let source = self.source_space(virtual_space)?;
        let found = self.find_version(source, slug, version).await?;
        self.find_version_attachment(source, &found, filename).await
    }

    /// Sets the display-name override and regenerates the per-channel
    /// tarballs with the new name substituted into the manifest.
    ///
    /// # Errors
    ///
    /// Propagates store and regeneration failures.
    pub async fn overwrite_app_name(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
        new_name: &str,
    ) -> Result<(), RegistryError> {
        let mut overrides = self.find_override(virtual_space, slug).await?;
        overrides.insert(NAME_KEY.to_owned(), Value::String(new_name.to_owned()));
        self.put_override(virtual_space, slug, overrides).await?;
        self.regenerate_overwritten_tarballs(virtual_space, slug).await
    }

    /// Clears the display-name override. With no icon override left, the
    /// regenerated versions are torn down and reads fall back to the
    /// source archives.
    ///
    /// # Errors
    ///
    /// Propagates store and regeneration failures.
    pub async fn clear_app_name(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
    ) -> Result<(), RegistryError> {
        let mut overrides = self.find_override(virtual_space, slug).await?;
        overrides.remove(NAME_KEY);
        self.put_override(virtual_space, slug, overrides).await?;
        self.regenerate_overwritten_tarballs(virtual_space, slug).await
    }

    /// Stores a replacement icon in the global asset store, records its
    /// digest in the override document and regenerates the tarballs.
    ///
    /// # Errors
    ///
    /// Propagates store and regeneration failures.
    pub async fn overwrite_app_icon(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
        content_type: &str,
        icon: Bytes,
    ) -> Result<(), RegistryError> {
        let digest = self.store_asset(content_type, icon).await?;
        let mut overrides = self.find_override(virtual_space, slug).await?;
        overrides.insert(ICON_KEY.to_owned(), Value::String(digest));
        self.put_override(virtual_space, slug, overrides).await?;
        self.regenerate_overwritten_tarballs(virtual_space, slug).await
    }

    /// Clears the icon override.
    ///
    /// # Errors
    ///
    /// Propagates store and regeneration failures.
    pub async fn clear_app_icon(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
    ) -> Result<(), RegistryError> {
        let mut overrides = self.find_override(virtual_space, slug).await?;
        overrides.remove(ICON_KEY);
        self.put_override(virtual_space, slug, overrides).await?;
        self.regenerate_overwritten_tarballs(virtual_space, slug).await
    }

    /// Flags an app as under maintenance in the virtual space. Does not
    /// touch the regenerated tarballs.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn activate_maintenance(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
        options: Value,
    ) -> Result<(), RegistryError> {
        let mut overrides = self.find_override(virtual_space, slug).await?;
        overrides.insert(MAINTENANCE_FLAG_KEY.to_owned(), Value::Bool(true));
        overrides.insert(MAINTENANCE_OPTIONS_KEY.to_owned(), options);
        self.put_override(virtual_space, slug, overrides).await
    }

    /// Removes the maintenance flag and options.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn deactivate_maintenance(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
    ) -> Result<(), RegistryError> {
        let mut overrides = self.find_override(virtual_space, slug).await?;
        overrides.remove(MAINTENANCE_FLAG_KEY);
        overrides.remove(MAINTENANCE_OPTIONS_KEY);
        self.put_override(virtual_space, slug, overrides).await
    }

    /// Called after a publish on the source space: refreshes the
    /// regenerated tarballs of every subscribing virtual space that has an
    /// archive-affecting override for the app.
    pub(crate) async fn refresh_virtual_space(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
    ) -> Result<(), RegistryError> {
        let overrides = self.find_override(virtual_space, slug).await?;
        if overrides.contains_key(NAME_KEY) || overrides.contains_key(ICON_KEY) {
            self.regenerate_overwritten_tarballs(virtual_space, slug).await?;
        }
        Ok(())
    }

    async fn overwritten_version(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
        version: &str,
    ) -> Result<Option<(Version, String)>, RegistryError> {
        let id = version_id(slug, version);
        match self
            .docs
            .get(&virtual_space.overrides_namespace(), &id)
            .await
        {
            Ok(doc) => {
                let version = serde_json::from_value(doc.body)
                    .map_err(|err| StoreError::Backend(err.to_string()))?;
                Ok(Some((version, doc.rev)))
            },
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Regenerates the latest tarball of each channel with the current
    /// overrides applied, or tears the overwritten versions down when no
    /// archive-affecting override remains. At most one regenerated version
    /// exists per `(app-slug, channel)`.
    pub(crate) async fn regenerate_overwritten_tarballs(
        &self,
        virtual_space: &VirtualSpace,
        slug: &str,
    ) -> Result<(), RegistryError> {
        let source = self.source_space(virtual_space)?;
        let overrides = self.find_override(virtual_space, slug).await?;
        let new_name = overrides
            .get(NAME_KEY)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let icon_digest = overrides
            .get(ICON_KEY)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        if new_name.is_none() && icon_digest.is_none() {
            return self.tear_down_overwritten(virtual_space, source, slug).await;
        }

        let new_icon = match &icon_digest {
            Some(digest) => Some(self.get_asset(digest).await?.data),
            None => None,
        };

        let mut processed: Vec<String> = Vec::new();
        for channel in Channel::ALL {
            let latest = match self.find_latest_version(source, slug, channel).await {
                Ok(latest) => latest,
                Err(RegistryError::VersionNotFound) => continue,
                Err(err) => return Err(err),
            };
            if processed.contains(&latest.version) {
                continue;
            }

            let source_blob = self
                .find_version_attachment(source, &latest, &tarball_filename(&latest.url))
                .await?;
            let regenerated = regenerate_archive(
                &latest,
                new_name.as_deref(),
                new_icon.as_deref(),
                &source_blob.data,
            )?;

            let prefix = virtual_space.storage_prefix();
            if !self.blobs.prefix_exists(&prefix).await? {
                self.blobs.create_prefix(&prefix).await?;
            }
            self.blobs
                .put(
                    &prefix,
                    &regenerated.sha256,
                    "application/gzip",
                    Bytes::from(regenerated.data),
                )
                .await?;

            let mut overwritten = latest.clone();
            overwritten.sha256 = regenerated.sha256.clone();
            overwritten.size = regenerated.size;
            overwritten.url = prefix_url_path(&latest.url, virtual_space.name())?;
            overwritten.attachments =
                BTreeMap::from([(TARBALL_KEY.to_owned(), regenerated.sha256.clone())]);
            if let Some(manifest) = regenerated.manifest {
                overwritten.manifest = manifest;
            }

            let existing = self
                .overwritten_version(virtual_space, slug, &latest.version)
                .await?;
            let rev = match &existing {
                Some((old, rev)) => {
                    if let Some(old_digest) = old.attachments.get(TARBALL_KEY) {
                        if *old_digest != regenerated.sha256 {
                            self.remove_stale_tarball(virtual_space, old_digest).await?;
                        }
                    }
                    Some(rev.clone())
                },
                None => None,
            };

            let body = serde_json::to_value(&overwritten)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            self.docs
                .put(
                    &virtual_space.overrides_namespace(),
                    &version_id(slug, &latest.version),
                    rev.as_deref(),
                    body,
                )
                .await?;

            info!(
                virtual_space = virtual_space.name(),
                %slug,
                version = %latest.version,
                sha256 = %overwritten.sha256,
                "regenerated overwritten tarball"
            );
            processed.push(latest.version.clone());
        }
        Ok(())
    }

    async fn tear_down_overwritten(
        &self,
        virtual_space: &VirtualSpace,
        source: &Space,
        slug: &str,
    ) -> Result<(), RegistryError> {
        let mut processed: Vec<String> = Vec::new();
        for channel in Channel::ALL {
            let latest = match self.find_latest_version(source, slug, channel).await {
                Ok(latest) => latest,
                Err(RegistryError::VersionNotFound) => continue,
                Err(err) => return Err(err),
            };
            if processed.contains(&latest.version) {
                continue;
            }
            processed.push(latest.version.clone());

            let Some((old, rev)) = self
                .overwritten_version(virtual_space, slug, &latest.version)
                .await?
            else {
                continue;
            };
            if let Some(digest) = old.attachments.get(TARBALL_KEY) {
                self.remove_stale_tarball(virtual_space, digest).await?;
            }
            self.docs
                .delete(
                    &virtual_space.overrides_namespace(),
                    &version_id(slug, &latest.version),
                    &rev,
                )
                .await?;
            debug!(
                virtual_space = virtual_space.name(),
                %slug,
                version = %latest.version,
                "removed overwritten version"
            );
        }
        Ok(())
    }

    async fn remove_stale_tarball(
        &self,
        virtual_space: &VirtualSpace,
        digest: &str,
    ) -> Result<(), RegistryError> {
        match self
            .blobs
            .remove(&virtual_space.storage_prefix(), digest)
            .await
        {
            Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

struct RegeneratedArchive {
    data: Vec<u8>,
    sha256: String,
    size: u64,
    manifest: Option<Value>,
}

/// Stream-copies the source archive entry by entry into a new gzipped
/// tar, substituting the icon bytes and/or the manifest's `name` field.
/// The output buffer spills to a temporary file past a threshold; the
/// spill file is unlinked when the buffer drops, errors included.
fn regenerate_archive(
    version: &Version,
    new_name: Option<&str>,
    new_icon: Option<&[u8]>,
    input: &[u8],
) -> Result<RegeneratedArchive, RegistryError> {
    let icon_target = version
        .manifest
        .get("icon")
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
        .map(clean_path);
    let manifest_filename = version.kind.manifest_filename();
    let mut new_manifest = None;

    let spool = SpooledTempFile::new(SPOOL_THRESHOLD);
    let encoder = GzEncoder::new(spool, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut archive = tar::Archive::new(GzDecoder::new(input));
    for entry in archive.entries().map_err(backend)? {
        let mut entry = entry.map_err(backend)?;
        let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(backend)?;

        if entry.header().entry_type().is_file() {
            let mut name = clean_path(&path);
            if !version.tar_prefix.is_empty() {
                if let Some(stripped) = name.strip_prefix(&format!("/{}", version.tar_prefix)) {
                    name = clean_path(stripped);
                }
            }

            if let Some(icon) = new_icon {
                if icon_target.as_deref() == Some(name.as_str()) {
                    data = icon.to_vec();
                }
            }
            if let Some(name_override) = new_name {
                if name.rsplit('/').next() == Some(manifest_filename) {
                    let mut manifest: Value =
                        serde_json::from_slice(&data).map_err(backend)?;
                    if let Some(object) = manifest.as_object_mut() {
                        object.insert(
                            NAME_KEY.to_owned(),
                            Value::String(name_override.to_owned()),
                        );
                    }
                    data = serde_json::to_vec(&manifest).map_err(backend)?;
                    new_manifest = Some(manifest);
                }
            }
        }

        let mut header = entry.header().clone();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data.as_slice())
            .map_err(backend)?;
    }

    let encoder = builder.into_inner().map_err(backend)?;
    let mut spool = encoder.finish().map_err(backend)?;
    spool.seek(SeekFrom::Start(0)).map_err(backend)?;
    let mut data = Vec::new();
    spool.read_to_end(&mut data).map_err(backend)?;

    Ok(RegeneratedArchive {
        sha256: hex_digest(&data),
        size: data.len() as u64,
        manifest: new_manifest,
        data,
    })
}

/// Prepends the virtual-space name to the URL path, marking the archive
/// as served by the virtual space.
fn prefix_url_path(url: &str, virtual_space_name: &str) -> Result<String, RegistryError> {
    let mut parsed = reqwest::Url::parse(url)
        .map_err(|err| StoreError::Backend(format!("stored version URL is invalid: {err}")))?;
    let path = format!("/{virtual_space_name}{}", parsed.path());
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn backend(err: impl std::fmt::Display) -> RegistryError {
    StoreError::Backend(err.to_string()).into()
}
