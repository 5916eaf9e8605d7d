//! Version creation, lookup and channel ordering.
//!
//! "Latest in channel" consumes the per-app materialised contract: a slug
//! query against the versions namespace, ranked with the ordering key of
//! the version codec. The latest-version and version-list reads go through
//! the look-aside cache; every successful create invalidates both.

use bytes::Bytes;
use tracing::{debug, info};

use crate::cache::{app_key_prefixes, latest_version_key, version_list_key, DEFAULT_TTL};
use crate::error::RegistryError;
use crate::ingest::{PendingVersion, VersionOptions};
use crate::space::Space;
use crate::store::{Query, StoreError};
use crate::version::{Channel, OrderingKey, VersionString};

use super::apps::validate_slug;
use super::{version_id, App, AppVersions, Registry, Version};

impl Registry {
    /// Publishes a version: runs the download pipeline on the options and
    /// persists the outcome for `app`. The caller has authenticated the
    /// editor beforehand.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionAlreadyExists`] when `(space, slug,
    /// version)` is taken, [`RegistryError::Unprocessable`] for every
    /// ingestion failure, plus the validation errors of the pipeline.
    pub async fn publish_version(
        &self,
        space: &Space,
        app: &App,
        opts: &VersionOptions,
    ) -> Result<Version, RegistryError> {
        crate::ingest::Downloader::validate_options(opts)?;

        match self.find_version(space, &app.slug, &opts.version).await {
            Ok(_) => return Err(RegistryError::VersionAlreadyExists),
            Err(RegistryError::VersionNotFound) => {},
            Err(err) => return Err(err),
        }

        let pending = self.downloader().download_version(opts).await?;
        self.create_version(space, pending, app).await
    }

    /// Persists a downloaded version and its attachments, invalidates the
    /// caches and refreshes subscribing virtual spaces.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionSlugMismatch`] when the manifest slug does
    /// not name `app`, [`RegistryError::VersionAlreadyExists`] on a
    /// duplicate. An `AlreadyExists` from the store on a concurrent
    /// publish is a definitive "someone else won".
    pub async fn create_version(
        &self,
        space: &Space,
        pending: PendingVersion,
        app: &App,
    ) -> Result<Version, RegistryError> {
        let PendingVersion {
            mut version,
            attachments,
        } = pending;

        if version.slug != app.slug {
            return Err(RegistryError::VersionSlugMismatch);
        }

        match self.find_version(space, &version.slug, &version.version).await {
            Ok(_) => return Err(RegistryError::VersionAlreadyExists),
            Err(RegistryError::VersionNotFound) => {},
            Err(err) => return Err(err),
        }

        version.kind = app.kind;
        version.editor = app.editor.clone();

        let body = serde_json::to_value(&version)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let id = version_id(&version.slug, &version.version);
        match self
            .docs
            .put(&space.versions_namespace(), &id, None, body)
            .await
        {
            Ok(_) => {},
            Err(StoreError::Conflict { .. }) => return Err(RegistryError::VersionAlreadyExists),
            Err(err) => return Err(err.into()),
        }

        self.store_attachments(&space.storage_prefix(), &attachments).await?;

        for prefix in app_key_prefixes(space.name(), &version.slug) {
            self.cache.invalidate(&prefix).await;
        }

        info!(
            space = space.name(),
            slug = %version.slug,
            version = %version.version,
            "version created"
        );

        for virtual_space in self.spaces.virtual_spaces_of(space.name()) {
            self.refresh_virtual_space(virtual_space, &version.slug).await?;
        }

        Ok(version)
    }

    /// Fetches one version document.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionNotFound`] on a miss,
    /// [`RegistryError::VersionInvalid`] on a malformed version string.
    pub async fn find_version(
        &self,
        space: &Space,
        slug: &str,
        version: &str,
    ) -> Result<Version, RegistryError> {
        validate_slug(slug)?;
        let version = VersionString::parse(version)?;
        let id = version_id(slug, version.as_str());
        let doc = match self.docs.get(&space.versions_namespace(), &id).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound { .. }) => return Err(RegistryError::VersionNotFound),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_value(doc.body)
            .map_err(|err| StoreError::Backend(err.to_string()).into())
    }

    /// Returns the highest-ranked version visible from `channel`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionNotFound`] when the channel has no version.
    pub async fn find_latest_version(
        &self,
        space: &Space,
        slug: &str,
        channel: Channel,
    ) -> Result<Version, RegistryError> {
        validate_slug(slug)?;

        let key = latest_version_key(space.name(), slug, channel);
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(version) = serde_json::from_slice(&cached) {
                debug!(%key, "latest version served from cache");
                return Ok(version);
            }
        }

        let latest = self
            .ranked_versions(space, slug)
            .await?
            .into_iter()
            .filter(|(version, _, _)| channel.includes(version.channel()))
            .max_by(|(_, a, _), (_, b, _)| a.cmp(b))
            .map(|(_, _, doc)| doc)
            .ok_or(RegistryError::VersionNotFound)?;

        if let Ok(bytes) = serde_json::to_vec(&latest) {
            self.cache.put(&key, Bytes::from(bytes), DEFAULT_TTL).await;
        }
        Ok(latest)
    }

    /// Returns the channel-grouped version lists for an app, ordered
    /// ascending by the channel ordering key.
    ///
    /// # Errors
    ///
    /// Propagates store failures. An app without versions yields empty
    /// lists.
    pub async fn find_app_versions(
        &self,
        space: &Space,
        slug: &str,
    ) -> Result<AppVersions, RegistryError> {
        validate_slug(slug)?;

        let key = version_list_key(space.name(), slug);
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(versions) = serde_json::from_slice(&cached) {
                return Ok(versions);
            }
        }

        let mut ranked = self.ranked_versions(space, slug).await?;
        ranked.sort_by(|(_, a, _), (_, b, _)| a.cmp(b));

        let mut versions = AppVersions::default();
        for (version, _, _) in &ranked {
            let raw = version.as_str().to_owned();
            match version.channel() {
                Channel::Stable => {
                    versions.stable.push(raw.clone());
                    versions.beta.push(raw.clone());
                    versions.dev.push(raw);
                },
                Channel::Beta => {
                    versions.beta.push(raw.clone());
                    versions.dev.push(raw);
                },
                Channel::Dev => {
                    versions.dev.push(raw);
                },
            }
        }

        if let Ok(bytes) = serde_json::to_vec(&versions) {
            self.cache.put(&key, Bytes::from(bytes), DEFAULT_TTL).await;
        }
        Ok(versions)
    }

    /// Every version document of an app, paired with its ordering key.
    /// Documents with unparsable version strings are skipped.
    async fn ranked_versions(
        &self,
        space: &Space,
        slug: &str,
    ) -> Result<Vec<(VersionString, OrderingKey, Version)>, RegistryError> {
        let rows = self
            .docs
            .query(&space.versions_namespace(), &Query::selecting("slug", slug))
            .await?;

        let mut ranked = Vec::with_capacity(rows.len());
        for row in rows {
            let doc: Version = match serde_json::from_value(row.body) {
                Ok(doc) => doc,
                Err(err) => {
                    debug!(id = %row.id, error = %err, "skipping undecodable version document");
                    continue;
                },
            };
            let Ok(version) = VersionString::parse(&doc.version) else {
                continue;
            };
            let rank = version.ordering_key(doc.created_at);
            ranked.push((version, rank, doc));
        }
        Ok(ranked)
    }
}
