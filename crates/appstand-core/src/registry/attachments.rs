//! Attachment storage and retrieval.
//!
//! Two-tier addressing: immutable content-addressed objects in the object
//! store under `(space-prefix, sha-256)`, with the owning version document
//! holding the filename to digest mapping. The global asset prefix is
//! shared across spaces and serves override icons.

use bytes::Bytes;

use crate::archive::{hex_digest, RawAttachment};
use crate::error::RegistryError;
use crate::space::Space;
use crate::store::ObjectBlob;
use crate::version::Channel;

use super::{Registry, Version};

impl Registry {
    /// Serves an attachment of one version by filename (`icon`,
    /// `screenshots/<name>`, or the archive itself).
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionNotFound`] when the version carries no such
    /// attachment.
    pub async fn find_version_attachment(
        &self,
        space: &Space,
        version: &Version,
        filename: &str,
    ) -> Result<ObjectBlob, RegistryError> {
        let digest = version
            .attachments
            .get(filename)
            .ok_or(RegistryError::VersionNotFound)?;
        Ok(self.blobs.get(&space.storage_prefix(), digest).await?)
    }

    /// Serves an attachment of the latest version visible from `channel`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::VersionNotFound`] when the channel is empty or the
    /// attachment is absent.
    pub async fn find_app_attachment(
        &self,
        space: &Space,
        slug: &str,
        filename: &str,
        channel: Channel,
    ) -> Result<ObjectBlob, RegistryError> {
        let latest = self.find_latest_version(space, slug, channel).await?;
        self.find_version_attachment(space, &latest, filename).await
    }

    /// Writes harvested attachments into the space's storage prefix,
    /// one by one, keyed by their content digest.
    pub(crate) async fn store_attachments(
        &self,
        prefix: &str,
        attachments: &[RawAttachment],
    ) -> Result<(), RegistryError> {
        if !self.blobs.prefix_exists(prefix).await? {
            self.blobs.create_prefix(prefix).await?;
        }
        for attachment in attachments {
            self.blobs
                .put(
                    prefix,
                    &attachment.digest,
                    attachment.content_type,
                    Bytes::from(attachment.data.clone()),
                )
                .await?;
        }
        Ok(())
    }

    /// Stores a shared asset (an override icon) in the global asset
    /// prefix and returns its digest.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn store_asset(
        &self,
        content_type: &str,
        data: Bytes,
    ) -> Result<String, RegistryError> {
        let digest = hex_digest(&data);
        let prefix = self.spaces.assets_prefix();
        if !self.blobs.prefix_exists(&prefix).await? {
            self.blobs.create_prefix(&prefix).await?;
        }
        self.blobs.put(&prefix, &digest, content_type, data).await?;
        Ok(digest)
    }

    /// Fetches a shared asset by digest.
    ///
    /// # Errors
    ///
    /// Propagates store failures, including the not-found case.
    pub async fn get_asset(&self, digest: &str) -> Result<ObjectBlob, RegistryError> {
        Ok(self.blobs.get(&self.spaces.assets_prefix(), digest).await?)
    }
}
