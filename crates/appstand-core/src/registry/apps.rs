//! Application creation and lookup.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::archive::AppKind;
use crate::error::RegistryError;
use crate::space::{self, Space};
use crate::store::{Query, StoreError};

use super::{app_id, App, Registry};

pub(crate) static SLUG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").expect("slug regex is valid"));

/// Options supplied when registering an application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppOptions {
    /// Application slug.
    #[serde(default)]
    pub slug: String,
    /// Owning editor name.
    #[serde(default)]
    pub editor: String,
    /// Application kind, `webapp` or `konnector`.
    #[serde(default, rename = "type")]
    pub kind: String,
}

/// Validates app options, aggregating field failures.
pub(crate) fn validate_app_options(opts: &AppOptions) -> Result<AppKind, RegistryError> {
    if !SLUG_REGEX.is_match(&opts.slug) {
        return Err(RegistryError::AppInvalid(
            "the slug should contain only lowercase alphanumeric characters and dashes".to_owned(),
        ));
    }
    let mut fields = Vec::new();
    if opts.editor.is_empty() {
        fields.push("editor");
    }
    let kind = AppKind::from_str(&opts.kind);
    if kind.is_err() {
        fields.push("type");
    }
    match kind {
        Ok(kind) if fields.is_empty() => Ok(kind),
        _ => Err(RegistryError::AppInvalid(format!(
            "the following fields are missing or erroneous: {}",
            fields.join(", ")
        ))),
    }
}

pub(crate) fn validate_slug(slug: &str) -> Result<(), RegistryError> {
    if SLUG_REGEX.is_match(slug) {
        Ok(())
    } else {
        Err(RegistryError::AppInvalid(
            "the slug should contain only lowercase alphanumeric characters and dashes".to_owned(),
        ))
    }
}

impl Registry {
    /// Registers an application in a space.
    ///
    /// The caller has already authenticated the editor; the app document
    /// records the editor's display name and is immutable afterwards.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AppInvalid`] on malformed options,
    /// [`RegistryError::AppAlreadyExists`] when the slug is taken.
    pub async fn create_app(
        &self,
        space: &Space,
        opts: &AppOptions,
        editor: &crate::auth::Editor,
    ) -> Result<App, RegistryError> {
        let kind = validate_app_options(opts)?;

        match self.find_app(space, &opts.slug).await {
            Ok(_) => return Err(RegistryError::AppAlreadyExists),
            Err(RegistryError::AppNotFound) => {},
            Err(err) => return Err(err),
        }

        let app = App {
            slug: opts.slug.clone(),
            kind,
            editor: editor.name.clone(),
            created_at: Utc::now(),
            name: None,
            versions: None,
            maintenance_activated: None,
            maintenance_options: None,
        };
        let body = serde_json::to_value(&app)
            .map_err(|err| StoreError::Backend(err.to_string()))?;

        match self
            .docs
            .put(&space.apps_namespace(), &app_id(&app.slug), None, body)
            .await
        {
            Ok(_) => {},
            Err(StoreError::Conflict { .. }) => return Err(RegistryError::AppAlreadyExists),
            Err(err) => return Err(err.into()),
        }

        space::install_channel_views(self.docs.as_ref(), space, &app.slug).await?;
        info!(space = space.name(), slug = %app.slug, editor = %app.editor, "application created");

        Ok(App {
            versions: Some(super::AppVersions::default()),
            ..app
        })
    }

    /// Fetches an application by exact slug, with its channel-grouped
    /// versions attached.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AppNotFound`] on a miss.
    pub async fn find_app(&self, space: &Space, slug: &str) -> Result<App, RegistryError> {
        let mut app = self.get_app_bare(space, slug).await?;
        app.versions = Some(self.find_app_versions(space, slug).await?);
        Ok(app)
    }

    /// Fetches the app document without the versions view.
    pub(crate) async fn get_app_bare(
        &self,
        space: &Space,
        slug: &str,
    ) -> Result<App, RegistryError> {
        validate_slug(slug)?;
        let doc = match self.docs.get(&space.apps_namespace(), &app_id(slug)).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound { .. }) => return Err(RegistryError::AppNotFound),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_value(doc.body)
            .map_err(|err| StoreError::Backend(err.to_string()).into())
    }

    /// Whether any application in any declared space is owned by the
    /// editor. Editor deletion is refused while this holds.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn editor_in_use(&self, editor_name: &str) -> Result<bool, RegistryError> {
        for space in self.spaces.spaces() {
            let rows = self
                .docs
                .query(
                    &space.apps_namespace(),
                    &Query::selecting("editor", editor_name).with_limit(1),
                )
                .await?;
            if !rows.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Removes an editor, provided no application references it.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AppInvalid`] when applications still reference the
    /// editor, [`RegistryError::EditorNotFound`] on a miss.
    pub async fn delete_editor(&self, name: &str) -> Result<(), RegistryError> {
        let editor = self.vault().get(name).await?;
        if self.editor_in_use(&editor.name).await? {
            return Err(RegistryError::AppInvalid(
                "the editor is still referenced by registered applications".to_owned(),
            ));
        }
        self.vault().delete(name).await
    }
}
