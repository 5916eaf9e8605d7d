//! Persistence for editor records.
//!
//! Editors are global, not per-space. Documents are keyed by the lowercased
//! editor name, so retrieval is case-insensitive while the display name
//! keeps its case.

use std::sync::Arc;

use crate::error::RegistryError;
use crate::store::{DocumentStore, StoreError};

use super::Editor;

const LIST_LIMIT: usize = 2000;

/// Store-backed editor vault.
pub struct EditorVault {
    store: Arc<dyn DocumentStore>,
    namespace: String,
}

impl EditorVault {
    /// Creates a vault over the given namespace.
    pub fn new(store: Arc<dyn DocumentStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// The namespace this vault persists into.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Creates the backing namespace when absent.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn ensure_namespace(&self) -> Result<(), RegistryError> {
        if !self.store.namespace_exists(&self.namespace).await? {
            tracing::info!(namespace = %self.namespace, "creating editors namespace");
            self.store.create_namespace(&self.namespace).await?;
        }
        Ok(())
    }

    /// Registers a new editor.
    ///
    /// # Errors
    ///
    /// [`RegistryError::EditorExists`] when the name is already taken
    /// (under any casing).
    pub async fn create(&self, editor: &Editor) -> Result<(), RegistryError> {
        match self.get(&editor.name).await {
            Ok(_) => return Err(RegistryError::EditorExists),
            Err(RegistryError::EditorNotFound) => {},
            Err(err) => return Err(err),
        }
        let body = serde_json::to_value(editor)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        match self.store.put(&self.namespace, &editor.id(), None, body).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => Err(RegistryError::EditorExists),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetches an editor by name, ignoring case.
    ///
    /// # Errors
    ///
    /// [`RegistryError::EditorNotFound`] on a miss.
    pub async fn get(&self, name: &str) -> Result<Editor, RegistryError> {
        let id = name.to_lowercase();
        let doc = match self.store.get(&self.namespace, &id).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound { .. }) => return Err(RegistryError::EditorNotFound),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_value(doc.body)
            .map_err(|err| StoreError::Backend(err.to_string()).into())
    }

    /// Replaces an editor record (used for salt and key rotation).
    ///
    /// # Errors
    ///
    /// [`RegistryError::EditorNotFound`] when the editor does not exist.
    pub async fn update(&self, editor: &Editor) -> Result<(), RegistryError> {
        let id = editor.id();
        let current = match self.store.get(&self.namespace, &id).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound { .. }) => return Err(RegistryError::EditorNotFound),
            Err(err) => return Err(err.into()),
        };
        let body = serde_json::to_value(editor)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        self.store
            .put(&self.namespace, &id, Some(&current.rev), body)
            .await?;
        Ok(())
    }

    /// Removes an editor record. Reference checks against published apps
    /// are the registry's responsibility.
    ///
    /// # Errors
    ///
    /// [`RegistryError::EditorNotFound`] when the editor does not exist.
    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let id = name.to_lowercase();
        let current = match self.store.get(&self.namespace, &id).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound { .. }) => return Err(RegistryError::EditorNotFound),
            Err(err) => return Err(err.into()),
        };
        self.store.delete(&self.namespace, &id, &current.rev).await?;
        Ok(())
    }

    /// Lists all editors, skipping design documents.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn all(&self) -> Result<Vec<Editor>, RegistryError> {
        let docs = self.store.all_docs(&self.namespace, LIST_LIMIT).await?;
        let mut editors = Vec::with_capacity(docs.len());
        for doc in docs {
            if doc.id.starts_with("_design") {
                continue;
            }
            let editor = serde_json::from_value(doc.body)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            editors.push(editor);
        }
        Ok(editors)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryDocumentStore;

    use super::*;

    async fn vault() -> EditorVault {
        let store = Arc::new(MemoryDocumentStore::new());
        let vault = EditorVault::new(store, "registry-editors");
        vault.ensure_namespace().await.unwrap();
        vault
    }

    #[tokio::test]
    async fn create_get_is_case_insensitive() {
        let vault = vault().await;
        vault.create(&Editor::generate("Acme").unwrap()).await.unwrap();

        let fetched = vault.get("acme").await.unwrap();
        assert_eq!(fetched.name, "Acme");
        let fetched = vault.get("ACME").await.unwrap();
        assert_eq!(fetched.name, "Acme");
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let vault = vault().await;
        vault.create(&Editor::generate("acme").unwrap()).await.unwrap();
        let err = vault.create(&Editor::generate("ACME").unwrap()).await.unwrap_err();
        assert!(matches!(err, RegistryError::EditorExists));
    }

    #[tokio::test]
    async fn update_replaces_salt() {
        let vault = vault().await;
        let mut editor = Editor::generate("acme").unwrap();
        vault.create(&editor).await.unwrap();

        let before = editor.session_salt.clone();
        editor.rotate_salt();
        vault.update(&editor).await.unwrap();

        let fetched = vault.get("acme").await.unwrap();
        assert_ne!(fetched.session_salt, before);
    }

    #[tokio::test]
    async fn delete_then_get_misses() {
        let vault = vault().await;
        vault.create(&Editor::generate("acme").unwrap()).await.unwrap();
        vault.delete("acme").await.unwrap();
        assert!(matches!(
            vault.get("acme").await,
            Err(RegistryError::EditorNotFound)
        ));
        assert!(matches!(
            vault.delete("acme").await,
            Err(RegistryError::EditorNotFound)
        ));
    }

    #[tokio::test]
    async fn listing_skips_design_documents() {
        let vault = vault().await;
        vault.create(&Editor::generate("acme").unwrap()).await.unwrap();
        vault.create(&Editor::generate("globex").unwrap()).await.unwrap();
        vault
            .store
            .install_design_doc("registry-editors", "by-name", serde_json::json!({}))
            .await
            .unwrap();

        let editors = vault.all().await.unwrap();
        let mut names: Vec<_> = editors.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["acme", "globex"]);
    }
}
