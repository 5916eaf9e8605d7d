//! In-memory store implementations.
//!
//! Used by the test-suite and the development server profile. Writes are
//! revision-checked the same way a remote document store would, so the
//! registry's conflict handling is exercised for real.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use super::{Document, DocumentStore, ObjectBlob, ObjectStore, Query, SortOrder, StoreError};

#[derive(Debug, Clone)]
struct StoredDoc {
    rev: String,
    body: Value,
}

#[derive(Debug, Default)]
struct Namespace {
    docs: BTreeMap<String, StoredDoc>,
    generation: u64,
}

impl Namespace {
    fn next_rev(&mut self, previous: Option<&str>) -> String {
        self.generation += 1;
        let seq = previous
            .and_then(|rev| rev.split('-').next())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        format!("{}-{:08x}", seq + 1, self.generation)
    }
}

/// Document store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_namespace<T>(
        &self,
        namespace: &str,
        f: impl FnOnce(&Namespace) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let namespaces = self.namespaces.read().expect("store lock poisoned");
        let ns = namespaces
            .get(namespace)
            .ok_or_else(|| StoreError::not_found(namespace))?;
        f(ns)
    }

    fn with_namespace_mut<T>(
        &self,
        namespace: &str,
        f: impl FnOnce(&mut Namespace) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut namespaces = self.namespaces.write().expect("store lock poisoned");
        let ns = namespaces
            .get_mut(namespace)
            .ok_or_else(|| StoreError::not_found(namespace))?;
        f(ns)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, StoreError> {
        let namespaces = self.namespaces.read().expect("store lock poisoned");
        Ok(namespaces.contains_key(namespace))
    }

    async fn create_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        let mut namespaces = self.namespaces.write().expect("store lock poisoned");
        if namespaces.contains_key(namespace) {
            return Err(StoreError::conflict(namespace));
        }
        namespaces.insert(namespace.to_owned(), Namespace::default());
        Ok(())
    }

    async fn get(&self, namespace: &str, id: &str) -> Result<Document, StoreError> {
        self.with_namespace(namespace, |ns| {
            let doc = ns.docs.get(id).ok_or_else(|| StoreError::not_found(id))?;
            Ok(Document {
                id: id.to_owned(),
                rev: doc.rev.clone(),
                body: doc.body.clone(),
            })
        })
    }

    async fn put(
        &self,
        namespace: &str,
        id: &str,
        rev: Option<&str>,
        body: Value,
    ) -> Result<String, StoreError> {
        self.with_namespace_mut(namespace, |ns| {
            match (ns.docs.get(id), rev) {
                (Some(_), None) => return Err(StoreError::conflict(id)),
                (Some(doc), Some(rev)) if doc.rev != rev => {
                    return Err(StoreError::conflict(id));
                },
                (None, Some(_)) => return Err(StoreError::not_found(id)),
                _ => {},
            }
            let new_rev = ns.next_rev(rev);
            ns.docs.insert(
                id.to_owned(),
                StoredDoc {
                    rev: new_rev.clone(),
                    body,
                },
            );
            Ok(new_rev)
        })
    }

    async fn delete(&self, namespace: &str, id: &str, rev: &str) -> Result<(), StoreError> {
        self.with_namespace_mut(namespace, |ns| {
            let doc = ns.docs.get(id).ok_or_else(|| StoreError::not_found(id))?;
            if doc.rev != rev {
                return Err(StoreError::conflict(id));
            }
            ns.docs.remove(id);
            Ok(())
        })
    }

    async fn create_index(
        &self,
        namespace: &str,
        _name: &str,
        _fields: &[&str],
    ) -> Result<(), StoreError> {
        // Queries scan in memory; the declaration only checks the namespace.
        self.with_namespace(namespace, |_| Ok(()))
    }

    async fn install_design_doc(
        &self,
        namespace: &str,
        name: &str,
        body: Value,
    ) -> Result<(), StoreError> {
        let id = format!("_design/{name}");
        self.with_namespace_mut(namespace, |ns| {
            let rev = match ns.docs.get(&id) {
                Some(existing) if existing.body == body => return Ok(()),
                Some(existing) => Some(existing.rev.clone()),
                None => None,
            };
            let new_rev = ns.next_rev(rev.as_deref());
            ns.docs.insert(
                id.clone(),
                StoredDoc {
                    rev: new_rev,
                    body,
                },
            );
            Ok(())
        })
    }

    async fn query(&self, namespace: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.with_namespace(namespace, |ns| {
            let mut rows: Vec<Document> = ns
                .docs
                .iter()
                .filter(|(id, _)| !id.starts_with("_design/"))
                .filter(|(_, doc)| matches_selector(&doc.body, &query.selector))
                .map(|(id, doc)| Document {
                    id: id.clone(),
                    rev: doc.rev.clone(),
                    body: doc.body.clone(),
                })
                .collect();

            if let Some((field, order)) = &query.sort {
                rows.sort_by(|a, b| {
                    let ordering = compare_values(a.body.get(field), b.body.get(field));
                    match order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                });
            }

            let rows = rows
                .into_iter()
                .skip(query.skip)
                .take(query.limit.unwrap_or(usize::MAX))
                .collect();
            Ok(rows)
        })
    }

    async fn all_docs(&self, namespace: &str, limit: usize) -> Result<Vec<Document>, StoreError> {
        self.with_namespace(namespace, |ns| {
            Ok(ns
                .docs
                .iter()
                .take(limit)
                .map(|(id, doc)| Document {
                    id: id.clone(),
                    rev: doc.rev.clone(),
                    body: doc.body.clone(),
                })
                .collect())
        })
    }
}

fn matches_selector(body: &Value, selector: &[(String, Value)]) -> bool {
    selector.iter().all(|(field, expected)| {
        match body.get(field) {
            // A constraint against an array field matches on membership.
            Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
            Some(actual) => actual == expected,
            None => false,
        }
    })
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    content_type: String,
    data: Bytes,
}

/// Object store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    prefixes: RwLock<HashMap<String, HashMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn prefix_exists(&self, prefix: &str) -> Result<bool, StoreError> {
        let prefixes = self.prefixes.read().expect("store lock poisoned");
        Ok(prefixes.contains_key(prefix))
    }

    async fn create_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut prefixes = self.prefixes.write().expect("store lock poisoned");
        prefixes.entry(prefix.to_owned()).or_default();
        Ok(())
    }

    async fn put(
        &self,
        prefix: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<(), StoreError> {
        let mut prefixes = self.prefixes.write().expect("store lock poisoned");
        let container = prefixes
            .get_mut(prefix)
            .ok_or_else(|| StoreError::not_found(prefix))?;
        container.insert(
            key.to_owned(),
            StoredObject {
                content_type: content_type.to_owned(),
                data,
            },
        );
        Ok(())
    }

    async fn get(&self, prefix: &str, key: &str) -> Result<ObjectBlob, StoreError> {
        let prefixes = self.prefixes.read().expect("store lock poisoned");
        let object = prefixes
            .get(prefix)
            .and_then(|container| container.get(key))
            .ok_or_else(|| StoreError::not_found(format!("{prefix}/{key}")))?;
        Ok(ObjectBlob {
            content_type: object.content_type.clone(),
            etag: key.to_owned(),
            content_length: object.data.len() as u64,
            data: object.data.clone(),
        })
    }

    async fn remove(&self, prefix: &str, key: &str) -> Result<(), StoreError> {
        let mut prefixes = self.prefixes.write().expect("store lock poisoned");
        let container = prefixes
            .get_mut(prefix)
            .ok_or_else(|| StoreError::not_found(prefix))?;
        container
            .remove(key)
            .ok_or_else(|| StoreError::not_found(format!("{prefix}/{key}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn create_then_update_requires_matching_rev() {
        let store = MemoryDocumentStore::new();
        store.create_namespace("apps").await.unwrap();

        let rev = store
            .put("apps", "notes", None, json!({"slug": "notes"}))
            .await
            .unwrap();

        // Create over an existing id conflicts.
        let err = store
            .put("apps", "notes", None, json!({"slug": "notes"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // Stale revision conflicts.
        let err = store
            .put("apps", "notes", Some("0-deadbeef"), json!({"slug": "notes"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // Fresh revision succeeds and bumps the generation.
        let rev2 = store
            .put("apps", "notes", Some(&rev), json!({"slug": "notes", "x": 1}))
            .await
            .unwrap();
        assert_ne!(rev, rev2);
    }

    #[tokio::test]
    async fn query_filters_sorts_and_paginates() {
        let store = MemoryDocumentStore::new();
        store.create_namespace("apps").await.unwrap();
        for (slug, kind) in [("a", "webapp"), ("b", "konnector"), ("c", "webapp")] {
            store
                .put("apps", slug, None, json!({"slug": slug, "type": kind}))
                .await
                .unwrap();
        }

        let rows = store
            .query(
                "apps",
                &Query::selecting("type", "webapp").sorted_by("slug", SortOrder::Desc),
            )
            .await
            .unwrap();
        let slugs: Vec<_> = rows.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(slugs, vec!["c", "a"]);

        let rows = store
            .query("apps", &Query::default().with_skip(1).with_limit(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "b");
    }

    #[tokio::test]
    async fn array_fields_match_on_membership() {
        let store = MemoryDocumentStore::new();
        store.create_namespace("apps").await.unwrap();
        store
            .put("apps", "a", None, json!({"tags": ["sync", "files"]}))
            .await
            .unwrap();

        let rows = store
            .query("apps", &Query::selecting("tags", "sync"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let rows = store
            .query("apps", &Query::selecting("tags", "mail"))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn design_docs_are_hidden_from_queries_but_listed() {
        let store = MemoryDocumentStore::new();
        store.create_namespace("versions").await.unwrap();
        store
            .install_design_doc("versions", "channels-notes", json!({"views": {}}))
            .await
            .unwrap();
        // Unchanged body is a no-op; changed body bumps the revision.
        store
            .install_design_doc("versions", "channels-notes", json!({"views": {}}))
            .await
            .unwrap();
        store
            .install_design_doc("versions", "channels-notes", json!({"views": {"x": 1}}))
            .await
            .unwrap();

        assert!(store
            .query("versions", &Query::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.all_docs("versions", 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn object_store_round_trip() {
        let store = MemoryObjectStore::new();
        store.create_prefix("main").await.unwrap();
        store
            .put("main", "abc123", "image/svg+xml", Bytes::from_static(b"<svg/>"))
            .await
            .unwrap();

        let blob = store.get("main", "abc123").await.unwrap();
        assert_eq!(blob.content_type, "image/svg+xml");
        assert_eq!(blob.etag, "abc123");
        assert_eq!(blob.content_length, 6);

        store.remove("main", "abc123").await.unwrap();
        assert!(matches!(
            store.get("main", "abc123").await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
