//! In-memory document store for tests. Single process, no durability.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{
    Collection, Document, DocumentStore, DocumentSubscription, StoreError, CHANGE_FEED_CAPACITY,
};

pub struct InMemoryDocumentStore {
    docs: RwLock<HashMap<(Collection, String), Document>>,
    changes: broadcast::Sender<Document>,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            docs: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Current stored version of a record, if it exists.
    pub fn version_of(&self, collection: Collection, id: &str) -> Option<i64> {
        self.docs
            .read()
            .ok()?
            .get(&(collection, id.to_string()))
            .map(|d| d.version)
    }

    /// Moves a record's `updated_at` into the past without bumping its version.
    pub fn backdate(&self, collection: Collection, id: &str, by: chrono::Duration) {
        if let Some(doc) = self
            .docs
            .write()
            .expect("document store lock poisoned")
            .get_mut(&(collection, id.to_string()))
        {
            doc.updated_at = doc.updated_at - by;
        }
    }

    fn publish(&self, doc: &Document) {
        // No subscribers is fine.
        let _ = self.changes.send(doc.clone());
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(
        &self,
        collection: Collection,
        id: &str,
        body: Value,
    ) -> Result<Document, StoreError> {
        let doc = {
            let mut docs = self.docs.write().expect("document store lock poisoned");
            let key = (collection, id.to_string());
            if docs.contains_key(&key) {
                return Err(StoreError::Conflict {
                    collection,
                    id: id.to_string(),
                });
            }
            let doc = Document {
                collection,
                id: id.to_string(),
                version: 1,
                body,
                updated_at: Utc::now(),
            };
            docs.insert(key, doc.clone());
            doc
        };
        self.publish(&doc);
        Ok(doc)
    }

    async fn conditional_update(
        &self,
        collection: Collection,
        id: &str,
        expected_version: i64,
        body: Value,
    ) -> Result<Document, StoreError> {
        let doc = {
            let mut docs = self.docs.write().expect("document store lock poisoned");
            let current = docs
                .get_mut(&(collection, id.to_string()))
                .ok_or_else(|| StoreError::NotFound {
                    collection,
                    id: id.to_string(),
                })?;
            if current.version != expected_version {
                return Err(StoreError::VersionConflict {
                    collection,
                    id: id.to_string(),
                    expected: expected_version,
                    actual: current.version,
                });
            }
            current.version += 1;
            current.body = body;
            current.updated_at = Utc::now();
            current.clone()
        };
        self.publish(&doc);
        Ok(doc)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Document, StoreError> {
        self.docs
            .read()
            .expect("document store lock poisoned")
            .get(&(collection, id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection,
                id: id.to_string(),
            })
    }

    async fn subscribe(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<DocumentSubscription, StoreError> {
        Ok(DocumentSubscription::new(
            collection,
            id,
            self.changes.subscribe(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_starts_at_version_one_and_rejects_duplicates() {
        let store = InMemoryDocumentStore::new();
        let doc = store
            .insert(Collection::Cvs, "a", json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(doc.version, 1);

        let err = store
            .insert(Collection::Cvs, "a", json!({"n": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.get(Collection::Cvs, "a").await.unwrap().body["n"], 1);
    }

    #[tokio::test]
    async fn test_same_id_in_different_collections_is_independent() {
        let store = InMemoryDocumentStore::new();
        store.insert(Collection::Cvs, "a", json!({})).await.unwrap();
        store
            .insert(Collection::JobDescriptions, "a", json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_conditional_update_requires_matching_version() {
        let store = InMemoryDocumentStore::new();
        store.insert(Collection::Cvs, "a", json!({"n": 1})).await.unwrap();

        let updated = store
            .conditional_update(Collection::Cvs, "a", 1, json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let err = store
            .conditional_update(Collection::Cvs, "a", 1, json!({"n": 3}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert_eq!(store.get(Collection::Cvs, "a").await.unwrap().body["n"], 2);
    }

    #[tokio::test]
    async fn test_missing_documents_are_not_found() {
        let store = InMemoryDocumentStore::new();
        assert!(matches!(
            store.get(Collection::Cvs, "nope").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store
                .conditional_update(Collection::Cvs, "nope", 1, json!({}))
                .await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_subscribers_see_committed_writes_in_order() {
        let store = InMemoryDocumentStore::new();
        store.insert(Collection::Cvs, "a", json!({"n": 1})).await.unwrap();
        let mut sub = store.subscribe(Collection::Cvs, "a").await.unwrap();

        store
            .conditional_update(Collection::Cvs, "a", 1, json!({"n": 2}))
            .await
            .unwrap();
        // Rejected writes are never announced.
        let _ = store
            .conditional_update(Collection::Cvs, "a", 1, json!({"n": 99}))
            .await;
        store
            .conditional_update(Collection::Cvs, "a", 2, json!({"n": 3}))
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().version, 2);
        let third = sub.recv().await.unwrap();
        assert_eq!(third.version, 3);
        assert_eq!(third.body["n"], 3);
    }
}
