//! PostgreSQL document store.
//!
//! `documents` holds the current version of every record; `document_versions`
//! is append-only and keeps every committed version. Each write inserts its
//! version row and issues `pg_notify` in the same transaction, so LISTEN
//! subscribers only ever hear about committed versions and can read exactly
//! the version that was announced.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::{FromRow, PgConnection, PgPool};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Collection, Document, DocumentStore, DocumentSubscription, StoreError, CHANGE_FEED_CAPACITY,
};

const CHANGE_CHANNEL: &str = "document_changes";
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, FromRow)]
struct DocumentRow {
    version: i64,
    body: Value,
    updated_at: DateTime<Utc>,
}

impl DocumentRow {
    fn into_document(self, collection: Collection, id: &str) -> Document {
        Document {
            collection,
            id: id.to_string(),
            version: self.version,
            body: self.body,
            updated_at: self.updated_at,
        }
    }
}

/// Payload carried by `pg_notify`. Bodies are read back from `document_versions`
/// because NOTIFY payloads are capped at 8000 bytes.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ChangeNotice {
    collection: String,
    id: String,
    version: i64,
}

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    changes: broadcast::Sender<Document>,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { pool, changes }
    }

    /// Starts the background LISTEN loop that feeds every subscription in this
    /// process. Subscriptions receive nothing until this has been called.
    pub async fn start_change_feed(&self) -> anyhow::Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        info!("Listening for document changes on '{CHANGE_CHANNEL}'");

        let pool = self.pool.clone();
        let changes = self.changes.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        if let Err(e) = forward_change(&pool, &changes, notification.payload()).await
                        {
                            warn!("Dropped change notification: {e}");
                        }
                    }
                    Err(e) => {
                        // PgListener reconnects on the next recv.
                        warn!("Change feed listener error: {e}");
                        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                    }
                }
            }
        }))
    }
}

async fn forward_change(
    pool: &PgPool,
    changes: &broadcast::Sender<Document>,
    payload: &str,
) -> Result<(), StoreError> {
    let notice: ChangeNotice = serde_json::from_str(payload)?;
    let Some(collection) = Collection::parse(&notice.collection) else {
        debug!("Ignoring change for unknown collection '{}'", notice.collection);
        return Ok(());
    };

    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT version, body, committed_at AS updated_at
        FROM document_versions
        WHERE collection = $1 AND id = $2 AND version = $3
        "#,
    )
    .bind(collection.as_str())
    .bind(&notice.id)
    .bind(notice.version)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound {
        collection,
        id: notice.id.clone(),
    })?;

    // No subscribers is fine.
    let _ = changes.send(row.into_document(collection, &notice.id));
    Ok(())
}

/// Appends the committed version and announces it. Must run inside the
/// writing transaction.
async fn record_commit(conn: &mut PgConnection, doc: &Document) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO document_versions (collection, id, version, body, committed_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(doc.collection.as_str())
    .bind(&doc.id)
    .bind(doc.version)
    .bind(&doc.body)
    .bind(doc.updated_at)
    .execute(&mut *conn)
    .await?;

    let payload = serde_json::to_string(&ChangeNotice {
        collection: doc.collection.as_str().to_string(),
        id: doc.id.clone(),
        version: doc.version,
    })?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANGE_CHANNEL)
        .bind(payload)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert(
        &self,
        collection: Collection,
        id: &str,
        body: Value,
    ) -> Result<Document, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            INSERT INTO documents (collection, id, version, body)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (collection, id) DO NOTHING
            RETURNING version, body, updated_at
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(&body)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::Conflict {
                collection,
                id: id.to_string(),
            });
        };

        let doc = row.into_document(collection, id);
        record_commit(&mut *tx, &doc).await?;
        tx.commit().await?;
        Ok(doc)
    }

    async fn conditional_update(
        &self,
        collection: Collection,
        id: &str,
        expected_version: i64,
        body: Value,
    ) -> Result<Document, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            UPDATE documents
            SET version = version + 1, body = $4, updated_at = NOW()
            WHERE collection = $1 AND id = $2 AND version = $3
            RETURNING version, body, updated_at
            "#,
        )
        .bind(collection.as_str())
        .bind(id)
        .bind(expected_version)
        .bind(&body)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let actual: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM documents WHERE collection = $1 AND id = $2",
            )
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            return Err(match actual {
                None => StoreError::NotFound {
                    collection,
                    id: id.to_string(),
                },
                Some(actual) => StoreError::VersionConflict {
                    collection,
                    id: id.to_string(),
                    expected: expected_version,
                    actual,
                },
            });
        };

        let doc = row.into_document(collection, id);
        record_commit(&mut *tx, &doc).await?;
        tx.commit().await?;
        Ok(doc)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Document, StoreError> {
        sqlx::query_as::<_, DocumentRow>(
            "SELECT version, body, updated_at FROM documents WHERE collection = $1 AND id = $2",
        )
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.into_document(collection, id))
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

    #[test]
    fn test_change_notice_payload_shape() {
        let notice = ChangeNotice {
            collection: Collection::EnhancementRequests.as_str().to_string(),
            id: "abc".to_string(),
            version: 7,
        };
        let payload = serde_json::to_string(&notice).unwrap();
        assert_eq!(
            payload,
            r#"{"collection":"enhancement_requests","id":"abc","version":7}"#
        );
        let back: ChangeNotice = serde_json::from_str(&payload).unwrap();
        assert_eq!(back, notice);
    }
}
