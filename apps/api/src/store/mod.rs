//! Durable JSON records with per-document optimistic versioning.
//!
//! Every record carries a version that starts at 1 on insert and increases by
//! exactly one on every committed write. Writers name the version they read;
//! a stale writer gets `VersionConflict` instead of silently overwriting.
//!
//! Every committed write is also pushed to the change feed, which is what the
//! status notifier listens to. A write is never announced before it commits.

#[cfg(test)]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Buffered change notifications per process. Subscribers that fall further
/// behind than this resynchronise from the stored record.
pub const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    EnhancementRequests,
    ActiveSlots,
    Cvs,
    JobDescriptions,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnhancementRequests => "enhancement_requests",
            Self::ActiveSlots => "active_slots",
            Self::Cvs => "cvs",
            Self::JobDescriptions => "job_descriptions",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "enhancement_requests" => Some(Self::EnhancementRequests),
            "active_slots" => Some(Self::ActiveSlots),
            "cvs" => Some(Self::Cvs),
            "job_descriptions" => Some(Self::JobDescriptions),
            _ => None,
        }
    }
}

/// One committed version of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub collection: Collection,
    pub id: String,
    pub version: i64,
    pub body: Value,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.body.clone()).map_err(|e| StoreError::Corrupt {
            collection: self.collection,
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection:?}/{id} not found")]
    NotFound { collection: Collection, id: String },

    #[error("{collection:?}/{id} already exists")]
    Conflict { collection: Collection, id: String },

    #[error("{collection:?}/{id} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        collection: Collection,
        id: String,
        expected: i64,
        actual: i64,
    },

    #[error("{collection:?}/{id} holds an unreadable document: {reason}")]
    Corrupt {
        collection: Collection,
        id: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Storage contract used by every typed adapter in the service.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a new record at version 1. Fails with `Conflict` if the id is taken.
    async fn insert(
        &self,
        collection: Collection,
        id: &str,
        body: Value,
    ) -> Result<Document, StoreError>;

    /// Replaces a record only if its stored version equals `expected_version`.
    async fn conditional_update(
        &self,
        collection: Collection,
        id: &str,
        expected_version: i64,
        body: Value,
    ) -> Result<Document, StoreError>;

    async fn get(&self, collection: Collection, id: &str) -> Result<Document, StoreError>;

    /// Opens a change feed for one record. Only writes committed after this
    /// call returns are delivered.
    async fn subscribe(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<DocumentSubscription, StoreError>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum FeedError {
    /// The subscriber fell behind and missed `skipped` notifications.
    Lagged { skipped: u64 },
    /// The feed has shut down.
    Closed,
}

/// Change feed for a single record, filtered out of the process-wide broadcast.
pub struct DocumentSubscription {
    collection: Collection,
    id: String,
    rx: broadcast::Receiver<Document>,
}

impl DocumentSubscription {
    pub fn new(collection: Collection, id: &str, rx: broadcast::Receiver<Document>) -> Self {
        Self {
            collection,
            id: id.to_string(),
            rx,
        }
    }

    /// Waits for the next committed version of the watched record.
    pub async fn recv(&mut self) -> Result<Document, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(doc) if doc.collection == self.collection && doc.id == self.id => {
                    return Ok(doc)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(FeedError::Lagged { skipped })
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }
}

/// Reads the record-level `ownerId` field without decoding the whole record.
/// Missing or malformed ownership yields `None`.
pub fn owner_of(doc: &Document) -> Option<uuid::Uuid> {
    doc.body
        .get("ownerId")
        .and_then(Value::as_str)
        .and_then(|raw| uuid::Uuid::parse_str(raw).ok())
}
