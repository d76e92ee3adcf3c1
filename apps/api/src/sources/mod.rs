//! CVs and job descriptions, the inputs an enhancement request points at.
//!
//! Records live in the document store (with their `ownerId`), CV bytes in the
//! blob store under `cvs/{owner}/{cv}/{file}`.

pub mod handlers;

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::blob::{BlobError, BlobStore};
use crate::models::source::{CvRecord, JobDescriptionRecord};
use crate::store::{owner_of, Collection, DocumentStore, StoreError};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("CV text could not be extracted: {0}")]
    Unreadable(String),
}

#[derive(Clone)]
pub struct SourceStore {
    docs: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
}

impl SourceStore {
    pub fn new(docs: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { docs, blobs }
    }

    /// Stores the CV bytes first, then the record pointing at them.
    pub async fn create_cv(
        &self,
        owner_id: Uuid,
        file_name: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> Result<CvRecord, SourceError> {
        let id = Uuid::new_v4();
        let blob_path = format!("cvs/{owner_id}/{id}/{}", sanitize_file_name(file_name));
        self.blobs.put(&blob_path, data, content_type).await?;

        let record = CvRecord {
            id,
            owner_id,
            file_name: file_name.to_string(),
            content_type: content_type.map(str::to_string),
            blob_path,
            created_at: Utc::now(),
        };
        self.docs
            .insert(
                Collection::Cvs,
                &id.to_string(),
                serde_json::to_value(&record).map_err(StoreError::from)?,
            )
            .await?;

        info!("Stored CV {id} for user {owner_id}");
        Ok(record)
    }

    pub async fn create_job_description(
        &self,
        owner_id: Uuid,
        title: &str,
        description: &str,
    ) -> Result<JobDescriptionRecord, SourceError> {
        let record = JobDescriptionRecord {
            id: Uuid::new_v4(),
            owner_id,
            title: title.trim().to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
        };
        self.docs
            .insert(
                Collection::JobDescriptions,
                &record.id.to_string(),
                serde_json::to_value(&record).map_err(StoreError::from)?,
            )
            .await?;

        info!("Stored job description {} for user {owner_id}", record.id);
        Ok(record)
    }

    /// Record-level owner of a CV. `Ok(None)` means the record exists but its
    /// ownership cannot be read, which callers must treat as a denial.
    pub async fn cv_owner(&self, id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let doc = self.docs.get(Collection::Cvs, &id.to_string()).await?;
        Ok(owner_of(&doc))
    }

    pub async fn job_owner(&self, id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let doc = self
            .docs
            .get(Collection::JobDescriptions, &id.to_string())
            .await?;
        Ok(owner_of(&doc))
    }

    pub async fn get_cv(&self, id: Uuid) -> Result<CvRecord, StoreError> {
        self.docs
            .get(Collection::Cvs, &id.to_string())
            .await?
            .decode()
    }

    pub async fn get_job_description(&self, id: Uuid) -> Result<JobDescriptionRecord, StoreError> {
        self.docs
            .get(Collection::JobDescriptions, &id.to_string())
            .await?
            .decode()
    }

    /// Reads the CV bytes and turns them into plain text for the provider.
    /// Extraction runs on the blocking pool.
    pub async fn load_cv_text(&self, cv: &CvRecord) -> Result<String, SourceError> {
        let data = self.blobs.get(&cv.blob_path).await?;
        let is_pdf = cv.is_pdf();
        off_executor(move || extract_cv_text(&data, is_pdf)).await
    }
}

/// Runs CPU-bound parsing via `spawn_blocking`. A panic in the parser surfaces
/// as `Unreadable` instead of taking the calling task down with it.
async fn off_executor<T, F>(work: F) -> Result<T, SourceError>
where
    F: FnOnce() -> Result<T, SourceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SourceError::Unreadable(format!("CV text extraction aborted: {e}")))?
}

pub fn extract_cv_text(data: &[u8], is_pdf: bool) -> Result<String, SourceError> {
    let text = if is_pdf {
        pdf_extract::extract_text_from_mem(data)
            .map_err(|e| SourceError::Unreadable(e.to_string()))?
    } else {
        String::from_utf8_lossy(data).into_owned()
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(SourceError::Unreadable("document contains no text".to_string()));
    }
    Ok(text.to_string())
}

/// Keeps blob keys predictable: anything outside `[A-Za-z0-9._-]` becomes `_`.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "cv".to_string()
    } else {
        cleaned.to_string()
    }
}
