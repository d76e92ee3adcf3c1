use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An uploaded CV. The bytes live in the blob store under `blob_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub file_name: String,
    pub content_type: Option<String>,
    pub blob_path: String,
    pub created_at: DateTime<Utc>,
}

impl CvRecord {
    pub fn is_pdf(&self) -> bool {
        self.content_type.as_deref() == Some("application/pdf")
            || self.file_name.to_ascii_lowercase().ends_with(".pdf")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptionRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}
