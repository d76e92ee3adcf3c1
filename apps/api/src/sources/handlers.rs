//! Axum route handlers for CV uploads and job descriptions.

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::errors::AppError;
use crate::models::source::{CvRecord, JobDescriptionRecord};
use crate::routes::caller::Caller;
use crate::sources::SourceError;
use crate::state::AppState;

impl From<SourceError> for AppError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Store(e) => e.into(),
            SourceError::Blob(e) => e.into(),
            SourceError::Unreadable(msg) => AppError::Validation(msg),
        }
    }
}

/// POST /api/v1/cvs
///
/// Multipart upload; the CV bytes are taken from the `file` field.
pub async fn handle_upload_cv(
    State(state): State<AppState>,
    Caller(caller): Caller,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CvRecord>), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("cv").to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("Failed to read upload: {e}")))?;

        if data.is_empty() {
            return Err(AppError::Validation("Uploaded CV is empty".to_string()));
        }

        let record = state
            .sources
            .create_cv(caller, &file_name, content_type.as_deref(), data)
            .await?;
        return Ok((StatusCode::CREATED, Json(record)));
    }

    Err(AppError::Validation(
        "Multipart field 'file' is required".to_string(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobDescriptionRequest {
    #[serde(default)]
    pub title: String,
    pub description: String,
}

/// POST /api/v1/job-descriptions
pub async fn handle_create_job_description(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<CreateJobDescriptionRequest>,
) -> Result<(StatusCode, Json<JobDescriptionRecord>), AppError> {
    if request.description.trim().is_empty() {
        return Err(AppError::Validation(
            "description cannot be empty".to_string(),
        ));
    }

    let record = state
        .sources
        .create_job_description(caller, &request.title, &request.description)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}
