use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::dispatch::webhook::{verify_secret, SECRET_HEADER};
use crate::enhancement::notifier::StatusSubscription;
use crate::enhancement::scheduler::SchedulerError;
use crate::enhancement::store::RequestStoreError;
use crate::errors::AppError;
use crate::models::enhancement::EnhancementRequest;
use crate::routes::caller::Caller;
use crate::state::AppState;

impl From<RequestStoreError> for AppError {
    fn from(e: RequestStoreError) -> Self {
        match e {
            RequestStoreError::ActiveRequestExists => AppError::Conflict(e.to_string()),
            RequestStoreError::Store(e) => e.into(),
            RequestStoreError::Transition(e) => AppError::Conflict(e.to_string()),
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(e: SchedulerError) -> Self {
        AppError::Internal(anyhow::Error::new(e).context("Failed to schedule drive"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnhancementRequest {
    pub cv_id: Uuid,
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub request_id: Uuid,
    pub outcome: &'static str,
}

/// POST /api/v1/enhancements
///
/// Returns 202: the request is stored `Pending` and its first dispatch is
/// already scheduled.
pub async fn handle_create(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<CreateEnhancementRequest>,
) -> Result<(StatusCode, Json<EnhancementRequest>), AppError> {
    let request = state
        .orchestrator
        .create(caller, req.cv_id, req.job_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

/// GET /api/v1/enhancements/:id
pub async fn handle_get(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<EnhancementRequest>, AppError> {
    Ok(Json(state.orchestrator.get(caller, id).await?))
}

/// POST /api/v1/enhancements/:id/retrigger
pub async fn handle_retrigger(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<EnhancementRequest>), AppError> {
    let request = state.orchestrator.retrigger(caller, id).await?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

/// GET /api/v1/enhancements/:id/events
///
/// Server-sent `status` events: the current state first, then each change.
/// The stream closes after `completed` or `failed`.
pub async fn handle_events(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let subscription = state.orchestrator.subscribe(caller, id).await?;
    Ok(Sse::new(status_events(subscription)).keep_alive(KeepAlive::default()))
}

fn status_events(subscription: StatusSubscription) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(subscription, |mut sub| async move {
        let message = sub.next().await?;
        let event = match Event::default().event("status").json_data(&message) {
            Ok(event) => event,
            Err(e) => {
                warn!("Could not encode status for request {}: {e}", sub.request_id());
                Event::default().event("error").data("status unavailable")
            }
        };
        Some((Ok::<_, Infallible>(event), sub))
    })
}

/// POST /api/v1/enhancements/:id/callback
///
/// Asynchronous provider answer. The shared secret is checked before the body
/// is parsed or any record is read.
pub async fn handle_callback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CallbackResponse>, AppError> {
    let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if !verify_secret(presented, &state.provider_secret) {
        warn!("Rejected callback for request {id}: bad or missing secret");
        return Err(AppError::Unauthorized);
    }

    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Callback body is not JSON: {e}")))?;
    let outcome = state.orchestrator.apply_callback(id, body).await?;
    Ok(Json(CallbackResponse {
        request_id: id,
        outcome: outcome.as_str(),
    }))
}
