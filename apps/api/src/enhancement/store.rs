//! Typed CRUD and versioned transitions for enhancement requests on top of
//! the document store.
//!
//! The one-active-request-per-(owner, cv, job) rule is enforced with an
//! `active_slots` document per triple that names the request holding it.
//! Claiming a slot is an insert (first request ever) or a conditional update
//! (replacing a finished holder), so two simultaneous creators can never both
//! win: the second write fails on the store's versioning instead of
//! overwriting the first.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::enhancement::{EnhancementRequest, TransitionError};
use crate::store::{Collection, Document, DocumentStore, StoreError};

/// A slot whose holder was never written (creator crashed between the two
/// writes) is considered abandoned after this long.
const ORPHANED_SLOT_GRACE_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum RequestStoreError {
    #[error("an active enhancement request already exists for this CV and job")]
    ActiveRequestExists,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl RequestStoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_version_conflict())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveSlot {
    request_id: Option<Uuid>,
}

fn slot_key(owner_id: Uuid, cv_ref: Uuid, job_ref: Uuid) -> String {
    format!("{owner_id}:{cv_ref}:{job_ref}")
}

pub(crate) fn decode_request(doc: &Document) -> Result<EnhancementRequest, StoreError> {
    let mut request: EnhancementRequest = doc.decode()?;
    request.version = doc.version;
    Ok(request)
}

/// `updatedAt` must move forward on every transition, even within one clock tick.
fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[derive(Clone)]
pub struct RequestStore {
    docs: Arc<dyn DocumentStore>,
}

impl RequestStore {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    pub fn documents(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.docs)
    }

    /// Creates a `Pending` request, failing with `ActiveRequestExists` if the
    /// triple already has a request that is not `Completed` or `Failed`.
    pub async fn create(
        &self,
        owner_id: Uuid,
        cv_ref: Uuid,
        job_ref: Uuid,
    ) -> Result<EnhancementRequest, RequestStoreError> {
        let mut request = EnhancementRequest::new(owner_id, cv_ref, job_ref, Utc::now());
        let key = slot_key(owner_id, cv_ref, job_ref);
        let claimed = self.claim_slot(&key, request.id).await?;

        request.version = 1;
        let body = serde_json::to_value(&request).map_err(StoreError::from)?;
        let doc = match self
            .docs
            .insert(Collection::EnhancementRequests, &request.id.to_string(), body)
            .await
        {
            Ok(doc) => doc,
            Err(e) => {
                self.release_slot(&key, &claimed).await;
                return Err(e.into());
            }
        };

        info!(
            "Created enhancement request {} for user {owner_id} (cv {cv_ref}, job {job_ref})",
            request.id
        );
        Ok(decode_request(&doc)?)
    }

    async fn claim_slot(&self, key: &str, request_id: Uuid) -> Result<Document, RequestStoreError> {
        let claim = serde_json::to_value(ActiveSlot {
            request_id: Some(request_id),
        })
        .map_err(StoreError::from)?;

        let existing = match self.docs.get(Collection::ActiveSlots, key).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound { .. }) => {
                return self
                    .docs
                    .insert(Collection::ActiveSlots, key, claim)
                    .await
                    .map_err(|e| match e {
                        StoreError::Conflict { .. } => RequestStoreError::ActiveRequestExists,
                        other => other.into(),
                    });
            }
            Err(e) => return Err(e.into()),
        };

        let slot: ActiveSlot = existing.decode()?;
        if let Some(holder) = slot.request_id {
            if self.holder_blocks(holder, &existing).await? {
                return Err(RequestStoreError::ActiveRequestExists);
            }
        }

        self.docs
            .conditional_update(Collection::ActiveSlots, key, existing.version, claim)
            .await
            .map_err(|e| {
                if e.is_version_conflict() {
                    RequestStoreError::ActiveRequestExists
                } else {
                    e.into()
                }
            })
    }

    async fn holder_blocks(&self, holder: Uuid, slot: &Document) -> Result<bool, StoreError> {
        match self.get(holder).await {
            Ok(request) => Ok(request.is_active()),
            Err(StoreError::NotFound { .. }) => {
                let age = Utc::now() - slot.updated_at;
                Ok(age < Duration::seconds(ORPHANED_SLOT_GRACE_SECS))
            }
            Err(e) => Err(e),
        }
    }

    /// Best effort: frees a slot claimed by a create that then failed.
    async fn release_slot(&self, key: &str, claimed: &Document) {
        let body = match serde_json::to_value(ActiveSlot { request_id: None }) {
            Ok(body) => body,
            Err(e) => {
                warn!("Could not release active slot {key}: {e}");
                return;
            }
        };
        if let Err(e) = self
            .docs
            .conditional_update(Collection::ActiveSlots, key, claimed.version, body)
            .await
        {
            warn!("Could not release active slot {key}: {e}");
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<EnhancementRequest, StoreError> {
        let doc = self
            .docs
            .get(Collection::EnhancementRequests, &id.to_string())
            .await?;
        decode_request(&doc)
    }

    /// Applies `mutator` to the stored record and writes it back only if the
    /// stored version is still `expected_version`. A `VersionConflict` means
    /// another writer got there first; re-read before deciding anything else.
    pub async fn compare_and_transition<F>(
        &self,
        id: Uuid,
        expected_version: i64,
        mutator: F,
    ) -> Result<EnhancementRequest, RequestStoreError>
    where
        F: FnOnce(&mut EnhancementRequest) -> Result<(), TransitionError> + Send,
    {
        let key = id.to_string();
        let doc = self
            .docs
            .get(Collection::EnhancementRequests, &key)
            .await?;
        if doc.version != expected_version {
            return Err(StoreError::VersionConflict {
                collection: Collection::EnhancementRequests,
                id: key,
                expected: expected_version,
                actual: doc.version,
            }
            .into());
        }

        let mut request = decode_request(&doc)?;
        let previous_status = request.status;
        mutator(&mut request)?;
        request.updated_at = next_timestamp(request.updated_at);
        request.version = expected_version + 1;

        let body = serde_json::to_value(&request).map_err(StoreError::from)?;
        let written = self
            .docs
            .conditional_update(Collection::EnhancementRequests, &key, expected_version, body)
            .await?;

        debug!(
            "Request {id}: {previous_status} → {} (attempt {}, v{})",
            request.status, request.attempt, written.version
        );
        Ok(decode_request(&written)?)
    }
}
