//! Status notifier: per-request status streams built on the store's change feed.
//!
//! A subscriber first gets the current state (the snapshot), then every later
//! committed transition exactly once and in version order. The stream ends
//! after a terminal status. If the subscriber falls behind the broadcast
//! buffer it re-reads the record, so intermediate states may be skipped but
//! the latest one never is.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::enhancement::store::decode_request;
use crate::models::enhancement::{
    EnhancementRequest, EnhancementResult, EnhancementStatus, RequestError,
};
use crate::store::{Collection, DocumentStore, DocumentSubscription, FeedError, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub request_id: Uuid,
    pub status: EnhancementStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EnhancementResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RequestError>,
}

impl From<&EnhancementRequest> for StatusMessage {
    fn from(request: &EnhancementRequest) -> Self {
        Self {
            request_id: request.id,
            status: request.status,
            attempt: request.attempt,
            result: request.result.clone(),
            error: request.last_error.clone(),
        }
    }
}

#[derive(Clone)]
pub struct StatusNotifier {
    docs: Arc<dyn DocumentStore>,
}

impl StatusNotifier {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    pub async fn subscribe(&self, request_id: Uuid) -> Result<StatusSubscription, StoreError> {
        let key = request_id.to_string();
        // Feed before snapshot: a write landing in between is then seen twice
        // (and deduplicated) instead of not at all.
        let feed = self
            .docs
            .subscribe(Collection::EnhancementRequests, &key)
            .await?;
        let snapshot = self
            .docs
            .get(Collection::EnhancementRequests, &key)
            .await?;

        Ok(StatusSubscription {
            docs: Arc::clone(&self.docs),
            request_id,
            feed,
            pending: Some(decode_request(&snapshot)?),
            last_version: 0,
            finished: false,
        })
    }
}

pub struct StatusSubscription {
    docs: Arc<dyn DocumentStore>,
    request_id: Uuid,
    feed: DocumentSubscription,
    pending: Option<EnhancementRequest>,
    last_version: i64,
    finished: bool,
}

impl StatusSubscription {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Next status change, or `None` once the request is terminal or the
    /// feed has shut down.
    pub async fn next(&mut self) -> Option<StatusMessage> {
        if self.finished {
            return None;
        }

        loop {
            let request = match self.pending.take() {
                Some(request) => request,
                None => match self.feed.recv().await {
                    Ok(doc) => match decode_request(&doc) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!("Skipping undecodable version of request {}: {e}", self.request_id);
                            continue;
                        }
                    },
                    Err(FeedError::Lagged { skipped }) => {
                        warn!(
                            "Status stream for request {} lagged by {skipped}; resyncing",
                            self.request_id
                        );
                        match self.resync().await {
                            Some(request) => request,
                            None => return self.finish(),
                        }
                    }
                    Err(FeedError::Closed) => return self.finish(),
                },
            };

            if request.version <= self.last_version {
                continue;
            }
            self.last_version = request.version;
            if request.status.is_terminal() {
                self.finished = true;
            }
            return Some(StatusMessage::from(&request));
        }
    }

    async fn resync(&self) -> Option<EnhancementRequest> {
        let doc = self
            .docs
            .get(Collection::EnhancementRequests, &self.request_id.to_string())
            .await;
        match doc.and_then(|doc| decode_request(&doc)) {
            Ok(request) => Some(request),
            Err(e) => {
                warn!("Could not resync request {}: {e}", self.request_id);
                None
            }
        }
    }

    fn finish(&mut self) -> Option<StatusMessage> {
        self.finished = true;
        None
    }
}
