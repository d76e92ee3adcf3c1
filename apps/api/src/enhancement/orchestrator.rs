//! Drives enhancement requests through their lifecycle.
//!
//! ```text
//! Pending ──► Dispatching ──► Processing ──► Completed
//!                 │  ▲             │
//!                 │  └── retry ◄───┤
//!                 └──────────► Failed ◄┘
//! ```
//!
//! `drive` is the single entry point for progress. It is idempotent: calling it
//! on a terminal request does nothing, and every write is a compare-and-swap
//! against the version that was read. A drive that loses a race abandons its
//! work silently; whoever won has already published the newer state.
//!
//! Attempts are counted when a dispatch starts (`Pending → Dispatching` takes
//! attempt 1, each retry takes the next), so `attempt` always names the
//! dispatch in flight.
//!
//! Every transition that leaves a request active also arms its next drive: the
//! retry delay after a failure, the processing timeout after an acknowledgement.
//! When that drive cannot be scheduled the request is failed instead.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::{parse_callback, DispatchClient, DispatchEnvelope, DispatchFailure, DispatchOutcome};
use crate::enhancement::notifier::{StatusNotifier, StatusSubscription};
use crate::enhancement::retry::{RetryController, RetryDecision};
use crate::enhancement::scheduler::{DriveReceiver, DriveScheduler};
use crate::enhancement::store::RequestStore;
use crate::errors::AppError;
use crate::guard::{authorize, require_owner, Access};
use crate::models::enhancement::{
    EnhancementRequest, EnhancementStatus, FailureCategory, RequestError, TransitionError,
};
use crate::sources::{SourceError, SourceStore};
use crate::store::StoreError;

/// How many times a provider callback re-reads the request after losing a
/// version race before giving up with a conflict.
const CALLBACK_TRANSITION_TRIES: usize = 3;

/// What a single `drive` (or callback) did.
#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    /// The request was already `Completed` or `Failed`.
    AlreadyFinal,
    /// `Processing` and still within the callback window.
    AwaitingCallback,
    /// Another writer changed the request first; nothing was written.
    Superseded,
    Completed,
    Acknowledged,
    RetryScheduled { attempt: u32, delay: Duration },
    Failed { category: FailureCategory },
}

impl DriveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyFinal => "already_final",
            Self::AwaitingCallback => "awaiting_callback",
            Self::Superseded => "superseded",
            Self::Completed => "completed",
            Self::Acknowledged => "acknowledged",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::Failed { .. } => "failed",
        }
    }
}

pub struct Orchestrator {
    requests: RequestStore,
    sources: SourceStore,
    dispatcher: DispatchClient,
    retry: RetryController,
    scheduler: Arc<dyn DriveScheduler>,
    notifier: StatusNotifier,
    processing_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        requests: RequestStore,
        sources: SourceStore,
        dispatcher: DispatchClient,
        retry: RetryController,
        scheduler: Arc<dyn DriveScheduler>,
        processing_timeout: Duration,
    ) -> Self {
        let notifier = StatusNotifier::new(requests.documents());
        Self {
            requests,
            sources,
            dispatcher,
            retry,
            scheduler,
            notifier,
            processing_timeout,
        }
    }

    // ── Client-facing operations ────────────────────────────────────────────

    /// Creates a `Pending` request and schedules its first drive immediately.
    ///
    /// The caller must own both the CV and the job description. At most one
    /// non-terminal request may exist per (owner, CV, job).
    pub async fn create(
        &self,
        caller: Uuid,
        cv_ref: Uuid,
        job_ref: Uuid,
    ) -> Result<EnhancementRequest, AppError> {
        require_owner(caller, self.sources.cv_owner(cv_ref).await?)?;
        require_owner(caller, self.sources.job_owner(job_ref).await?)?;

        let request = self.requests.create(caller, cv_ref, job_ref).await?;

        // A request left Pending here is still recoverable through retrigger.
        if let Err(e) = self.scheduler.schedule(request.id, Duration::ZERO).await {
            warn!("Could not schedule first drive for request {}: {e}", request.id);
        }
        Ok(request)
    }

    pub async fn get(&self, caller: Uuid, id: Uuid) -> Result<EnhancementRequest, AppError> {
        let request = self.requests.get(id).await?;
        require_owner(caller, Some(request.owner_id))?;
        Ok(request)
    }

    /// Schedules an immediate drive for a request that is not yet terminal.
    /// Terminal requests are returned unchanged.
    pub async fn retrigger(&self, caller: Uuid, id: Uuid) -> Result<EnhancementRequest, AppError> {
        let request = self.get(caller, id).await?;
        if request.is_active() {
            self.scheduler.schedule(id, Duration::ZERO).await?;
            info!("Retriggered request {id} ({})", request.status);
        }
        Ok(request)
    }

    pub async fn subscribe(&self, caller: Uuid, id: Uuid) -> Result<StatusSubscription, AppError> {
        self.get(caller, id).await?;
        Ok(self.notifier.subscribe(id).await?)
    }

    // ── Drive ────────────────────────────────────────────────────────────────

    /// Advances one request by at most one dispatch.
    pub async fn drive(&self, id: Uuid) -> Result<DriveOutcome, AppError> {
        let loaded = self.requests.get(id).await?;

        let current = match loaded.status {
            EnhancementStatus::Completed | EnhancementStatus::Failed => {
                debug!("Request {id} is already {}; nothing to drive", loaded.status);
                return Ok(DriveOutcome::AlreadyFinal);
            }
            EnhancementStatus::Processing => {
                if let Some(remaining) = self.processing_remaining(&loaded) {
                    // A timer that fired early (clock skew between instances) re-arms.
                    if let Err(e) = self.scheduler.schedule(id, remaining).await {
                        warn!("Could not re-arm processing timeout of request {id}: {e}");
                    }
                    return Ok(DriveOutcome::AwaitingCallback);
                }
                let failure = DispatchFailure::timeout(format!(
                    "provider did not report back within {}s",
                    self.processing_timeout.as_secs()
                ));
                return Ok(self
                    .settle_failure(&loaded, failure)
                    .await?
                    .unwrap_or(DriveOutcome::Superseded));
            }
            EnhancementStatus::Pending => {
                let max_attempts = self.retry.max_attempts();
                match self
                    .transition(&loaded, move |r| r.begin_dispatch(max_attempts))
                    .await?
                {
                    Some(claimed) => claimed,
                    None => return Ok(DriveOutcome::Superseded),
                }
            }
            EnhancementStatus::Dispatching => loaded,
        };

        let outcome = match self.build_envelope(&current).await {
            Ok(envelope) => self.dispatcher.dispatch(&envelope).await,
            Err(failure) => Err(failure),
        };

        let settled = match outcome {
            Ok(DispatchOutcome::Completed(result)) => self
                .transition(&current, move |r| r.complete(result))
                .await?
                .map(|_| DriveOutcome::Completed),
            Ok(DispatchOutcome::Accepted) => {
                match self.transition(&current, |r| r.acknowledge()).await? {
                    Some(processing) => Some(
                        self.schedule_follow_up(&processing, self.processing_timeout)
                            .await?
                            .unwrap_or(DriveOutcome::Acknowledged),
                    ),
                    None => None,
                }
            }
            Err(failure) => self.settle_failure(&current, failure).await?,
        };
        Ok(settled.unwrap_or(DriveOutcome::Superseded))
    }

    /// Consumes the drive queue, running each drive on its own task.
    pub async fn run_worker(self: Arc<Self>, mut queue: DriveReceiver) {
        info!(
            "Drive worker started ({} provider, max {} attempts)",
            self.dispatcher.provider_name(),
            self.retry.max_attempts()
        );
        while let Some(id) = queue.recv().await {
            let orchestrator = Arc::clone(&self);
            tokio::spawn(async move {
                match orchestrator.drive(id).await {
                    Ok(outcome) => debug!("Drive of request {id}: {outcome:?}"),
                    Err(e) => error!("Drive of request {id} failed: {e}"),
                }
            });
        }
        info!("Drive queue closed; worker stopping");
    }

    // ── Provider callback ────────────────────────────────────────────────────

    /// Applies an asynchronous provider answer. The shared secret has already
    /// been checked by the caller.
    ///
    /// A callback for a terminal request is a no-op. A callback naming an
    /// `attempt` other than the current one is a late answer and is ignored,
    /// as is one without an `attempt` once the request has been retried.
    pub async fn apply_callback(&self, id: Uuid, body: Value) -> Result<DriveOutcome, AppError> {
        let reported_attempt = body.get("attempt").and_then(Value::as_u64);
        let parsed = parse_callback(body);

        for _ in 0..CALLBACK_TRANSITION_TRIES {
            let current = self.requests.get(id).await?;
            match current.status {
                EnhancementStatus::Completed | EnhancementStatus::Failed => {
                    info!("Ignoring callback for request {id}: already {}", current.status);
                    return Ok(DriveOutcome::AlreadyFinal);
                }
                EnhancementStatus::Pending => {
                    return Err(AppError::Conflict(format!(
                        "Request {id} has not been dispatched yet"
                    )));
                }
                EnhancementStatus::Dispatching | EnhancementStatus::Processing => {}
            }

            match reported_attempt {
                Some(reported) if reported != u64::from(current.attempt) => {
                    info!(
                        "Ignoring callback for attempt {reported} of request {id}; attempt {} is current",
                        current.attempt
                    );
                    return Ok(DriveOutcome::Superseded);
                }
                None if current.attempt > 1 => {
                    info!(
                        "Ignoring callback without an attempt for request {id}; attempt {} is current",
                        current.attempt
                    );
                    return Ok(DriveOutcome::Superseded);
                }
                _ => {}
            }

            let settled = match parsed.clone() {
                Ok(result) => self
                    .transition(&current, move |r| r.complete(result))
                    .await?
                    .map(|_| DriveOutcome::Completed),
                Err(failure) => self.settle_failure(&current, failure).await?,
            };
            if let Some(outcome) = settled {
                return Ok(outcome);
            }
        }

        Err(AppError::Conflict(format!(
            "Request {id} is being updated concurrently; retry the callback"
        )))
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Time left in the callback window; `None` once it has closed.
    fn processing_remaining(&self, request: &EnhancementRequest) -> Option<Duration> {
        let age = (chrono::Utc::now() - request.updated_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.processing_timeout
            .checked_sub(age)
            .filter(|remaining| !remaining.is_zero())
    }

    /// Arms the next drive of a request that `updated` left active. `Some`
    /// carries the outcome that replaces the caller's when scheduling failed
    /// and the request was failed in its place.
    async fn schedule_follow_up(
        &self,
        updated: &EnhancementRequest,
        delay: Duration,
    ) -> Result<Option<DriveOutcome>, AppError> {
        let Err(e) = self.scheduler.schedule(updated.id, delay).await else {
            return Ok(None);
        };
        error!(
            "Could not schedule the next drive of request {}: {e}",
            updated.id
        );
        let category = FailureCategory::ProviderError;
        let error = RequestError::new(category, format!("next drive could not be scheduled: {e}"));
        let failed = self.transition(updated, move |r| r.fail(error)).await?;
        Ok(Some(failed.map_or(DriveOutcome::Superseded, |_| {
            DriveOutcome::Failed { category }
        })))
    }

    /// Compare-and-swap from `current`. `None` means another writer got there first.
    async fn transition<F>(
        &self,
        current: &EnhancementRequest,
        mutator: F,
    ) -> Result<Option<EnhancementRequest>, AppError>
    where
        F: FnOnce(&mut EnhancementRequest) -> Result<(), TransitionError> + Send,
    {
        match self
            .requests
            .compare_and_transition(current.id, current.version, mutator)
            .await
        {
            Ok(updated) => {
                info!(
                    "Request {} is now {} (attempt {})",
                    updated.id, updated.status, updated.attempt
                );
                Ok(Some(updated))
            }
            Err(e) if e.is_version_conflict() => {
                debug!(
                    "Request {} moved past v{}; abandoning this step",
                    current.id, current.version
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Records a failed attempt: retry with backoff or give up, per the retry policy.
    async fn settle_failure(
        &self,
        current: &EnhancementRequest,
        failure: DispatchFailure,
    ) -> Result<Option<DriveOutcome>, AppError> {
        let category = failure.category;
        match self.retry.next_action(current.attempt, category) {
            RetryDecision::Retry(delay) => {
                warn!(
                    "Attempt {} of request {} failed ({failure}); retrying in {}ms",
                    current.attempt,
                    current.id,
                    delay.as_millis()
                );
                let max_attempts = self.retry.max_attempts();
                let error = failure.into_request_error();
                let Some(updated) = self
                    .transition(current, move |r| r.schedule_retry(error, max_attempts))
                    .await?
                else {
                    return Ok(None);
                };
                if let Some(replaced) = self.schedule_follow_up(&updated, delay).await? {
                    return Ok(Some(replaced));
                }
                Ok(Some(DriveOutcome::RetryScheduled {
                    attempt: updated.attempt,
                    delay,
                }))
            }
            RetryDecision::GiveUp => {
                error!(
                    "Request {} failed after {} attempt(s): {failure}",
                    current.id, current.attempt
                );
                let error = failure.into_request_error();
                Ok(self
                    .transition(current, move |r| r.fail(error))
                    .await?
                    .map(|_| DriveOutcome::Failed { category }))
            }
        }
    }

    async fn build_envelope(
        &self,
        request: &EnhancementRequest,
    ) -> Result<DispatchEnvelope, DispatchFailure> {
        let cv = self
            .sources
            .get_cv(request.cv_ref)
            .await
            .map_err(|e| source_failure(SourceError::from(e)))?;
        let job = self
            .sources
            .get_job_description(request.job_ref)
            .await
            .map_err(|e| source_failure(SourceError::from(e)))?;

        if authorize(request.owner_id, Some(cv.owner_id)) == Access::Deny
            || authorize(request.owner_id, Some(job.owner_id)) == Access::Deny
        {
            return Err(DispatchFailure::validation(
                "CV or job description no longer belongs to the requester",
            ));
        }

        let cv_content = self
            .sources
            .load_cv_text(&cv)
            .await
            .map_err(source_failure)?;

        let job_description = if job.title.is_empty() {
            job.description
        } else {
            format!("{}\n\n{}", job.title, job.description)
        };

        Ok(DispatchEnvelope {
            request_id: request.id,
            owner_id: request.owner_id,
            attempt: request.attempt,
            cv_content,
            job_description,
        })
    }
}

/// Missing or malformed inputs are `Validation`; storage errors stay retryable.
fn source_failure(e: SourceError) -> DispatchFailure {
    match e {
        SourceError::Store(StoreError::NotFound { collection, id }) => {
            DispatchFailure::validation(format!("{} {id} no longer exists", collection.as_str()))
        }
        SourceError::Store(malformed @ (StoreError::Corrupt { .. } | StoreError::Serialization(_))) => {
            DispatchFailure::validation(format!("stored input is malformed: {malformed}"))
        }
        SourceError::Blob(crate::blob::BlobError::NotFound(path)) => {
            DispatchFailure::validation(format!("CV file {path} is missing"))
        }
        SourceError::Unreadable(msg) => DispatchFailure::validation(msg),
        other => DispatchFailure::provider(format!("could not load inputs: {other}")),
    }
}
