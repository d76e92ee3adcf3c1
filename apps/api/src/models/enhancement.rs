//! Enhancement request record and the transitions it may go through.
//!
//! Transitions are pure mutations on an in-memory copy. Persisting them (and the
//! version bump that goes with every write) is the request store's job.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Status and failure taxonomy
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementStatus {
    Pending,
    Dispatching,
    Processing,
    Completed,
    Failed,
}

impl EnhancementStatus {
    /// `Completed` and `Failed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatching => "dispatching",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EnhancementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a dispatch attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Validation,
    ProviderError,
    Timeout,
    AuthError,
}

impl FailureCategory {
    /// Caller/input errors never retry; transient provider trouble does.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ProviderError | Self::Timeout)
    }

    /// Lenient parse for categories reported by external providers.
    /// Unknown values are `None`; callers downgrade them to `ProviderError`.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "validation" | "validation_failure" => Some(Self::Validation),
            "provider_error" | "providererror" => Some(Self::ProviderError),
            "timeout" => Some(Self::Timeout),
            "auth_error" | "autherror" | "auth" => Some(Self::AuthError),
            _ => None,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::ProviderError => "provider_error",
            Self::Timeout => "timeout",
            Self::AuthError => "auth_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestError {
    pub category: FailureCategory,
    pub message: String,
}

impl RequestError {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// Validated provider output. Only ever constructed by the dispatch boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancementResult {
    pub enhanced_content: Value,
    pub suggestions: Vec<String>,
    pub match_score: f64,
}

// ────────────────────────────────────────────────────────────────────────────
// Request record
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancementRequest {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub cv_ref: Uuid,
    pub job_ref: Uuid,
    pub status: EnhancementStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EnhancementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RequestError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("request {id} is already {status}")]
    Terminal { id: Uuid, status: EnhancementStatus },

    #[error("request {id} cannot move from {from} to {to}")]
    Illegal {
        id: Uuid,
        from: EnhancementStatus,
        to: EnhancementStatus,
    },

    #[error("request {id} has used all {max_attempts} attempts")]
    AttemptsExhausted { id: Uuid, max_attempts: u32 },
}

impl EnhancementRequest {
    /// A fresh `Pending` record. The store assigns the first version on insert.
    pub fn new(owner_id: Uuid, cv_ref: Uuid, job_ref: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            cv_ref,
            job_ref,
            status: EnhancementStatus::Pending,
            attempt: 0,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    fn ensure_open(&self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    fn ensure_in_flight(&self, to: EnhancementStatus) -> Result<(), TransitionError> {
        self.ensure_open()?;
        match self.status {
            EnhancementStatus::Dispatching | EnhancementStatus::Processing => Ok(()),
            from => Err(TransitionError::Illegal {
                id: self.id,
                from,
                to,
            }),
        }
    }

    /// `Pending → Dispatching`, counting the first attempt.
    pub fn begin_dispatch(&mut self, max_attempts: u32) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if self.status != EnhancementStatus::Pending {
            return Err(TransitionError::Illegal {
                id: self.id,
                from: self.status,
                to: EnhancementStatus::Dispatching,
            });
        }
        if self.attempt >= max_attempts {
            return Err(TransitionError::AttemptsExhausted {
                id: self.id,
                max_attempts,
            });
        }
        self.status = EnhancementStatus::Dispatching;
        self.attempt += 1;
        self.last_error = None;
        Ok(())
    }

    /// `Dispatching → Processing` once the provider has accepted the job.
    pub fn acknowledge(&mut self) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if self.status != EnhancementStatus::Dispatching {
            return Err(TransitionError::Illegal {
                id: self.id,
                from: self.status,
                to: EnhancementStatus::Processing,
            });
        }
        self.status = EnhancementStatus::Processing;
        self.last_error = None;
        Ok(())
    }

    /// Final success. The result is written once and never touched again.
    pub fn complete(&mut self, result: EnhancementResult) -> Result<(), TransitionError> {
        self.ensure_in_flight(EnhancementStatus::Completed)?;
        if self.result.is_some() {
            return Err(TransitionError::Illegal {
                id: self.id,
                from: self.status,
                to: EnhancementStatus::Completed,
            });
        }
        self.status = EnhancementStatus::Completed;
        self.result = Some(result);
        self.last_error = None;
        Ok(())
    }

    /// Back to `Dispatching` for another attempt, keeping the failure that caused it.
    pub fn schedule_retry(
        &mut self,
        error: RequestError,
        max_attempts: u32,
    ) -> Result<(), TransitionError> {
        self.ensure_in_flight(EnhancementStatus::Dispatching)?;
        if self.attempt >= max_attempts {
            return Err(TransitionError::AttemptsExhausted {
                id: self.id,
                max_attempts,
            });
        }
        self.status = EnhancementStatus::Dispatching;
        self.attempt += 1;
        self.last_error = Some(error);
        Ok(())
    }

    pub fn fail(&mut self, error: RequestError) -> Result<(), TransitionError> {
        self.ensure_in_flight(EnhancementStatus::Failed)?;
        self.status = EnhancementStatus::Failed;
        self.last_error = Some(error);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending() -> EnhancementRequest {
        EnhancementRequest::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Utc::now())
    }

    fn sample_result() -> EnhancementResult {
        EnhancementResult {
            enhanced_content: json!({"summary": "x"}),
            suggestions: vec!["add metrics".to_string()],
            match_score: 82.0,
        }
    }

    fn transient(msg: &str) -> RequestError {
        RequestError::new(FailureCategory::ProviderError, msg)
    }

    #[test]
    fn test_new_request_is_pending_with_no_attempts() {
        let req = pending();
        assert_eq!(req.status, EnhancementStatus::Pending);
        assert_eq!(req.attempt, 0);
        assert!(req.is_active());
        assert!(req.result.is_none());
    }

    #[test]
    fn test_happy_path_counts_one_attempt() {
        let mut req = pending();
        req.begin_dispatch(3).unwrap();
        assert_eq!(req.status, EnhancementStatus::Dispatching);
        assert_eq!(req.attempt, 1);

        req.complete(sample_result()).unwrap();
        assert_eq!(req.status, EnhancementStatus::Completed);
        assert_eq!(req.attempt, 1);
        assert_eq!(req.result, Some(sample_result()));
    }

    #[test]
    fn test_acknowledged_request_can_complete() {
        let mut req = pending();
        req.begin_dispatch(3).unwrap();
        req.acknowledge().unwrap();
        assert_eq!(req.status, EnhancementStatus::Processing);
        req.complete(sample_result()).unwrap();
        assert_eq!(req.status, EnhancementStatus::Completed);
    }

    #[test]
    fn test_retry_keeps_error_and_bumps_attempt() {
        let mut req = pending();
        req.begin_dispatch(3).unwrap();
        req.schedule_retry(transient("502"), 3).unwrap();
        assert_eq!(req.status, EnhancementStatus::Dispatching);
        assert_eq!(req.attempt, 2);
        assert_eq!(req.last_error.as_ref().unwrap().message, "502");
    }

    #[test]
    fn test_retry_refused_at_attempt_cap() {
        let mut req = pending();
        req.begin_dispatch(2).unwrap();
        req.schedule_retry(transient("a"), 2).unwrap();
        let err = req.schedule_retry(transient("b"), 2).unwrap_err();
        assert!(matches!(err, TransitionError::AttemptsExhausted { max_attempts: 2, .. }));
        assert_eq!(req.attempt, 2);
    }

    #[test]
    fn test_terminal_requests_reject_every_transition() {
        let mut req = pending();
        req.begin_dispatch(3).unwrap();
        req.fail(RequestError::new(FailureCategory::AuthError, "bad key"))
            .unwrap();

        assert!(matches!(
            req.complete(sample_result()),
            Err(TransitionError::Terminal { .. })
        ));
        assert!(matches!(
            req.schedule_retry(transient("x"), 3),
            Err(TransitionError::Terminal { .. })
        ));
        assert!(matches!(req.acknowledge(), Err(TransitionError::Terminal { .. })));
        assert_eq!(req.status, EnhancementStatus::Failed);
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut req = pending();
        let err = req.complete(sample_result()).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Illegal {
                from: EnhancementStatus::Pending,
                to: EnhancementStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn test_begin_dispatch_only_from_pending() {
        let mut req = pending();
        req.begin_dispatch(3).unwrap();
        assert!(req.begin_dispatch(3).is_err());
        assert_eq!(req.attempt, 1);
    }

    #[test]
    fn test_failure_category_wire_parsing() {
        assert_eq!(
            FailureCategory::from_wire("ProviderError"),
            Some(FailureCategory::ProviderError)
        );
        assert_eq!(
            FailureCategory::from_wire("auth-error"),
            Some(FailureCategory::AuthError)
        );
        assert_eq!(
            FailureCategory::from_wire("Validation"),
            Some(FailureCategory::Validation)
        );
        assert_eq!(FailureCategory::from_wire("teapot"), None);
        assert!(FailureCategory::Timeout.is_retryable());
        assert!(!FailureCategory::Validation.is_retryable());
    }

    #[test]
    fn test_request_serializes_camel_case_without_empty_options() {
        let req = pending();
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("ownerId").is_some());
        assert!(value.get("cvRef").is_some());
        assert_eq!(value["status"], "pending");
        assert!(value.get("result").is_none());
        assert!(value.get("lastError").is_none());
    }
}
