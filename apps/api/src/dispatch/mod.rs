//! One provider call per dispatch, bounded by a hard timeout.
//!
//! Retries are not done here; the orchestrator asks the retry controller what
//! to do with a failure. Provider payloads are validated against the result
//! schema before they leave this module: anything that does not conform
//! becomes a `ProviderError`, never an untyped value.

pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::models::enhancement::{EnhancementResult, FailureCategory, RequestError};

pub const MIN_MATCH_SCORE: f64 = 0.0;
pub const MAX_MATCH_SCORE: f64 = 100.0;

// ────────────────────────────────────────────────────────────────────────────
// Wire types
// ────────────────────────────────────────────────────────────────────────────

/// Request envelope sent to the provider. Asynchronous providers echo
/// `attempt` in their callback so a late answer to an earlier attempt can be
/// told apart from the current one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    pub request_id: Uuid,
    pub owner_id: Uuid,
    pub attempt: u32,
    pub cv_content: String,
    pub job_description: String,
}

/// What a provider said, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderReply {
    /// A synchronous answer carrying the (unvalidated) result envelope.
    Body(Value),
    /// The provider took the job and will report back through the callback route.
    Accepted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed(EnhancementResult),
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{category}: {message}")]
pub struct DispatchFailure {
    pub category: FailureCategory,
    pub message: String,
}

impl DispatchFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureCategory::Validation, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(FailureCategory::ProviderError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureCategory::Timeout, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureCategory::AuthError, message)
    }

    pub fn into_request_error(self) -> RequestError {
        RequestError::new(self.category, self.message)
    }
}

/// A backend that can run one enhancement job.
#[async_trait]
pub trait EnhancementProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Makes exactly one call to the provider.
    async fn send(&self, envelope: &DispatchEnvelope) -> Result<ProviderReply, DispatchFailure>;
}

// ────────────────────────────────────────────────────────────────────────────
// Dispatch client
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DispatchClient {
    provider: Arc<dyn EnhancementProvider>,
    timeout: Duration,
}

impl DispatchClient {
    pub fn new(provider: Arc<dyn EnhancementProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn dispatch(
        &self,
        envelope: &DispatchEnvelope,
    ) -> Result<DispatchOutcome, DispatchFailure> {
        debug!(
            "Dispatching request {} to {} provider",
            envelope.request_id,
            self.provider.name()
        );

        let reply = tokio::time::timeout(self.timeout, self.provider.send(envelope))
            .await
            .map_err(|_| {
                DispatchFailure::timeout(format!(
                    "provider did not answer within {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        match reply {
            ProviderReply::Accepted => Ok(DispatchOutcome::Accepted),
            ProviderReply::Body(body) => validate_result(body).map(DispatchOutcome::Completed),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Schema validation
// ────────────────────────────────────────────────────────────────────────────

/// Validates a provider result envelope:
/// `{enhancedContent: object, suggestions: string[], matchScore: number in [0, 100]}`.
/// `suggestions` may be omitted; everything else is required.
pub fn validate_result(body: Value) -> Result<EnhancementResult, DispatchFailure> {
    let Value::Object(mut fields) = body else {
        return Err(DispatchFailure::provider("response is not a JSON object"));
    };

    let enhanced_content = match fields.remove("enhancedContent") {
        None | Some(Value::Null) => {
            return Err(DispatchFailure::provider("response is missing enhancedContent"))
        }
        Some(content @ Value::Object(_)) => content,
        Some(_) => {
            return Err(DispatchFailure::provider(
                "enhancedContent must be a JSON object",
            ))
        }
    };

    let suggestions = match fields.remove("suggestions") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(DispatchFailure::provider("suggestions must all be strings")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(DispatchFailure::provider("suggestions must be an array")),
    };

    let match_score = fields
        .get("matchScore")
        .ok_or_else(|| DispatchFailure::provider("response is missing matchScore"))?
        .as_f64()
        .ok_or_else(|| DispatchFailure::provider("matchScore must be a number"))?;
    if !match_score.is_finite() || !(MIN_MATCH_SCORE..=MAX_MATCH_SCORE).contains(&match_score) {
        return Err(DispatchFailure::provider(format!(
            "matchScore {match_score} outside [{MIN_MATCH_SCORE}, {MAX_MATCH_SCORE}]"
        )));
    }

    Ok(EnhancementResult {
        enhanced_content,
        suggestions,
        match_score,
    })
}

/// Parses an asynchronous provider callback: either a result envelope or
/// `{error: {category, message}}`. Unknown categories downgrade to `ProviderError`.
pub fn parse_callback(body: Value) -> Result<EnhancementResult, DispatchFailure> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        let category = error
            .get("category")
            .and_then(Value::as_str)
            .and_then(FailureCategory::from_wire)
            .unwrap_or(FailureCategory::ProviderError);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("provider reported an error");
        return Err(DispatchFailure::new(category, message));
    }
    validate_result(body)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedProvider(Result<ProviderReply, DispatchFailure>);

    #[async_trait]
    impl EnhancementProvider for FixedProvider {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn send(&self, _: &DispatchEnvelope) -> Result<ProviderReply, DispatchFailure> {
            self.0.clone()
        }
    }

    struct StalledProvider;

    #[async_trait]
    impl EnhancementProvider for StalledProvider {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn send(&self, _: &DispatchEnvelope) -> Result<ProviderReply, DispatchFailure> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ProviderReply::Accepted)
        }
    }

    fn envelope() -> DispatchEnvelope {
        DispatchEnvelope {
            request_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            attempt: 1,
            cv_content: "Jane Doe".to_string(),
            job_description: "Rust engineer".to_string(),
        }
    }

    #[test]
    fn test_valid_result_is_kept_verbatim() {
        let result = validate_result(json!({
            "enhancedContent": {"summary": "x"},
            "suggestions": ["add metrics"],
            "matchScore": 82
        }))
        .unwrap();
        assert_eq!(result.enhanced_content, json!({"summary": "x"}));
        assert_eq!(result.suggestions, vec!["add metrics".to_string()]);
        assert_eq!(result.match_score, 82.0);
    }

    #[test]
    fn test_score_out_of_range_is_provider_error() {
        let err = validate_result(json!({
            "enhancedContent": {"summary": "x"},
            "suggestions": [],
            "matchScore": 150
        }))
        .unwrap_err();
        assert_eq!(err.category, FailureCategory::ProviderError);
        assert!(err.message.contains("150"));

        let err = validate_result(json!({
            "enhancedContent": {},
            "matchScore": -0.5
        }))
        .unwrap_err();
        assert_eq!(err.category, FailureCategory::ProviderError);
    }

    #[test]
    fn test_score_bounds_are_inclusive() {
        for score in [0, 100] {
            assert!(validate_result(json!({"enhancedContent": {}, "matchScore": score})).is_ok());
        }
    }

    #[test]
    fn test_missing_content_is_provider_error() {
        let err = validate_result(json!({"suggestions": [], "matchScore": 50})).unwrap_err();
        assert_eq!(err.category, FailureCategory::ProviderError);
        assert!(err.message.contains("enhancedContent"));

        let err =
            validate_result(json!({"enhancedContent": "text", "matchScore": 50})).unwrap_err();
        assert_eq!(err.category, FailureCategory::ProviderError);
    }

    #[test]
    fn test_odd_shapes_downgrade_to_provider_error() {
        for body in [
            json!("just a string"),
            json!([1, 2, 3]),
            json!({"enhancedContent": {}, "matchScore": "82"}),
            json!({"enhancedContent": {}, "matchScore": 82, "suggestions": [1]}),
            json!({"enhancedContent": {}, "matchScore": 82, "suggestions": "one"}),
            json!({"enhancedContent": {}}),
        ] {
            let err = validate_result(body.clone()).unwrap_err();
            assert_eq!(err.category, FailureCategory::ProviderError, "{body}");
        }
    }

    #[test]
    fn test_missing_suggestions_default_to_empty() {
        let result = validate_result(json!({"enhancedContent": {}, "matchScore": 10})).unwrap();
        assert!(result.suggestions.is_empty());
    }

    #[test]
    fn test_callback_error_envelope() {
        let err = parse_callback(json!({
            "error": {"category": "auth_error", "message": "bad key"}
        }))
        .unwrap_err();
        assert_eq!(err.category, FailureCategory::AuthError);
        assert_eq!(err.message, "bad key");

        let err = parse_callback(json!({"error": {"category": "weird"}})).unwrap_err();
        assert_eq!(err.category, FailureCategory::ProviderError);
    }

    #[test]
    fn test_callback_success_envelope() {
        let result = parse_callback(json!({
            "enhancedContent": {"summary": "y"},
            "suggestions": [],
            "matchScore": 55.5,
            "error": null
        }))
        .unwrap();
        assert_eq!(result.match_score, 55.5);
    }

    #[tokio::test]
    async fn test_dispatch_validates_synchronous_body() {
        let client = DispatchClient::new(
            Arc::new(FixedProvider(Ok(ProviderReply::Body(json!({
                "enhancedContent": {"summary": "x"},
                "matchScore": 150
            }))))),
            Duration::from_secs(1),
        );
        let err = client.dispatch(&envelope()).await.unwrap_err();
        assert_eq!(err.category, FailureCategory::ProviderError);
    }

    #[tokio::test]
    async fn test_dispatch_passes_through_acceptance_and_failures() {
        let client = DispatchClient::new(
            Arc::new(FixedProvider(Ok(ProviderReply::Accepted))),
            Duration::from_secs(1),
        );
        assert_eq!(
            client.dispatch(&envelope()).await.unwrap(),
            DispatchOutcome::Accepted
        );

        let client = DispatchClient::new(
            Arc::new(FixedProvider(Err(DispatchFailure::auth("nope")))),
            Duration::from_secs(1),
        );
        assert_eq!(
            client.dispatch(&envelope()).await.unwrap_err().category,
            FailureCategory::AuthError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let client = DispatchClient::new(Arc::new(StalledProvider), Duration::from_secs(30));
        let err = client.dispatch(&envelope()).await.unwrap_err();
        assert_eq!(err.category, FailureCategory::Timeout);
    }
}
