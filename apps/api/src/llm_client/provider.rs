//! Direct Anthropic backend for the dispatch client.

use async_trait::async_trait;

use crate::dispatch::{DispatchEnvelope, DispatchFailure, EnhancementProvider, ProviderReply};
use crate::llm_client::prompts::{build_enhancement_prompt, ENHANCEMENT_SYSTEM};
use crate::llm_client::{LlmClient, LlmError};

pub struct LlmProvider {
    llm: LlmClient,
}

impl LlmProvider {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl EnhancementProvider for LlmProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn send(&self, envelope: &DispatchEnvelope) -> Result<ProviderReply, DispatchFailure> {
        let prompt = build_enhancement_prompt(&envelope.cv_content, &envelope.job_description);
        let body = self.llm.complete_json(ENHANCEMENT_SYSTEM, &prompt).await?;
        Ok(ProviderReply::Body(body))
    }
}

impl From<LlmError> for DispatchFailure {
    fn from(e: LlmError) -> Self {
        match &e {
            LlmError::Http(inner) if inner.is_timeout() => DispatchFailure::timeout(e.to_string()),
            LlmError::Api { status: 400 | 413 | 422, .. } => {
                DispatchFailure::validation(e.to_string())
            }
            LlmError::Api { status: 401 | 403, .. } => DispatchFailure::auth(e.to_string()),
            LlmError::Api { status: 408 | 504, .. } => DispatchFailure::timeout(e.to_string()),
            _ => DispatchFailure::provider(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enhancement::FailureCategory;

    fn api(status: u16) -> LlmError {
        LlmError::Api {
            status,
            message: "nope".to_string(),
        }
    }

    #[test]
    fn test_llm_errors_map_to_failure_categories() {
        assert_eq!(
            DispatchFailure::from(api(401)).category,
            FailureCategory::AuthError
        );
        assert_eq!(
            DispatchFailure::from(api(400)).category,
            FailureCategory::Validation
        );
        assert_eq!(
            DispatchFailure::from(api(529)).category,
            FailureCategory::ProviderError
        );
        assert_eq!(
            DispatchFailure::from(api(429)).category,
            FailureCategory::ProviderError
        );
        assert_eq!(
            DispatchFailure::from(LlmError::EmptyContent).category,
            FailureCategory::ProviderError
        );
    }

    #[test]
    fn test_unparseable_reply_is_provider_error() {
        let parse = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        assert_eq!(
            DispatchFailure::from(LlmError::Parse(parse)).category,
            FailureCategory::ProviderError
        );
    }

    #[tokio::test]
    async fn test_provider_returns_model_json_as_body() {
        use axum::{routing::post, Json, Router};
        use serde_json::json;
        use std::time::Duration;
        use uuid::Uuid;

        let app = Router::new().route(
            "/v1/messages",
            post(|| async {
                Json(json!({
                    "content": [{"type": "text", "text": "{\"enhancedContent\": {}, \"matchScore\": 40}"}]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let llm = LlmClient::new("sk-test".to_string(), Duration::from_secs(5))
            .unwrap()
            .with_endpoint(format!("http://{addr}/v1/messages"));
        let reply = LlmProvider::new(llm)
            .send(&DispatchEnvelope {
                request_id: Uuid::new_v4(),
                owner_id: Uuid::new_v4(),
                attempt: 1,
                cv_content: "Jane Doe".to_string(),
                job_description: "Rust engineer".to_string(),
            })
            .await
            .unwrap();
        let ProviderReply::Body(body) = reply else {
            panic!("expected a body");
        };
        assert_eq!(body["matchScore"], 40);
    }
}
