//! Posts the dispatch envelope to an external enhancement
//! pipeline, authenticated with a shared secret header.
//!
//! Status mapping:
//! - 200 → result body (validated by the dispatch client)
//! - 202 → accepted; the result arrives later on the callback route
//! - 400 / 422 → `Validation`
//! - 401 / 403 → `AuthError`
//! - 408 / 504 or a client-side timeout → `Timeout`
//! - anything else → `ProviderError`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::warn;

use super::{DispatchEnvelope, DispatchFailure, EnhancementProvider, ProviderReply};

/// Header carrying the shared secret, both on outbound dispatches and on
/// inbound provider callbacks.
pub const SECRET_HEADER: &str = "x-webhook-secret";

/// Longest error body echoed into a request's `lastError`.
const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(Clone)]
pub struct WebhookProvider {
    client: Client,
    url: String,
    secret: String,
}

impl WebhookProvider {
    pub fn new(url: String, secret: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url,
            secret,
        })
    }
}

#[async_trait]
impl EnhancementProvider for WebhookProvider {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, envelope: &DispatchEnvelope) -> Result<ProviderReply, DispatchFailure> {
        let response = self
            .client
            .post(&self.url)
            .header(SECRET_HEADER, &self.secret)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchFailure::timeout(format!("webhook timed out: {e}"))
                } else {
                    DispatchFailure::provider(format!("webhook unreachable: {e}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(ProviderReply::Accepted);
        }

        if status.is_success() {
            let body: Value = response.json().await.map_err(|e| {
                DispatchFailure::provider(format!("webhook returned an unreadable body: {e}"))
            })?;
            return Ok(ProviderReply::Body(body));
        }

        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        warn!("Webhook returned {status} for request {}", envelope.request_id);
        Err(failure_for_status(status, &body))
    }
}

fn failure_for_status(status: StatusCode, body: &str) -> DispatchFailure {
    let message = if body.is_empty() {
        format!("webhook returned {status}")
    } else {
        format!("webhook returned {status}: {body}")
    };
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            DispatchFailure::validation(message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DispatchFailure::auth(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            DispatchFailure::timeout(message)
        }
        _ => DispatchFailure::provider(message),
    }
}

/// Compares a presented secret with the configured one without
/// short-circuiting on the first differing byte.
pub fn verify_secret(presented: Option<&str>, expected: &str) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    if expected.is_empty() || presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enhancement::FailureCategory;
    use axum::{
        http::{HeaderMap, StatusCode as HttpStatus},
        routing::post,
        Json, Router,
    };
    use serde_json::json;
    use uuid::Uuid;

    const SECRET: &str = "s3cr3t";

    fn envelope() -> DispatchEnvelope {
        DispatchEnvelope {
            request_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            attempt: 1,
            cv_content: "Jane Doe".to_string(),
            job_description: "Rust engineer".to_string(),
        }
    }

    async fn ok_handler(headers: HeaderMap, Json(body): Json<Value>) -> (HttpStatus, Json<Value>) {
        if headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()) != Some(SECRET) {
            return (HttpStatus::UNAUTHORIZED, Json(json!({})));
        }
        let echoed = body["cvContent"].clone();
        (
            HttpStatus::OK,
            Json(json!({
                "enhancedContent": {"summary": echoed},
                "suggestions": ["add metrics"],
                "matchScore": 82
            })),
        )
    }

    async fn spawn_provider() -> String {
        let app = Router::new()
            .route("/ok", post(ok_handler))
            .route("/accepted", post(|| async { HttpStatus::ACCEPTED }))
            .route(
                "/invalid",
                post(|| async { (HttpStatus::UNPROCESSABLE_ENTITY, "cv too short") }),
            )
            .route("/boom", post(|| async { HttpStatus::BAD_GATEWAY }))
            .route("/garbage", post(|| async { (HttpStatus::OK, "<html>") }))
            .route(
                "/slow",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    HttpStatus::OK
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(base: &str, path: &str, secret: &str, timeout: Duration) -> WebhookProvider {
        WebhookProvider::new(format!("{base}{path}"), secret.to_string(), timeout).unwrap()
    }

    #[tokio::test]
    async fn test_success_sends_envelope_and_secret() {
        let base = spawn_provider().await;
        let reply = provider(&base, "/ok", SECRET, Duration::from_secs(5))
            .send(&envelope())
            .await
            .unwrap();
        let ProviderReply::Body(body) = reply else {
            panic!("expected a body");
        };
        assert_eq!(body["enhancedContent"]["summary"], "Jane Doe");
        assert_eq!(body["matchScore"], 82);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_auth_error() {
        let base = spawn_provider().await;
        let err = provider(&base, "/ok", "wrong", Duration::from_secs(5))
            .send(&envelope())
            .await
            .unwrap_err();
        assert_eq!(err.category, FailureCategory::AuthError);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let base = spawn_provider().await;
        let timeout = Duration::from_secs(5);

        let reply = provider(&base, "/accepted", SECRET, timeout)
            .send(&envelope())
            .await
            .unwrap();
        assert_eq!(reply, ProviderReply::Accepted);

        let err = provider(&base, "/invalid", SECRET, timeout)
            .send(&envelope())
            .await
            .unwrap_err();
        assert_eq!(err.category, FailureCategory::Validation);
        assert!(err.message.contains("cv too short"));

        let err = provider(&base, "/boom", SECRET, timeout)
            .send(&envelope())
            .await
            .unwrap_err();
        assert_eq!(err.category, FailureCategory::ProviderError);

        let err = provider(&base, "/garbage", SECRET, timeout)
            .send(&envelope())
            .await
            .unwrap_err();
        assert_eq!(err.category, FailureCategory::ProviderError);
    }

    #[tokio::test]
    async fn test_client_timeout_is_timeout() {
        let base = spawn_provider().await;
        let err = provider(&base, "/slow", SECRET, Duration::from_millis(200))
            .send(&envelope())
            .await
            .unwrap_err();
        assert_eq!(err.category, FailureCategory::Timeout);
    }

    #[test]
    fn test_failure_for_status_table() {
        let cases = [
            (StatusCode::BAD_REQUEST, FailureCategory::Validation),
            (StatusCode::FORBIDDEN, FailureCategory::AuthError),
            (StatusCode::GATEWAY_TIMEOUT, FailureCategory::Timeout),
            (StatusCode::TOO_MANY_REQUESTS, FailureCategory::ProviderError),
            (StatusCode::INTERNAL_SERVER_ERROR, FailureCategory::ProviderError),
        ];
        for (status, expected) in cases {
            assert_eq!(failure_for_status(status, "").category, expected, "{status}");
        }
    }

    #[test]
    fn test_verify_secret() {
        assert!(verify_secret(Some("abc"), "abc"));
        assert!(!verify_secret(Some("abd"), "abc"));
        assert!(!verify_secret(Some("ab"), "abc"));
        assert!(!verify_secret(None, "abc"));
        assert!(!verify_secret(Some(""), ""));
    }
}
