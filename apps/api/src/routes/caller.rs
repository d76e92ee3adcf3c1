use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::errors::AppError;

/// Header carrying the authenticated user id, set by whatever authenticates upstream.
pub const CALLER_HEADER: &str = "x-user-id";

/// The user on whose behalf a request is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)?;
        let id = Uuid::parse_str(raw.trim()).map_err(|_| AppError::Unauthorized)?;
        if id.is_nil() {
            return Err(AppError::Unauthorized);
        }
        Ok(Caller(id))
    }
}
