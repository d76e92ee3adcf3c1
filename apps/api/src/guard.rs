//! Decides whether a caller may act on a record.
//!
//! Deny by default. Only an exact, non-nil identity match is allowed; missing
//! or ambiguous ownership data never grants access.

use uuid::Uuid;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

pub fn authorize(caller_id: Uuid, resource_owner_id: Option<Uuid>) -> Access {
    match resource_owner_id {
        Some(owner) if !caller_id.is_nil() && !owner.is_nil() && owner == caller_id => {
            Access::Allow
        }
        _ => Access::Deny,
    }
}

/// `authorize`, failing closed with `Forbidden`.
pub fn require_owner(caller_id: Uuid, resource_owner_id: Option<Uuid>) -> Result<(), AppError> {
    match authorize(caller_id, resource_owner_id) {
        Access::Allow => Ok(()),
        Access::Deny => {
            tracing::debug!("Denied caller {caller_id} (owner {resource_owner_id:?})");
            Err(AppError::Forbidden)
        }
    }
}
