//! Tenant context extraction.
//!
//! The identity layer in front of this service authenticates the caller and
//! forwards the resolved school and actor as headers. Requests without them
//! are rejected before any handler runs.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use rollcall_core::TenantContext;

use crate::ApiError;

/// Header carrying the caller's school.
pub const SCHOOL_HEADER: &str = "x-school-id";

/// Header carrying the acting user.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Extractor for the request's [`TenantContext`].
#[derive(Debug, Clone, Copy)]
pub struct Tenant(pub TenantContext);

fn header_id(parts: &Parts, name: &str) -> Result<i64, ApiError> {
    let value = parts
        .headers
        .get(name)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", name)))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {} header", name)))
}

#[async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let school_id = header_id(parts, SCHOOL_HEADER)?;
        let actor_id = header_id(parts, ACTOR_HEADER)?;
        Ok(Tenant(TenantContext::new(school_id, actor_id)))
    }
}
