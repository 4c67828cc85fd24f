//! Custom Axum extractors.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::server::error::AppError;
use crate::types::UserId;

/// The caller's identity, injected by whatever sits in front of this
/// service on the `x-user-id` header. General user authentication is out
/// of scope here; this extractor only trusts that header is already set.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::bad_request("missing x-user-id header"))?;

        let uuid = raw
            .parse()
            .map_err(|_| AppError::bad_request("x-user-id is not a valid uuid"))?;

        Ok(Self(UserId(uuid)))
    }
}
