//! Caller identity for owner-scoped operations.
//!
//! The identity provider's proxy authenticates the caller and forwards the
//! result as headers. Handlers take a [`RequestContext`] extractor and pass
//! it explicitly to the store and dispatcher. Ownership checks use the user
//! id; the org id is forwarded to the runner with each run.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::api::ApiError;
use crate::errors::BridgeError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ORG_ID_HEADER: &str = "x-org-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: String,
    pub org_id: Option<String>,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            org_id: None,
        }
    }

    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    /// Fail with `Unauthorized` unless the caller owns the resource.
    pub fn ensure_owner(&self, kind: &'static str, id: &str, owner_id: &str) -> Result<(), BridgeError> {
        if self.user_id == owner_id {
            Ok(())
        } else {
            Err(BridgeError::Unauthorized {
                kind,
                id: id.to_string(),
            })
        }
    }
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_value(parts, USER_ID_HEADER).ok_or(BridgeError::Unauthenticated)?;
        Ok(Self {
            user_id,
            org_id: header_value(parts, ORG_ID_HEADER),
        })
    }
}
