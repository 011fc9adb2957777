//! HTTP API surface: webhook CRUD and subscription management.
//!
//! Identity arrives as a developer-license address in a trusted proxy
//! header (`X-Developer-License`); token verification itself happens
//! upstream.

pub mod handlers;
pub mod models;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::errors::Error;
use crate::types::is_developer_license;

/// Header carrying the authenticated developer-license address, set by the
/// upstream auth proxy.
pub const DEVELOPER_LICENSE_HEADER: &str = "x-developer-license";

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct DeveloperIdentity(pub String);

impl<S> FromRequestParts<S> for DeveloperIdentity
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(DEVELOPER_LICENSE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::Unauthenticated { message: None })?;

        if !is_developer_license(value) {
            return Err(Error::Unauthenticated {
                message: Some("X-Developer-License is not a 20-byte hex address".to_string()),
            });
        }
        Ok(Self(value.to_string()))
    }
}
