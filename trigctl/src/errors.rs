//! Error types and HTTP response conversion.
//!
//! The main [`Error`] enum covers all application error cases:
//!
//! - **Authentication**: `Unauthenticated` (401)
//! - **Validation**: `BadRequest` (400) for bad payloads, URLs, conditions
//! - **Not Found**: `NotFound` (404)
//! - **Conflicts**: `Conflict` (409) for duplicate display names and
//!   subscriptions
//! - **Permissions**: `PermissionDenied` (403) when the permission oracle
//!   rejects a grantee
//! - **Upstream**: `Upstream` (502) for oracle / bus failures
//! - **Dispatch**: `Dispatch` for webhook delivery failures (never surfaced
//!   over HTTP; recorded against the webhook instead)
//! - **Expressions**: `Expression` wrapping condition compile/evaluation
//!   failures
//! - **Database**: wraps [`DbError`] with appropriate status codes
//!
//! All errors implement [`IntoResponse`] so handlers can return
//! `Result<T, Error>` and get a JSON-ish HTTP error for free.

use crate::db::errors::DbError;
use crate::xl;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Caller identity missing or malformed
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Conflict error, e.g., for unique constraint violations
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// The permission oracle denied the grantee access to the asset
    #[error("Permission denied for asset {asset_did}")]
    PermissionDenied { asset_did: String },

    /// An external collaborator (permission oracle, bus) failed
    #[error("Upstream failure in {service}: {message}")]
    Upstream { service: &'static str, message: String },

    /// Webhook HTTP delivery failed (non-2xx or transport error)
    #[error("Webhook delivery failed: {message}")]
    Dispatch {
        status_code: Option<u16>,
        message: String,
    },

    /// Condition compile or evaluation error
    #[error(transparent)]
    Expression(#[from] xl::Error),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Error::Dispatch { .. } => StatusCode::BAD_GATEWAY,
            Error::Expression(_) => StatusCode::BAD_REQUEST,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message
                .clone()
                .unwrap_or_else(|| "Authentication required".to_string()),
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Conflict { message } => message.clone(),
            Error::PermissionDenied { asset_did } => {
                format!("Not authorized to read telemetry for {asset_did}")
            }
            Error::Upstream { service, .. } => format!("Upstream service {service} is unavailable"),
            Error::Dispatch { .. } => "Webhook delivery failed".to_string(),
            Error::Expression(e) => format!("Invalid condition: {e}"),
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { constraint, .. } => match constraint.as_deref() {
                    Some("webhooks_owner_display_name_live") => {
                        "A webhook with this display name already exists".to_string()
                    }
                    Some("subscriptions_pkey") => {
                        "This vehicle is already subscribed to the webhook".to_string()
                    }
                    _ => "Resource already exists".to_string(),
                },
                DbError::ForeignKeyViolation { .. } => {
                    "Invalid reference to related resource".to_string()
                }
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Transient { .. } => "Service temporarily overloaded, please retry".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - level tracks severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Upstream { .. } | Error::Dispatch { .. } => {
                tracing::warn!("Upstream error: {}", self);
            }
            Error::Database(_) | Error::Conflict { .. } => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::Unauthenticated { .. } | Error::PermissionDenied { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } | Error::Expression(_) => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let body = serde_json::json!({ "message": self.user_message() });
        (status, axum::response::Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
