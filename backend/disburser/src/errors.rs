//! Application-wide error types.
//!
//! Every variant carries a stable discriminator ([`DisburserError::kind`]) that
//! the API hands back to callers next to the human-readable message.

use axum::http::StatusCode;
use thiserror::Error;

use crate::grant::GrantState;

#[derive(Debug, Error)]
pub enum DisburserError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Pool {pool_id} not found")]
    NotFound { pool_id: String },

    #[error("Pool {pool_id} is {state}; cannot {operation}")]
    StateConflict {
        pool_id: String,
        state: GrantState,
        operation: &'static str,
    },

    #[error("Pool {pool_id} has not been authorized by the funder yet")]
    NotYetAuthorized { pool_id: String },

    #[error("Authorization session for pool {pool_id} is stale; request a new pool grant")]
    AuthorizationStale { pool_id: String },

    #[error("Authorization server rejected request (status {status}): {message}")]
    UpstreamAuthorization {
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Grant for {access} unexpectedly requires interaction")]
    UnexpectedInteractionRequired { access: &'static str },

    #[error("Resource server failed to create {resource} (status {status}): {message}")]
    UpstreamResource {
        resource: &'static str,
        status: u16,
        message: String,
        value_at_risk: bool,
    },

    #[error("Pool {pool_id} exhausted: requested {requested}, remaining {remaining}")]
    ExhaustedGrant {
        pool_id: String,
        requested: u64,
        remaining: u64,
    },

    #[error("Concurrent update on pool {pool_id}")]
    Conflict { pool_id: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DisburserError {
    /// Stable snake_case discriminator reported to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::StateConflict { .. } | Self::Conflict { .. } => "state_conflict",
            Self::NotYetAuthorized { .. } => "not_yet_authorized",
            Self::AuthorizationStale { .. } => "authorization_stale",
            Self::UpstreamAuthorization { .. } => "upstream_authorization_error",
            Self::UnexpectedInteractionRequired { .. } => "unexpected_interaction_required",
            Self::UpstreamResource { .. } => "upstream_resource_error",
            Self::ExhaustedGrant { .. } => "exhausted_grant",
            Self::Database(_) | Self::Migrate(_) => "storage_error",
            Self::Http(_) => "upstream_unreachable",
            Self::Json(_) => "malformed_upstream_response",
            Self::Config(_) => "configuration_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::StateConflict { .. }
            | Self::Conflict { .. }
            | Self::NotYetAuthorized { .. }
            | Self::AuthorizationStale { .. } => StatusCode::CONFLICT,
            Self::ExhaustedGrant { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UpstreamAuthorization { .. }
            | Self::UnexpectedInteractionRequired { .. }
            | Self::UpstreamResource { .. }
            | Self::Http(_)
            | Self::Json(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Migrate(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the caller may repeat the same request unchanged and expect progress.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotYetAuthorized { .. } | Self::Conflict { .. } | Self::Http(_) => true,
            Self::UpstreamAuthorization { retryable, .. } => *retryable,
            Self::UpstreamResource { value_at_risk, .. } => !*value_at_risk,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DisburserError>;
