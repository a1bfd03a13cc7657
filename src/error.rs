// Error handling module
// Defines the client-facing error and the shareable refresh error

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;

/// Errors returned by the authenticated client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Network or protocol failure before a response was received
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    ///
    /// Carries the response headers and raw body; `message` is the body decoded as text.
    #[error("HTTP error: {status} - {message}")]
    Status {
        status: u16,
        message: String,
        headers: HeaderMap,
        body: Vec<u8>,
    },

    /// Session refresh failed; the session is over
    #[error("Session refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    /// Credential store could not be read or written
    #[error("Credential store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { status, .. } => StatusCode::from_u16(*status).ok(),
            ClientError::Transport(e) => e.status(),
            _ => None,
        }
    }

    /// Response headers of a non-success status
    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            ClientError::Status { headers, .. } => Some(headers),
            _ => None,
        }
    }

    /// True for a 401 that was handed back to the caller
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }

    /// True when the refresh flow gave up and the user must log in again
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ClientError::Refresh(_))
    }
}

/// Failure of a single refresh attempt.
///
/// Every request waiting on the same refresh receives a copy, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// Refresh endpoint answered with a non-success status
    #[error("refresh endpoint returned {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Refresh request never produced a response
    #[error("refresh request failed: {0}")]
    Transport(String),

    /// Response body was not the expected token payload
    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    /// Refresh did not settle in time
    #[error("refresh timed out after {0:?}")]
    Timeout(Duration),

    /// New credential could not be persisted
    #[error("failed to persist refreshed credential: {0}")]
    Store(String),

    /// Refresh task panicked or was cancelled
    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
