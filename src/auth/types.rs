// Authentication types

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use crate::error::RefreshError;

/// Bearer credential with optional expiry
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Credential without expiry information
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    /// Credential that expires `expires_in` seconds from now.
    ///
    /// `None` when the expiry is beyond what a timestamp can represent.
    pub fn expiring_in(token: impl Into<String>, expires_in: u64) -> Option<Self> {
        let lifetime = i64::try_from(expires_in)
            .ok()
            .and_then(TimeDelta::try_seconds)?;

        Some(Self {
            token: token.into(),
            expires_at: Some(Utc::now().checked_add_signed(lifetime)?),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Utc::now() >= exp)
    }

    /// Short token prefix, safe for logs
    pub fn preview(&self) -> &str {
        let end = self
            .token
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.token.len());
        &self.token[..end]
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &format_args!("{}...", self.preview()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Refresh endpoint response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub token: String,
    /// Lifetime in seconds
    pub expires_in: Option<u64>,
}

impl RefreshResponse {
    pub fn into_credential(self) -> Result<Credential, RefreshError> {
        match self.expires_in {
            Some(secs) => Credential::expiring_in(self.token, secs).ok_or_else(|| {
                RefreshError::InvalidResponse(format!("expiresIn out of range: {}", secs))
            }),
            None => Ok(Credential::new(self.token)),
        }
    }
}

/// Session lifecycle notifications for the hosting application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A refresh produced a new credential
    Refreshed { expires_at: Option<DateTime<Utc>> },

    /// Refresh failed; the user has to log in again at `login_route`
    Expired {
        reason: RefreshError,
        login_route: String,
    },
}
