// Session refresh call

use anyhow::{Context, Result};
use reqwest::{Client, Url};

use super::types::{Credential, RefreshResponse};
use crate::error::RefreshError;

/// Resolve an API path such as `/auth/refresh-token` against the base URL
pub fn endpoint_url(base_url: &str, path: &str) -> Result<Url> {
    let joined = join_path(base_url, path);
    Url::parse(&joined).with_context(|| format!("Invalid endpoint URL: {}", joined))
}

/// Join a base URL and an absolute API path without doubling slashes
pub fn join_path(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Exchange the session cookie for a new bearer token.
///
/// Goes straight to the transport: no credential header, no interception. Cookies from the
/// client's jar ride along, which is what the server authenticates the refresh with.
pub async fn refresh_session(
    client: Client,
    url: Url,
) -> std::result::Result<Credential, RefreshError> {
    tracing::info!(url = %url, "Refreshing session token...");

    let response = client
        .post(url.clone())
        .header("Content-Type", "application/json")
        .body("{}")
        .send()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            body = %error_text,
            "Session refresh rejected"
        );
        return Err(RefreshError::Rejected {
            status: status.as_u16(),
            message: error_text,
        });
    }

    let data: RefreshResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

    if data.token.is_empty() {
        return Err(RefreshError::InvalidResponse(
            "response does not contain token".to_string(),
        ));
    }

    let credential = data.into_credential()?;
    tracing::info!(
        token = %credential.preview(),
        expires_at = ?credential.expires_at,
        "Session token refreshed"
    );

    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(
            join_path("http://localhost:5000/api", "/auth/refresh-token"),
            "http://localhost:5000/api/auth/refresh-token"
        );
        assert_eq!(
            join_path("http://localhost:5000/api/", "auth/me"),
            "http://localhost:5000/api/auth/me"
        );
    }

    #[test]
    fn test_endpoint_url() {
        let url = endpoint_url("http://localhost:5000/api", "/auth/refresh-token").unwrap();
        assert_eq!(url.path(), "/api/auth/refresh-token");
        assert!(endpoint_url("not a url", "/auth/refresh-token").is_err());
    }
}
