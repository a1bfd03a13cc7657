use anyhow::{Context, Result};
use chrono::TimeDelta;
use futures::FutureExt;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::{
    endpoint_url, join_path, refresh_session, CookieStore, Credential, CredentialStore,
    LocalStorage, MemoryStore, RefreshCoordinator, RefreshFn, SessionEvent,
};
use crate::config::{Config, StorageKind};
use crate::error::ClientError;

/// A request on its way through the client.
///
/// Records the token it is sent with and how many times it has been retried after a refresh.
/// Retrying produces a new value instead of mutating the original.
#[derive(Debug)]
pub struct AuthRequest {
    request: Request,
    credential: Option<String>,
    retries: u32,
}

impl AuthRequest {
    pub fn new(request: Request, credential: Option<String>) -> Self {
        Self {
            request,
            credential,
            retries: 0,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Token the request carries, if any
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn url(&self) -> &Url {
        self.request.url()
    }

    /// Same request, carrying `token`, with the retry recorded
    pub fn retry_with(self, token: String) -> Self {
        Self {
            request: self.request,
            credential: Some(token),
            retries: self.retries + 1,
        }
    }

    /// Materialize the outgoing request with its `Authorization` header
    fn build(&self) -> Result<Request, ClientError> {
        let mut req = self.request.try_clone().ok_or_else(|| {
            ClientError::Internal(anyhow::anyhow!("Request body is not cloneable"))
        })?;

        if let Some(token) = &self.credential {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => {
                    req.headers_mut().insert(AUTHORIZATION, value);
                }
                Err(e) => {
                    tracing::warn!("Failed to build Authorization header: {}", e);
                }
            }
        }

        Ok(req)
    }
}

/// HTTP client that attaches the session credential and renews it on 401
pub struct AuthenticatedClient {
    /// Raw transport; the refresh call goes through it directly
    client: Client,

    base_url: String,

    store: Arc<dyn CredentialStore>,

    coordinator: RefreshCoordinator,

    /// 401 here never triggers a refresh
    refresh_url: Url,

    /// Identity check; a 401 is an expected answer, not an expired session
    identity_url: Option<Url>,
}

impl AuthenticatedClient {
    /// Create a client with the transport and store described by `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let jar = Arc::new(Jar::default());

        let client = Client::builder()
            .cookie_provider(jar.clone())
            .pool_max_idle_per_host(config.http_max_connections)
            .connect_timeout(Duration::from_secs(config.http_connect_timeout))
            .timeout(Duration::from_secs(config.http_request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let store: Arc<dyn CredentialStore> = match config.storage {
            StorageKind::Local => Arc::new(LocalStorage::new(
                config.storage_file.clone(),
                config.storage_key.clone(),
            )),
            StorageKind::Cookie => {
                let url = Url::parse(&config.api_url).context("Invalid API URL")?;
                let max_age = TimeDelta::try_days(config.cookie_max_age_days)
                    .context("COOKIE_MAX_AGE_DAYS is out of range")?;
                Arc::new(
                    CookieStore::new(jar, url, config.storage_key.clone(), max_age)
                        .persistent(config.storage_file.clone())?,
                )
            }
            StorageKind::Memory => Arc::new(MemoryStore::new()),
        };

        Self::new(config, client, store)
    }

    /// Create a client over an existing transport and store.
    /// The transport should carry a cookie store if the refresh endpoint relies on cookies.
    pub fn new(config: &Config, client: Client, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let refresh_url = endpoint_url(&config.api_url, &config.refresh_path)?;
        let identity_url = config
            .identity_path
            .as_deref()
            .map(|path| endpoint_url(&config.api_url, path))
            .transpose()?;

        let refresh: RefreshFn = {
            let client = client.clone();
            let url = refresh_url.clone();
            Arc::new(move || refresh_session(client.clone(), url.clone()).boxed())
        };

        let coordinator = RefreshCoordinator::new(
            refresh,
            store.clone(),
            Duration::from_secs(config.refresh_timeout),
            config.login_route.clone(),
        );

        Ok(Self {
            client,
            base_url: config.api_url.clone(),
            store,
            coordinator,
            refresh_url,
            identity_url,
        })
    }

    /// Start a request to `path` relative to the API base URL
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, join_path(&self.base_url, path))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> RequestBuilder {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Build and execute a request
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let request = builder.build()?;
        self.execute(request).await
    }

    /// Execute a request with the session credential.
    /// Automatically handles:
    /// - attaching `Authorization: Bearer <token>` when a credential is stored
    /// - 401: refreshes the session once and retries with the new credential
    pub async fn execute(&self, request: Request) -> Result<Response, ClientError> {
        let request_id = Uuid::new_v4();
        let method = request.method().clone();

        let credential = self
            .store
            .load()
            .map_err(|e| ClientError::Store(e.to_string()))?
            .map(|c| c.token);

        let mut current = AuthRequest::new(request, credential);

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            url = %current.url(),
            authenticated = current.credential().is_some(),
            "Sending HTTP request"
        );

        loop {
            let req = current.build()?;

            let response = match self.client.execute(req).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        error = %e,
                        url = %current.url(),
                        "HTTP request error"
                    );
                    return Err(ClientError::Transport(e));
                }
            };

            let status = response.status();
            tracing::debug!(
                request_id = %request_id,
                status = %status,
                attempt = current.retries() + 1,
                "Received HTTP response"
            );

            if status != StatusCode::UNAUTHORIZED || !self.should_refresh(&current) {
                return finish(response).await;
            }

            tracing::warn!(
                request_id = %request_id,
                url = %current.url(),
                "Received 401, renewing session"
            );

            let credential = self.coordinator.fresh_credential(current.credential()).await?;
            current = current.retry_with(credential.token);
        }
    }

    /// Whether a 401 for `request` should go through the refresh flow
    fn should_refresh(&self, request: &AuthRequest) -> bool {
        if request.retries() > 0 {
            tracing::debug!("Request already retried after refresh, not refreshing again");
            return false;
        }

        if same_endpoint(request.url(), &self.refresh_url) {
            return false;
        }

        if let Some(identity_url) = &self.identity_url {
            if same_endpoint(request.url(), identity_url) {
                tracing::debug!("Identity check returned 401, no active session");
                return false;
            }
        }

        true
    }

    /// Ask the identity endpoint who the current session belongs to
    pub async fn current_session(&self) -> Result<Response, ClientError> {
        let url = self.identity_url.clone().ok_or_else(|| {
            ClientError::ConfigError("Identity endpoint is not configured".to_string())
        })?;
        let request = self.client.get(url).build()?;
        self.execute(request).await
    }

    /// Persist a credential obtained outside of the refresh flow, e.g. from a login response
    pub fn login(&self, credential: &Credential) -> Result<(), ClientError> {
        self.store
            .save(credential)
            .map_err(|e| ClientError::Store(e.to_string()))?;
        tracing::info!(token = %credential.preview(), "Credential stored");
        Ok(())
    }

    /// Forget the stored credential
    pub fn logout(&self) -> Result<(), ClientError> {
        self.store
            .clear()
            .map_err(|e| ClientError::Store(e.to_string()))?;
        tracing::info!("Credential cleared");
        Ok(())
    }

    /// Session notifications; `Expired` means the user has to log in again
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Turn a final response into the caller's result
async fn finish(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .unwrap_or_default();
    let error_text = String::from_utf8_lossy(&body).into_owned();
    tracing::warn!(
        status = status.as_u16(),
        url = %url,
        response_body = %error_text,
        "HTTP request failed with error response"
    );

    Err(ClientError::Status {
        status: status.as_u16(),
        message: error_text,
        headers,
        body,
    })
}

fn same_endpoint(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin() && a.path().trim_end_matches('/') == b.path().trim_end_matches('/')
}
