// Authenticated session client - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub use auth::{Credential, CredentialStore, RefreshCoordinator, SessionEvent};
pub use error::{ClientError, RefreshError};
pub use http_client::{AuthRequest, AuthenticatedClient};
