// Authentication module
// Credential storage and single-flight session refresh

mod coordinator;
mod refresh;
mod store;
mod types;

pub use coordinator::{RefreshCoordinator, RefreshFn};
pub use refresh::{endpoint_url, join_path, refresh_session};
pub use store::{CookieStore, CredentialStore, LocalStorage, MemoryStore};
pub use types::{Credential, RefreshResponse, SessionEvent};
