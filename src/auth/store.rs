// Credential storage backends

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::cookie::Jar;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use super::types::Credential;

/// Where the current credential lives.
///
/// Reads happen on every outgoing request, so implementations should be cheap to query.
pub trait CredentialStore: Send + Sync {
    /// Current credential, `None` when absent or expired
    fn load(&self) -> Result<Option<Credential>>;

    /// Replace the stored credential
    fn save(&self, credential: &Credential) -> Result<()>;

    /// Remove the stored credential
    fn clear(&self) -> Result<()>;
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    credential: RwLock<Option<Credential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: RwLock::new(Some(credential)),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Result<Option<Credential>> {
        let guard = self
            .credential
            .read()
            .map_err(|_| anyhow::anyhow!("Credential lock poisoned"))?;
        Ok(guard.clone().filter(|c| !c.is_expired()))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let mut guard = self
            .credential
            .write()
            .map_err(|_| anyhow::anyhow!("Credential lock poisoned"))?;
        *guard = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .credential
            .write()
            .map_err(|_| anyhow::anyhow!("Credential lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}

/// Persistent key/value storage backed by a JSON object file.
/// The token is kept as a plain string under a fixed key, without expiry.
pub struct LocalStorage {
    path: PathBuf,
    key: String,
    // Serializes read-modify-write cycles within the process
    lock: Mutex<()>,
}

impl LocalStorage {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        if !self.path.exists() {
            return Ok(serde_json::Map::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read storage file: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(serde_json::Map::new());
        }

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse storage file: {}", self.path.display()))
    }

    fn write_entries(&self, entries: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory: {}", parent.display())
                })?;
            }
        }

        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write storage file: {}", self.path.display()))
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Storage lock poisoned"))
    }
}

impl CredentialStore for LocalStorage {
    fn load(&self) -> Result<Option<Credential>> {
        let _guard = self.locked()?;
        let entries = self.read_entries()?;

        Ok(entries
            .get(&self.key)
            .and_then(|v| v.as_str())
            .filter(|token| !token.is_empty())
            .map(Credential::new))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let _guard = self.locked()?;
        let mut entries = self.read_entries()?;
        entries.insert(
            self.key.clone(),
            serde_json::Value::String(credential.token.clone()),
        );
        self.write_entries(&entries)
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.locked()?;
        let mut entries = self.read_entries()?;
        if entries.remove(&self.key).is_some() {
            self.write_entries(&entries)?;
        }
        Ok(())
    }
}

/// Cookie-backed store.
///
/// The credential is written as a cookie with an `Expires` attribute into the jar shared with the
/// HTTP client, and optionally mirrored to a file so it survives restarts.
pub struct CookieStore {
    jar: Arc<Jar>,
    url: Url,
    name: String,
    default_max_age: Duration,
    file: Option<PathBuf>,
    current: RwLock<Option<Credential>>,
}

impl CookieStore {
    pub fn new(
        jar: Arc<Jar>,
        url: Url,
        name: impl Into<String>,
        default_max_age: Duration,
    ) -> Self {
        Self {
            jar,
            url,
            name: name.into(),
            default_max_age,
            file: None,
            current: RwLock::new(None),
        }
    }

    /// Mirror the cookie to `path`; an existing unexpired cookie there is loaded immediately
    pub fn persistent(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if path.exists() {
            let line = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read cookie file: {}", path.display()))?;
            match parse_cookie(&line, &self.name) {
                Some(credential) if !credential.is_expired() => {
                    self.jar.add_cookie_str(line.trim(), &self.url);
                    self.current = RwLock::new(Some(credential));
                }
                Some(_) => tracing::debug!("Stored session cookie has expired"),
                None => tracing::warn!("Ignoring malformed cookie file: {}", path.display()),
            }
        }

        self.file = Some(path);
        Ok(self)
    }

    fn write_file(&self, line: &str) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, line)
            .with_context(|| format!("Failed to write cookie file: {}", path.display()))
    }
}

impl CredentialStore for CookieStore {
    fn load(&self) -> Result<Option<Credential>> {
        let guard = self
            .current
            .read()
            .map_err(|_| anyhow::anyhow!("Cookie lock poisoned"))?;
        Ok(guard.clone().filter(|c| !c.is_expired()))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let expires_at = match credential.expires_at {
            Some(expires_at) => expires_at,
            None => Utc::now()
                .checked_add_signed(self.default_max_age)
                .context("Cookie expiry is out of range")?,
        };
        let stored = Credential {
            token: credential.token.clone(),
            expires_at: Some(expires_at),
        };

        // Nothing changes unless the file write succeeds
        let mut guard = self
            .current
            .write()
            .map_err(|_| anyhow::anyhow!("Cookie lock poisoned"))?;
        let line = format_cookie(&self.name, &stored.token, expires_at);
        self.write_file(&line)?;
        self.jar.add_cookie_str(&line, &self.url);
        *guard = Some(stored);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        // An already-expired cookie evicts the jar entry
        let line = format_cookie(&self.name, "", DateTime::<Utc>::UNIX_EPOCH);
        self.jar.add_cookie_str(&line, &self.url);

        if let Some(path) = &self.file {
            if path.exists() {
                std::fs::remove_file(path)
                    .with_context(|| format!("Failed to remove cookie file: {}", path.display()))?;
            }
        }

        let mut guard = self
            .current
            .write()
            .map_err(|_| anyhow::anyhow!("Cookie lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}

/// `Set-Cookie` style line with an IMF-fixdate `Expires` attribute
pub(crate) fn format_cookie(name: &str, value: &str, expires_at: DateTime<Utc>) -> String {
    format!(
        "{}={}; Expires={}; Path=/",
        name,
        value,
        expires_at.format("%a, %d %b %Y %H:%M:%S GMT")
    )
}

/// Parse a line produced by [`format_cookie`]
pub(crate) fn parse_cookie(line: &str, name: &str) -> Option<Credential> {
    let mut parts = line.trim().split(';').map(str::trim);

    let (cookie_name, value) = parts.next()?.split_once('=')?;
    if cookie_name != name || value.is_empty() {
        return None;
    }

    let expires_at = parts
        .filter_map(|attr| attr.split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("expires"))
        .and_then(|(_, date)| DateTime::parse_from_rfc2822(date).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Some(Credential {
        token: value.to_string(),
        expires_at,
    })
}
