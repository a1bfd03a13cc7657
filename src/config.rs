use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;

const DEFAULT_API_URL: &str = "http://localhost:5000/api";

/// Browsers cap cookie lifetimes at 400 days
pub const MAX_COOKIE_MAX_AGE_DAYS: i64 = 400;

/// Authenticated session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// API base URL
    #[arg(short = 'u', long, env = "API_URL")]
    pub api_url: Option<String>,

    /// Credential storage (local, cookie, memory)
    #[arg(short = 's', long, env = "TOKEN_STORAGE", default_value = "local")]
    pub storage: String,

    /// Path of the storage file
    #[arg(long, env = "TOKEN_STORAGE_FILE")]
    pub storage_file: Option<String>,

    /// Do not exempt the identity endpoint from session refresh
    #[arg(long, env = "NO_IDENTITY_EXEMPTION")]
    pub no_identity_exemption: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Session refresh timeout in seconds
    #[arg(long, env = "REFRESH_TIMEOUT", default_value = "30")]
    pub refresh_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Send a request through the authenticated client
    Request {
        /// HTTP method
        method: String,

        /// Path relative to the API base URL
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Store a bearer token obtained elsewhere
    Login {
        /// Token value; prompted for when omitted
        #[arg(short, long, env = "AUTH_TOKEN")]
        token: Option<String>,
    },

    /// Remove the stored token
    Logout,

    /// Ask the server who the current session belongs to
    Whoami,
}

#[derive(Clone, Debug)]
pub struct Config {
    // API endpoints
    pub api_url: String,
    pub refresh_path: String,
    pub identity_path: Option<String>,
    pub login_route: String,

    // Credential storage
    pub storage: StorageKind,
    pub storage_key: String,
    pub storage_file: PathBuf,
    pub cookie_max_age_days: i64,

    // Timeouts
    pub refresh_timeout: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    pub log_level: String,
    pub log_json: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StorageKind {
    Local,  // JSON key/value file
    Cookie, // Cookie with expiry, mirrored to a file
    Memory, // Process lifetime only
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load(args: &CliArgs) -> Result<Self> {
        let storage = parse_storage_kind(&args.storage);

        let config = Config {
            api_url: args
                .api_url
                .clone()
                .or_else(|| std::env::var("REACT_APP_API_URL").ok())
                .or_else(|| std::env::var("VITE_API_URL").ok())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),

            refresh_path: std::env::var("REFRESH_PATH")
                .unwrap_or_else(|_| "/auth/refresh-token".to_string()),

            identity_path: if args.no_identity_exemption {
                None
            } else {
                Some(std::env::var("IDENTITY_PATH").unwrap_or_else(|_| "/auth/me".to_string()))
            },

            login_route: std::env::var("LOGIN_ROUTE").unwrap_or_else(|_| "/login".to_string()),

            storage_key: std::env::var("TOKEN_STORAGE_KEY")
                .unwrap_or_else(|_| "token".to_string()),

            storage_file: args
                .storage_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(|| default_storage_file(&storage)),

            storage,

            cookie_max_age_days: std::env::var("COOKIE_MAX_AGE_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(7),

            refresh_timeout: args.refresh_timeout,

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level.clone(),

            log_json: args.log_format.eq_ignore_ascii_case("json"),
        };

        Ok(config)
    }

    /// Defaults for the given API base URL, in-memory storage
    pub fn for_api_url(api_url: impl Into<String>) -> Self {
        Config {
            api_url: api_url.into(),
            refresh_path: "/auth/refresh-token".to_string(),
            identity_path: Some("/auth/me".to_string()),
            login_route: "/login".to_string(),
            storage: StorageKind::Memory,
            storage_key: "token".to_string(),
            storage_file: default_storage_file(&StorageKind::Memory),
            cookie_max_age_days: 7,
            refresh_timeout: 30,
            http_max_connections: 20,
            http_connect_timeout: 30,
            http_request_timeout: 60,
            log_level: "info".to_string(),
            log_json: false,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_url)
            .with_context(|| format!("API_URL is not a valid URL: {}", self.api_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("API_URL must use http or https: {}", self.api_url);
        }

        if !self.refresh_path.starts_with('/') {
            anyhow::bail!("REFRESH_PATH must start with '/': {}", self.refresh_path);
        }

        if let Some(identity_path) = &self.identity_path {
            if !identity_path.starts_with('/') {
                anyhow::bail!("IDENTITY_PATH must start with '/': {}", identity_path);
            }
        }

        if self.storage_key.is_empty() {
            anyhow::bail!("TOKEN_STORAGE_KEY cannot be empty");
        }

        if self.refresh_timeout == 0 {
            anyhow::bail!("REFRESH_TIMEOUT must be greater than zero");
        }

        if !(1..=MAX_COOKIE_MAX_AGE_DAYS).contains(&self.cookie_max_age_days) {
            anyhow::bail!(
                "COOKIE_MAX_AGE_DAYS must be between 1 and {}: {}",
                MAX_COOKIE_MAX_AGE_DAYS,
                self.cookie_max_age_days
            );
        }

        Ok(())
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default storage file under the user's data directory
fn default_storage_file(storage: &StorageKind) -> PathBuf {
    let file_name = match storage {
        StorageKind::Cookie => "session.cookie",
        _ => "storage.json",
    };

    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("auth-session-client")
        .join(file_name)
}

/// Parse storage kind from string
fn parse_storage_kind(s: &str) -> StorageKind {
    match s.to_lowercase().as_str() {
        "cookie" | "cookies" => StorageKind::Cookie,
        "memory" => StorageKind::Memory,
        _ => StorageKind::Local, // default
    }
}
