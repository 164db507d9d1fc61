use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Base API URL baked in at build time, if the build environment provided one.
const BUILD_API_URL: Option<&str> = option_env!("TOLLGATE_API_URL");

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "api.base_url") is overridden by an env var.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// CSRF token endpoint, transport names and cache timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CsrfConfig {
    #[serde(default = "default_csrf_path")]
    pub path: String,
    #[serde(default = "default_csrf_cookie")]
    pub cookie_name: String,
    #[serde(default = "default_csrf_header")]
    pub header_name: String,
    /// Cached tokens older than this are fetched again.
    #[serde(default = "default_csrf_lifetime_secs")]
    pub lifetime_secs: u64,
    /// Non-forced lookups within this window after a fetch never hit the network.
    #[serde(default = "default_csrf_min_interval_ms")]
    pub min_fetch_interval_ms: u64,
    /// Pause after the token response so the cookie jar has the new cookie.
    #[serde(default = "default_csrf_cookie_settle_ms")]
    pub cookie_settle_ms: u64,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            path: default_csrf_path(),
            cookie_name: default_csrf_cookie(),
            header_name: default_csrf_header(),
            lifetime_secs: default_csrf_lifetime_secs(),
            min_fetch_interval_ms: default_csrf_min_interval_ms(),
            cookie_settle_ms: default_csrf_cookie_settle_ms(),
        }
    }
}

impl CsrfConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }

    pub fn min_fetch_interval(&self) -> Duration {
        Duration::from_millis(self.min_fetch_interval_ms)
    }

    pub fn cookie_settle(&self) -> Duration {
        Duration::from_millis(self.cookie_settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_sign_in_path")]
    pub sign_in_path: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_sign_out_path")]
    pub sign_out_path: String,
    /// Exact `message` the server sends with a 401 when the access token expired.
    #[serde(default = "default_expiry_message")]
    pub expiry_message: String,
    /// Where the console sends the user when the session cannot be recovered.
    #[serde(default = "default_login_route")]
    pub login_route: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            sign_in_path: default_sign_in_path(),
            refresh_path: default_refresh_path(),
            sign_out_path: default_sign_out_path(),
            expiry_message: default_expiry_message(),
            login_route: default_login_route(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Directory for the persistent session mirror. Unset keeps the session in memory only.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_base_url() -> String {
    BUILD_API_URL.unwrap_or("http://localhost:3000/api").to_string()
}
fn default_user_agent() -> String {
    format!("tollgate/{}", env!("CARGO_PKG_VERSION"))
}
const fn default_connect_timeout_secs() -> u64 {
    10
}
const fn default_request_timeout_secs() -> u64 {
    60
}
fn default_csrf_path() -> String {
    "/auth/csrf-token".to_string()
}
fn default_csrf_cookie() -> String {
    "csrf-token".to_string()
}
fn default_csrf_header() -> String {
    "X-CSRF-Token".to_string()
}
const fn default_csrf_lifetime_secs() -> u64 {
    25 * 60
}
const fn default_csrf_min_interval_ms() -> u64 {
    1_000
}
const fn default_csrf_cookie_settle_ms() -> u64 {
    50
}
fn default_sign_in_path() -> String {
    "/auth/admin/sign-in".to_string()
}
fn default_refresh_path() -> String {
    "/auth/refresh-token".to_string()
}
fn default_sign_out_path() -> String {
    "/auth/sign-out".to_string()
}
fn default_expiry_message() -> String {
    "Token expired".to_string()
}
fn default_login_route() -> String {
    "/login".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Configuration pointing at `base_url`, everything else defaulted.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.api.base_url = base_url.into();
        config
    }

    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `TOLLGATE_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that would otherwise fail on the first request.
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.api.base_url)
            .map_err(|e| Error::Config(format!("api.base_url '{}': {e}", self.api.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "api.base_url must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.auth.expiry_message.is_empty() {
            return Err(Error::Config("auth.expiry_message cannot be empty".into()));
        }
        Ok(())
    }

    /// Absolute URL for an API path, keeping any path prefix of the base URL.
    pub fn api_url(&self, path: &str) -> Result<url::Url> {
        let base = self.api.base_url.trim_end_matches('/');
        let url = if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        };
        Ok(url::Url::parse(&url)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.api.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }

        // -- API --
        env_str!("api.base_url", "TOLLGATE_API_URL", self.api.base_url);
        env_parse!(
            "api.request_timeout_secs",
            "TOLLGATE_API_TIMEOUT_SECS",
            self.api.request_timeout_secs
        );

        // -- CSRF --
        env_parse!(
            "csrf.lifetime_secs",
            "TOLLGATE_CSRF_LIFETIME_SECS",
            self.csrf.lifetime_secs
        );
        env_parse!(
            "csrf.min_fetch_interval_ms",
            "TOLLGATE_CSRF_MIN_INTERVAL_MS",
            self.csrf.min_fetch_interval_ms
        );

        // -- Auth --
        env_str!(
            "auth.expiry_message",
            "TOLLGATE_AUTH_EXPIRY_MESSAGE",
            self.auth.expiry_message
        );
        env_str!("auth.login_route", "TOLLGATE_AUTH_LOGIN_ROUTE", self.auth.login_route);

        // -- Session --
        if let Ok(val) = std::env::var("TOLLGATE_SESSION_MIRROR_DIR") {
            self.session.mirror_dir = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
            ov.record("session.mirror_dir", "TOLLGATE_SESSION_MIRROR_DIR");
        }

        // -- Logging --
        env_str!("logging.level", "TOLLGATE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "TOLLGATE_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
