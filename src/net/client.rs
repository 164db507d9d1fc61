//! HTTP transport with a shared cookie jar.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, ClientBuilder};
use url::Url;

use crate::config::Config;

/// Default user agent for the application.
pub const USER_AGENT: &str = concat!("tollgate/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// reqwest client plus the cookie jar it reads and writes.
///
/// The jar holds the server-set `csrf-token` cookie and the httpOnly refresh
/// cookie. Clones share both the connection pool and the jar.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    jar: Arc<Jar>,
}

impl HttpClient {
    /// Create a new HTTP client with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new builder.
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Build a client from the `[api]` section of the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::builder()
            .user_agent(&config.api.user_agent)
            .connect_timeout(config.connect_timeout())
            .request_timeout(config.request_timeout())
            .build()
    }

    /// Get the inner reqwest client.
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    /// Get the cookie jar shared with the inner client.
    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    /// Value of the cookie `name` the jar would send to `url`.
    pub fn cookie(&self, url: &Url, name: &str) -> Option<String> {
        let header = self.jar.cookies(url)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name && !value.is_empty()).then(|| value.to_string())
        })
    }

    /// Store a cookie as if `url` had sent `Set-Cookie: {cookie}`.
    pub fn set_cookie(&self, url: &Url, cookie: &str) {
        self.jar.add_cookie_str(cookie, url);
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    builder: ClientBuilder,
    jar: Arc<Jar>,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            builder: Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT),
            jar: Arc::new(Jar::default()),
        }
    }
}

impl HttpClientBuilder {
    /// Set a custom user agent.
    pub fn user_agent(mut self, ua: &str) -> Self {
        self.builder = self.builder.user_agent(ua);
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.connect_timeout(timeout);
        self
    }

    /// Set request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.timeout(timeout);
        self
    }

    /// Share an existing cookie jar.
    pub fn cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.jar = jar;
        self
    }

    /// Build the client.
    pub fn build(self) -> HttpClient {
        let inner = match self.builder.cookie_provider(Arc::clone(&self.jar)).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    "Failed to build HTTP client with custom config: {}; using defaults",
                    e
                );
                Client::builder()
                    .cookie_provider(Arc::clone(&self.jar))
                    .build()
                    .unwrap_or_default()
            }
        };
        HttpClient {
            inner,
            jar: self.jar,
        }
    }
}
