//! CSRF token cache.
//!
//! One [`CsrfTokenCache`] serves every request a [`Pipeline`](crate::Pipeline)
//! sends. Lookups resolve in this order:
//!
//! 1. join a fetch that is already in flight (all joiners get its result)
//! 2. adopt the `csrf-token` cookie from the transport's jar
//! 3. reuse the cached token while it is younger than the lifetime
//! 4. return the cached value if the last fetch is too recent
//! 5. fetch `GET /auth/csrf-token`
//!
//! Forced lookups skip steps 2-4. A failed fetch yields `None`: callers send
//! without the header and let the server decide.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::Config;
use crate::error::Result;
use crate::net::HttpClient;

/// Where a CSRF token value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfSource {
    /// Read from the `csrf-token` cookie set by the server.
    Cookie,
    /// Read from the `csrfToken` field of the token endpoint response.
    NetworkBody,
}

/// A cached anti-forgery token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken {
    value: String,
    fetched_at: Instant,
    source: CsrfSource,
}

impl CsrfToken {
    fn new(value: String, source: CsrfSource) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
            source,
        }
    }

    /// The token value to send in the CSRF header.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// When the token was obtained.
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn source(&self) -> CsrfSource {
        self.source
    }

    /// Time since the token was obtained.
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsrfTokenResponse {
    #[serde(default)]
    csrf_token: Option<String>,
}

#[derive(Default)]
struct CacheState {
    token: Option<CsrfToken>,
    last_fetch: Option<Instant>,
    in_flight: bool,
    waiters: Vec<oneshot::Sender<Option<CsrfToken>>>,
}

struct Inner {
    http: HttpClient,
    endpoint: Url,
    cookie_name: String,
    header_name: String,
    lifetime: Duration,
    min_fetch_interval: Duration,
    cookie_settle: Duration,
    state: Mutex<CacheState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cookie_token(&self) -> Option<String> {
        self.http.cookie(&self.endpoint, &self.cookie_name)
    }
}

enum Lookup {
    Ready(Option<CsrfToken>),
    Join(oneshot::Receiver<Option<CsrfToken>>),
    Fetch(FetchGuard),
}

/// Process-wide (per pipeline) single-flight CSRF token cache.
///
/// Cloning is cheap and clones share the cache.
#[derive(Clone)]
pub struct CsrfTokenCache {
    inner: Arc<Inner>,
}

impl CsrfTokenCache {
    /// Create a cache that fetches from the configured CSRF endpoint.
    pub fn new(http: HttpClient, config: &Config) -> Result<Self> {
        let endpoint = config.api_url(&config.csrf.path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoint,
                cookie_name: config.csrf.cookie_name.clone(),
                header_name: config.csrf.header_name.clone(),
                lifetime: config.csrf.lifetime(),
                min_fetch_interval: config.csrf.min_fetch_interval(),
                cookie_settle: config.csrf.cookie_settle(),
                state: Mutex::new(CacheState::default()),
            }),
        })
    }

    /// Name of the request header the token is sent in.
    pub fn header_name(&self) -> &str {
        &self.inner.header_name
    }

    /// The cached token, without any network or cookie lookup.
    pub fn current(&self) -> Option<CsrfToken> {
        self.inner.state().token.clone()
    }

    /// Drop the cached token and the rate-limit timestamp.
    pub fn invalidate(&self) {
        let mut state = self.inner.state();
        state.token = None;
        state.last_fetch = None;
    }

    /// Warm the cache ahead of the first mutating request.
    pub async fn prefetch(&self) {
        let _ = self.get_token(false).await;
    }

    /// Get a CSRF token, fetching one if needed.
    ///
    /// Never fails: a token that cannot be obtained is `None`.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_token(&self, force_refresh: bool) -> Option<CsrfToken> {
        match self.lookup(force_refresh) {
            Lookup::Ready(token) => token,
            Lookup::Join(rx) => {
                debug!("Joining in-flight CSRF token fetch");
                rx.await.ok().flatten()
            }
            Lookup::Fetch(guard) => {
                let token = self.fetch().await;
                guard.finish(token.clone());
                token
            }
        }
    }

    fn lookup(&self, force_refresh: bool) -> Lookup {
        let mut state = self.inner.state();

        // An in-flight fetch is always at least as fresh as a forced one would be.
        if state.in_flight {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            return Lookup::Join(rx);
        }

        if !force_refresh {
            if let Some(value) = self.inner.cookie_token() {
                let adopted = match state.token.take() {
                    Some(existing) if existing.value == value => existing,
                    _ => {
                        debug!("Adopted CSRF token from cookie");
                        CsrfToken::new(value, CsrfSource::Cookie)
                    }
                };
                state.token = Some(adopted.clone());
                return Lookup::Ready(Some(adopted));
            }

            if let Some(token) = state.token.as_ref() {
                if token.age() < self.inner.lifetime {
                    return Lookup::Ready(Some(token.clone()));
                }
            }

            if let Some(last) = state.last_fetch {
                if last.elapsed() < self.inner.min_fetch_interval {
                    debug!("CSRF token fetched too recently; returning cached value");
                    return Lookup::Ready(state.token.clone());
                }
            }
        }

        state.in_flight = true;
        state.last_fetch = Some(Instant::now());
        Lookup::Fetch(FetchGuard {
            inner: Arc::clone(&self.inner),
            settled: false,
        })
    }

    async fn fetch(&self) -> Option<CsrfToken> {
        let inner = &self.inner;
        debug!(url = %inner.endpoint, "Fetching CSRF token");

        let response = match inner.http.inner().get(inner.endpoint.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "CSRF token fetch failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "CSRF token endpoint returned an error");
            return None;
        }

        let body = match response.bytes().await {
            Ok(bytes) => serde_json::from_slice::<CsrfTokenResponse>(&bytes)
                .ok()
                .and_then(|b| b.csrf_token)
                .filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read CSRF token response");
                None
            }
        };

        if !inner.cookie_settle.is_zero() {
            tokio::time::sleep(inner.cookie_settle).await;
        }

        if let Some(value) = inner.cookie_token() {
            debug!("CSRF token taken from cookie");
            Some(CsrfToken::new(value, CsrfSource::Cookie))
        } else if let Some(value) = body {
            debug!("CSRF token taken from response body");
            Some(CsrfToken::new(value, CsrfSource::NetworkBody))
        } else {
            warn!("CSRF token response carried neither a cookie nor a token field");
            None
        }
    }
}

impl std::fmt::Debug for CsrfTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("CsrfTokenCache")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("has_token", &state.token.is_some())
            .field("in_flight", &state.in_flight)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Owns the in-flight flag for one fetch.
///
/// Dropping it without [`finish`](FetchGuard::finish) (the fetching future was
/// cancelled) clears the flag and releases waiters with `None`.
struct FetchGuard {
    inner: Arc<Inner>,
    settled: bool,
}

impl FetchGuard {
    fn finish(mut self, token: Option<CsrfToken>) {
        self.settle(token);
    }

    fn settle(&mut self, token: Option<CsrfToken>) {
        if self.settled {
            return;
        }
        self.settled = true;

        let waiters = {
            let mut state = self.inner.state();
            if let Some(token) = token.as_ref() {
                state.token = Some(token.clone());
            }
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        if !waiters.is_empty() {
            debug!(waiters = waiters.len(), "Releasing CSRF token waiters");
        }
        for waiter in waiters {
            let _ = waiter.send(token.clone());
        }
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        self.settle(None);
    }
}
