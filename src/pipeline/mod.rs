//! The request pipeline every API call goes through.
//!
//! Outbound, a request gets the CSRF header (mutating verbs only), the bearer
//! token and a correlation id. Inbound, two failures are recovered, each at
//! most once per request:
//!
//! - **CSRF rejection** (403/419 mentioning the token): force a new CSRF
//!   token and replay.
//! - **Access-token expiry** (401 with the configured message): park the
//!   request behind a single refresh and replay it with the new token. Parked
//!   requests are replayed concurrently, started in the order they parked.
//!
//! Everything else reaches the caller as [`Error::Api`].
//!
//! # Example
//!
//! ```no_run
//! use tollgate::{Config, Pipeline};
//!
//! # async fn run() -> tollgate::Result<()> {
//! let pipeline = Pipeline::builder(Config::with_base_url("https://shop.test/api")).build()?;
//! pipeline.login("admin@shop.test", "secret").await?;
//! let products: serde_json::Value = pipeline.get("/products").send_json().await?;
//! # let _ = products;
//! # Ok(())
//! # }
//! ```

pub mod navigator;
pub mod recovery;
pub mod refresh;
pub mod request;

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthClient, CredentialStore, FileTokenMirror, Session};
use crate::bootstrap::SessionBootstrap;
use crate::config::Config;
use crate::csrf::CsrfTokenCache;
use crate::error::{Error, Result};
use crate::net::HttpClient;

pub use navigator::{LogNavigator, Navigator};
pub use recovery::Recovery;
pub use refresh::RefreshCoordinator;
pub use request::{ApiRequest, ApiResponse, RecoveryPolicy, RequestContext};

use refresh::{PendingRequest, RefreshGuard, RefreshOutcome};

const REQUEST_ID_HEADER: &str = "x-request-id";

struct Inner {
    config: Config,
    http: HttpClient,
    csrf: CsrfTokenCache,
    credentials: CredentialStore,
    auth: AuthClient,
    refresh: Arc<RefreshCoordinator>,
    navigator: Arc<dyn Navigator>,
    bootstrap: SessionBootstrap,
}

/// Shared entry point for API calls. Cloning is cheap and clones share all
/// state (CSRF cache, session, refresh queue).
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn http(&self) -> &HttpClient {
        &self.inner.http
    }

    pub fn csrf(&self) -> &CsrfTokenCache {
        &self.inner.csrf
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn auth(&self) -> &AuthClient {
        &self.inner.auth
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.inner.refresh
    }

    /// Sign in. See [`AuthClient::login`].
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        self.inner.auth.login(email, password).await
    }

    /// Sign out with the stored token. See [`AuthClient::logout`].
    pub async fn logout(&self) {
        self.inner.auth.logout(None).await
    }

    /// Restore a session once per pipeline. See [`SessionBootstrap::restore`].
    pub async fn restore_session(&self) -> bool {
        self.inner
            .bootstrap
            .restore(|| self.refresh_session())
            .await
    }

    /// Exchange the refresh cookie for a new access token.
    ///
    /// Joins the refresh already running for expired requests, if any, so
    /// concurrent callers share one refresh call.
    pub async fn refresh_session(&self) -> Result<Session> {
        let (listener, rx) = oneshot::channel::<RefreshOutcome>();
        if self.inner.refresh.subscribe(listener) {
            info!("Refreshing session");
            tokio::spawn(self.clone().drive_refresh());
        }
        match rx.await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(error)) => Err(Error::RefreshFailed(error)),
            Err(_) => Err(Error::Cancelled),
        }
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, ApiRequest::new(method, path))
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    /// Send a prepared request through the pipeline.
    #[instrument(
        skip_all,
        fields(method = %request.method, path = %request.path, request_id = %request.context.request_id())
    )]
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.execute(request).await
    }

    // Boxed so the refresh task (which replays through here) has a nameable,
    // Send future type.
    fn execute(&self, mut request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse>> {
        async move {
            loop {
                let response = self.dispatch(&mut request).await?;
                if response.status().is_success() {
                    return Ok(response);
                }

                let status = response.status().as_u16();
                let message = recovery::body_message(response.body());
                let action = recovery::classify(
                    status,
                    message.as_deref(),
                    &request.context,
                    &self.inner.config.auth.expiry_message,
                );

                match action {
                    Recovery::CsrfRetry => {
                        request.context.mark_applied(RecoveryPolicy::CsrfRetry);
                        warn!(status, "CSRF token rejected; fetching a new one and retrying");
                        // Never resend the rejected value, even if the fetch fails.
                        self.inner.csrf.invalidate();
                        let _ = self.inner.csrf.get_token(true).await;
                    }
                    Recovery::AuthRefresh => {
                        request.context.mark_applied(RecoveryPolicy::AuthRefresh);
                        let current = self.inner.credentials.access_token().await;
                        if current.is_some() && current.as_deref() != request.context.bearer() {
                            debug!("Access token changed since dispatch; replaying");
                            continue;
                        }
                        return self.wait_for_refresh(request).await;
                    }
                    Recovery::Propagate => return Err(response.into_error()),
                }
            }
        }
        .boxed()
    }

    async fn dispatch(&self, request: &mut ApiRequest) -> Result<ApiResponse> {
        let url = self.inner.config.api_url(&request.path)?;
        let mut builder = self
            .inner
            .http
            .inner()
            .request(request.method.clone(), url)
            .headers(request.headers.clone());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        if request.is_mutating() && !request.context.skips_csrf() {
            match self.inner.csrf.get_token(false).await {
                Some(token) => builder = builder.header(self.inner.csrf.header_name(), token.value()),
                None => debug!("No CSRF token available; sending without one"),
            }
        }

        let bearer = self.inner.credentials.access_token().await;
        if let Some(token) = &bearer {
            builder = builder.bearer_auth(token);
        }
        request.context.record_attempt(bearer);
        builder = builder.header(REQUEST_ID_HEADER, request.context.request_id().to_string());

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        debug!(
            status = status.as_u16(),
            attempt = request.context.attempts(),
            "Response received"
        );
        Ok(ApiResponse::new(status, headers, body))
    }

    async fn wait_for_refresh(&self, request: ApiRequest) -> Result<ApiResponse> {
        let (reply, rx) = oneshot::channel();
        if self.inner.refresh.enqueue(PendingRequest { request, reply }) {
            info!("Access token expired; refreshing");
            tokio::spawn(self.clone().drive_refresh());
        }
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    async fn drive_refresh(self) {
        let guard = RefreshGuard::new(Arc::clone(&self.inner.refresh));
        let outcome = self.inner.auth.refresh().await.map_err(Arc::new);
        let settled = guard.settle();

        for listener in settled.listeners {
            let _ = listener.send(outcome.clone());
        }

        match outcome {
            Ok(_) => {
                debug!(replaying = settled.requests.len(), "Replaying parked requests");
                let this = &self;
                let replays = settled.requests.into_iter().map(|pending| async move {
                    let result = this.execute(pending.request).await;
                    let _ = pending.reply.send(result);
                });
                join_all(replays).await;
            }
            Err(error) => {
                if settled.requests.is_empty() {
                    return;
                }
                warn!(
                    rejected = settled.requests.len(),
                    error = %error,
                    "Refresh failed; rejecting parked requests"
                );
                for pending in settled.requests {
                    let _ = pending
                        .reply
                        .send(Err(Error::RefreshFailed(Arc::clone(&error))));
                }
                self.inner
                    .navigator
                    .redirect_to_login(&self.inner.config.auth.login_route);
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("base_url", &self.inner.config.api.base_url)
            .field("csrf", &self.inner.csrf)
            .field("credentials", &self.inner.credentials)
            .field("refresh", &self.inner.refresh)
            .finish()
    }
}

/// Assembles a [`Pipeline`]. Unset parts are built from the config.
pub struct PipelineBuilder {
    config: Config,
    http: Option<HttpClient>,
    credentials: Option<CredentialStore>,
    navigator: Option<Arc<dyn Navigator>>,
}

impl PipelineBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            http: None,
            credentials: None,
            navigator: None,
        }
    }

    /// Use a prepared transport (shared cookie jar, custom timeouts).
    pub fn http_client(mut self, http: HttpClient) -> Self {
        self.http = Some(http);
        self
    }

    /// Share a credential store with other components.
    pub fn credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn navigator(mut self, navigator: impl Navigator + 'static) -> Self {
        self.navigator = Some(Arc::new(navigator));
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        config.validate()?;

        let http = self.http.unwrap_or_else(|| HttpClient::from_config(&config));
        let credentials = match (self.credentials, &config.session.mirror_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => CredentialStore::with_mirror(Arc::new(FileTokenMirror::new(dir))),
            (None, None) => CredentialStore::new(),
        };
        let csrf = CsrfTokenCache::new(http.clone(), &config)?;
        let auth = AuthClient::new(http.clone(), csrf.clone(), credentials.clone(), &config)?;
        let navigator = self.navigator.unwrap_or_else(|| Arc::new(LogNavigator));

        debug!(base_url = %config.api.base_url, "Pipeline ready");
        Ok(Pipeline {
            inner: Arc::new(Inner {
                bootstrap: SessionBootstrap::new(credentials.clone()),
                refresh: Arc::new(RefreshCoordinator::new()),
                config,
                http,
                csrf,
                credentials,
                auth,
                navigator,
            }),
        })
    }
}

/// Fluent builder for one request. Errors are deferred to [`send`](Self::send).
#[must_use = "requests do nothing until sent"]
pub struct RequestBuilder<'a> {
    pipeline: &'a Pipeline,
    request: ApiRequest,
    error: Option<Error>,
}

impl<'a> RequestBuilder<'a> {
    fn new(pipeline: &'a Pipeline, request: ApiRequest) -> Self {
        Self {
            pipeline,
            request,
            error: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.request.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.request.headers.insert(name, value);
            }
            _ => self.fail(Error::InvalidRequest(format!("invalid header '{name}'"))),
        }
        self
    }

    /// JSON body with a matching `Content-Type`.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        match serde_json::to_vec(body) {
            Ok(bytes) => {
                self.request.body = Some(Bytes::from(bytes));
                self.request
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Err(e) => self.fail(Error::InvalidRequest(format!("body: {e}"))),
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = Some(body.into());
        self
    }

    /// Leave the CSRF header off this request.
    pub fn skip_csrf(mut self) -> Self {
        self.request.context.set_skip_csrf(true);
        self
    }

    fn fail(&mut self, error: Error) {
        self.error.get_or_insert(error);
    }

    /// The request as it would be sent.
    pub fn build(self) -> Result<ApiRequest> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.request),
        }
    }

    pub async fn send(self) -> Result<ApiResponse> {
        let pipeline = self.pipeline;
        pipeline.send(self.build()?).await
    }

    /// Send and deserialize the JSON body of the success response.
    pub async fn send_json<T: DeserializeOwned>(self) -> Result<T> {
        self.send().await?.json()
    }
}
