//! Login, logout and token refresh.
//!
//! These calls talk to the auth endpoints directly through the transport and
//! never pass through the [`Pipeline`](crate::Pipeline): a refresh can
//! therefore never trigger another refresh.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::claims;
use crate::auth::session::{CredentialStore, Session, SessionState, User};
use crate::config::Config;
use crate::csrf::CsrfTokenCache;
use crate::error::{Error, Result};
use crate::net::HttpClient;
use crate::pipeline::recovery::body_message;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user: Option<User>,
}

impl TokenResponse {
    /// Turn the body into a session, falling back to the token's own claims
    /// for the user.
    fn into_session(self) -> Option<Session> {
        let token = self.access_token.filter(|t| !t.is_empty())?;
        let user = self
            .user
            .filter(|u| !u.is_empty())
            .or_else(|| claims::decode_user(&token));
        Some(Session::new(token, user))
    }
}

/// Auth endpoint client.
///
/// Every successful operation updates the shared [`CredentialStore`].
#[derive(Clone)]
pub struct AuthClient {
    http: HttpClient,
    csrf: CsrfTokenCache,
    credentials: CredentialStore,
    sign_in_url: Url,
    refresh_url: Url,
    sign_out_url: Url,
}

impl AuthClient {
    pub fn new(
        http: HttpClient,
        csrf: CsrfTokenCache,
        credentials: CredentialStore,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self {
            sign_in_url: config.api_url(&config.auth.sign_in_path)?,
            refresh_url: config.api_url(&config.auth.refresh_path)?,
            sign_out_url: config.api_url(&config.auth.sign_out_path)?,
            http,
            csrf,
            credentials,
        })
    }

    /// The store this client writes to.
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Sign in with email and password.
    ///
    /// Always fetches a fresh CSRF token first. A rejected or unusable
    /// response is an [`Error::Authentication`] and is never retried.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let previous = self.credentials.state().await;
        self.credentials.set_state(SessionState::Authenticating).await;

        match self.sign_in(email, password).await {
            Ok(session) => {
                self.credentials.set(session.clone()).await;
                info!("Signed in");
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                self.credentials.set_state(previous).await;
                Err(e)
            }
        }
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let csrf = self.csrf.get_token(true).await;

        let mut request = self
            .http
            .inner()
            .post(self.sign_in_url.clone())
            .json(&json!({ "email": email, "password": password }));
        if let Some(token) = &csrf {
            request = request.header(self.csrf.header_name(), token.value());
        } else {
            debug!("Signing in without a CSRF token");
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(Error::Authentication {
                status: status.as_u16(),
                message: body_message(&body)
                    .unwrap_or_else(|| "Invalid credentials".to_string()),
            });
        }

        serde_json::from_slice::<TokenResponse>(&body)
            .ok()
            .and_then(TokenResponse::into_session)
            .ok_or_else(|| Error::Authentication {
                status: status.as_u16(),
                message: "Sign-in response did not include an access token".into(),
            })
    }

    /// Best-effort sign-out.
    ///
    /// Uses `token` or, when `None`, the stored access token. The store is
    /// cleared whatever the server answers.
    #[instrument(skip_all)]
    pub async fn logout(&self, token: Option<&str>) {
        let token = match token {
            Some(t) => Some(t.to_string()),
            None => self.credentials.access_token().await,
        };

        if let Some(token) = token {
            let mut request = self.http.inner().post(self.sign_out_url.clone()).bearer_auth(&token);
            if let Some(csrf) = self.csrf.get_token(false).await {
                request = request.header(self.csrf.header_name(), csrf.value());
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => debug!("Server sign-out accepted"),
                Ok(response) => warn!(
                    status = response.status().as_u16(),
                    "Server sign-out rejected; clearing local session anyway"
                ),
                Err(e) => warn!(error = %e, "Server sign-out failed; clearing local session anyway"),
            }
        }

        self.credentials.clear().await;
        info!("Signed out");
    }

    /// Exchange the long-lived refresh cookie for a new access token.
    ///
    /// On failure the store is cleared and the error is returned unchanged.
    /// Only the pipeline's refresh driver calls this; everyone else goes
    /// through [`Pipeline::refresh_session`](crate::Pipeline::refresh_session).
    #[instrument(skip_all)]
    pub(crate) async fn refresh(&self) -> Result<Session> {
        self.credentials.set_state(SessionState::Refreshing).await;

        match self.request_refresh().await {
            Ok(session) => {
                self.credentials.set(session.clone()).await;
                info!("Access token refreshed");
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed; clearing session");
                self.credentials.clear().await;
                Err(e)
            }
        }
    }

    async fn request_refresh(&self) -> Result<Session> {
        let mut request = self.http.inner().post(self.refresh_url.clone());
        if let Some(csrf) = self.csrf.get_token(false).await {
            request = request.header(self.csrf.header_name(), csrf.value());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(Error::api(status.as_u16(), String::from_utf8_lossy(&body)));
        }

        serde_json::from_slice::<TokenResponse>(&body)?
            .into_session()
            .ok_or_else(|| Error::Authentication {
                status: status.as_u16(),
                message: "Refresh response did not include an access token".into(),
            })
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("sign_in_url", &self.sign_in_url.as_str())
            .field("refresh_url", &self.refresh_url.as_str())
            .field("sign_out_url", &self.sign_out_url.as_str())
            .finish()
    }
}
