//! Tollgate -- authenticated API client for the shop admin console.
//!
//! Every API call goes through a [`Pipeline`], which attaches the CSRF token
//! and bearer token, retries once on a stale CSRF token, and queues requests
//! behind a single token refresh when the access token expires.
//!
//! - [`csrf`] - single-flight CSRF token cache with cookie adoption
//! - [`auth`] - credential store, login/logout/refresh, session mirror
//! - [`pipeline`] - request pipeline and refresh coordination
//! - [`bootstrap`] - one-shot session restore at startup
//! - [`net`] - HTTP transport with a shared cookie jar
//! - [`config`] - TOML configuration with `TOLLGATE_*` overrides

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod csrf;
pub mod error;
pub mod net;
pub mod pipeline;

pub use auth::{AuthClient, CredentialStore, Session, SessionState, User};
pub use bootstrap::SessionBootstrap;
pub use config::Config;
pub use csrf::{CsrfSource, CsrfToken, CsrfTokenCache};
pub use error::{Error, Result};
pub use net::HttpClient;
pub use pipeline::{ApiRequest, ApiResponse, LogNavigator, Navigator, Pipeline, PipelineBuilder};
