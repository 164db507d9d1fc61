//! Session credentials and the auth endpoints that change them.
//!
//! - [`CredentialStore`] - the one current [`Session`] (token + user)
//! - [`AuthClient`] - login, logout and refresh against the auth endpoints
//! - [`store`] - optional persistent mirror of the session
//! - [`claims`] - unverified JWT claim decoding for the user

pub mod claims;
pub mod client;
pub mod session;
pub mod store;

pub use client::AuthClient;
pub use session::{CredentialStore, Session, SessionState, User};
pub use store::{FileTokenMirror, MemoryTokenMirror, TokenMirror};
