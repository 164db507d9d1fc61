//! Hook for sending the user back to the login screen.

use tracing::warn;

/// Called once per failed token refresh.
///
/// The console swaps screens here; headless callers usually just log.
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self, route: &str);
}

/// Logs the redirect and does nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn redirect_to_login(&self, route: &str) {
        warn!(route, "Session could not be recovered; sign in again");
    }
}

impl<F> Navigator for F
where
    F: Fn(&str) + Send + Sync,
{
    fn redirect_to_login(&self, route: &str) {
        self(route)
    }
}
