//! Users that sessions authenticate as.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Login state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserState {
    /// Logged out; sessions wait for a login.
    LoggedOut,
    /// Logged in with a usable token.
    LoggedIn,
    /// Removed from the device.
    Removed,
}

/// The identity a session authenticates as.
///
/// Implementations usually wrap an authentication service. Sessions read
/// the access token whenever they bind and ask for a refresh when the
/// server reports it expired.
pub trait SyncUser: Send + Sync + fmt::Debug {
    /// Stable identity of the user.
    fn identity(&self) -> String;

    /// Current login state.
    fn state(&self) -> UserState;

    /// Current access token.
    fn access_token(&self) -> String;

    /// Obtains a fresh access token.
    ///
    /// # Errors
    ///
    /// Fails when the user cannot be re-authenticated.
    fn refresh_access_token(&self) -> SyncResult<String>;
}

type Refresher = Arc<dyn Fn(&str) -> SyncResult<String> + Send + Sync>;

/// A [`SyncUser`] holding a token handed to it by the application.
pub struct TokenUser {
    identity: String,
    state: Mutex<UserState>,
    token: Mutex<String>,
    refresher: Option<Refresher>,
}

impl fmt::Debug for TokenUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenUser")
            .field("identity", &self.identity)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl TokenUser {
    /// A logged-in user.
    pub fn new(identity: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: Mutex::new(UserState::LoggedIn),
            token: Mutex::new(token.into()),
            refresher: None,
        }
    }

    /// Sets how expired tokens are replaced. `f` receives the identity.
    #[must_use]
    pub fn with_refresher(mut self, f: impl Fn(&str) -> SyncResult<String> + Send + Sync + 'static) -> Self {
        self.refresher = Some(Arc::new(f));
        self
    }

    /// Logs in with `token`.
    pub fn log_in(&self, token: impl Into<String>) {
        *self.token.lock() = token.into();
        *self.state.lock() = UserState::LoggedIn;
    }

    /// Logs out. Sessions stop until the next login.
    pub fn log_out(&self) {
        *self.state.lock() = UserState::LoggedOut;
    }

    /// Marks the user removed.
    pub fn remove(&self) {
        *self.state.lock() = UserState::Removed;
    }
}

impl SyncUser for TokenUser {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn state(&self) -> UserState {
        *self.state.lock()
    }

    fn access_token(&self) -> String {
        self.token.lock().clone()
    }

    fn refresh_access_token(&self) -> SyncResult<String> {
        if self.state() != UserState::LoggedIn {
            return Err(SyncError::AuthenticationFailed(format!(
                "user {} is not logged in",
                self.identity
            )));
        }
        let refresher = self
            .refresher
            .as_ref()
            .ok_or_else(|| SyncError::AuthenticationFailed("no way to refresh the access token".into()))?;
        let token = refresher(&self.identity)?;
        *self.token.lock() = token.clone();
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_replaces_the_token() {
        let user = TokenUser::new("alice", "old").with_refresher(|identity| Ok(format!("{identity}-new")));
        assert_eq!(user.access_token(), "old");
        assert_eq!(user.refresh_access_token().unwrap(), "alice-new");
        assert_eq!(user.access_token(), "alice-new");
    }

    #[test]
    fn logged_out_users_cannot_refresh() {
        let user = TokenUser::new("bob", "t").with_refresher(|_| Ok("x".into()));
        user.log_out();
        assert_eq!(user.state(), UserState::LoggedOut);
        assert!(matches!(
            user.refresh_access_token(),
            Err(SyncError::AuthenticationFailed(_))
        ));
        user.log_in("fresh");
        assert_eq!(user.state(), UserState::LoggedIn);
        assert_eq!(user.access_token(), "fresh");
    }

    #[test]
    fn refresh_needs_a_refresher() {
        let user = TokenUser::new("carol", "t");
        assert!(user.refresh_access_token().is_err());
    }
}
