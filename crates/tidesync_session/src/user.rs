//! Sync users and their access tokens.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Login state of a [`SyncUser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    /// The user holds a valid refresh token.
    LoggedIn,
    /// The user logged out and can log in again.
    LoggedOut,
    /// The user was removed and will never log in again.
    Removed,
}

/// An opaque access token.
///
/// The token value is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a token value.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(<{} bytes>)", self.0.len())
    }
}

/// Receives login state changes of a [`SyncUser`].
///
/// Callbacks run on the thread that changed the user, after the user's
/// internal lock has been released.
pub trait UserObserver: Send + Sync {
    /// The user logged out or was removed.
    fn user_logged_out(&self);

    /// The user logged in again.
    fn user_logged_in(&self);

    /// The user's access token changed while logged in.
    fn access_token_refreshed(&self, token: &AccessToken);
}

struct UserInner {
    state: UserState,
    access_token: Option<AccessToken>,
    observers: Vec<Weak<dyn UserObserver>>,
}

/// A user whose credentials authorize sync sessions.
pub struct SyncUser {
    identity: String,
    inner: Mutex<UserInner>,
}

impl SyncUser {
    /// Creates a logged-in user.
    pub fn new(identity: impl Into<String>, access_token: AccessToken) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            inner: Mutex::new(UserInner {
                state: UserState::LoggedIn,
                access_token: Some(access_token),
                observers: Vec::new(),
            }),
        })
    }

    /// Returns the user identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the login state.
    pub fn state(&self) -> UserState {
        self.inner.lock().state
    }

    /// Returns true if the user is logged in.
    pub fn is_logged_in(&self) -> bool {
        self.state() == UserState::LoggedIn
    }

    /// Returns the current access token, if logged in.
    pub fn access_token(&self) -> Option<AccessToken> {
        let inner = self.inner.lock();
        match inner.state {
            UserState::LoggedIn => inner.access_token.clone(),
            _ => None,
        }
    }

    /// Registers an observer. Dropped observers are pruned lazily.
    pub fn add_observer(&self, observer: Weak<dyn UserObserver>) {
        self.inner.lock().observers.push(observer);
    }

    /// Logs the user out. No-op unless logged in.
    pub fn log_out(&self) {
        let observers = {
            let mut inner = self.inner.lock();
            if inner.state != UserState::LoggedIn {
                return;
            }
            inner.state = UserState::LoggedOut;
            inner.access_token = None;
            Self::live_observers(&mut inner)
        };
        debug!(user = %self.identity, "user logged out");
        for observer in observers {
            observer.user_logged_out();
        }
    }

    /// Logs the user in with a fresh token. No-op once removed.
    pub fn log_in(&self, access_token: AccessToken) {
        let state = self.state();
        match state {
            UserState::Removed => {}
            UserState::LoggedIn => self.update_access_token(access_token),
            UserState::LoggedOut => {
                let observers = {
                    let mut inner = self.inner.lock();
                    if inner.state != UserState::LoggedOut {
                        return;
                    }
                    inner.state = UserState::LoggedIn;
                    inner.access_token = Some(access_token);
                    Self::live_observers(&mut inner)
                };
                debug!(user = %self.identity, "user logged in");
                for observer in observers {
                    observer.user_logged_in();
                }
            }
        }
    }

    /// Replaces the access token of a logged-in user.
    pub fn update_access_token(&self, access_token: AccessToken) {
        let observers = {
            let mut inner = self.inner.lock();
            if inner.state != UserState::LoggedIn {
                return;
            }
            inner.access_token = Some(access_token.clone());
            Self::live_observers(&mut inner)
        };
        for observer in observers {
            observer.access_token_refreshed(&access_token);
        }
    }

    /// Removes the user permanently.
    pub fn remove(&self) {
        let (was_logged_in, observers) = {
            let mut inner = self.inner.lock();
            if inner.state == UserState::Removed {
                return;
            }
            let was_logged_in = inner.state == UserState::LoggedIn;
            inner.state = UserState::Removed;
            inner.access_token = None;
            (was_logged_in, Self::live_observers(&mut inner))
        };
        debug!(user = %self.identity, "user removed");
        if was_logged_in {
            for observer in observers {
                observer.user_logged_out();
            }
        }
    }

    fn live_observers(inner: &mut UserInner) -> Vec<Arc<dyn UserObserver>> {
        inner.observers.retain(|weak| weak.strong_count() > 0);
        inner.observers.iter().filter_map(Weak::upgrade).collect()
    }
}

impl fmt::Debug for SyncUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncUser")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}
