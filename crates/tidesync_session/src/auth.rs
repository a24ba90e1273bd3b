//! Access token acquisition.

use crate::user::{AccessToken, SyncUser};
use std::sync::Arc;
use tidesync_protocol::{ErrorCode, Status};

/// Receives the result of an access token request. Called at most once.
pub type AccessTokenReply = Box<dyn FnOnce(Result<AccessToken, Status>) + Send + 'static>;

/// Obtains access tokens for sessions.
///
/// Implementations may reply synchronously on the calling thread or later
/// from any thread. Replies arriving after the session moved on are
/// discarded by the session.
pub trait AccessTokenProvider: Send + Sync {
    /// Requests a token for `user`.
    fn request_access_token(&self, user: &Arc<SyncUser>, reply: AccessTokenReply);
}

/// Replies immediately with the token the user currently holds.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserTokenProvider;

impl AccessTokenProvider for UserTokenProvider {
    fn request_access_token(&self, user: &Arc<SyncUser>, reply: AccessTokenReply) {
        match user.access_token() {
            Some(token) => reply(Ok(token)),
            None => reply(Err(Status::new(
                ErrorCode::ClientUserNotLoggedIn,
                format!("user '{}' is not logged in", user.identity()),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn request(user: &Arc<SyncUser>) -> Result<AccessToken, Status> {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        UserTokenProvider.request_access_token(
            user,
            Box::new(move |result| {
                *sink.lock() = Some(result);
            }),
        );
        let result = slot.lock().take();
        result.expect("provider replies synchronously")
    }

    #[test]
    fn replies_with_current_token() {
        let user = SyncUser::new("alice", AccessToken::new("t0"));
        assert_eq!(request(&user), Ok(AccessToken::new("t0")));
    }

    #[test]
    fn logged_out_user_fails() {
        let user = SyncUser::new("alice", AccessToken::new("t0"));
        user.log_out();
        let err = request(&user).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ClientUserNotLoggedIn);
    }
}
