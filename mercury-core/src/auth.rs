//! Bearer credentials for the event connection
//!
//! Obtaining and refreshing tokens belongs to the application; the supervisor
//! only asks for the current one each time it builds a new connection.

use futures::future::BoxFuture;

/// Source of bearer tokens.
///
/// The returned future may resolve to `None`, e.g. when the user logged out
/// while the request was in flight. It is polled off the supervisor task.
pub trait AccessTokenProvider: Send + Sync {
    fn access_token(&self) -> BoxFuture<'static, Option<String>>;
}

/// Provider that always hands out the same token
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Provider for a logged-out session
    pub fn none() -> Self {
        Self { token: None }
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    fn access_token(&self) -> BoxFuture<'static, Option<String>> {
        let token = self.token.clone().filter(|t| !t.is_empty());
        Box::pin(async move { token })
    }
}
