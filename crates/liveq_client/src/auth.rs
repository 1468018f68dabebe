//! Credential lifecycle: token fetching, the identity version, and the
//! retry-once policy for server-side auth rejections.
//!
//! The controller itself is synchronous. The worker owns the in-flight
//! fetch future and pauses the socket while it runs, so no query
//! traffic is attributed to a half-switched identity.

use futures::future::BoxFuture;
use liveq_protocol::{AuthToken, ClientMessage};

/// Supplies credentials on demand.
///
/// `force_refresh` is set when the server rejected the previous token,
/// telling providers to bypass their cache.
pub trait TokenFetcher: Send {
    /// Fetches a credential, or `None` when the user is signed out or
    /// the provider failed.
    fn fetch_token(&mut self, force_refresh: bool) -> BoxFuture<'static, Option<String>>;
}

impl<F> TokenFetcher for F
where
    F: FnMut(bool) -> BoxFuture<'static, Option<String>> + Send,
{
    fn fetch_token(&mut self, force_refresh: bool) -> BoxFuture<'static, Option<String>> {
        (self)(force_refresh)
    }
}

/// Where the connection stands with respect to authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No credential presented, or the last one was withdrawn.
    Unauthenticated,
    /// A token fetch is in flight; query traffic is paused.
    Pausing,
    /// A credential has been presented and not rejected.
    Authenticated,
}

/// The outcome of a finished token fetch.
#[derive(Debug)]
pub struct FetchOutcome {
    /// The `Authenticate` to send before any buffered query traffic,
    /// when a credential was produced.
    pub message: Option<ClientMessage>,
    /// The value to report through the auth-change callback.
    pub authenticated: bool,
}

/// Tracks the identity version and the fetch/retry state machine.
#[derive(Debug)]
pub struct AuthController {
    state: AuthState,
    identity_version: u64,
    retried: bool,
}

impl AuthController {
    /// Creates an unauthenticated controller at identity version zero.
    pub fn new() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            identity_version: 0,
            retried: false,
        }
    }

    /// The current auth state.
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// The identity version the next `Authenticate` will carry.
    pub fn identity_version(&self) -> u64 {
        self.identity_version
    }

    /// Marks a fetch as started. The worker pauses the socket for the
    /// duration.
    pub fn begin_fetch(&mut self) {
        self.state = AuthState::Pausing;
    }

    /// Consumes a finished fetch.
    ///
    /// A produced token becomes an `Authenticate` tagged with the
    /// current identity version, which then advances. A missing token
    /// leaves the connection unauthenticated without disturbing the
    /// subscription set.
    pub fn finish_fetch(&mut self, token: Option<String>) -> FetchOutcome {
        match token {
            Some(token) => {
                let message = ClientMessage::Authenticate {
                    base_version: self.identity_version,
                    token: AuthToken::User(token),
                };
                self.identity_version += 1;
                self.state = AuthState::Authenticated;
                FetchOutcome {
                    message: Some(message),
                    authenticated: true,
                }
            }
            None => {
                self.state = AuthState::Unauthenticated;
                self.retried = false;
                FetchOutcome {
                    message: None,
                    authenticated: false,
                }
            }
        }
    }

    /// Records the identity version a transition carried.
    ///
    /// A credential only earns back its forced-refresh retry once the
    /// server has applied it; a fetch that merely completed proves
    /// nothing, and resetting there would refetch a rejected token
    /// forever.
    pub fn observe_identity(&mut self, identity: u64) {
        if self.state == AuthState::Authenticated && identity >= self.identity_version {
            self.retried = false;
        }
    }

    /// Withdraws the credential. Returns the `Authenticate` clearing it
    /// on the server.
    pub fn clear(&mut self) -> ClientMessage {
        let message = ClientMessage::Authenticate {
            base_version: self.identity_version,
            token: AuthToken::None,
        };
        self.identity_version += 1;
        self.state = AuthState::Unauthenticated;
        self.retried = false;
        message
    }

    /// Handles a server `AuthError`.
    ///
    /// The first rejection of a credential earns one forced-refresh
    /// retry; a second consecutive rejection gives up and reports
    /// unauthenticated. Returns true when the caller should start a
    /// forced-refresh fetch.
    pub fn auth_error(&mut self, error: &str) -> bool {
        tracing::warn!(error, "server rejected credential");
        if self.state == AuthState::Unauthenticated {
            return false;
        }
        if self.retried {
            self.state = AuthState::Unauthenticated;
            self.retried = false;
            return false;
        }
        self.retried = true;
        self.state = AuthState::Pausing;
        true
    }
}

impl Default for AuthController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_fetch_advances_identity_version() {
        let mut auth = AuthController::new();
        auth.begin_fetch();
        assert_eq!(auth.state(), AuthState::Pausing);

        let outcome = auth.finish_fetch(Some("jwt-1".into()));
        assert!(outcome.authenticated);
        assert_eq!(
            outcome.message,
            Some(ClientMessage::Authenticate {
                base_version: 0,
                token: AuthToken::User("jwt-1".into()),
            })
        );
        assert_eq!(auth.state(), AuthState::Authenticated);
        assert_eq!(auth.identity_version(), 1);
    }

    #[test]
    fn failed_fetch_reports_unauthenticated() {
        let mut auth = AuthController::new();
        auth.begin_fetch();
        let outcome = auth.finish_fetch(None);
        assert!(!outcome.authenticated);
        assert!(outcome.message.is_none());
        assert_eq!(auth.state(), AuthState::Unauthenticated);
        assert_eq!(auth.identity_version(), 0);
    }

    #[test]
    fn clear_sends_none_token() {
        let mut auth = AuthController::new();
        auth.begin_fetch();
        auth.finish_fetch(Some("jwt".into()));

        let message = auth.clear();
        assert_eq!(
            message,
            ClientMessage::Authenticate {
                base_version: 1,
                token: AuthToken::None,
            }
        );
        assert_eq!(auth.state(), AuthState::Unauthenticated);
    }

    #[test]
    fn auth_error_retries_once() {
        let mut auth = AuthController::new();
        auth.begin_fetch();
        auth.finish_fetch(Some("stale".into()));

        // First rejection earns a forced refresh.
        assert!(auth.auth_error("token expired"));
        assert_eq!(auth.state(), AuthState::Pausing);

        // Retry fetch also gets rejected.
        auth.finish_fetch(Some("still-stale".into()));
        assert!(!auth.auth_error("token expired"));
        assert_eq!(auth.state(), AuthState::Unauthenticated);
    }

    #[test]
    fn confirmed_credential_restores_the_budget() {
        let mut auth = AuthController::new();
        auth.begin_fetch();
        auth.finish_fetch(Some("jwt-1".into()));

        // The server applies the credential.
        auth.observe_identity(1);

        // A later rejection of the confirmed credential earns a fresh
        // forced-refresh retry.
        assert!(auth.auth_error("token expired"));
        assert_eq!(auth.state(), AuthState::Pausing);
    }

    #[test]
    fn stale_identity_does_not_restore_the_budget() {
        let mut auth = AuthController::new();
        auth.begin_fetch();
        auth.finish_fetch(Some("stale".into()));

        assert!(auth.auth_error("token expired"));
        auth.finish_fetch(Some("still-stale".into()));

        // A transition from before the refetch confirms nothing.
        auth.observe_identity(1);
        assert!(!auth.auth_error("token expired"));
    }

    #[test]
    fn auth_error_while_unauthenticated_is_ignored() {
        let mut auth = AuthController::new();
        assert!(!auth.auth_error("who are you"));
    }
}
