//! Configuration for the sync client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with a machine-readable reason string when the
/// server closes the socket abnormally.
///
/// Unstable surface: reason strings are server-defined and may change.
pub type ServerDisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked when the authentication state settles, with `true`
/// for authenticated and `false` for not authenticated.
pub type AuthChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Configuration for a sync client.
///
/// Anything dial-specific (endpoint, handshake headers, client
/// identification) belongs to the connector, which the caller
/// constructs.
#[derive(Clone)]
pub struct ClientConfig {
    /// Inactivity window after which the socket is presumed dead.
    pub heartbeat_timeout: Duration,
    /// Base reconnect delay after a client-initiated close.
    pub client_close_base_backoff: Duration,
    /// Cap on the reconnect delay.
    pub max_backoff: Duration,
    /// Invoked when the server closes the socket with an abnormal code
    /// and a machine-readable reason.
    pub on_server_disconnect: Option<ServerDisconnectCallback>,
    /// Invoked when authentication settles.
    pub on_auth_change: Option<AuthChangeCallback>,
}

impl ClientConfig {
    /// Creates a configuration with default timings.
    pub fn new() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            client_close_base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(16000),
            on_server_disconnect: None,
            on_auth_change: None,
        }
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the reconnect delay cap.
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Sets the server-disconnect callback.
    pub fn with_on_server_disconnect(mut self, callback: ServerDisconnectCallback) -> Self {
        self.on_server_disconnect = Some(callback);
        self
    }

    /// Sets the auth-change callback.
    pub fn with_on_auth_change(mut self, callback: AuthChangeCallback) -> Self {
        self.on_auth_change = Some(callback);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("client_close_base_backoff", &self.client_close_base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field(
                "on_server_disconnect",
                &self.on_server_disconnect.as_ref().map(|_| "<callback>"),
            )
            .field(
                "on_auth_change",
                &self.on_auth_change.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.max_backoff, Duration::from_millis(16000));
        assert_eq!(config.client_close_base_backoff, Duration::from_millis(100));
    }

    #[test]
    fn config_builder() {
        let config = ClientConfig::new()
            .with_heartbeat_timeout(Duration::from_secs(5))
            .with_max_backoff(Duration::from_secs(2));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.max_backoff, Duration::from_secs(2));
    }
}
