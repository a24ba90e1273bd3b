//! Configuration for sessions and coordinators.

use crate::error::{SessionError, SessionResult};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// What happens to an active session when the application closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStopPolicy {
    /// Stop at once, aborting pending completion waiters.
    Immediately,
    /// Keep syncing until the process exits.
    LiveIndefinitely,
    /// Keep the session alive until local changes known at close time have
    /// been uploaded.
    #[default]
    AfterChangesUploaded,
}

/// TLS settings forwarded to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SslConfig {
    /// Whether to use TLS at all.
    pub enabled: bool,
    /// Whether to verify the server certificate.
    pub verify_server_certificate: bool,
    /// Certificate to trust instead of the system store.
    pub trust_certificate_path: Option<PathBuf>,
}

impl SslConfig {
    /// TLS disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            verify_server_certificate: false,
            trust_certificate_path: None,
        }
    }

    /// Trusts the given certificate file.
    pub fn with_trust_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_certificate_path = Some(path.into());
        self
    }

    /// Sets whether the server certificate is verified.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_server_certificate = verify;
        self
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_server_certificate: true,
            trust_certificate_path: None,
        }
    }
}

/// Configuration for one sync session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server URL, e.g. `wss://sync.example.com`.
    pub server_url: String,
    /// Path of the synchronized file on the server. Must start with `/`.
    pub server_path: String,
    /// TLS settings.
    pub ssl: SslConfig,
    /// Behavior on close.
    pub stop_policy: SessionStopPolicy,
    /// Reconnect backoff.
    pub retry: RetryConfig,
}

impl SessionConfig {
    /// Creates a configuration.
    ///
    /// TLS is enabled when the URL uses a secure scheme.
    pub fn new(server_url: impl Into<String>, server_path: impl Into<String>) -> Self {
        let server_url = server_url.into();
        let ssl = if server_url.starts_with("wss://") || server_url.starts_with("https://") {
            SslConfig::default()
        } else {
            SslConfig::disabled()
        };
        Self {
            server_url,
            server_path: server_path.into(),
            ssl,
            stop_policy: SessionStopPolicy::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the TLS settings.
    pub fn with_ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = ssl;
        self
    }

    /// Sets the stop policy.
    pub fn with_stop_policy(mut self, policy: SessionStopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks the configuration for obvious mistakes.
    pub fn validate(&self) -> SessionResult<()> {
        if self.server_url.is_empty() {
            return Err(SessionError::InvalidConfig("server URL is empty".into()));
        }
        if !self.server_path.starts_with('/') {
            return Err(SessionError::InvalidConfig(format!(
                "server path '{}' must start with '/'",
                self.server_path
            )));
        }
        if !self.ssl.enabled && self.ssl.trust_certificate_path.is_some() {
            return Err(SessionError::InvalidConfig(
                "trust certificate given but TLS is disabled".into(),
            ));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(SessionError::InvalidConfig(
                "retry.backoff_multiplier must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff for reconnect attempts.
///
/// Reconnects continue for as long as errors stay transient; only the delay
/// between attempts grows, up to `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates the default backoff: 1s doubling up to 5 minutes, with jitter.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based; 0 means now).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter && capped > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..0.25);
            Duration::from_secs_f64(capped * (1.0 + jitter))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a [`crate::SessionCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Share one connection between sessions talking to the same server.
    pub multiplex_sessions: bool,
}

impl CoordinatorConfig {
    /// Sets connection multiplexing.
    pub fn with_multiplexing(mut self, multiplex: bool) -> Self {
        self.multiplex_sessions = multiplex;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            multiplex_sessions: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_builder() {
        let config = SessionConfig::new("wss://sync.example.com", "/notes")
            .with_stop_policy(SessionStopPolicy::Immediately)
            .with_retry(RetryConfig::new().with_max_delay(Duration::from_secs(30)));

        assert!(config.ssl.enabled);
        assert!(config.ssl.verify_server_certificate);
        assert_eq!(config.server_path, "/notes");
        assert_eq!(config.stop_policy, SessionStopPolicy::Immediately);
        assert_eq!(config.retry.max_delay, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn plain_scheme_disables_tls() {
        let config = SessionConfig::new("ws://localhost:9090", "/a");
        assert!(!config.ssl.enabled);
    }

    #[test]
    fn validation_failures() {
        assert!(SessionConfig::new("", "/a").validate().is_err());
        assert!(SessionConfig::new("wss://x", "a").validate().is_err());

        let config = SessionConfig::new("ws://x", "/a")
            .with_ssl(SslConfig::disabled().with_trust_certificate("/etc/ca.pem"));
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidConfig(_))
        ));

        let config = SessionConfig::new("wss://x", "/a")
            .with_retry(RetryConfig::new().with_backoff_multiplier(0.5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_without_jitter() {
        let retry = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let retry = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        // 5s cap plus at most 25% jitter
        let delay = retry.delay_for_attempt(40);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(6250));
    }
}
