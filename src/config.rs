//! Service configuration.
//!
//! The configuration is a closed, immutable set of fields constructed from
//! explicit inputs (or the environment) before the service starts.  Nothing
//! here is mutated at runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable carrying the RTM API key.
pub const ENV_API_KEY: &str = "RTM_API_KEY";
/// Environment variable carrying the RTM shared secret.
pub const ENV_SHARED_SECRET: &str = "RTM_SHARED_SECRET";
/// Environment variable carrying a pre-supplied auth token.
pub const ENV_AUTH_TOKEN: &str = "RTM_AUTH_TOKEN";
/// Environment variable carrying a token for test mode.
pub const ENV_TEST_TOKEN: &str = "RTM_TEST_TOKEN";
/// CI marker; when non-empty, test mode returns a synthetic success.
pub const ENV_CI: &str = "CI";

/// RTM permission scope requested during authentication.
///
/// `delete` is a superset of `write`, which is a superset of `read`.
#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Copy, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum Perms {
    /// Read-only access to tasks, lists and settings.
    Read,
    /// Read plus task creation and modification.
    Write,
    /// Full access, including task deletion.
    #[default]
    Delete,
}

impl Perms {
    /// The wire spelling RTM expects in the `perms` parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Perms::Read => "read",
            Perms::Write => "write",
            Perms::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Perms {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Perms, &'static str> {
        match s {
            "read" => Ok(Perms::Read),
            "write" => Ok(Perms::Write),
            "delete" => Ok(Perms::Delete),
            _ => Err("expected one of: read, write, delete"),
        }
    }
}

impl std::fmt::Display for Perms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How [`ensure_authenticated`](crate::AuthManager::ensure_authenticated)
/// behaves when no valid token is available.
#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Copy, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Print instructions and, when enabled, run the callback listener to
    /// complete the flow without copy-paste.
    #[default]
    Interactive,
    /// Only consult existing tokens; fail with instructions if none is
    /// valid.  Never starts a browser flow.
    Headless,
    /// Like headless, but honours `TestTokenPath`/`RTM_TEST_TOKEN` and
    /// returns a synthetic success in CI environments.
    Test,
}

/// Immutable service configuration.
///
/// Defaults match a desktop deployment: interactive auth with the callback
/// listener on `localhost:8090`, `delete` permission, token auto-save.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// RTM API key.  Required.
    pub api_key: String,
    /// RTM shared secret used for request signing.  Required.
    pub shared_secret: String,
    /// Auth completion mode.
    pub mode: AuthMode,
    /// Whether interactive auth stands up the local callback listener.
    pub auto_complete_auth: bool,
    /// Bind host for the callback listener.
    pub callback_host: String,
    /// Bind port for the callback listener.
    pub callback_port: u16,
    /// Overall timeout for an interactive auth flow, in seconds.
    pub timeout_secs: u64,
    /// Attempts for retried operations (frob acquisition, token exchange).
    pub retry_attempts: u32,
    /// Base backoff between retries, in milliseconds; attempt `n` waits
    /// `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    /// Persist the token to storage after successful verification.
    pub auto_save_token: bool,
    /// Test mode: read the token from this file instead of storage.
    pub test_token_path: Option<PathBuf>,
    /// Permission scope requested during authentication.
    pub permission: Perms,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_key: String::new(),
            shared_secret: String::new(),
            mode: AuthMode::Interactive,
            auto_complete_auth: true,
            callback_host: "localhost".into(),
            callback_port: 8090,
            timeout_secs: 120,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            auto_save_token: true,
            test_token_path: None,
            permission: Perms::Delete,
        }
    }
}

impl Config {
    /// Build a configuration from credentials, leaving everything else at
    /// its default.
    pub fn new(api_key: impl Into<String>, shared_secret: impl Into<String>) -> Config {
        Config {
            api_key: api_key.into(),
            shared_secret: shared_secret.into(),
            ..Config::default()
        }
    }

    /// Fill credentials from `RTM_API_KEY` / `RTM_SHARED_SECRET` where they
    /// were not supplied programmatically.
    pub fn with_env_credentials(mut self) -> Config {
        if self.api_key.is_empty() {
            if let Ok(key) = std::env::var(ENV_API_KEY) {
                self.api_key = key;
            }
        }
        if self.shared_secret.is_empty() {
            if let Ok(secret) = std::env::var(ENV_SHARED_SECRET) {
                self.shared_secret = secret;
            }
        }
        self
    }

    /// Check the invariants the service refuses to start without.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::Config(format!(
                "missing RTM API key (set {ENV_API_KEY} or supply it programmatically)"
            )));
        }
        if self.shared_secret.is_empty() {
            return Err(Error::Config(format!(
                "missing RTM shared secret (set {ENV_SHARED_SECRET} or supply it programmatically)"
            )));
        }
        Ok(())
    }

    /// Interactive auth flow timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base retry backoff.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_desktop_deployment() {
        let config = Config::default();
        assert_eq!(config.callback_host, "localhost");
        assert_eq!(config.callback_port, 8090);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_backoff_ms, 500);
        assert_eq!(config.permission, Perms::Delete);
        assert!(config.auto_complete_auth);
        assert!(config.auto_save_token);
    }

    #[test]
    fn validate_requires_credentials() {
        assert!(Config::default().validate().is_err());
        assert!(Config::new("key", "").validate().is_err());
        assert!(Config::new("key", "secret").validate().is_ok());
    }
}
