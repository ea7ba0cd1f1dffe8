//! Error taxonomy for RTM operations.
//!
//! RTM reports failures in-band via the response envelope, so transport
//! problems, envelope problems and semantic API errors are distinct kinds
//! here and callers can match on them.

use thiserror::Error;

/// RTM error code meaning the auth token is invalid or expired.
pub const CODE_INVALID_TOKEN: i32 = 98;

/// RTM error code for a bad signature or API key.  Indicates a programming
/// or configuration bug, never a transient fault.
pub const CODE_INVALID_API_KEY: i32 = 100;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all RTM client, auth and service operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed configuration.  Fatal at boot.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request construction, connection, or body read failed.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The in-process limiter rejected the call, or the server returned 503.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The response envelope carried `stat="fail"`.
    ///
    /// Code [`CODE_INVALID_TOKEN`] is handled specially upstream: it clears
    /// the local auth state and is never retried.
    #[error("RTM error {code}: {msg}")]
    Rtm {
        /// RTM's numeric error code.
        code: i32,
        /// RTM's human-readable message, surfaced verbatim.
        msg: String,
    },

    /// The envelope or a method payload failed to parse.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// An operation requiring a token was invoked without one.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// The caller supplied malformed parameters.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Token storage (secret store or file) failed.
    #[error("token storage error: {0}")]
    Storage(String),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A lower-level error wrapped with operation context.
    #[error("{context}")]
    Context {
        /// Description of the operation that failed.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with operation-level context.
    pub fn context(self, context: impl Into<String>) -> Error {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether retrying the operation could plausibly succeed.
    ///
    /// Transport faults and rate limiting are transient.  RTM semantic
    /// errors, parse failures and bad arguments are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::RateLimited(_) => true,
            Error::Context { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether this is RTM error 98 (invalid auth token), possibly wrapped.
    pub fn is_invalid_token(&self) -> bool {
        match self {
            Error::Rtm { code, .. } => *code == CODE_INVALID_TOKEN,
            Error::Context { source, .. } => source.is_invalid_token(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_token_detected_through_context() {
        let err = Error::Rtm {
            code: 98,
            msg: "Login failed / Invalid auth token".into(),
        }
        .context("verifying stored token");
        assert!(err.is_invalid_token());
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limited_is_retryable() {
        let err = Error::RateLimited("server returned 503".into());
        assert!(err.is_retryable());
        assert!(!err.is_invalid_token());
    }
}
