//! Error types for WireGuard key, config and daemon operations.

use thiserror::Error;

/// Result type alias for WireGuard operations.
pub type Result<T> = std::result::Result<T, WireGuardError>;

/// Errors that can occur during WireGuard operations.
#[derive(Debug, Error)]
pub enum WireGuardError {
    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid endpoint.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Invalid address family name.
    #[error("invalid address family: {0}")]
    InvalidFamily(String),

    /// A command argument failed validation before execution.
    #[error("invalid command argument: {0}")]
    InvalidArgument(String),

    /// The daemon could not be reached (not running, not installed, no permission).
    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// The daemon was reached but refused the instruction.
    #[error("daemon rejected instruction: {0}")]
    DaemonRejected(String),

    /// The daemon returned output that could not be understood.
    #[error("malformed daemon output at line {line}: {message}")]
    MalformedOutput {
        /// Line number in the daemon output (1-based).
        line: usize,
        /// Description of the problem.
        message: String,
    },
}

impl WireGuardError {
    /// Returns true if retrying the same daemon instruction may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DaemonUnavailable(_))
    }
}

impl From<base64::DecodeError> for WireGuardError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidBase64(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_transient() {
        assert!(WireGuardError::DaemonUnavailable("wg not found".to_string()).is_transient());
    }

    #[test]
    fn rejected_is_permanent() {
        assert!(!WireGuardError::DaemonRejected("bad key".to_string()).is_transient());
        assert!(!WireGuardError::InvalidKeyLength(16).is_transient());
    }

    #[test]
    fn key_length_display() {
        let err = WireGuardError::InvalidKeyLength(16);
        assert_eq!(err.to_string(), "invalid key length: expected 32, got 16");
    }
}
