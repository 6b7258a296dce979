//! Error types for platform operations.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors that can occur while mutating or reading kernel link state.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Reading or writing a sysfs attribute failed.
    #[error("sysfs access to {} failed: {source}", path.display())]
    Sysfs {
        /// The attribute path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// No kernel link with this interface index.
    #[error("Link with ifindex {ifindex} not found")]
    LinkNotFound {
        /// The interface index.
        ifindex: i32,
    },

    /// No kernel link with this interface name.
    #[error("Link '{name}' not found")]
    LinkNameNotFound {
        /// The interface name.
        name: String,
    },

    /// A link with this name already exists.
    #[error("Link '{name}' already exists")]
    LinkExists {
        /// The interface name.
        name: String,
    },

    /// The kernel refused the operation.
    #[error("Kernel rejected {operation}: {message}")]
    Rejected {
        /// The operation that was refused.
        operation: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl PlatformError {
    /// Creates a rejected-operation error.
    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a link not found error.
    pub fn link_not_found(ifindex: i32) -> Self {
        Self::LinkNotFound { ifindex }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::LinkNotFound { .. }
                | PlatformError::LinkNameNotFound { .. }
                | PlatformError::ShellCommandFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlatformError::link_not_found(7);
        assert_eq!(err.to_string(), "Link with ifindex 7 not found");
    }

    #[test]
    fn test_rejected_error() {
        let err = PlatformError::rejected("enslave", "Device or resource busy");
        assert_eq!(
            err.to_string(),
            "Kernel rejected enslave: Device or resource busy"
        );
    }

    #[test]
    fn test_shell_command_failed() {
        let err = PlatformError::ShellCommandFailed {
            command: "ip link add bond0 type bond".to_string(),
            exit_code: 2,
            output: "RTNETLINK answers: File exists".to_string(),
        };
        assert!(err.to_string().contains("ip link add"));
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn test_sysfs_error_mentions_path() {
        let err = PlatformError::Sysfs {
            path: PathBuf::from("/sys/class/net/bond0/bonding/miimon"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("bonding/miimon"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(PlatformError::link_not_found(3).is_retryable());
        assert!(!PlatformError::internal("bug").is_retryable());
        assert!(!PlatformError::LinkExists {
            name: "bond0".to_string()
        }
        .is_retryable());
    }
}
