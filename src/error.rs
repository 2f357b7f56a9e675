//! Unified error taxonomy for the tunnel core.
//!
//! One enum covers every failure surface described by the component contracts:
//! authentication, key loading, network/transport, protocol-level forward
//! requests, local-loopback dialing, and configuration validation. Callers
//! branch on the variant, not on a type, to decide whether a failure is
//! fatal or retriable.

use thiserror::Error;

/// A core-level error, classified so the Supervisor knows whether it is
/// retriable (`NetError`, and mid-session failures reported the same way)
/// or fatal to the current attempt (`AuthError`, `KeyError`).
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Credentials rejected, key unreadable, or a passphrase is required.
    #[error("authentication failed: {message}")]
    AuthError {
        message: String,
        /// Distinguishes "wrong/missing passphrase" from an outright
        /// authentication rejection so the caller can retry with one.
        needs_passphrase: bool,
    },

    /// Key file missing, corrupt, or in an unsupported format.
    #[error("key error: {0}")]
    KeyError(String),

    /// TCP connect, DNS, handshake timeout, or mid-session transport failure.
    #[error("network error: {0}")]
    NetError(String),

    /// The server refused a port-forward request (port in use, policy, etc).
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The local loopback target for a tunneled connection was unreachable.
    #[error("local dial error: {0}")]
    LocalDialError(String),

    /// Configuration failed validation before the supervisor was started.
    #[error("config error: {0}")]
    ConfigError(String),
}

impl CoreError {
    pub fn auth(message: impl Into<String>) -> Self {
        CoreError::AuthError {
            message: message.into(),
            needs_passphrase: false,
        }
    }

    pub fn needs_passphrase(message: impl Into<String>) -> Self {
        CoreError::AuthError {
            message: message.into(),
            needs_passphrase: true,
        }
    }

    /// True for the two kinds the Supervisor must never retry more than once:
    /// repeated attempts against rejected or unreadable credentials risk
    /// locking the account out on the remote server.
    pub fn is_credential_fatal(&self) -> bool {
        matches!(self, CoreError::AuthError { .. } | CoreError::KeyError(_))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::NetError(err.to_string())
    }
}

impl From<russh::Error> for CoreError {
    fn from(err: russh::Error) -> Self {
        CoreError::NetError(err.to_string())
    }
}

impl From<russh::keys::Error> for CoreError {
    fn from(err: russh::keys::Error) -> Self {
        CoreError::KeyError(err.to_string())
    }
}
