//! Error types for instance identity operations

/// Main error type for identity, session and marketplace operations.
///
/// Messages never include key material or passwords.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Cryptography unsupported: {0}")]
    CryptoUnsupported(String),

    #[error("Failed to decrypt private key (wrong password or corrupted key data)")]
    WrongPasswordOrTampered,

    #[error("Signing session is locked - unlock with your password to continue")]
    SessionLocked,

    #[error("Invalid key file: {0}")]
    InvalidKeyFile(String),

    #[error("Marketplace request failed: {0}")]
    NetworkOrServer(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No instance key has been generated")]
    NoInstanceKey,

    #[error("An instance key already exists - regenerate or import to replace it")]
    IdentityExists,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IdentityError {
    /// Whether the caller can recover (re-prompt, pick another file, retry).
    ///
    /// Only a platform without the required primitives is fatal.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::CryptoUnsupported(_))
    }
}

impl From<std::io::Error> for IdentityError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("JSON error: {}", err))
    }
}

impl From<tokio::task::JoinError> for IdentityError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Background task failed: {}", err))
    }
}

/// Result type alias for identity operations
pub type Result<T> = std::result::Result<T, IdentityError>;
