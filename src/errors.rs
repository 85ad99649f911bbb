use thiserror::Error;

/// All errors that can occur in CardVault.
#[derive(Debug, Error)]
pub enum CardVaultError {
    // --- Cipher and encoding errors ---
    #[error("Invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(String),

    #[error("Invalid padding: {0}")]
    PaddingError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // --- Key management errors ---
    #[error("Invalid KEK share #{part}: expected 32 bytes, got {actual}")]
    InvalidShareSize { part: u8, actual: usize },

    #[error("Key version not found: {0}")]
    KeyVersionNotFound(String),

    #[error("Config key '{0}' not found")]
    ConfigKeyMissing(String),

    #[error("Key-share service error: {0}")]
    ConnectivityError(String),

    // --- Vault errors ---
    #[error("Token not found")]
    TokenNotFound,

    // --- Storage errors ---
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // --- Config errors ---
    #[error("Config file error: {0}")]
    ConfigError(String),

    // --- IO errors ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // --- Serialization errors ---
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // --- CLI errors ---
    #[error("Command failed: {0}")]
    CommandFailed(String),
}

/// Convenience type alias for CardVault results.
pub type Result<T> = std::result::Result<T, CardVaultError>;
