/// Convenient result alias for embed update operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Errors that can occur while checking for or applying an embed update.
#[derive(thiserror::Error, Debug)]
pub enum EmbedError {
    /// Network request to a content or release host failed.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// A resource could not be fetched within the retry budget.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Neither the primary host nor the fallback registry returned release metadata.
    #[error("release information unavailable from every source")]
    ReleaseUnavailable,
    /// A JSON document could not be decoded or encoded.
    #[error("json decoding failed: {0}")]
    Json(#[from] serde_json::Error),
    /// The locally computed digest did not match the server-declared one.
    #[error("integrity check failed (expected {expected}, got {actual})")]
    IntegrityMismatch {
        /// Server-declared SHA-256 digest.
        expected: String,
        /// Locally computed SHA-256 digest.
        actual: String,
    },
    /// The signature did not recover to any trusted key.
    #[error("signature does not belong to a trusted key")]
    SignatureRejected,
    /// The release package is truncated or malformed.
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
    /// The release requires a newer host application.
    #[error("release requires client {required}, running {running}")]
    VersionIncompatible {
        /// Minimum client version declared by the release.
        required: String,
        /// Version of the running host application.
        running: String,
    },
    /// The embedding application supplied an unusable configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Failed to perform an I/O operation.
    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse or compare versions.
    #[error("version error: {0}")]
    Version(#[from] semver::Error),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl EmbedError {
    /// Helper for wrapping configuration failures.
    pub fn configuration(msg: impl Into<String>) -> Self {
        EmbedError::Configuration(msg.into())
    }

    /// Helper for wrapping archive failures.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        EmbedError::CorruptArchive(msg.into())
    }
}

impl From<zip::result::ZipError> for EmbedError {
    fn from(err: zip::result::ZipError) -> Self {
        EmbedError::CorruptArchive(err.to_string())
    }
}
