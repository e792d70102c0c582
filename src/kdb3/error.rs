//! Error types for KDB handling

use std::io;

use thiserror::Error;

/// Result type alias for KDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, mutating or saving a database.
///
/// A user cancellation is not an error, see [`Outcome`](crate::kdb3::Outcome).
#[derive(Error, Debug)]
pub enum Error {
    /// File too short, bad signature, bad version or a broken record
    #[error("kdb file invalid: {0}")]
    MalformedFile(&'static str),

    /// Content hash mismatch after decryption. Wrong password, wrong key file
    /// and a corrupted file all end up here.
    #[error("kdb file invalid: content hash invalid")]
    ContentIntegrity,

    /// No registered algorithm handles the header's algorithm flags
    #[error("encryption algorithm not supported (flags {0:#x})")]
    UnsupportedAlgorithm(u32),

    /// Caller error
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
