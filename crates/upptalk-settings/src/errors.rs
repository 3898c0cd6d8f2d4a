//! Settings errors.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The file is not JSON, or does not fit [`ClientSettings`](crate::ClientSettings).
    #[error("malformed settings: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A value the client cannot run with.
    #[error("{field}: {reason}")]
    Invalid {
        /// Dotted settings key.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Shorthand for settings results.
pub type Result<T> = std::result::Result<T, SettingsError>;
