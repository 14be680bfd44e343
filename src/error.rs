//! Crate-wide error type.
//!
//! `ScanError` covers setup-time failures (bad configuration, duplicate model
//! registrations), run-time failures (measurement callbacks, blocked resource
//! reacquisition) and the data conditions callers are expected to handle
//! (`NoData`, `BadFit`).
//!
//! Each variant maps to a process exit code so the `scan` binary can report
//! failures the same way regardless of where they originate.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    /// Statistics were requested for a cell that has no samples yet.
    #[error("no data for channel '{channel}' at point {point_index}")]
    NoData { channel: String, point_index: usize },

    /// The user-supplied measurement callback failed.
    #[error("measurement of channel '{channel}' at point {point_index} failed: {source}")]
    Measurement {
        channel: String,
        point_index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A lost resource could not be reacquired.
    #[error("resource reacquisition blocked: {0}")]
    ResourceBlocked(String),

    /// A strict validator rejected a fit.
    #[error("fit of model '{model}' rejected by strict validator '{validator}': {message}")]
    BadFit {
        model: String,
        validator: String,
        message: String,
    },

    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("invalid scan state: {0}")]
    InvalidState(String),

    /// Numerical failure inside a fit backend.
    #[error("fit error: {0}")]
    Fit(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScanError {
    /// Process exit code used by the `scan` binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            ScanError::Configuration(_)
            | ScanError::DuplicateRegistration(_)
            | ScanError::UnknownChannel(_)
            | ScanError::UnknownModel(_)
            | ScanError::Io(_)
            | ScanError::Json(_) => 2,
            ScanError::NoData { .. } | ScanError::Measurement { .. } => 3,
            ScanError::BadFit { .. } | ScanError::Fit(_) => 4,
            ScanError::ResourceBlocked(_) | ScanError::InvalidState(_) => 5,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ScanError::Configuration(message.into())
    }
}
