//! Error types.
//!
//! - `HarnessError` is the library error: one variant per failure class the
//!   harness distinguishes (registration, store lookups, sampling, derivation).
//! - `AppError` is the binary surface: a message plus a process exit code.
//!
//! Exit codes used by the binary:
//! - `2`: invalid input or configuration
//! - `3`: missing data (unknown tag, empty posterior)
//! - `4`: run/compute failure

use std::path::PathBuf;

use thiserror::Error;

/// Library result alias.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid tag '{tag}': {reason}")]
    InvalidTag { tag: String, reason: String },

    #[error("invalid bounds for '{parameter}' in '{tag}': lower={lower}, upper={upper}")]
    InvalidBounds {
        tag: String,
        parameter: String,
        lower: f64,
        upper: f64,
    },

    #[error("invalid prior for '{parameter}' in '{tag}': {reason}")]
    InvalidPrior {
        tag: String,
        parameter: String,
        reason: String,
    },

    #[error("invalid sampler settings: {0}")]
    InvalidSettings(String),

    #[error("tag already registered: {0}")]
    DuplicateTag(String),

    #[error("sampler failed for '{tag}': {cause}")]
    Sampler { tag: String, cause: String },

    #[error("no result stored for tag: {0}")]
    NotFound(String),

    #[error("insufficient samples for '{tag}': requested {requested}, available {available}")]
    InsufficientSamples {
        tag: String,
        requested: usize,
        available: usize,
    },

    #[error("forward model error: {0}")]
    ForwardModel(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store at '{}' has format version {found}, expected {expected}", root.display())]
    StoreVersion {
        root: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Exit code used when this error reaches the binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            HarnessError::InvalidTag { .. }
            | HarnessError::InvalidBounds { .. }
            | HarnessError::InvalidPrior { .. }
            | HarnessError::InvalidSettings(_)
            | HarnessError::DuplicateTag(_)
            | HarnessError::Dataset(_)
            | HarnessError::Config(_)
            | HarnessError::StoreVersion { .. } => 2,
            HarnessError::NotFound(_) | HarnessError::InsufficientSamples { .. } => 3,
            HarnessError::Sampler { .. }
            | HarnessError::ForwardModel(_)
            | HarnessError::Io { .. }
            | HarnessError::Json(_) => 4,
        }
    }
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<HarnessError> for AppError {
    fn from(err: HarnessError) -> Self {
        AppError::new(err.exit_code(), err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_errors_map_to_exit_codes() {
        let err: AppError = HarnessError::NotFound("a".to_string()).into();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.to_string(), "no result stored for tag: a");

        let err: AppError = HarnessError::DuplicateTag("a".to_string()).into();
        assert_eq!(err.exit_code(), 2);
    }
}
