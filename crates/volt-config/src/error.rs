use std::path::{Path, PathBuf};

use thiserror::Error;

/// Schema or resolution failure while building the config model.
///
/// Carries the offending file, a JSON pointer into it (empty for whole-document
/// problems) and a human-readable reason. All resolver errors are terminal; no
/// partial model ever escapes the loader.
#[derive(Debug, Clone, Error)]
#[error("{file}#{pointer}: {reason}")]
pub struct ConfigError {
    pub file: String,
    pub pointer: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(file: &Path, pointer: &str, reason: impl Into<String>) -> Self {
        Self {
            file: file.display().to_string(),
            pointer: pointer.to_string(),
            reason: reason.into(),
        }
    }

    /// An error that concerns the document as a whole.
    pub fn whole(file: &Path, reason: impl Into<String>) -> Self {
        Self::new(file, "", reason)
    }
}

/// Infrastructure failure during boot (unreadable files, bad install layout,
/// unreachable broker). Always fatal.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid installation prefix {0}")]
    BadPrefix(PathBuf),
    #[error("config file {0} not found")]
    MissingConfig(PathBuf),
    #[error("broker unreachable at {0}")]
    BrokerUnreachable(String),
    #[error("{0}")]
    Invalid(String),
}
