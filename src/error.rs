//! Error taxonomy for the build pipeline.
//!
//! Every variant here is recovered at a Module or DownloadCache boundary and
//! folded into a boolean outcome, with the exception of [`BuildError::Config`],
//! which aborts loading of a stage before anything runs.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or running a build stage.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A configuration document is malformed or missing a required key.
    #[error("invalid configuration '{}': {message}", document.display())]
    Config { document: PathBuf, message: String },

    /// A shell command reported failure.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A downloaded or locally found artifact does not hash to its declared checksum.
    #[error("checksum mismatch for '{}': expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// An archive member would be written outside its extraction destination.
    #[error("archive member '{member}' escapes destination '{}'", destination.display())]
    PathTraversal {
        member: String,
        destination: PathBuf,
    },

    /// A validate phase's last output line matched none of the accepted results.
    #[error("validation of '{module}' printed '{actual}', which is not an accepted result")]
    Validation { module: String, actual: String },

    /// A build-root directory a phase depends on is absent.
    #[error("missing directory '{}'", path.display())]
    MissingDirectory { path: PathBuf },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn config(document: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Config {
            document: document.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of a single shell command.
///
/// The captured combined output travels with the error so callers can log it
/// or show it to the operator.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn '{shell}' for `{command}`: {source}")]
    Spawn {
        shell: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    Status {
        command: String,
        status: String,
        output: Vec<u8>,
    },

    #[error("`{command}` was terminated by signal {signal}")]
    Signal {
        command: String,
        signal: i32,
        output: Vec<u8>,
    },
}

impl CommandError {
    /// Combined output captured before the failure, if any.
    pub fn output(&self) -> &[u8] {
        match self {
            Self::Status { output, .. } | Self::Signal { output, .. } => output,
            Self::Spawn { .. } => &[],
        }
    }
}
