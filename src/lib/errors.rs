//! Custom error types for graphmill operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for graphmill operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type for graphmill operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Write attempted onto a pre-existing, unforced output path
    #[error("output file '{path}' already exists (use --force to overwrite)")]
    AlreadyExists {
        /// The offending output path
        path: PathBuf,
    },

    /// Append attempted onto a file that is already sentinel-terminated
    #[error("file '{path}' is already complete, nothing to append")]
    AlreadyComplete {
        /// The offending output path
        path: PathBuf,
    },

    /// A required input file (or one of its shards) lacks the completion sentinel
    #[error("input file '{path}' is incomplete or missing")]
    IncompleteInput {
        /// The offending input path
        path: PathBuf,
    },

    /// No record boundary was found within the bounded lookahead
    #[error("no record boundary found near offset {offset} in '{path}'")]
    BoundaryAlignment {
        /// The file being chunked
        path: PathBuf,
        /// The logical byte offset where realignment started
        offset: u64,
    },

    /// A record line could not be parsed
    #[error("could not parse record in '{path}': {reason}: '{line}'")]
    Parse {
        /// The file the record came from
        path: PathBuf,
        /// The offending line
        line: String,
        /// Explanation of the problem
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// The path being read or written
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        PipelineError::Io { path: path.into(), source }
    }
}

/// A failure captured at the worker-task boundary.
///
/// Workers never let an error or panic escape; the failure is converted into
/// one of these and sent back over the result channel so the driver can
/// report every failed chunk before aborting the stage.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    /// Name of the step that failed
    pub step: String,
    /// Index of the chunk the worker was processing
    pub chunk: usize,
    /// The full error chain or panic payload
    pub message: String,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step '{}' chunk {}: {}", self.step, self.chunk, self.message)
    }
}
