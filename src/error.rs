//! Error taxonomy for script execution.
//!
//! Library layers return these typed errors; the CLI and suite runner wrap them
//! with `anyhow` context like the rest of the application code.
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures while reading, quoting or unquoting a text archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("read archive {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("file marker at byte {offset} has a non-UTF-8 name")]
    InvalidName { offset: usize },

    #[error("data has no final newline")]
    NoFinalNewline,

    #[error("data contains non-UTF-8 characters")]
    InvalidUtf8,

    #[error("data does not appear to be quoted")]
    NotQuoted,
}

/// Failures of the process runner.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("executable file {name:?} not found in $PATH")]
    NotFound { name: String },

    #[error("start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    TimedOut,
}

/// Everything that can abort a script or end it early.
///
/// `Skip` is not a failure; it unwinds the directive loop the same way a fatal
/// error does and the interpreter classifies it afterwards.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("unterminated quoted argument")]
    UnterminatedQuote,

    #[error("{0}")]
    Syntax(String),

    #[error("setup: {0}")]
    Setup(String),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("unknown condition {0:?}")]
    UnknownCondition(String),

    #[error("bad condition {cond:?}: {message}")]
    BadCondition { cond: String, message: String },

    #[error("{0}")]
    Assertion(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("usage: {0}")]
    Usage(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error("{0}")]
    Cleanup(String),

    #[error("skip: {0}")]
    Skip(String),
}

impl ScriptError {
    pub fn assertion(message: impl Into<String>) -> Self {
        ScriptError::Assertion(message.into())
    }

    pub fn usage(message: impl Into<String>) -> Self {
        ScriptError::Usage(message.into())
    }

    /// I/O failure on `path`, keeping the error kind.
    pub fn io(op: &str, path: &Path, err: io::Error) -> Self {
        ScriptError::Io(io::Error::new(
            err.kind(),
            format!("{op} {}: {err}", path.display()),
        ))
    }
}

pub type Result<T, E = ScriptError> = std::result::Result<T, E>;
