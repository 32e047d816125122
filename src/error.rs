use crate::cmd_runner::Detached;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error)]
pub enum Error {
    /// Bad input: malformed or expired certificate material, hostname collisions, bad host data.
    #[error("{0}")]
    Validation(String),
    /// Template missing, template render failure, unwritable path.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("Item Not Found - {0}")]
    NotFound(String),
    /// Non-zero exit or unparseable output of an external command. `output` is the raw tool output.
    #[error("{program} failed: {output}")]
    ExternalTool { program: String, output: String },
    /// `child` resolves once the abandoned process has actually exited.
    #[error("{program} did not finish within {}", crate::time::humanize_std_duration(.after))]
    Timeout {
        program: String,
        after: Duration,
        child: Detached,
    },
    #[error("internal consistency check failed: {0}")]
    InternalConsistency(String),
    #[error("certificate {0} already has an operation in progress")]
    Busy(i64),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same call later could succeed without the caller changing its input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ExternalTool { .. } | Error::Timeout { .. } | Error::Busy(_) | Error::Io { .. }
        )
    }
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        Error::Configuration(format!("{err:#}"))
    }
}

pub trait IoContext<T> {
    fn with_path<P: Into<PathBuf>>(self, path: P) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path<P: Into<PathBuf>>(self, path: P) -> Result<T> {
        self.map_err(|source| Error::io(path, source))
    }
}
