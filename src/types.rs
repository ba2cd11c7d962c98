/// Core error types for the runbox system
use nix::errno::Errno;
use thiserror::Error;

/// Custom error types for runbox
#[derive(Error, Debug)]
pub enum RunError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("document format error: {0}")]
    Format(String),

    #[error("no such key: {0}")]
    Name(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("value error: {0}")]
    Value(String),

    #[error("{call} failed: {errno}")]
    System { call: &'static str, errno: Errno },

    #[error("already set: {0}")]
    AlreadySet(String),
}

impl RunError {
    /// Wrap a syscall failure, capturing the calling thread's errno.
    pub fn system(call: &'static str) -> Self {
        RunError::System {
            call,
            errno: Errno::last(),
        }
    }

    pub fn from_errno(call: &'static str, errno: Errno) -> Self {
        RunError::System { call, errno }
    }
}

impl From<serde_json::Error> for RunError {
    fn from(err: serde_json::Error) -> Self {
        RunError::Format(err.to_string())
    }
}

/// Result type alias for runbox operations
pub type Result<T> = std::result::Result<T, RunError>;
