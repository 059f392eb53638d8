use std::io;

use thiserror::Error;

use crate::executor::CommandResult;

pub type Result<T> = std::result::Result<T, CommandError>;

/// Failure taxonomy of the command subsystem.
///
/// The variant is part of the contract: callers classify failures by matching
/// on it, and the core never rewraps one kind as another. Adapters may render
/// these however the transport wants, but must keep the classification.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Bad caller input: empty argv, relative or missing working directory,
    /// unknown encoding label, invalid regex, empty id list, program not on
    /// the allow-list.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operating system refused to run the program.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The child could not be started at all (unknown program, spawn
    /// failure).
    #[error("command execution failed: {0}")]
    Execution(String),

    /// A synchronous execution exceeded its timeout. The child was killed;
    /// `partial` carries everything captured up to that point.
    #[error("command timed out after {timeout_secs}s")]
    Timeout {
        timeout_secs: u64,
        partial: Box<CommandResult>,
    },

    #[error("process {0} not found")]
    ProcessNotFound(String),

    /// stop was requested in a state that forbids it, or did not complete
    /// within its deadline.
    #[error("process control error: {0}")]
    ProcessControl(String),

    #[error("process clean error: {0}")]
    ProcessClean(String),

    /// A log read failed below the store's contract (I/O while scanning an
    /// existing log).
    #[error("output retrieval error: {0}")]
    OutputRetrieval(String),

    /// The backing storage rejected an append, register or clear.
    #[error("storage error: {error}")]
    Storage {
        #[source]
        error: io::Error,
    },
}

impl CommandError {
    pub(crate) fn storage(error: io::Error) -> Self {
        Self::Storage { error }
    }
}
