//! Error taxonomy shared by the shell driver, the supervisor client and the
//! job mirrors.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Spawning the shell failed, pty resources ran out, or the remote side
    /// rejected authentication.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No prompt (or no terminal job state) was observed before the deadline.
    /// `partial` carries whatever output arrived, for diagnostics.
    #[error("Timeout after {elapsed:?} while {context}")]
    Timeout {
        context: String,
        elapsed: Duration,
        partial: String,
    },

    /// Malformed or unexpected response framing.
    #[error("Protocol error: {message}")]
    Protocol { message: String, partial: String },

    /// Unknown job id, or its directory lacks required files.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The operation is not valid for the current job or session state.
    #[error("Incorrect state: {0}")]
    IncorrectState(String),

    /// Bad URL, unsupported scheme, or an unusable job description.
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// The supervisor hit an I/O failure on the remote host (disk full, ...).
    #[error("Remote I/O error: {0}")]
    RemoteIo(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn protocol(message: impl Into<String>, partial: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
            partial: partial.into(),
        }
    }

    /// Recoverable errors leave the session and the job usable; the caller
    /// may simply try again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::InvalidJob(_))
    }

    /// Output captured before the failure, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Error::Timeout { partial, .. } | Error::Protocol { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
