use std::{error::Error, fmt, io};

use crate::job::{JobId, JobStatus};

/// The edge module's result type.
pub type Result<T> = std::result::Result<T, EdgeErr>;

/// Edge node failures that are surfaced to a caller.
///
/// Failures of the training path itself never show up here, they are
/// contained by the job runner and reported to the operator instead.
#[derive(Debug)]
pub enum EdgeErr {
    Io(io::Error),
    /// A `LocalTrain` arrived while another job is still active.
    Admission {
        running: JobId,
    },
    /// A command arrived after the shutdown signal fired.
    ShuttingDown,
    InvalidRequest(&'static str),
    InvalidTransition {
        job: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    Config(String),
    /// The remote end answered with an error message.
    Rejected(String),
    UnexpectedReply(&'static str),
}

impl fmt::Display for EdgeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeErr::Io(e) => write!(f, "io error: {e}"),
            EdgeErr::Admission { running } => {
                write!(f, "a training job is already running (job {running})")
            }
            EdgeErr::ShuttingDown => write!(f, "the node is shutting down"),
            EdgeErr::InvalidRequest(what) => write!(f, "invalid request: {what}"),
            EdgeErr::InvalidTransition { job, from, to } => {
                write!(f, "job {job} can not go from {from} to {to}")
            }
            EdgeErr::Config(msg) => write!(f, "invalid config: {msg}"),
            EdgeErr::Rejected(reason) => write!(f, "rejected by peer: {reason}"),
            EdgeErr::UnexpectedReply(got) => write!(f, "unexpected reply: got {got}"),
        }
    }
}

impl Error for EdgeErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EdgeErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EdgeErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<EdgeErr> for io::Error {
    fn from(value: EdgeErr) -> Self {
        match value {
            EdgeErr::Io(e) => e,
            EdgeErr::Config(_) => io::Error::new(io::ErrorKind::InvalidInput, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
