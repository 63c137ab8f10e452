use core::fmt;
use std::{error, io, result};

/// Internally, we only use this Error type and a newtype wrapper around
/// `std::result::Result<T, E>` where `E` is fixed. Transient conditions
/// (timeouts, worker disconnects) are handled inside the scheduler and never
/// reach this type; only permanent failures and wire-level problems do.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// Malformed or unrecognized message on the wire. Fatal to the connection
    /// that produced it, not to the process.
    Protocol(String),
    /// The work queue has reached its configured capacity bound. Callers must
    /// back off and retry or drop; the queue never blocks a producer.
    QueueFull,
    /// A task has exhausted its retry budget.
    TaskFailed { task_id: u64, attempts: u32 },
}

impl fmt::Display for Error {
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {err}"),
            Error::Protocol(err) => write!(f, "Protocol error: {err}"),
            Error::QueueFull => write!(f, "The work queue is at capacity"),
            Error::TaskFailed { task_id, attempts } => write!(
                f,
                "Task {task_id} permanently failed after {attempts} attempts"
            ),
        }
    }
}

impl From<io::Error> for Error {
    #[cold]
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    #[cold]
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(e) => Error::Io(e),
            _ => Error::Protocol("Invalid encoding".to_string()),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;
