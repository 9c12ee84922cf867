use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::control::stall::MotionPhase;
use crate::servo::protocol::packet::{FrameError, FrameErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Framing,
    Checksum,
    Io,
}

/// Why a single request attempt did not produce a usable reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("malformed reply: {0}")]
    Framing(FrameError),
    #[error("corrupted reply: {0}")]
    Checksum(FrameError),
    #[error("reply carried {actual} parameter bytes, expected {expected}")]
    UnexpectedLength { expected: usize, actual: usize },
    #[error("port i/o failed: {0}")]
    Io(io::ErrorKind),
}

impl AttemptFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            AttemptFailure::Timeout(_) => FailureKind::Timeout,
            AttemptFailure::Framing(_) | AttemptFailure::UnexpectedLength { .. } => {
                FailureKind::Framing
            }
            AttemptFailure::Checksum(_) => FailureKind::Checksum,
            AttemptFailure::Io(_) => FailureKind::Io,
        }
    }
}

impl From<FrameError> for AttemptFailure {
    fn from(err: FrameError) -> Self {
        match err.kind() {
            FrameErrorKind::Checksum => AttemptFailure::Checksum(err),
            FrameErrorKind::Framing => AttemptFailure::Framing(err),
        }
    }
}

impl From<io::Error> for AttemptFailure {
    fn from(err: io::Error) -> Self {
        AttemptFailure::Io(err.kind())
    }
}

/// Every attempt of a request failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("servo {id}: no valid reply after {attempts} attempt(s), last failure: {last}")]
pub struct CommunicationError {
    pub id: u8,
    pub attempts: u32,
    pub last: AttemptFailure,
}

impl CommunicationError {
    pub fn kind(&self) -> FailureKind {
        self.last.kind()
    }
}

/// A command argument outside the register's range, rejected before
/// anything is written to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{field} {value} out of range {min}..={max}")]
pub struct ValueError {
    pub field: &'static str,
    pub value: i64,
    pub min: i64,
    pub max: i64,
}

impl ValueError {
    pub fn check(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ValueError> {
        if value < min || value > max {
            return Err(ValueError {
                field,
                value,
                min,
                max,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ServoError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("serial port: {0}")]
    Port(#[from] serialport::Error),
}

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("move rejected: {0}")]
    Rejected(#[from] ValueError),
    #[error("servo link lost while {phase}: {source}")]
    LinkLost {
        phase: MotionPhase,
        #[source]
        source: ServoError,
    },
    #[error("motion worker has shut down")]
    WorkerGone,
}
