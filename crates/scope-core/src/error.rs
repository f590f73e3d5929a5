//! Error taxonomy shared by every component (§7): one nested enum per
//! raising component, plus `ScopeError` as the umbrella type components
//! above C1-C9 can propagate with `?`.

use thiserror::Error;

/// Raised by the Control Link (C2) and Stream Link (C3).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("link is disconnected")]
    Disconnected,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Raised by the Frame Codec (C1).
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// Raised by the Frame Store (C4).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("capacity exceeded while patterns 0 and 1 remain pinned")]
    CapacityExceededWhilePinned,
}

/// Raised by the Worker Pool (C5).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("worker pool is shut down")]
    Shutdown,
    #[error("timed out awaiting task result")]
    Timeout,
}

/// Raised by the Triangulator (C7) during setup.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("missing calibration parameters")]
    MissingParameters,
    #[error("rectification failed: {0}")]
    RectificationFailed(String),
}

/// Raised by the Scan Orchestrator (C8) and Session Supervisor (C9).
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("stream link stalled for more than 10s")]
    StreamStalled,
    #[error("projection desynchronised: {0}")]
    ProjectionDesynchronised(String),
    #[error("session was cancelled")]
    Cancelled,
    #[error("memory budget exhausted")]
    MemoryExhausted,
}

/// Umbrella error every public operation above a single component can
/// return. Each raising component's own enum converts into this via
/// `#[from]`, so call sites anywhere in the pipeline can use `?` without
/// matching on the originating component.
#[derive(Error, Debug)]
pub enum ScopeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScopeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_errors_convert_into_the_umbrella_type() {
        let err: ScopeError = TransportError::Timeout.into();
        assert!(matches!(err, ScopeError::Transport(TransportError::Timeout)));

        let err: ScopeError = SessionError::Cancelled.into();
        assert!(matches!(err, ScopeError::Session(SessionError::Cancelled)));
    }
}
