//! The single event enumeration dispatched to Session Supervisor
//! subscribers, replacing the origin's two-callback (progress +
//! completion) pattern.

use serde::{Deserialize, Serialize};

use crate::types::{CameraIndex, Frame};

/// One event delivered to a subscriber's callback on a non-UI thread.
#[derive(Debug, Clone)]
pub enum Event {
    /// A live preview frame outside of a scan (or the frame underlying a
    /// pattern during a scan, if the collaborator wants to display it).
    Preview {
        camera: CameraIndex,
        frame: Frame,
        timestamp: f64,
    },
    /// Progress update during an active scan.
    ScanProgress {
        percent: f32,
        patterns_received: u32,
        message: String,
    },
    /// A new point cloud has been published.
    PointCloudUpdated {
        point_count: usize,
        timestamp: f64,
    },
    /// A fatal error terminated (or will terminate) the session. Exactly
    /// one of these is produced per fatal failure; transient problems are
    /// logged, not published.
    Error { code: ErrorCode, message: String },
}

/// Coarse classification of `Event::Error` for subscribers that branch on
/// error kind without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Transport,
    Decode,
    Store,
    Worker,
    Calibration,
    Session,
    Config,
    Io,
}

impl From<&crate::error::ScopeError> for ErrorCode {
    fn from(err: &crate::error::ScopeError) -> Self {
        use crate::error::ScopeError::*;
        match err {
            Transport(_) => ErrorCode::Transport,
            Decode(_) => ErrorCode::Decode,
            Store(_) => ErrorCode::Store,
            Worker(_) => ErrorCode::Worker,
            Calibration(_) => ErrorCode::Calibration,
            Session(_) => ErrorCode::Session,
            Config(_) => ErrorCode::Config,
            Io(_) => ErrorCode::Io,
        }
    }
}

/// Opaque handle returned by a subscription, so a subscriber can
/// unsubscribe without the supervisor walking a widget tree to find it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ScopeError, SessionError};

    #[test]
    fn error_code_maps_from_scope_error() {
        let err = ScopeError::Session(SessionError::Cancelled);
        assert_eq!(ErrorCode::from(&err), ErrorCode::Session);
    }
}
