//! Session identity and state types.
//!
//! # Scan lifecycle
//!
//! ```text
//!            start                 connected
//!   Idle ───────────► Connecting ───────────► ScanningReady ◄──────────────┐
//!    ▲                    ▲                        │ capture               │
//!    │ stop               │ connection dropped     ▼                       │
//!    │ (from any state)   └──────────────── Processing ◄──► Matching       │
//!    │                                             │ terminal event        │
//!    │                                             └───────────────────────┘
//!   Error ◄── fatal device / transport failure (from any state)
//! ```
//!
//! `recognition_success` and `recognition_failed` are not resting states: the
//! machine records them as the last [`CaptureOutcome`] and settles back in
//! `ScanningReady` so the operator can capture again.

use std::fmt;

use uuid::Uuid;

/// Unique identifier for one scanning session.
pub type SessionId = Uuid;
/// Identifier of the exam being graded.
pub type ExamId = String;
/// Identifier of the answer-sheet template the service aligns against.
pub type TemplateId = String;

/// Parameters the operator supplies when starting a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub exam_id: ExamId,
    pub template_id: TemplateId,
}

/// State of the duplex channel to the recognition service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Failures that end a session and park the machine in [`ScanState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    DeviceUnavailable,
    PermissionDenied,
    DeviceDisconnected,
    ConnectionLost,
}

impl FatalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FatalKind::DeviceUnavailable => "device_unavailable",
            FatalKind::PermissionDenied => "permission_denied",
            FatalKind::DeviceDisconnected => "device_disconnected",
            FatalKind::ConnectionLost => "connection_lost",
        }
    }
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authoritative scan state of the current session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScanState {
    /// No session.  Initial state and the state after a clean stop.
    #[default]
    Idle,
    /// Waiting for the device and the first (or a replacement) connection.
    Connecting,
    /// Connected with the device acquired; a capture may be issued.
    ScanningReady,
    /// A frame is in flight and the service has not started matching yet.
    Processing { sequence: u64 },
    /// The service is matching the in-flight frame against the template.
    Matching { sequence: u64 },
    /// The session ended on a fatal failure.  Only `start` leaves this state.
    Error { kind: FatalKind, message: String },
}

impl ScanState {
    /// Wire-style label used by the operator console.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Connecting => "connecting",
            ScanState::ScanningReady => "scanning_ready",
            ScanState::Processing { .. } => "processing",
            ScanState::Matching { .. } => "matching",
            ScanState::Error { .. } => "error",
        }
    }

    /// Returns `true` while a session exists (everything but `Idle` and `Error`).
    pub fn is_active(&self) -> bool {
        !matches!(self, ScanState::Idle | ScanState::Error { .. })
    }

    /// Sequence number of the frame in flight, if any.
    pub fn in_flight(&self) -> Option<u64> {
        match self {
            ScanState::Processing { sequence } | ScanState::Matching { sequence } => {
                Some(*sequence)
            }
            _ => None,
        }
    }
}

/// Why a capture cycle ended without a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The service could not read the sheet (misalignment, unreadable marks…).
    Recognition(String),
    /// The service reported an internal error for this frame.
    ServiceError(String),
    /// No terminal event arrived within the capture window.
    Timeout,
    /// The connection dropped while the frame was in flight.
    ConnectionLost,
}

impl FailureReason {
    /// Stable reason code shown next to the retry prompt.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Recognition(_) => "recognition_failed",
            FailureReason::ServiceError(_) => "service_error",
            FailureReason::Timeout => "timeout",
            FailureReason::ConnectionLost => "connection_lost",
        }
    }
}

/// How the most recent capture cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Succeeded {
        sequence: u64,
        message: String,
    },
    Failed {
        sequence: u64,
        reason: FailureReason,
        message: String,
        /// Aligned/annotated image (base64) the service attached, if any.
        preview: Option<String>,
    },
}

impl CaptureOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            CaptureOutcome::Succeeded { sequence, .. } | CaptureOutcome::Failed { sequence, .. } => {
                *sequence
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CaptureOutcome::Succeeded { .. })
    }
}

/// One scanning run, from `start` until `stop` or a fatal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: SessionId,
    pub exam_id: ExamId,
    pub template_id: TemplateId,
    pub connection_state: ConnectionState,
    pub scan_state: ScanState,
}

impl Session {
    pub fn new(session_id: SessionId, params: SessionParams) -> Self {
        Self {
            session_id,
            exam_id: params.exam_id,
            template_id: params.template_id,
            connection_state: ConnectionState::Disconnected,
            scan_state: ScanState::Connecting,
        }
    }

    pub fn params(&self) -> SessionParams {
        SessionParams {
            exam_id: self.exam_id.clone(),
            template_id: self.template_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_starts_connecting_and_disconnected() {
        let session = Session::new(
            Uuid::new_v4(),
            SessionParams {
                exam_id: "exam-1".into(),
                template_id: "tpl-a".into(),
            },
        );

        assert_eq!(session.scan_state, ScanState::Connecting);
        assert_eq!(session.connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_scan_state_in_flight_only_for_processing_and_matching() {
        assert_eq!(ScanState::Processing { sequence: 3 }.in_flight(), Some(3));
        assert_eq!(ScanState::Matching { sequence: 4 }.in_flight(), Some(4));
        assert_eq!(ScanState::ScanningReady.in_flight(), None);
        assert_eq!(ScanState::Idle.in_flight(), None);
    }

    #[test]
    fn test_idle_and_error_are_not_active() {
        assert!(!ScanState::Idle.is_active());
        assert!(!ScanState::Error {
            kind: FatalKind::ConnectionLost,
            message: String::new()
        }
        .is_active());
        assert!(ScanState::Connecting.is_active());
        assert!(ScanState::ScanningReady.is_active());
    }

    #[test]
    fn test_failure_reason_codes() {
        assert_eq!(FailureReason::Timeout.code(), "timeout");
        assert_eq!(FailureReason::ConnectionLost.code(), "connection_lost");
        assert_eq!(
            FailureReason::Recognition("x".into()).code(),
            "recognition_failed"
        );
        assert_eq!(FailureReason::ServiceError("x".into()).code(), "service_error");
    }
}
