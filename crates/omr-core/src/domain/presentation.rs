//! Read-only projection of the session for the operator.
//!
//! [`project`] is a pure function of the state machine and the reconciler.
//! It never stores anything, so the view can be rebuilt after every input
//! and compared with the previous one to decide whether to redraw.

use crate::domain::reconciler::{RecognitionResult, ResultReconciler, SessionStats};
use crate::domain::session::{
    CaptureOutcome, ConnectionState, FailureReason, ScanState, SessionId,
};
use crate::domain::state_machine::SessionStateMachine;

/// Inline retry prompt for the most recent failed capture.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureNotice {
    pub sequence: u64,
    /// Stable reason code (`recognition_failed`, `timeout`…).
    pub reason: &'static str,
    pub message: String,
    /// Aligned image (base64) showing why the sheet was rejected.
    pub preview: Option<String>,
}

/// Everything the operator console renders.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: Option<SessionId>,
    pub state: ScanState,
    /// Short human label for `state`.
    pub label: String,
    pub connection: ConnectionState,
    pub reconnect_attempt: Option<u32>,
    /// Latest status text from the service, or the label when there is none.
    pub status_text: String,
    pub can_capture: bool,
    pub in_flight: Option<u64>,
    pub last_result: Option<RecognitionResult>,
    /// Present only while the most recent capture is a failure.
    pub failure: Option<FailureNotice>,
    pub stats: SessionStats,
}

impl Default for SessionView {
    fn default() -> Self {
        project(&SessionStateMachine::new(), &ResultReconciler::new())
    }
}

/// Builds the operator view from the authoritative state.
pub fn project(machine: &SessionStateMachine, reconciler: &ResultReconciler) -> SessionView {
    let state = machine.scan_state().clone();
    let label = label_for(&state, machine.reconnect_attempt());
    let status_text = match (&state, machine.last_progress()) {
        (ScanState::Processing { .. } | ScanState::Matching { .. }, Some(p))
            if !p.message.is_empty() =>
        {
            p.message.clone()
        }
        _ => label.clone(),
    };

    // A result saved after the capture failed (late answer to a timeout)
    // supersedes the retry prompt for that frame.
    let failure = match machine.last_outcome() {
        Some(CaptureOutcome::Failed {
            sequence,
            reason,
            message,
            preview,
        }) => Some(FailureNotice {
            sequence: *sequence,
            reason: reason.code(),
            message: failure_text(reason, message),
            preview: preview.clone(),
        })
        .filter(|notice| !reconciler.has_saved(notice.sequence)),
        _ => None,
    };

    SessionView {
        session_id: machine.session_id(),
        in_flight: state.in_flight(),
        can_capture: machine.can_capture(),
        connection: machine.connection_state(),
        reconnect_attempt: machine.reconnect_attempt(),
        last_result: reconciler.last_result().cloned(),
        stats: reconciler.stats(),
        state,
        label,
        status_text,
        failure,
    }
}

fn label_for(state: &ScanState, reconnect_attempt: Option<u32>) -> String {
    match state {
        ScanState::Idle => "Idle".to_string(),
        ScanState::Connecting => match reconnect_attempt {
            Some(n) if n > 1 => format!("Reconnecting (attempt {n})"),
            _ => "Connecting".to_string(),
        },
        ScanState::ScanningReady => "Ready to scan".to_string(),
        ScanState::Processing { sequence } => format!("Processing frame {sequence}"),
        ScanState::Matching { sequence } => format!("Matching frame {sequence}"),
        ScanState::Error { kind, message } => format!("Error ({kind}): {message}"),
    }
}

fn failure_text(reason: &FailureReason, message: &str) -> String {
    match reason {
        FailureReason::Timeout | FailureReason::ConnectionLost => message.to_string(),
        FailureReason::Recognition(detail) | FailureReason::ServiceError(detail) => {
            if detail.is_empty() || detail == message {
                message.to_string()
            } else {
                format!("{message} ({detail})")
            }
        }
    }
}
