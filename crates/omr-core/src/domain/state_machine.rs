//! The session state machine: single authority on what the session is doing.
//!
//! # How events flow (for beginners)
//!
//! Two kinds of input move the machine:
//!
//! 1. **Operator commands** – [`start`](SessionStateMachine::start),
//!    [`begin_capture`](SessionStateMachine::begin_capture) and
//!    [`stop`](SessionStateMachine::stop).
//! 2. **Tagged transport events** – everything the transport reports
//!    (connection attempts, opens, drops, service messages) arrives with an
//!    [`EventTag`] naming the session and connection generation that
//!    produced it.
//!
//! Before a transport event is allowed to touch anything, its tag is checked:
//!
//! ```text
//!   no session?               → Discarded(NoSession)
//!   other session id?         → Discarded(StaleSession)
//!   generation ≠ current?     → Discarded(StaleGeneration)
//!   otherwise                 → apply the transition
//! ```
//!
//! That one gate is what keeps a slow message from a dead connection (or a
//! dead session) from flipping the display back to "matching" after the
//! operator has already moved on.
//!
//! # Terminal bookkeeping
//!
//! Each issued sequence number ends exactly once.  The machine remembers the
//! set of sequence numbers that already reached a terminal outcome, so a
//! repeated `recognition_failed` or a second `result_saved` for the same
//! frame collapses to the first one.  A `result_saved` arriving *after* the
//! capture ended (for example after a `recognition_success` that carried no
//! payload) is surfaced as [`EventDisposition::LateResult`] so the reconciler
//! can still commit it.
//!
//! # Stragglers from timed-out frames
//!
//! A timeout only ends the capture on this side; the service keeps working
//! on the frame and answers later.  Most `progress` events carry no sequence
//! number, so the machine keeps the timed-out frames the service has not
//! answered yet.  The service handles frames in order, so while one of them
//! is outstanding a bare terminal `progress` belongs to it, not to the frame
//! now in flight, and is dropped as [`DiscardReason::Straggler`].  Once the
//! service reports `processing`/`matching` for the new frame it has moved
//! on, and bare terminal events apply to the new frame again.
//!
//! The machine is plain data with no clock and no I/O.  The scanner
//! application owns the only instance and serializes all calls into it.

use std::collections::{BTreeSet, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::domain::reconciler::RecognitionResult;
use crate::domain::session::{
    CaptureOutcome, ConnectionState, FailureReason, FatalKind, ScanState, Session, SessionId,
    SessionParams,
};
use crate::protocol::messages::{ProgressDetails, ProgressStatus, ServiceMessage};
use crate::protocol::sequence::Generation;

// ── Inputs and outputs ────────────────────────────────────────────────────────

/// Provenance stamped on every transport event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTag {
    pub session_id: SessionId,
    pub generation: Generation,
}

impl EventTag {
    pub fn new(session_id: SessionId, generation: Generation) -> Self {
        Self {
            session_id,
            generation,
        }
    }
}

/// Why an operator command was refused.  The machine is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandRejected {
    #[error("no active session")]
    NoSession,

    #[error("capture is only allowed in scanning_ready (current state: {state})")]
    NotReady { state: &'static str },

    #[error("sequence {sequence} was not issued after {last_issued}")]
    SequenceRegressed { sequence: u64, last_issued: u64 },
}

/// Result of [`SessionStateMachine::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session was created and is now `connecting`.
    Started,
    /// A session is already running; nothing changed.
    AlreadyActive(ScanState),
}

/// One capture cycle reaching its terminal outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureCompletion {
    pub outcome: CaptureOutcome,
    /// Graded payload to offer the reconciler, when the event carried one.
    pub result: Option<RecognitionResult>,
}

impl CaptureCompletion {
    pub fn sequence(&self) -> u64 {
        self.outcome.sequence()
    }
}

/// Why an inbound event was dropped without changing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    NoSession,
    StaleSession,
    StaleGeneration,
    /// A second terminal event for a sequence that already ended.
    DuplicateTerminal(u64),
    /// A bare terminal `progress` that answers the earlier, timed-out frame.
    Straggler(u64),
    /// Well-formed JSON that makes no sense in the current state.
    ProtocolViolation(String),
}

/// What the machine did with a service message.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDisposition {
    /// An intermediate status was applied; carries the resulting state.
    Progressed(ScanState),
    /// The in-flight capture ended.
    Completed(CaptureCompletion),
    /// A `result_saved` for a capture that had already ended.
    LateResult(RecognitionResult),
    Discarded(DiscardReason),
}

/// Latest `progress` status and message accepted from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub status: ProgressStatus,
    pub message: String,
}

// ── Machine ───────────────────────────────────────────────────────────────────

/// Explicit state machine for one station.
///
/// Holds at most one [`Session`].  When there is none, [`scan_state`]
/// reports the resting state: `Idle` after a clean stop, `Error` after a
/// fatal failure.
///
/// [`scan_state`]: SessionStateMachine::scan_state
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    session: Option<Session>,
    resting: ScanState,
    generation: Generation,
    last_issued: u64,
    terminated: HashSet<u64>,
    /// Timed-out frames the service has not answered yet, oldest first.
    unanswered: BTreeSet<u64>,
    /// The service has reported `processing`/`matching` for the frame in flight.
    acknowledged: bool,
    last_progress: Option<ProgressSnapshot>,
    last_outcome: Option<CaptureOutcome>,
    reconnect_attempt: Option<u32>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.session_id)
    }

    pub fn scan_state(&self) -> &ScanState {
        self.session
            .as_ref()
            .map_or(&self.resting, |s| &s.scan_state)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map_or(ConnectionState::Disconnected, |s| s.connection_state)
    }

    /// Generation of the connection whose events are currently accepted.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn last_progress(&self) -> Option<&ProgressSnapshot> {
        self.last_progress.as_ref()
    }

    pub fn last_outcome(&self) -> Option<&CaptureOutcome> {
        self.last_outcome.as_ref()
    }

    /// Attempt number while the transport is backing off, `None` otherwise.
    pub fn reconnect_attempt(&self) -> Option<u32> {
        self.reconnect_attempt
    }

    /// Returns `true` if a `capture` command would currently be accepted.
    pub fn can_capture(&self) -> bool {
        matches!(self.scan_state(), ScanState::ScanningReady)
    }

    // ── Operator commands ───────────────────────────────────────────────────

    /// Opens a new session in `connecting`.
    ///
    /// A no-op while a session is already running.  From `idle` or `error`
    /// all per-session bookkeeping starts over.
    pub fn start(&mut self, session_id: SessionId, params: SessionParams) -> StartOutcome {
        if let Some(session) = &self.session {
            return StartOutcome::AlreadyActive(session.scan_state.clone());
        }

        let mut session = Session::new(session_id, params);
        session.connection_state = ConnectionState::Connecting;
        self.session = Some(session);
        self.resting = ScanState::Idle;
        self.generation = Generation::NONE;
        self.last_issued = 0;
        self.terminated.clear();
        self.unanswered.clear();
        self.acknowledged = false;
        self.last_progress = None;
        self.last_outcome = None;
        self.reconnect_attempt = None;
        StartOutcome::Started
    }

    /// Checks the `capture` precondition without changing anything.
    pub fn check_capture(&self) -> Result<(), CommandRejected> {
        match &self.session {
            None => Err(CommandRejected::NoSession),
            Some(s) if s.scan_state == ScanState::ScanningReady => Ok(()),
            Some(s) => Err(CommandRejected::NotReady {
                state: s.scan_state.as_str(),
            }),
        }
    }

    /// Records that frame `sequence` has been issued; moves to `processing`.
    pub fn begin_capture(&mut self, sequence: u64) -> Result<(), CommandRejected> {
        self.check_capture()?;
        if sequence <= self.last_issued {
            return Err(CommandRejected::SequenceRegressed {
                sequence,
                last_issued: self.last_issued,
            });
        }
        if let Some(session) = self.session.as_mut() {
            session.scan_state = ScanState::Processing { sequence };
        }
        self.last_issued = sequence;
        self.acknowledged = false;
        self.last_progress = None;
        Ok(())
    }

    /// Ends the session and returns to `idle`.  Idempotent.
    ///
    /// Returns `true` if a session (or an error state) was cleared.
    pub fn stop(&mut self) -> bool {
        let had_session = self.session.take().is_some();
        let was_error = matches!(self.resting, ScanState::Error { .. });
        self.resting = ScanState::Idle;
        self.reconnect_attempt = None;
        had_session || was_error
    }

    // ── Failures raised by the application ──────────────────────────────────

    /// Destroys the session and parks the machine in `error`.
    ///
    /// Returns the sequence of the capture that was abandoned, if any.
    pub fn fail_fatal(&mut self, kind: FatalKind, message: impl Into<String>) -> Option<u64> {
        let session = self.session.take()?;
        let abandoned = session.scan_state.in_flight();
        if let Some(seq) = abandoned {
            self.terminated.insert(seq);
        }
        self.resting = ScanState::Error {
            kind,
            message: message.into(),
        };
        self.reconnect_attempt = None;
        abandoned
    }

    /// Fails the in-flight capture `sequence` with reason `timeout`.
    ///
    /// Returns `None` if that capture already ended (the timer lost the race).
    pub fn capture_timed_out(&mut self, sequence: u64) -> Option<CaptureCompletion> {
        if self.scan_state().in_flight() != Some(sequence) {
            return None;
        }
        self.unanswered.insert(sequence);
        Some(self.finish(
            CaptureOutcome::Failed {
                sequence,
                reason: FailureReason::Timeout,
                message: "no response from the recognition service".to_string(),
                preview: None,
            },
            None,
        ))
    }

    // ── Transport events ────────────────────────────────────────────────────

    /// The transport is (re)trying to connect.
    pub fn connection_attempt(&mut self, tag: EventTag, attempt: u32) -> bool {
        if self.gate(tag).is_err() {
            return false;
        }
        if let Some(session) = self.session.as_mut() {
            session.connection_state = ConnectionState::Connecting;
        }
        self.reconnect_attempt = Some(attempt);
        true
    }

    /// A new connection opened.  Its generation becomes the current one.
    pub fn connection_opened(&mut self, tag: EventTag) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.session_id != tag.session_id || tag.generation <= self.generation {
            return false;
        }
        self.generation = tag.generation;
        self.reconnect_attempt = None;
        // A fresh connection never carries answers for frames sent on an old one.
        self.unanswered.clear();
        session.connection_state = ConnectionState::Connected;
        if session.scan_state == ScanState::Connecting {
            session.scan_state = ScanState::ScanningReady;
        }
        true
    }

    /// The current connection dropped unexpectedly; reconnection is running.
    ///
    /// An in-flight capture cannot be answered on the next connection, so it
    /// is failed with reason `connection_lost`.
    pub fn connection_dropped(&mut self, tag: EventTag) -> Option<CaptureCompletion> {
        self.gate(tag).ok()?;
        let in_flight = self.scan_state().in_flight();
        let completion = in_flight.map(|sequence| {
            self.finish(
                CaptureOutcome::Failed {
                    sequence,
                    reason: FailureReason::ConnectionLost,
                    message: "connection lost while the frame was in flight".to_string(),
                    preview: None,
                },
                None,
            )
        });
        if let Some(session) = self.session.as_mut() {
            session.connection_state = ConnectionState::Connecting;
            session.scan_state = ScanState::Connecting;
        }
        completion
    }

    /// The transport used up its reconnect budget.
    pub fn connection_exhausted(&mut self, tag: EventTag, message: impl Into<String>) -> bool {
        if self.gate(tag).is_err() {
            return false;
        }
        self.fail_fatal(FatalKind::ConnectionLost, message);
        true
    }

    /// Applies one inbound service message.
    pub fn apply(&mut self, tag: EventTag, msg: &ServiceMessage) -> EventDisposition {
        if let Err(reason) = self.gate(tag) {
            debug!(
                "dropping {} from {} ({:?})",
                msg.type_name(),
                tag.generation,
                reason
            );
            return EventDisposition::Discarded(reason);
        }
        match msg {
            ServiceMessage::Progress {
                status,
                message,
                details,
            } => self.apply_progress(*status, message, details.as_ref()),
            ServiceMessage::ResultSaved {
                success,
                sequence_number,
                ..
            } => self.apply_result_saved(*success, *sequence_number, msg),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn gate(&self, tag: EventTag) -> Result<(), DiscardReason> {
        let session = self.session.as_ref().ok_or(DiscardReason::NoSession)?;
        if session.session_id != tag.session_id {
            return Err(DiscardReason::StaleSession);
        }
        if tag.generation != self.generation {
            return Err(DiscardReason::StaleGeneration);
        }
        Ok(())
    }

    fn apply_progress(
        &mut self,
        status: ProgressStatus,
        message: &str,
        details: Option<&ProgressDetails>,
    ) -> EventDisposition {
        let in_flight = self.scan_state().in_flight();
        let named = details.and_then(|d| d.sequence_number);

        let disposition = match status {
            ProgressStatus::Idle => EventDisposition::Progressed(self.scan_state().clone()),
            ProgressStatus::Processing | ProgressStatus::Matching => {
                let Some(sequence) = in_flight else {
                    if let Some(&earlier) = self.unanswered.first() {
                        return EventDisposition::Discarded(DiscardReason::Straggler(earlier));
                    }
                    return self.violation(format!("{} with no frame in flight", status.as_str()));
                };
                if named.is_some_and(|n| n != sequence) {
                    return self.stale_or_violation(named, status);
                }
                self.acknowledged = true;
                self.unanswered.clear();
                let next = if status == ProgressStatus::Processing {
                    ScanState::Processing { sequence }
                } else {
                    ScanState::Matching { sequence }
                };
                if let Some(session) = self.session.as_mut() {
                    session.scan_state = next.clone();
                }
                EventDisposition::Progressed(next)
            }
            _ => {
                let sequence = match (in_flight, named) {
                    (Some(seq), Some(n)) if n == seq => seq,
                    (Some(seq), None) if self.unanswered.is_empty() || self.acknowledged => seq,
                    (_, None) if !self.unanswered.is_empty() => return self.straggler(status),
                    _ => return self.stale_or_violation(named, status),
                };
                let (outcome, result) = terminal_outcome(sequence, status, message, details);
                EventDisposition::Completed(self.finish(outcome, result))
            }
        };

        self.last_progress = Some(ProgressSnapshot {
            status,
            message: message.to_string(),
        });
        disposition
    }

    fn apply_result_saved(
        &mut self,
        success: bool,
        sequence: u64,
        msg: &ServiceMessage,
    ) -> EventDisposition {
        let Some(result) = RecognitionResult::from_result_saved(msg) else {
            return self.violation("result_saved could not be read".to_string());
        };

        if self.scan_state().in_flight() == Some(sequence) {
            let outcome = if success {
                CaptureOutcome::Succeeded {
                    sequence,
                    message: "result saved".to_string(),
                }
            } else {
                CaptureOutcome::Failed {
                    sequence,
                    reason: FailureReason::Recognition("result not saved".to_string()),
                    message: "the service could not save this sheet".to_string(),
                    preview: None,
                }
            };
            return EventDisposition::Completed(self.finish(outcome, Some(result)));
        }

        if self.terminated.contains(&sequence) {
            self.unanswered.remove(&sequence);
            return EventDisposition::LateResult(result);
        }
        self.violation(format!(
            "result_saved for sequence {sequence} which is not in flight (last issued {})",
            self.last_issued
        ))
    }

    /// Attributes a bare terminal event to the oldest unanswered timed-out frame.
    fn straggler(&mut self, status: ProgressStatus) -> EventDisposition {
        match self.unanswered.pop_first() {
            Some(sequence) => {
                debug!(
                    "{} answers timed-out frame {sequence}; dropped",
                    status.as_str()
                );
                EventDisposition::Discarded(DiscardReason::Straggler(sequence))
            }
            None => self.violation(format!("{} with no frame in flight", status.as_str())),
        }
    }

    /// A terminal-looking event that does not match the in-flight frame.
    fn stale_or_violation(
        &mut self,
        named: Option<u64>,
        status: ProgressStatus,
    ) -> EventDisposition {
        let target = named.unwrap_or(self.last_issued);
        if target != 0 && self.terminated.contains(&target) {
            if status.is_terminal() {
                self.unanswered.remove(&target);
            }
            return EventDisposition::Discarded(DiscardReason::DuplicateTerminal(target));
        }
        self.violation(format!(
            "{} does not match any frame in flight",
            status.as_str()
        ))
    }

    fn violation(&self, detail: String) -> EventDisposition {
        EventDisposition::Discarded(DiscardReason::ProtocolViolation(detail))
    }

    /// Records a terminal outcome and settles back in `scanning_ready`.
    fn finish(
        &mut self,
        outcome: CaptureOutcome,
        result: Option<RecognitionResult>,
    ) -> CaptureCompletion {
        self.terminated.insert(outcome.sequence());
        if let Some(session) = self.session.as_mut() {
            session.scan_state = ScanState::ScanningReady;
        }
        self.last_outcome = Some(outcome.clone());
        CaptureCompletion { outcome, result }
    }
}

fn terminal_outcome(
    sequence: u64,
    status: ProgressStatus,
    message: &str,
    details: Option<&ProgressDetails>,
) -> (CaptureOutcome, Option<RecognitionResult>) {
    if status.is_success() {
        let result = details.and_then(|d| RecognitionResult::from_success_details(sequence, d));
        let outcome = CaptureOutcome::Succeeded {
            sequence,
            message: message.to_string(),
        };
        return (outcome, result);
    }

    let reason_text = details
        .and_then(|d| d.reason.clone())
        .unwrap_or_else(|| message.to_string());
    let reason = if status == ProgressStatus::Error {
        FailureReason::ServiceError(reason_text)
    } else {
        FailureReason::Recognition(reason_text)
    };
    let outcome = CaptureOutcome::Failed {
        sequence,
        reason,
        message: message.to_string(),
        preview: details.and_then(|d| d.aligned_image.clone()),
    };
    (outcome, None)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn params() -> SessionParams {
        SessionParams {
            exam_id: "exam-1".into(),
            template_id: "tpl-a".into(),
        }
    }

    fn progress(status: ProgressStatus) -> ServiceMessage {
        ServiceMessage::Progress {
            status,
            message: status.as_str().to_string(),
            details: None,
        }
    }

    fn saved(sequence: u64, board: &str) -> ServiceMessage {
        ServiceMessage::ResultSaved {
            success: true,
            sequence_number: sequence,
            board_number: Some(board.into()),
            student_match: None,
            total_score: Some(8.5),
            answers: Vec::new(),
        }
    }

    /// Machine with an open session connected on generation 1.
    fn ready() -> (SessionStateMachine, EventTag) {
        let mut m = SessionStateMachine::new();
        let id = Uuid::new_v4();
        m.start(id, params());
        let tag = EventTag::new(id, Generation(1));
        assert!(m.connection_opened(tag));
        (m, tag)
    }

    #[test]
    fn test_start_moves_idle_to_connecting() {
        // Arrange
        let mut m = SessionStateMachine::new();

        // Act
        let outcome = m.start(Uuid::new_v4(), params());

        // Assert
        assert_eq!(outcome, StartOutcome::Started);
        assert_eq!(m.scan_state(), &ScanState::Connecting);
        assert_eq!(m.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_start_while_active_is_noop() {
        let (mut m, tag) = ready();

        let outcome = m.start(Uuid::new_v4(), params());

        assert_eq!(outcome, StartOutcome::AlreadyActive(ScanState::ScanningReady));
        assert_eq!(m.session_id(), Some(tag.session_id));
    }

    #[test]
    fn test_connection_opened_moves_to_scanning_ready() {
        let (m, _) = ready();
        assert_eq!(m.scan_state(), &ScanState::ScanningReady);
        assert_eq!(m.connection_state(), ConnectionState::Connected);
        assert_eq!(m.generation(), Generation(1));
    }

    #[test]
    fn test_capture_rejected_outside_scanning_ready() {
        // Arrange: connecting, nothing opened yet
        let mut m = SessionStateMachine::new();
        m.start(Uuid::new_v4(), params());

        // Act
        let result = m.begin_capture(1);

        // Assert
        assert_eq!(
            result,
            Err(CommandRejected::NotReady {
                state: "connecting"
            })
        );
        assert_eq!(m.scan_state(), &ScanState::Connecting);
    }

    #[test]
    fn test_capture_rejected_without_session() {
        let mut m = SessionStateMachine::new();
        assert_eq!(m.begin_capture(1), Err(CommandRejected::NoSession));
    }

    #[test]
    fn test_second_capture_rejected_while_in_flight() {
        let (mut m, _) = ready();
        m.begin_capture(1).unwrap();

        let second = m.begin_capture(2);

        assert!(matches!(second, Err(CommandRejected::NotReady { .. })));
        assert_eq!(m.scan_state(), &ScanState::Processing { sequence: 1 });
    }

    #[test]
    fn test_processing_matching_then_result_saved_completes() {
        // Arrange
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();

        // Act
        m.apply(tag, &progress(ProgressStatus::Processing));
        let matching = m.apply(tag, &progress(ProgressStatus::Matching));
        let done = m.apply(tag, &saved(1, "045"));

        // Assert
        assert_eq!(
            matching,
            EventDisposition::Progressed(ScanState::Matching { sequence: 1 })
        );
        match done {
            EventDisposition::Completed(c) => {
                assert!(c.outcome.is_success());
                let result = c.result.expect("payload must be handed over");
                assert_eq!(result.board_number.as_deref(), Some("045"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(m.scan_state(), &ScanState::ScanningReady);
    }

    #[test]
    fn test_recognition_failed_keeps_preview_and_returns_to_ready() {
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();
        let msg = ServiceMessage::Progress {
            status: ProgressStatus::RecognitionFailed,
            message: "misaligned".into(),
            details: Some(ProgressDetails {
                aligned_image: Some("iVBORw0K".into()),
                ..Default::default()
            }),
        };

        let disposition = m.apply(tag, &msg);

        match disposition {
            EventDisposition::Completed(c) => match c.outcome {
                CaptureOutcome::Failed {
                    reason, preview, ..
                } => {
                    assert_eq!(reason, FailureReason::Recognition("misaligned".into()));
                    assert_eq!(preview.as_deref(), Some("iVBORw0K"));
                }
                other => panic!("expected failure, got {other:?}"),
            },
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(m.scan_state(), &ScanState::ScanningReady);
    }

    #[test]
    fn test_service_error_status_is_service_error_failure() {
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();

        let disposition = m.apply(tag, &progress(ProgressStatus::Error));

        let EventDisposition::Completed(c) = disposition else {
            panic!("expected completion");
        };
        assert!(matches!(
            c.outcome,
            CaptureOutcome::Failed {
                reason: FailureReason::ServiceError(_),
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_terminal_collapses_to_first() {
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();
        m.apply(tag, &progress(ProgressStatus::RecognitionFailed));

        let again = m.apply(tag, &progress(ProgressStatus::RecognitionFailed));

        assert_eq!(
            again,
            EventDisposition::Discarded(DiscardReason::DuplicateTerminal(1))
        );
        assert_eq!(m.scan_state(), &ScanState::ScanningReady);
    }

    #[test]
    fn test_result_saved_after_success_progress_is_late_result() {
        // Arrange: success without a payload, then the saved result
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();
        m.apply(tag, &progress(ProgressStatus::RecognitionSuccess));

        // Act
        let late = m.apply(tag, &saved(1, "045"));

        // Assert
        match late {
            EventDisposition::LateResult(r) => assert_eq!(r.sequence_number, 1),
            other => panic!("expected late result, got {other:?}"),
        }
    }

    #[test]
    fn test_result_saved_for_unissued_sequence_is_violation() {
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();

        let disposition = m.apply(tag, &saved(9, "045"));

        assert!(matches!(
            disposition,
            EventDisposition::Discarded(DiscardReason::ProtocolViolation(_))
        ));
        assert_eq!(m.scan_state(), &ScanState::Processing { sequence: 1 });
    }

    #[test]
    fn test_matching_without_frame_in_flight_is_violation() {
        let (mut m, tag) = ready();

        let disposition = m.apply(tag, &progress(ProgressStatus::Matching));

        assert!(matches!(
            disposition,
            EventDisposition::Discarded(DiscardReason::ProtocolViolation(_))
        ));
        assert_eq!(m.scan_state(), &ScanState::ScanningReady);
    }

    #[test]
    fn test_stale_generation_event_leaves_state_unchanged() {
        // Arrange: in flight on generation 1, then a reconnect to generation 2
        let (mut m, old) = ready();
        m.connection_dropped(old);
        let new = EventTag::new(old.session_id, Generation(2));
        m.connection_opened(new);
        m.begin_capture(1).unwrap();
        let before = m.scan_state().clone();

        // Act
        let disposition = m.apply(old, &progress(ProgressStatus::Matching));

        // Assert
        assert_eq!(
            disposition,
            EventDisposition::Discarded(DiscardReason::StaleGeneration)
        );
        assert_eq!(m.scan_state(), &before);
    }

    #[test]
    fn test_events_from_previous_session_are_discarded() {
        let (mut m, old) = ready();
        m.stop();
        let id = Uuid::new_v4();
        m.start(id, params());
        m.connection_opened(EventTag::new(id, Generation(2)));

        let disposition = m.apply(old, &progress(ProgressStatus::Processing));

        assert_eq!(
            disposition,
            EventDisposition::Discarded(DiscardReason::StaleSession)
        );
    }

    #[test]
    fn test_events_after_stop_are_discarded() {
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();
        m.stop();

        let disposition = m.apply(tag, &saved(1, "045"));

        assert_eq!(
            disposition,
            EventDisposition::Discarded(DiscardReason::NoSession)
        );
        assert_eq!(m.scan_state(), &ScanState::Idle);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut m, _) = ready();

        assert!(m.stop());
        assert!(!m.stop());
        assert_eq!(m.scan_state(), &ScanState::Idle);
    }

    #[test]
    fn test_drop_mid_capture_fails_with_connection_lost() {
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();
        m.apply(tag, &progress(ProgressStatus::Matching));

        let completion = m.connection_dropped(tag).expect("capture must be failed");

        assert!(matches!(
            completion.outcome,
            CaptureOutcome::Failed {
                sequence: 1,
                reason: FailureReason::ConnectionLost,
                ..
            }
        ));
        assert_eq!(m.scan_state(), &ScanState::Connecting);
        assert_eq!(m.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_old_connection_cannot_reopen() {
        let (mut m, tag) = ready();
        m.connection_dropped(tag);

        assert!(!m.connection_opened(tag), "same generation must not reopen");
        assert_eq!(m.scan_state(), &ScanState::Connecting);
    }

    #[test]
    fn test_exhausted_moves_to_error_and_start_recovers() {
        // Arrange
        let (mut m, tag) = ready();
        m.connection_dropped(tag);
        m.connection_attempt(tag, 3);

        // Act
        assert!(m.connection_exhausted(tag, "gave up after 3 attempts"));

        // Assert
        assert!(matches!(
            m.scan_state(),
            ScanState::Error {
                kind: FatalKind::ConnectionLost,
                ..
            }
        ));
        assert!(m.session().is_none());
        assert_eq!(m.start(Uuid::new_v4(), params()), StartOutcome::Started);
        assert_eq!(m.scan_state(), &ScanState::Connecting);
    }

    #[test]
    fn test_timeout_fails_only_the_matching_capture() {
        let (mut m, _) = ready();
        m.begin_capture(1).unwrap();

        assert!(m.capture_timed_out(7).is_none());
        let completion = m.capture_timed_out(1).expect("in-flight capture must time out");

        assert!(matches!(
            completion.outcome,
            CaptureOutcome::Failed {
                reason: FailureReason::Timeout,
                ..
            }
        ));
        assert_eq!(m.scan_state(), &ScanState::ScanningReady);
        assert!(m.capture_timed_out(1).is_none(), "second timeout is a no-op");
    }

    #[test]
    fn test_bare_terminal_after_timeout_answers_the_timed_out_frame() {
        // Arrange: frame 1 timed out, frame 2 in flight but not yet picked up
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();
        m.capture_timed_out(1).expect("frame 1 times out");
        m.begin_capture(2).unwrap();
        let late_failure = ServiceMessage::Progress {
            status: ProgressStatus::RecognitionFailed,
            message: "frame1 misaligned".into(),
            details: None,
        };

        // Act
        let disposition = m.apply(tag, &late_failure);

        // Assert
        assert_eq!(
            disposition,
            EventDisposition::Discarded(DiscardReason::Straggler(1))
        );
        assert_eq!(m.scan_state(), &ScanState::Processing { sequence: 2 });
        assert!(matches!(
            m.last_outcome(),
            Some(CaptureOutcome::Failed {
                sequence: 1,
                reason: FailureReason::Timeout,
                ..
            })
        ));

        // Frame 2 still completes normally afterwards.
        m.apply(tag, &progress(ProgressStatus::Processing));
        m.apply(tag, &progress(ProgressStatus::Matching));
        let done = m.apply(tag, &saved(2, "046"));
        assert!(matches!(
            done,
            EventDisposition::Completed(CaptureCompletion {
                outcome: CaptureOutcome::Succeeded { sequence: 2, .. },
                ..
            })
        ));
    }

    #[test]
    fn test_bare_terminal_applies_once_new_frame_is_picked_up() {
        // Arrange
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();
        m.capture_timed_out(1);
        m.begin_capture(2).unwrap();
        m.apply(tag, &progress(ProgressStatus::Processing));

        // Act
        let disposition = m.apply(tag, &progress(ProgressStatus::RecognitionFailed));

        // Assert
        assert!(matches!(
            disposition,
            EventDisposition::Completed(CaptureCompletion {
                outcome: CaptureOutcome::Failed { sequence: 2, .. },
                ..
            })
        ));
        assert_eq!(m.scan_state(), &ScanState::ScanningReady);
    }

    #[test]
    fn test_straggler_progress_while_ready_is_not_a_violation() {
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();
        m.capture_timed_out(1);

        let matching = m.apply(tag, &progress(ProgressStatus::Matching));
        let failed = m.apply(tag, &progress(ProgressStatus::RecognitionFailed));

        assert_eq!(
            matching,
            EventDisposition::Discarded(DiscardReason::Straggler(1))
        );
        assert_eq!(failed, EventDisposition::Discarded(DiscardReason::Straggler(1)));
        assert_eq!(m.scan_state(), &ScanState::ScanningReady);
    }

    #[test]
    fn test_new_connection_forgets_unanswered_frames() {
        let (mut m, tag) = ready();
        m.begin_capture(1).unwrap();
        m.capture_timed_out(1);
        m.connection_dropped(tag);
        let next = EventTag::new(tag.session_id, Generation(2));
        assert!(m.connection_opened(next));
        m.begin_capture(2).unwrap();

        let disposition = m.apply(next, &progress(ProgressStatus::RecognitionFailed));

        assert!(matches!(
            disposition,
            EventDisposition::Completed(CaptureCompletion {
                outcome: CaptureOutcome::Failed { sequence: 2, .. },
                ..
            })
        ));
    }

    #[test]
    fn test_fatal_device_error_destroys_session() {
        let (mut m, _) = ready();
        m.begin_capture(1).unwrap();

        let abandoned = m.fail_fatal(FatalKind::DeviceDisconnected, "camera unplugged");

        assert_eq!(abandoned, Some(1));
        assert!(matches!(
            m.scan_state(),
            ScanState::Error {
                kind: FatalKind::DeviceDisconnected,
                ..
            }
        ));
        assert!(m.stop(), "stop clears the error state");
        assert_eq!(m.scan_state(), &ScanState::Idle);
    }

    #[test]
    fn test_sequence_numbers_must_increase() {
        let (mut m, tag) = ready();
        m.begin_capture(2).unwrap();
        m.apply(tag, &saved(2, "045"));

        let result = m.begin_capture(2);

        assert_eq!(
            result,
            Err(CommandRejected::SequenceRegressed {
                sequence: 2,
                last_issued: 2
            })
        );
    }
}
