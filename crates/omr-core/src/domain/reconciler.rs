//! Result reconciliation: which recognition result the operator sees.
//!
//! The service may deliver the same result more than once (a `progress`
//! success carrying the payload followed by `result_saved`, or a redelivery
//! after a flaky link).  The reconciler commits each sequence number at most
//! once and keeps exactly one "last accepted result" on display.  A failed or
//! unmatched result is recorded but never replaces what is already shown.
//!
//! Session statistics live here too.  They are derived counters only and
//! never feed back into control flow.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::protocol::messages::{ProgressDetails, QuestionAnswer, ServiceMessage};

/// Number of completed captures averaged by [`SessionStats::average_latency`].
pub const LATENCY_WINDOW: usize = 20;

/// Terminal payload for one accepted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    /// Frame the result belongs to.
    pub sequence_number: u64,
    /// `None` when the sheet could not be matched to a student.
    pub student_id: Option<String>,
    pub student_name: Option<String>,
    pub board_number: Option<String>,
    pub total_score: Option<f64>,
    pub per_question_answers: Vec<QuestionAnswer>,
    /// `true` when the service recognized and saved the sheet.
    pub matched: bool,
}

impl RecognitionResult {
    /// Builds a result from a `result_saved` message.
    ///
    /// Returns `None` for any other message type.
    pub fn from_result_saved(msg: &ServiceMessage) -> Option<Self> {
        match msg {
            ServiceMessage::ResultSaved {
                success,
                sequence_number,
                board_number,
                student_match,
                total_score,
                answers,
            } => Some(Self {
                sequence_number: *sequence_number,
                student_id: student_match.as_ref().map(|m| m.student_id.clone()),
                student_name: student_match.as_ref().and_then(|m| m.student_name.clone()),
                board_number: board_number.clone(),
                total_score: *total_score,
                per_question_answers: answers.clone(),
                matched: *success,
            }),
            ServiceMessage::Progress { .. } => None,
        }
    }

    /// Builds a result from the details of a successful `progress` event.
    ///
    /// Success details only count as a result when they name the board
    /// number; bare "done" notifications leave the payload to `result_saved`.
    pub fn from_success_details(sequence_number: u64, details: &ProgressDetails) -> Option<Self> {
        let board_number = details.board_number.clone()?;
        Some(Self {
            sequence_number,
            student_id: details.student_match.as_ref().map(|m| m.student_id.clone()),
            student_name: details
                .student_match
                .as_ref()
                .and_then(|m| m.student_name.clone()),
            board_number: Some(board_number),
            total_score: details.total_score,
            per_question_answers: details.answers.clone(),
            matched: true,
        })
    }
}

/// Outcome of [`ResultReconciler::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// First result for this sequence number; recorded.
    Committed,
    /// A result for this sequence number was already recorded.
    Duplicate,
    /// Recorded, but not a matched success, so the display is untouched.
    Unmatched,
}

/// Cumulative per-session counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub frames_captured: u64,
    pub successes: u64,
    pub failures: u64,
    /// Mean of the last [`LATENCY_WINDOW`] capture-to-terminal latencies.
    pub average_latency: Option<Duration>,
}

/// Commits recognition results and keeps the one the operator sees.
#[derive(Debug, Default)]
pub struct ResultReconciler {
    seen: HashSet<u64>,
    /// Sequences committed as matched successes.
    saved: HashSet<u64>,
    last: Option<RecognitionResult>,
    stats: SessionStats,
    latencies: VecDeque<Duration>,
}

impl ResultReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a result for commit.
    ///
    /// Only a matched result replaces the displayed one, and never with an
    /// older sequence number than the one already shown.
    pub fn accept(&mut self, result: RecognitionResult) -> Acceptance {
        if !self.seen.insert(result.sequence_number) {
            return Acceptance::Duplicate;
        }
        if !result.matched {
            return Acceptance::Unmatched;
        }
        self.saved.insert(result.sequence_number);
        let newer = self
            .last
            .as_ref()
            .map_or(true, |shown| result.sequence_number >= shown.sequence_number);
        if newer {
            self.last = Some(result);
        }
        Acceptance::Committed
    }

    /// The result currently on display.
    pub fn last_result(&self) -> Option<&RecognitionResult> {
        self.last.as_ref()
    }

    /// Returns `true` if a result for `sequence` has been recorded.
    pub fn has_seen(&self, sequence: u64) -> bool {
        self.seen.contains(&sequence)
    }

    /// Returns `true` if `sequence` was committed as a matched success.
    pub fn has_saved(&self, sequence: u64) -> bool {
        self.saved.contains(&sequence)
    }

    /// Counts a frame handed to the transport.
    pub fn record_frame_captured(&mut self) {
        self.stats.frames_captured += 1;
    }

    /// Counts one finished capture cycle and its latency.
    pub fn record_completion(&mut self, success: bool, latency: Duration) {
        if success {
            self.stats.successes += 1;
        } else {
            self.stats.failures += 1;
        }
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
        let total: Duration = self.latencies.iter().sum();
        self.stats.average_latency = Some(total / self.latencies.len() as u32);
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Forgets everything; called when a new session starts.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::StudentMatch;

    fn matched(seq: u64, board: &str, score: f64) -> RecognitionResult {
        RecognitionResult {
            sequence_number: seq,
            student_id: None,
            student_name: None,
            board_number: Some(board.to_string()),
            total_score: Some(score),
            per_question_answers: Vec::new(),
            matched: true,
        }
    }

    #[test]
    fn test_first_result_is_committed_and_displayed() {
        // Arrange
        let mut rec = ResultReconciler::new();

        // Act
        let outcome = rec.accept(matched(1, "045", 8.5));

        // Assert
        assert_eq!(outcome, Acceptance::Committed);
        let shown = rec.last_result().expect("result must be displayed");
        assert_eq!(shown.board_number.as_deref(), Some("045"));
        assert_eq!(shown.total_score, Some(8.5));
    }

    #[test]
    fn test_same_sequence_is_duplicate_the_second_time() {
        let mut rec = ResultReconciler::new();
        rec.accept(matched(1, "045", 8.5));

        let outcome = rec.accept(matched(1, "999", 1.0));

        assert_eq!(outcome, Acceptance::Duplicate);
        assert_eq!(
            rec.last_result().unwrap().board_number.as_deref(),
            Some("045"),
            "duplicate must not overwrite the display"
        );
    }

    #[test]
    fn test_unmatched_result_does_not_replace_display() {
        let mut rec = ResultReconciler::new();
        rec.accept(matched(1, "045", 8.5));
        let mut failed = matched(2, "046", 0.0);
        failed.matched = false;

        let outcome = rec.accept(failed);

        assert_eq!(outcome, Acceptance::Unmatched);
        assert_eq!(rec.last_result().unwrap().sequence_number, 1);
        assert!(rec.has_seen(2));
    }

    #[test]
    fn test_newer_matched_result_replaces_display() {
        let mut rec = ResultReconciler::new();
        rec.accept(matched(1, "045", 8.5));

        rec.accept(matched(2, "046", 9.0));

        assert_eq!(
            rec.last_result().unwrap().board_number.as_deref(),
            Some("046")
        );
    }

    #[test]
    fn test_late_older_result_is_committed_but_not_displayed() {
        let mut rec = ResultReconciler::new();
        rec.accept(matched(3, "047", 7.0));

        let outcome = rec.accept(matched(2, "046", 9.0));

        assert_eq!(outcome, Acceptance::Committed);
        assert_eq!(rec.last_result().unwrap().sequence_number, 3);
    }

    #[test]
    fn test_from_result_saved_maps_student_match() {
        let msg = ServiceMessage::ResultSaved {
            success: true,
            sequence_number: 4,
            board_number: Some("012".into()),
            student_match: Some(StudentMatch {
                student_id: "stu-1".into(),
                student_name: Some("Lee".into()),
            }),
            total_score: Some(10.0),
            answers: Vec::new(),
        };

        let result = RecognitionResult::from_result_saved(&msg).unwrap();

        assert_eq!(result.sequence_number, 4);
        assert_eq!(result.student_id.as_deref(), Some("stu-1"));
        assert_eq!(result.student_name.as_deref(), Some("Lee"));
        assert!(result.matched);
    }

    #[test]
    fn test_from_success_details_requires_board_number() {
        let empty = ProgressDetails::default();
        assert!(RecognitionResult::from_success_details(1, &empty).is_none());

        let details = ProgressDetails {
            board_number: Some("045".into()),
            total_score: Some(8.5),
            ..Default::default()
        };
        let result = RecognitionResult::from_success_details(1, &details).unwrap();
        assert!(result.matched);
        assert_eq!(result.student_id, None);
    }

    #[test]
    fn test_stats_count_outcomes_and_average_latency() {
        // Arrange
        let mut rec = ResultReconciler::new();

        // Act
        rec.record_frame_captured();
        rec.record_frame_captured();
        rec.record_completion(true, Duration::from_millis(400));
        rec.record_completion(false, Duration::from_millis(800));

        // Assert
        let stats = rec.stats();
        assert_eq!(stats.frames_captured, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.average_latency, Some(Duration::from_millis(600)));
    }

    #[test]
    fn test_average_latency_uses_rolling_window() {
        let mut rec = ResultReconciler::new();
        // One slow outlier followed by a full window of fast captures
        rec.record_completion(true, Duration::from_secs(60));
        for _ in 0..LATENCY_WINDOW {
            rec.record_completion(true, Duration::from_millis(100));
        }

        assert_eq!(
            rec.stats().average_latency,
            Some(Duration::from_millis(100)),
            "the outlier must have rolled out of the window"
        );
    }

    #[test]
    fn test_reset_clears_results_and_stats() {
        let mut rec = ResultReconciler::new();
        rec.accept(matched(1, "045", 8.5));
        rec.record_frame_captured();

        rec.reset();

        assert!(rec.last_result().is_none());
        assert!(!rec.has_seen(1));
        assert_eq!(rec.stats(), SessionStats::default());
    }
}
