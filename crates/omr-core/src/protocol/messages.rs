//! Message types for the recognition-service duplex channel.
//!
//! Every message is a JSON object carried on its own line.  The `"type"` field
//! identifies the variant and all other fields are flattened into the same
//! object, with camelCase field names:
//!
//! ```json
//! {"type":"start_scan","examId":"exam-1","templateId":"tpl-a"}
//! {"type":"frame","sequenceNumber":1,"imageData":"/9j/4AAQ...","examId":"exam-1","templateId":"tpl-a"}
//! {"type":"progress","status":"matching","message":"Matching template"}
//! {"type":"result_saved","success":true,"sequenceNumber":1,"boardNumber":"045","totalScore":8.5}
//! ```
//!
//! # Why separate client→service and service→client message types?
//!
//! The two directions carry different information.  Using two enums makes it
//! a compile-time error to send a service-only message from the station.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

// ── Client → Service messages ─────────────────────────────────────────────────

/// All messages the station sends to the recognition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens a scanning run for one exam/template pair.
    ///
    /// Sent once per connection, immediately after the channel opens
    /// (including after every successful reconnect).
    #[serde(rename_all = "camelCase")]
    StartScan {
        exam_id: String,
        template_id: String,
    },

    /// One captured still submitted for recognition.
    #[serde(rename_all = "camelCase")]
    Frame {
        /// Monotonic per-session frame number; echoed back in `result_saved`.
        sequence_number: u64,
        /// Encoded image bytes (JPEG/PNG) in standard base64.
        image_data: String,
        exam_id: String,
        template_id: String,
    },

    /// Ends the scanning run.
    Stop {},
}

impl ClientMessage {
    /// Builds a `frame` message, base64-encoding the raw image bytes.
    pub fn frame(sequence_number: u64, image: &[u8], exam_id: &str, template_id: &str) -> Self {
        ClientMessage::Frame {
            sequence_number,
            image_data: BASE64.encode(image),
            exam_id: exam_id.to_string(),
            template_id: template_id.to_string(),
        }
    }

    /// Returns a short type name for log messages.
    ///
    /// Used instead of `{:?}` so that image payloads never end up in logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::StartScan { .. } => "start_scan",
            ClientMessage::Frame { .. } => "frame",
            ClientMessage::Stop {} => "stop",
        }
    }
}

// ── Service → Client messages ─────────────────────────────────────────────────

/// Status values carried by a `progress` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Idle,
    Processing,
    Matching,
    RecognitionSuccess,
    RecognitionFailed,
    Complete,
    Error,
}

impl ProgressStatus {
    /// Returns `true` for statuses that end the current capture cycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressStatus::RecognitionSuccess
                | ProgressStatus::RecognitionFailed
                | ProgressStatus::Complete
                | ProgressStatus::Error
        )
    }

    /// Returns `true` for terminal statuses that report a successful recognition.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ProgressStatus::RecognitionSuccess | ProgressStatus::Complete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Idle => "idle",
            ProgressStatus::Processing => "processing",
            ProgressStatus::Matching => "matching",
            ProgressStatus::RecognitionSuccess => "recognition_success",
            ProgressStatus::RecognitionFailed => "recognition_failed",
            ProgressStatus::Complete => "complete",
            ProgressStatus::Error => "error",
        }
    }
}

/// Student record the service matched the sheet to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentMatch {
    #[serde(alias = "id")]
    pub student_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
}

/// The answer read for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAnswer {
    pub question: u32,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct: Option<bool>,
}

/// Status-specific payload attached to a `progress` message.
///
/// On failure the service usually attaches the aligned/annotated image so the
/// operator can see why the sheet was rejected; on success it may carry the
/// graded result.  Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aligned_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_match: Option<StudentMatch>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<QuestionAnswer>,
}

/// All messages the recognition service sends to the station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceMessage {
    /// Intermediate or terminal status for the frame currently in flight.
    Progress {
        status: ProgressStatus,
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<ProgressDetails>,
    },

    /// The service graded and persisted the result for one frame.
    #[serde(rename_all = "camelCase")]
    ResultSaved {
        success: bool,
        sequence_number: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        board_number: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        student_match: Option<StudentMatch>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_score: Option<f64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        answers: Vec<QuestionAnswer>,
    },
}

impl ServiceMessage {
    /// Returns a short type name for log messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ServiceMessage::Progress { .. } => "progress",
            ServiceMessage::ResultSaved { .. } => "result_saved",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
