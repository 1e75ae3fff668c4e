//! # omr-core
//!
//! Shared library for the OMR scanning station containing the recognition
//! service wire protocol, the scanning-session state machine, and the result
//! reconciler.
//!
//! It has zero dependencies on OS APIs, async runtimes, capture devices, or
//! network sockets, so every rule it encodes can be unit tested in isolation.
//!
//! # Architecture overview
//!
//! A scanning station points a camera at an answer sheet, sends still frames
//! to a remote recognition service, and shows the operator the graded result.
//! The service does all of the image work; the station only has to keep its
//! own bookkeeping honest while frames and status events race each other over
//! the network.
//!
//! - **`protocol`** – How messages travel over the duplex channel.  Each
//!   message is one JSON object per line, discriminated by a `"type"` field.
//!   Also holds the frame sequence and connection generation counters.
//!
//! - **`domain`** – Pure business logic.  The [`SessionStateMachine`] is the
//!   single authority on what the session is doing; the [`ResultReconciler`]
//!   decides which recognition result the operator sees; the
//!   [`presentation`](domain::presentation) module projects both into a view.

pub mod domain;
pub mod protocol;

pub use domain::presentation::{project, FailureNotice, SessionView};
pub use domain::reconciler::{Acceptance, RecognitionResult, ResultReconciler, SessionStats};
pub use domain::session::{
    CaptureOutcome, ConnectionState, ExamId, FailureReason, FatalKind, ScanState, Session,
    SessionId, SessionParams, TemplateId,
};
pub use domain::state_machine::{
    CaptureCompletion, CommandRejected, DiscardReason, EventDisposition, EventTag,
    ProgressSnapshot, SessionStateMachine, StartOutcome,
};
pub use protocol::codec::{decode_line, decode_lines, encode_line, ProtocolError};
pub use protocol::messages::{ClientMessage, ProgressStatus, ServiceMessage};
pub use protocol::sequence::{Generation, GenerationCounter, SequenceCounter};
