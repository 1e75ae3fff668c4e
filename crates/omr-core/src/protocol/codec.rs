//! Line codec for the recognition-service channel.
//!
//! Wire format: one compact JSON object per line, `\n` terminated.
//!
//! ```text
//! {"type":"progress","status":"processing"}\n
//! {"type":"progress","status":"matching"}\n
//! ```
//!
//! A single transport frame may carry several lines; [`decode_lines`] splits
//! them and decodes each one independently so that one malformed line never
//! poisons its neighbours.

use thiserror::Error;

use crate::protocol::messages::{ClientMessage, ServiceMessage};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The line is not valid JSON or does not match any known message shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The line contained nothing but whitespace.
    #[error("empty line")]
    EmptyLine,

    /// The message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`ClientMessage`] as a single `\n`-terminated line.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialize`] if serialization fails.
///
/// # Examples
///
/// ```rust
/// use omr_core::protocol::{encode_line, ClientMessage};
///
/// let line = encode_line(&ClientMessage::Stop {}).unwrap();
/// assert_eq!(line, "{\"type\":\"stop\"}\n");
/// ```
pub fn encode_line(msg: &ClientMessage) -> Result<String, ProtocolError> {
    // Compact serde_json output never contains a raw newline: newlines inside
    // strings are escaped, so the terminator below is the only one.
    let mut line = serde_json::to_string(msg).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decodes one [`ServiceMessage`] from a single line (terminator optional).
///
/// # Errors
///
/// Returns [`ProtocolError::EmptyLine`] for blank input and
/// [`ProtocolError::Malformed`] for anything that is not a known message.
pub fn decode_line(line: &str) -> Result<ServiceMessage, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyLine);
    }
    serde_json::from_str(trimmed).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decodes every non-blank line in `text`, preserving order.
///
/// Blank lines are skipped silently; malformed lines yield an `Err` entry in
/// their position so the caller can log and discard them.
pub fn decode_lines(text: &str) -> Vec<Result<ServiceMessage, ProtocolError>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(decode_line)
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
