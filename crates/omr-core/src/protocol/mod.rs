//! Protocol module containing message types, the line codec, and counters.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_line, decode_lines, encode_line, ProtocolError};
pub use messages::*;
pub use sequence::{Generation, GenerationCounter, SequenceCounter};
