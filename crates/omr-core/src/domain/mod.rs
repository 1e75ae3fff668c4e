//! Pure scanning-session logic: state, reconciliation, and projection.
//!
//! Nothing in here performs I/O.  The scanner application feeds operator
//! commands and tagged transport events into the [`state_machine`], hands
//! terminal payloads to the [`reconciler`], and renders whatever
//! [`presentation::project`] returns.

pub mod presentation;
pub mod reconciler;
pub mod session;
pub mod state_machine;
