//! Application layer of the scanning station.
//!
//! # What lives here? (for beginners)
//!
//! This layer declares the *ports* the station needs from the outside world
//! (a capture device, a link to the recognition service, an exam catalog) as
//! traits, and drives the `omr_core` domain types with them.  Concrete
//! adapters live in `infrastructure`; nothing here opens a file or a socket
//! directly.
//!
//! # Sub-modules
//!
//! - **`device_channel`**     – The capture-device port, plus the scoped
//!   [`DeviceLease`](device_channel::DeviceLease) that guarantees the device
//!   is released on every exit path.
//!
//! - **`session_transport`**  – The reconnecting duplex channel to the
//!   recognition service.  Tags every event with a connection generation.
//!
//! - **`capture_controller`** – Issues frame sequence numbers, enforces one
//!   frame in flight, and runs the capture timeout.
//!
//! - **`exam_catalog`**       – Read-only exam lookup used to build
//!   `start_scan`.
//!
//! - **`scan_session`**       – The session loop: the single task that
//!   applies every command and event to the state machine and publishes the
//!   operator view.

pub mod capture_controller;
pub mod device_channel;
pub mod exam_catalog;
pub mod scan_session;
pub mod session_transport;
