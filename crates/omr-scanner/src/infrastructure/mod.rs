//! Infrastructure layer for the scanning station.
//!
//! Contains the concrete adapters: capture devices, the WebSocket link to the
//! recognition service, the TOML configuration file, and the stdin operator
//! console.
//!
//! **Dependency rule**: this layer implements the ports declared in
//! `application` and may depend on it and on `omr_core`; the application layer
//! only reaches in here from its tests.

pub mod console;
pub mod device;
pub mod storage;
pub mod transport;
