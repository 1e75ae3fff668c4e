//! Storage infrastructure: station configuration file.
//!
//! The scanner persists nothing else.  Results are saved by the recognition
//! service, not by the station.

pub mod config;
