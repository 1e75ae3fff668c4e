//! Link adapters for the recognition-service transport.
//!
//! - [`ws_link`] is the production WebSocket client.
//! - [`mock`] is an in-memory connector for tests.
//!
//! Both implement `application::session_transport::{Connector, DuplexLink}`.

pub mod mock;
pub mod ws_link;

pub use mock::{MockConnector, ServiceEnd};
pub use ws_link::WsConnector;
