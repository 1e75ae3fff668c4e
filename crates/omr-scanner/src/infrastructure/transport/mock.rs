//! In-memory connector for unit and integration testing.
//!
//! Each accepted connection yields a [`ServiceEnd`]: the recognition
//! service's side of the link.  Tests use it to read what the station sent
//! and to push service lines back, or drop it to simulate a network failure.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use omr_core::ClientMessage;
use tokio::sync::mpsc;

use crate::application::session_transport::{Connector, DuplexLink, TransportError};

/// A [`Connector`] that hands out in-memory links.
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<ServiceEnd>,
    refuse_all: AtomicBool,
    refuse_next: AtomicU32,
    attempts: AtomicU32,
}

impl MockConnector {
    /// Creates a connector that accepts every attempt.
    ///
    /// The receiver yields the service side of each accepted link.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServiceEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted: tx,
            refuse_all: AtomicBool::new(false),
            refuse_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// While `true`, every attempt is refused.
    pub fn refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Refuses the next `count` attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refuse_next.store(count, Ordering::SeqCst);
    }

    /// Total connection attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn DuplexLink>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        let refused_one = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused_one {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (to_station_tx, to_station_rx) = mpsc::unbounded_channel();
        let (from_station_tx, from_station_rx) = mpsc::unbounded_channel();
        let service = ServiceEnd {
            to_station: to_station_tx,
            from_station: from_station_rx,
        };
        self.accepted
            .send(service)
            .map_err(|_| TransportError::Connect("test harness gone".into()))?;
        Ok(Box::new(MemoryLink {
            inbound: to_station_rx,
            outbound: from_station_tx,
        }))
    }
}

/// Station side of an in-memory link.
struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl DuplexLink for MemoryLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.inbound.recv().await)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Recognition-service side of an in-memory link.
pub struct ServiceEnd {
    to_station: mpsc::UnboundedSender<String>,
    from_station: mpsc::UnboundedReceiver<String>,
}

impl ServiceEnd {
    /// Sends one raw text frame (may contain several lines) to the station.
    pub fn send_text(&self, text: &str) {
        let _ = self.to_station.send(text.to_string());
    }

    /// Next message the station sent, or `None` once the station closed.
    pub async fn next_message(&mut self) -> Option<ClientMessage> {
        let line = self.from_station.recv().await?;
        serde_json::from_str(line.trim()).ok()
    }

    /// Simulates the network dropping this link.
    pub fn drop_link(self) {
        drop(self);
    }
}
