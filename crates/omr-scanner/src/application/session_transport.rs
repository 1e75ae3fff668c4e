//! Session transport: the reconnecting duplex channel to the recognition service.
//!
//! # How it works (for beginners)
//!
//! [`TransportHandle::spawn`] starts one background *pump* task per session.
//! The pump:
//!
//! 1. Opens a link through a [`Connector`] (WebSocket in production, an
//!    in-memory pair in tests).
//! 2. Takes a fresh [`Generation`] from the process-wide counter, reports
//!    `Connected`, and sends `start_scan`.
//! 3. Forwards every decoded service message to the session loop, and every
//!    outbound frame to the link.
//! 4. When the link drops, reports `Dropped` and reconnects with exponential
//!    backoff (`1s, 2s, 4s …`, capped).  After `max_attempts` consecutive
//!    failures it reports `Exhausted` and exits.
//!
//! Every event leaves the pump wrapped in a [`TaggedEvent`] carrying the
//! session id and the generation of the link that produced it.  The state
//! machine uses that tag to drop anything from a dead link or a dead session.
//!
//! Outbound frames carry the generation they were captured under.  A frame
//! whose generation no longer matches the live link is discarded instead of
//! being replayed onto a connection that never saw its `start_scan`.
//!
//! # Shutdown
//!
//! [`TransportHandle::shutdown`] cancels a `CancellationToken`.  A pending
//! backoff sleep or connect attempt is abandoned immediately; a live link gets
//! a best-effort `stop {}` and is closed.  All of that happens inside the pump
//! task, so the caller never waits on the network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use omr_core::{
    decode_lines, encode_line, ClientMessage, EventTag, Generation, GenerationCounter,
    ServiceMessage, SessionId, SessionParams,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Link port ─────────────────────────────────────────────────────────────────

/// Errors a link can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("link closed")]
    Closed,
}

/// Opens links to the recognition service.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DuplexLink>, TransportError>;
}

/// One open text-message link.
///
/// `recv_text` must be cancel-safe: the pump polls it inside `select!`.
#[async_trait]
pub trait DuplexLink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text message, or `Ok(None)` once the peer has closed the link.
    async fn recv_text(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self);
}

// ── Events ────────────────────────────────────────────────────────────────────

/// What the transport reports to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// About to try opening a link; `attempt` counts from 1 after each success.
    Connecting { attempt: u32 },
    /// A link opened; the event's tag carries its new generation.
    Connected,
    Message(ServiceMessage),
    /// The live link dropped unexpectedly.  Reconnection follows.
    Dropped { reason: String },
    /// The reconnect budget is spent.  The pump has exited.
    Exhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub tag: EventTag,
    pub event: TransportEvent,
}

// ── Reconnect policy ──────────────────────────────────────────────────────────

/// Exponential backoff bounded by a consecutive-failure budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before backoff step `step` (1-based): `initial * 2^(step-1)`, capped.
    pub fn delay_for_attempt(&self, step: u32) -> Duration {
        let exp = step.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

struct Outbound {
    message: ClientMessage,
    generation: Generation,
}

/// Owner-side handle for one session's transport pump.
///
/// Dropping the handle shuts the transport down.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Outbound({} @ {})", self.message.type_name(), self.generation)
    }
}

impl TransportHandle {
    /// Starts the pump for `session_id`.  Events go to `events`.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        session_id: SessionId,
        params: SessionParams,
        policy: ReconnectPolicy,
        generations: Arc<GenerationCounter>,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pump = Pump {
            connector,
            session_id,
            params,
            policy,
            generations,
            events,
            outbound: outbound_rx,
            cancel: cancel.clone(),
            generation: Generation::NONE,
        };
        tokio::spawn(pump.run());
        Self {
            outbound: outbound_tx,
            cancel,
        }
    }

    /// Queues `message` for the link of `generation`.  Fire-and-forget.
    pub fn send(&self, message: ClientMessage, generation: Generation) {
        if self
            .outbound
            .send(Outbound {
                message,
                generation,
            })
            .is_err()
        {
            debug!("transport pump has exited; outbound message dropped");
        }
    }

    /// Stops reconnecting and closes the link in the background.  Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Pump ──────────────────────────────────────────────────────────────────────

enum LinkEnd {
    Shutdown,
    Dropped(String),
}

struct Pump {
    connector: Arc<dyn Connector>,
    session_id: SessionId,
    params: SessionParams,
    policy: ReconnectPolicy,
    generations: Arc<GenerationCounter>,
    events: mpsc::UnboundedSender<TaggedEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
    /// Generation of the most recent link (NONE before the first one).
    generation: Generation,
}

impl Pump {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut has_connected = false;
        let mut last_error = String::new();

        loop {
            if failures >= self.policy.max_attempts {
                warn!(
                    "session {}: giving up after {failures} failed connection attempts",
                    self.session_id
                );
                self.emit(TransportEvent::Exhausted {
                    attempts: failures,
                    last_error,
                });
                return;
            }

            let attempt = failures + 1;
            // After a drop every attempt waits; on first connect only retries do.
            let step = if has_connected { attempt } else { attempt - 1 };
            if step > 0 {
                let delay = self.policy.delay_for_attempt(step);
                debug!(
                    "session {}: next connection attempt in {delay:?}",
                    self.session_id
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.emit(TransportEvent::Connecting { attempt });
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.connector.connect() => result,
            };

            let link = match connected {
                Ok(link) => link,
                Err(e) => {
                    warn!(
                        "session {}: connection attempt {attempt} failed: {e}",
                        self.session_id
                    );
                    failures += 1;
                    last_error = e.to_string();
                    continue;
                }
            };

            failures = 0;
            has_connected = true;
            self.generation = self.generations.advance();
            info!(
                "session {}: connected ({})",
                self.session_id, self.generation
            );
            self.emit(TransportEvent::Connected);

            match self.drive(link).await {
                LinkEnd::Shutdown => return,
                LinkEnd::Dropped(reason) => {
                    warn!(
                        "session {}: link {} dropped: {reason}",
                        self.session_id, self.generation
                    );
                    last_error = reason.clone();
                    self.emit(TransportEvent::Dropped { reason });
                }
            }
        }
    }

    /// Serves one open link until it drops or the transport shuts down.
    async fn drive(&mut self, mut link: Box<dyn DuplexLink>) -> LinkEnd {
        let start = ClientMessage::StartScan {
            exam_id: self.params.exam_id.clone(),
            template_id: self.params.template_id.clone(),
        };
        if let Err(e) = self.write(&mut link, &start).await {
            return LinkEnd::Dropped(e.to_string());
        }

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = self.write(&mut link, &ClientMessage::Stop {}).await;
                    link.close().await;
                    debug!("session {}: link {} closed", self.session_id, self.generation);
                    return LinkEnd::Shutdown;
                }

                outbound = self.outbound.recv() => {
                    let Some(outbound) = outbound else {
                        link.close().await;
                        return LinkEnd::Shutdown;
                    };
                    if outbound.generation != self.generation {
                        debug!(
                            "session {}: discarding {} captured on {} (live link is {})",
                            self.session_id,
                            outbound.message.type_name(),
                            outbound.generation,
                            self.generation
                        );
                        continue;
                    }
                    if let Err(e) = self.write(&mut link, &outbound.message).await {
                        return LinkEnd::Dropped(e.to_string());
                    }
                }

                inbound = link.recv_text() => match inbound {
                    Ok(Some(text)) => self.dispatch(&text),
                    Ok(None) => return LinkEnd::Dropped("closed by peer".to_string()),
                    Err(e) => return LinkEnd::Dropped(e.to_string()),
                },
            }
        }
    }

    async fn write(
        &self,
        link: &mut Box<dyn DuplexLink>,
        msg: &ClientMessage,
    ) -> Result<(), TransportError> {
        let line = encode_line(msg).map_err(|e| TransportError::Send(e.to_string()))?;
        debug!(
            "session {}: → {} ({} bytes)",
            self.session_id,
            msg.type_name(),
            line.len()
        );
        link.send_text(line).await
    }

    fn dispatch(&self, text: &str) {
        for decoded in decode_lines(text) {
            match decoded {
                Ok(msg) => {
                    debug!("session {}: ← {}", self.session_id, msg.type_name());
                    self.emit(TransportEvent::Message(msg));
                }
                Err(e) => warn!(
                    "session {}: protocol violation, line discarded: {e}",
                    self.session_id
                ),
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let tagged = TaggedEvent {
            tag: EventTag::new(self.session_id, self.generation),
            event,
        };
        if self.events.send(tagged).is_err() {
            debug!("session {}: event receiver gone", self.session_id);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
