//! Capture controller: issues frame sequence numbers and enforces the
//! one-frame-in-flight rule.
//!
//! The controller owns the per-session [`SequenceCounter`] and at most one
//! outstanding capture.  Each issued capture arms a timeout timer; completing
//! or abandoning the capture disarms it.  Latency is measured with
//! `tokio::time::Instant` so paused-clock tests see exact values.

use std::time::Duration;

use omr_core::SequenceCounter;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("frame {0} is still awaiting a result")]
    FrameOutstanding(u64),
}

struct InFlight {
    sequence: u64,
    issued_at: Instant,
    timer: JoinHandle<()>,
}

pub struct CaptureController {
    sequences: SequenceCounter,
    in_flight: Option<InFlight>,
    timeout: Duration,
}

impl CaptureController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sequences: SequenceCounter::new(),
            in_flight: None,
            timeout,
        }
    }

    /// Issues the next sequence number and arms its timeout.
    ///
    /// `on_timeout` runs on a spawned task if the capture is still
    /// outstanding when the window elapses.
    ///
    /// # Errors
    ///
    /// [`CaptureError::FrameOutstanding`] while another frame is in flight.
    pub fn issue<F>(&mut self, on_timeout: F) -> Result<u64, CaptureError>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if let Some(current) = &self.in_flight {
            return Err(CaptureError::FrameOutstanding(current.sequence));
        }
        let sequence = self.sequences.next();
        let window = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            on_timeout(sequence);
        });
        self.in_flight = Some(InFlight {
            sequence,
            issued_at: Instant::now(),
            timer,
        });
        debug!("frame {sequence} issued (timeout {window:?})");
        Ok(sequence)
    }

    /// Marks `sequence` finished and returns its capture-to-terminal latency.
    ///
    /// Returns `None` if `sequence` is not the outstanding capture.
    pub fn complete(&mut self, sequence: u64) -> Option<Duration> {
        match &self.in_flight {
            Some(current) if current.sequence == sequence => {}
            _ => return None,
        }
        let done = self.in_flight.take()?;
        done.timer.abort();
        Some(done.issued_at.elapsed())
    }

    /// Drops the outstanding capture, if any, without measuring it.
    pub fn abandon(&mut self) {
        if let Some(done) = self.in_flight.take() {
            done.timer.abort();
            debug!("frame {} abandoned", done.sequence);
        }
    }

    /// Starts numbering over for a new session.
    pub fn reset(&mut self) {
        self.abandon();
        self.sequences = SequenceCounter::new();
    }

    pub fn outstanding(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|f| f.sequence)
    }

    /// Last sequence number issued in this session (0 if none).
    pub fn last_issued(&self) -> u64 {
        self.sequences.current()
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.abandon();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
