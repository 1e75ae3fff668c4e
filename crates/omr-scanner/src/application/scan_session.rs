//! Scan session loop: the one place where session state changes.
//!
//! # How it works (for beginners)
//!
//! [`ScanSessionHandle::spawn`] starts a single background task that owns
//! every piece of mutable session state:
//!
//! - the [`SessionStateMachine`] (what the session is doing),
//! - the [`ResultReconciler`] (which graded result is on screen),
//! - the [`CaptureController`] (sequence numbers and the capture timer),
//! - the [`DeviceLease`] and the [`TransportHandle`] (external resources).
//!
//! Everything that can change that state arrives as a message: operator
//! commands from the handle, device completions and timer expiries from
//! spawned tasks, and tagged events from the transport pump.  The loop
//! applies them one at a time, so there is never a second writer.
//!
//! ```text
//!  ScanSessionHandle ──Command──►┐
//!  spawned grab/acquire/timer ──►├──► SessionLoop ──► watch<StationStatus>
//!  transport pump ──TaggedEvent─►┘
//! ```
//!
//! Slow work (opening the device, grabbing a still, connecting) runs in
//! spawned tasks that report back through the queue, which keeps `stop`
//! responsive while a device is still opening.  A completion addressed to a
//! session that no longer exists is discarded; a late device lease is
//! dropped on the spot, which closes the device again.
//!
//! After each input the loop re-projects the [`SessionView`] and publishes it
//! on a `watch` channel if anything changed.

use std::sync::Arc;
use std::time::Duration;

use omr_core::{
    project, Acceptance, CaptureCompletion, ClientMessage, CommandRejected, DiscardReason,
    EventDisposition, GenerationCounter, RecognitionResult, ResultReconciler, SessionId,
    SessionParams, SessionStateMachine, SessionView, StartOutcome,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::capture_controller::{CaptureController, CaptureError};
use crate::application::device_channel::{
    CaptureConstraints, DeviceChannel, DeviceError, DeviceInfo, DeviceLease, DeviceSlot,
    EncodedImage,
};
use crate::application::exam_catalog::{resolve_params, CatalogError, ExamCatalog, ExamMetadata};
use crate::application::session_transport::{
    Connector, ReconnectPolicy, TaggedEvent, TransportEvent, TransportHandle,
};

/// Bounded so a wedged loop pushes back on the console instead of buffering.
const COMMAND_QUEUE_DEPTH: usize = 32;

// ── Public types ──────────────────────────────────────────────────────────────

/// Tunables for one station's sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// How long a frame may wait for a terminal event.
    pub capture_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Device id to open; `None` lets the device channel choose.
    pub preferred_device: Option<String>,
    pub constraints: CaptureConstraints,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
            preferred_device: None,
            constraints: CaptureConstraints::default(),
        }
    }
}

/// What the operator console renders: the session view plus the device
/// indicator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StationStatus {
    pub view: SessionView,
    /// `true` while a device lease is held.
    pub device_active: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Rejected(#[from] CommandRejected),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("scan session task has stopped")]
    Closed,
}

// ── Loop inputs ───────────────────────────────────────────────────────────────

enum Command {
    Start {
        params: SessionParams,
        reply: oneshot::Sender<StartOutcome>,
    },
    Capture {
        reply: oneshot::Sender<Result<u64, SessionError>>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
}

/// Completions reported by tasks the loop spawned.
enum Internal {
    DeviceAcquired {
        session_id: SessionId,
        result: Result<DeviceLease, DeviceError>,
    },
    FrameGrabbed {
        session_id: SessionId,
        sequence: u64,
        result: Result<EncodedImage, DeviceError>,
    },
    CaptureTimedOut {
        session_id: SessionId,
        sequence: u64,
    },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable front door to the session loop.
///
/// The loop exits once every handle has been dropped, releasing whatever it
/// still holds.
#[derive(Clone)]
pub struct ScanSessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StationStatus>,
    device: Arc<dyn DeviceChannel>,
    catalog: Arc<dyn ExamCatalog>,
}

impl ScanSessionHandle {
    /// Starts the session loop on the current Tokio runtime.
    ///
    /// `generations` and `slot` are process-wide: every loop that may touch
    /// the same service or the same camera must be given clones of the same
    /// counter and slot.
    pub fn spawn(
        device: Arc<dyn DeviceChannel>,
        connector: Arc<dyn Connector>,
        catalog: Arc<dyn ExamCatalog>,
        generations: Arc<GenerationCounter>,
        slot: DeviceSlot,
        settings: SessionSettings,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(StationStatus::default());

        let controller = CaptureController::new(settings.capture_timeout);
        let session_loop = SessionLoop {
            device: Arc::clone(&device),
            connector,
            generations,
            settings,
            slot,
            machine: SessionStateMachine::new(),
            reconciler: ResultReconciler::new(),
            controller,
            lease: None,
            transport: None,
            internal_tx,
            transport_tx,
            status_tx,
        };
        tokio::spawn(session_loop.run(command_rx, internal_rx, transport_rx));

        Self {
            commands: command_tx,
            status: status_rx,
            device,
            catalog,
        }
    }

    /// Opens a session for `params`.  A no-op while one is already running.
    pub async fn start(&self, params: SessionParams) -> Result<StartOutcome, SessionError> {
        self.request(|reply| Command::Start { params, reply }).await
    }

    /// Looks `exam_id` up in the catalog and opens a session for it.
    ///
    /// `template` replaces the catalog's template id when given.
    pub async fn start_exam(
        &self,
        exam_id: &str,
        template: Option<&str>,
    ) -> Result<StartOutcome, SessionError> {
        let params = resolve_params(self.catalog.as_ref(), exam_id, template).await?;
        self.start(params).await
    }

    /// Issues a capture and returns its sequence number.
    ///
    /// Rejected unless the session is `scanning_ready`.
    pub async fn capture(&self) -> Result<u64, SessionError> {
        self.request(|reply| Command::Capture { reply }).await?
    }

    /// Ends the session.  Resolves once `idle` has been published.
    ///
    /// Returns `true` if there was a session (or an error) to clear.
    pub async fn stop(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Latest published status.
    pub fn status(&self) -> StationStatus {
        self.status.borrow().clone()
    }

    /// Receiver that wakes on every status change.
    pub fn subscribe(&self) -> watch::Receiver<StationStatus> {
        self.status.clone()
    }

    /// Enumerates capture devices without touching the session.
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        self.device.list_devices().await
    }

    pub async fn exams(&self) -> Result<Vec<ExamMetadata>, CatalogError> {
        self.catalog.list().await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }
}

// ── Loop ──────────────────────────────────────────────────────────────────────

struct SessionLoop {
    device: Arc<dyn DeviceChannel>,
    connector: Arc<dyn Connector>,
    generations: Arc<GenerationCounter>,
    settings: SessionSettings,
    slot: DeviceSlot,
    machine: SessionStateMachine,
    reconciler: ResultReconciler,
    controller: CaptureController,
    lease: Option<DeviceLease>,
    transport: Option<TransportHandle>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    transport_tx: mpsc::UnboundedSender<TaggedEvent>,
    status_tx: watch::Sender<StationStatus>,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut transport: mpsc::UnboundedReceiver<TaggedEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = internal.recv() => self.on_internal(event),
                Some(event) = transport.recv() => self.on_transport(event),
            }
            self.publish();
        }

        debug!("all session handles dropped; shutting the session loop down");
        self.stop();
        self.publish();
    }

    // ── Commands ────────────────────────────────────────────────────────────

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { params, reply } => {
                let outcome = self.start(params);
                let _ = reply.send(outcome);
            }
            Command::Capture { reply } => {
                let result = self.capture();
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                let cleared = self.stop();
                self.publish();
                let _ = reply.send(cleared);
            }
        }
    }

    fn start(&mut self, params: SessionParams) -> StartOutcome {
        let session_id = Uuid::new_v4();
        let exam_id = params.exam_id.clone();
        let outcome = self.machine.start(session_id, params);
        if let StartOutcome::AlreadyActive(state) = &outcome {
            debug!("start ignored: session already {}", state.as_str());
        }
        if outcome != StartOutcome::Started {
            return outcome;
        }

        self.reconciler.reset();
        self.controller.reset();
        info!("session {session_id}: started for exam {exam_id}; acquiring device");

        let device = Arc::clone(&self.device);
        let slot = self.slot.clone();
        let preferred = self.settings.preferred_device.clone();
        let constraints = self.settings.constraints.clone();
        let report = self.internal_tx.clone();
        tokio::spawn(async move {
            let result =
                DeviceLease::acquire(device, &slot, preferred.as_deref(), &constraints).await;
            // If the loop is gone the lease is dropped with the message.
            let _ = report.send(Internal::DeviceAcquired { session_id, result });
        });
        outcome
    }

    fn capture(&mut self) -> Result<u64, SessionError> {
        self.machine.check_capture()?;
        let (Some(session_id), Some(lease)) = (self.machine.session_id(), self.lease.as_ref())
        else {
            return Err(CommandRejected::NotReady {
                state: self.machine.scan_state().as_str(),
            }
            .into());
        };
        let grabber = lease.grabber();

        let timeouts = self.internal_tx.clone();
        let sequence = self.controller.issue(move |sequence| {
            let _ = timeouts.send(Internal::CaptureTimedOut {
                session_id,
                sequence,
            });
        })?;
        if let Err(rejected) = self.machine.begin_capture(sequence) {
            self.controller.abandon();
            return Err(rejected.into());
        }
        self.reconciler.record_frame_captured();
        debug!("session {session_id}: capturing frame {sequence}");

        let report = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = grabber.grab().await;
            let _ = report.send(Internal::FrameGrabbed {
                session_id,
                sequence,
                result,
            });
        });
        Ok(sequence)
    }

    /// Tears the session down.  Safe to call any number of times.
    fn stop(&mut self) -> bool {
        let session_id = self.machine.session_id();
        let cleared = self.machine.stop();
        self.controller.abandon();
        self.release_resources();
        if let Some(id) = session_id {
            info!("session {id}: stopped");
        }
        cleared
    }

    // ── Spawned-task completions ────────────────────────────────────────────

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::DeviceAcquired { session_id, result } => {
                if self.machine.session_id() != Some(session_id) {
                    if result.is_ok() {
                        debug!("session {session_id}: late device lease released");
                    }
                    return;
                }
                match result {
                    Ok(lease) => self.device_ready(session_id, lease),
                    Err(e) => {
                        error!("session {session_id}: {e}");
                        self.fail(e);
                    }
                }
            }

            Internal::FrameGrabbed {
                session_id,
                sequence,
                result,
            } => {
                if self.machine.session_id() != Some(session_id)
                    || self.machine.scan_state().in_flight() != Some(sequence)
                {
                    debug!("session {session_id}: frame {sequence} grabbed too late (dropped)");
                    return;
                }
                match result {
                    Ok(image) => self.send_frame(sequence, &image),
                    Err(e) => {
                        error!("session {session_id}: grabbing frame {sequence} failed: {e}");
                        self.fail(e);
                    }
                }
            }

            Internal::CaptureTimedOut {
                session_id,
                sequence,
            } => {
                if self.machine.session_id() != Some(session_id) {
                    return;
                }
                if let Some(completion) = self.machine.capture_timed_out(sequence) {
                    warn!("session {session_id}: frame {sequence} timed out");
                    self.finish_capture(completion);
                }
            }
        }
    }

    fn device_ready(&mut self, session_id: SessionId, lease: DeviceLease) {
        let Some(params) = self.machine.session().map(|s| s.params()) else {
            return;
        };
        info!(
            "session {session_id}: device {} ready; connecting to the recognition service",
            lease.device().device_id
        );
        self.lease = Some(lease);
        self.transport = Some(TransportHandle::spawn(
            Arc::clone(&self.connector),
            session_id,
            params,
            self.settings.reconnect.clone(),
            Arc::clone(&self.generations),
            self.transport_tx.clone(),
        ));
    }

    fn send_frame(&self, sequence: u64, image: &EncodedImage) {
        let (Some(session), Some(transport)) = (self.machine.session(), self.transport.as_ref())
        else {
            return;
        };
        let frame = ClientMessage::frame(
            sequence,
            &image.bytes,
            &session.exam_id,
            &session.template_id,
        );
        let age = image.age();
        debug!(
            "session {}: sending frame {sequence} ({} bytes, captured {} ms ago)",
            session.session_id,
            image.bytes.len(),
            age.as_millis()
        );
        transport.send(frame, self.machine.generation());
    }

    // ── Transport events ────────────────────────────────────────────────────

    fn on_transport(&mut self, TaggedEvent { tag, event }: TaggedEvent) {
        match event {
            TransportEvent::Connecting { attempt } => {
                if self.machine.connection_attempt(tag, attempt) && attempt > 1 {
                    info!("session {}: reconnect attempt {attempt}", tag.session_id);
                }
            }

            TransportEvent::Connected => {
                if self.machine.connection_opened(tag) {
                    info!(
                        "session {}: ready to scan on {}",
                        tag.session_id, tag.generation
                    );
                } else {
                    debug!("session {}: ignoring stale {}", tag.session_id, tag.generation);
                }
            }

            TransportEvent::Message(message) => match self.machine.apply(tag, &message) {
                EventDisposition::Progressed(_) => {}
                EventDisposition::Completed(completion) => self.finish_capture(completion),
                EventDisposition::LateResult(result) => self.commit(result),
                EventDisposition::Discarded(DiscardReason::ProtocolViolation(why)) => {
                    warn!("session {}: protocol violation: {why}", tag.session_id);
                }
                EventDisposition::Discarded(DiscardReason::Straggler(sequence)) => {
                    debug!(
                        "session {}: late answer for timed-out frame {sequence} dropped",
                        tag.session_id
                    );
                }
                EventDisposition::Discarded(_) => {}
            },

            TransportEvent::Dropped { reason } => {
                if let Some(completion) = self.machine.connection_dropped(tag) {
                    warn!(
                        "session {}: frame {} lost with the connection ({reason})",
                        tag.session_id,
                        completion.sequence()
                    );
                    self.finish_capture(completion);
                }
            }

            TransportEvent::Exhausted {
                attempts,
                last_error,
            } => {
                let message =
                    format!("recognition service unreachable after {attempts} attempts: {last_error}");
                if self.machine.connection_exhausted(tag, message.as_str()) {
                    error!("session {}: {message}", tag.session_id);
                    self.controller.abandon();
                    self.release_resources();
                }
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn finish_capture(&mut self, completion: CaptureCompletion) {
        let success = completion.outcome.is_success();
        if let Some(latency) = self.controller.complete(completion.sequence()) {
            self.reconciler.record_completion(success, latency);
        }
        if let Some(result) = completion.result {
            self.commit(result);
        }
    }

    fn commit(&mut self, result: RecognitionResult) {
        let sequence = result.sequence_number;
        match self.reconciler.accept(result) {
            Acceptance::Committed => info!("frame {sequence}: result committed"),
            Acceptance::Duplicate => debug!("frame {sequence}: duplicate result ignored"),
            Acceptance::Unmatched => info!("frame {sequence}: saved without a student match"),
        }
    }

    fn fail(&mut self, e: DeviceError) {
        self.machine.fail_fatal(e.fatal_kind(), e.to_string());
        self.controller.abandon();
        self.release_resources();
    }

    fn release_resources(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.shutdown();
        }
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }

    fn publish(&self) {
        let next = StationStatus {
            view: project(&self.machine, &self.reconciler),
            device_active: self.slot.is_active(),
        };
        self.status_tx.send_if_modified(move |current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::exam_catalog::MockExamCatalog;
    use crate::infrastructure::device::MockDevice;
    use crate::infrastructure::transport::{MockConnector, ServiceEnd};
    use omr_core::ScanState;

    struct Rig {
        handle: ScanSessionHandle,
        device: Arc<MockDevice>,
        accepted: mpsc::UnboundedReceiver<ServiceEnd>,
    }

    fn rig(catalog: MockExamCatalog) -> Rig {
        let device = Arc::new(MockDevice::new());
        let (connector, accepted) = MockConnector::new();
        let handle = ScanSessionHandle::spawn(
            device.clone(),
            connector,
            Arc::new(catalog),
            Arc::new(GenerationCounter::new()),
            DeviceSlot::new(),
            SessionSettings::default(),
        );
        Rig {
            handle,
            device,
            accepted,
        }
    }

    async fn ready(handle: &ScanSessionHandle) {
        let mut status = handle.subscribe();
        status
            .wait_for(|s| s.view.state == ScanState::ScanningReady)
            .await
            .expect("session loop alive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_exam_resolves_params_from_catalog() {
        // Arrange
        let mut catalog = MockExamCatalog::new();
        catalog.expect_lookup().returning(|id| {
            Ok(ExamMetadata {
                exam_id: id.to_string(),
                template_id: "tpl-a".into(),
                question_count: 20,
                max_score: 20.0,
            })
        });
        let mut rig = rig(catalog);

        // Act
        let outcome = rig.handle.start_exam("exam-7", None).await.unwrap();
        let mut service = rig.accepted.recv().await.unwrap();

        // Assert
        assert_eq!(outcome, StartOutcome::Started);
        assert_eq!(
            service.next_message().await,
            Some(ClientMessage::StartScan {
                exam_id: "exam-7".into(),
                template_id: "tpl-a".into(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_exam_with_template_sends_override() {
        let mut catalog = MockExamCatalog::new();
        catalog.expect_lookup().returning(|id| {
            Ok(ExamMetadata {
                exam_id: id.to_string(),
                template_id: "tpl-a".into(),
                question_count: 20,
                max_score: 20.0,
            })
        });
        let mut rig = rig(catalog);

        rig.handle
            .start_exam("exam-7", Some("tpl-fixed"))
            .await
            .unwrap();
        let mut service = rig.accepted.recv().await.unwrap();

        assert_eq!(
            service.next_message().await,
            Some(ClientMessage::StartScan {
                exam_id: "exam-7".into(),
                template_id: "tpl-fixed".into(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_exam_unknown_exam_starts_nothing() {
        let mut catalog = MockExamCatalog::new();
        catalog
            .expect_lookup()
            .returning(|id| Err(CatalogError::UnknownExam(id.to_string())));
        let rig = rig(catalog);

        let result = rig.handle.start_exam("nope", None).await;

        assert!(matches!(
            result,
            Err(SessionError::Catalog(CatalogError::UnknownExam(_)))
        ));
        assert_eq!(rig.handle.status().view.state, ScanState::Idle);
        assert_eq!(rig.device.acquire_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_before_ready_is_rejected() {
        let rig = rig(MockExamCatalog::new());

        let result = rig.handle.capture().await;

        assert!(matches!(
            result,
            Err(SessionError::Rejected(CommandRejected::NoSession))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_sends_base64_frame_on_live_link() {
        // Arrange
        let mut rig = rig(MockExamCatalog::new());
        rig.handle
            .start(SessionParams {
                exam_id: "exam-1".into(),
                template_id: "tpl-a".into(),
            })
            .await
            .unwrap();
        let mut service = rig.accepted.recv().await.unwrap();
        service.next_message().await; // start_scan
        ready(&rig.handle).await;

        // Act
        let sequence = rig.handle.capture().await.unwrap();
        let sent = service.next_message().await;

        // Assert
        assert_eq!(sequence, 1);
        assert_eq!(
            sent,
            Some(ClientMessage::frame(
                1,
                rig.device.frame_bytes(),
                "exam-1",
                "tpl-a"
            ))
        );
        assert!(rig.handle.status().device_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_handle_releases_the_device() {
        // Arrange
        let mut rig = rig(MockExamCatalog::new());
        rig.handle
            .start(SessionParams {
                exam_id: "exam-1".into(),
                template_id: "tpl-a".into(),
            })
            .await
            .unwrap();
        let _service = rig.accepted.recv().await.unwrap();
        ready(&rig.handle).await;
        let device = rig.device.clone();

        // Act
        drop(rig);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Assert
        assert_eq!(device.release_count(), 1);
        assert!(!device.is_open());
    }
}
