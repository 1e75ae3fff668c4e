//! Device channel: the capture-device port and its scoped lease.
//!
//! # Ownership model (for beginners)
//!
//! A camera can only be used by one session at a time, and it must be
//! released on *every* exit path: a clean stop, a fatal error, a panic in the
//! session task, or the whole station shutting down.  Rather than sprinkling
//! `close()` calls everywhere, acquisition returns a [`DeviceLease`].  The
//! lease owns the device; when it is dropped, `Drop` closes the device and
//! switches the "camera on" indicator off.
//!
//! Exclusivity comes from a [`DeviceSlot`]: a shared async mutex that the
//! lease keeps locked for its whole lifetime.  A second `acquire` simply
//! waits until the previous lease is gone.
//!
//! The lease also enforces the frame-rate ceiling from
//! [`CaptureConstraints::max_fps`]: grabs through its [`FrameGrabber`]s are
//! spaced at least `1 / max_fps` apart, whatever the device itself does.
//!
//! Concrete devices implement the [`DeviceChannel`] trait:
//! - `StillFolderDevice` (infrastructure) serves still images from disk.
//! - `MockDevice` (infrastructure) is a scriptable test double.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use omr_core::FatalKind;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info};

// ── Types ─────────────────────────────────────────────────────────────────────

/// Requested capture characteristics.  Devices honour them where they can.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
    /// Frame-rate ceiling; stills are never requested faster than this.
    /// `0` disables the ceiling.
    pub max_fps: u32,
    /// Prefer the rear-facing camera when no device is named explicitly.
    pub prefer_rear_facing: bool,
}

impl CaptureConstraints {
    /// Shortest allowed gap between two grabs, `None` when unlimited.
    pub fn min_frame_interval(&self) -> Option<Duration> {
        (self.max_fps > 0).then(|| Duration::from_secs(1) / self.max_fps)
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            max_fps: 30,
            prefer_rear_facing: true,
        }
    }
}

/// One capture device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    pub rear_facing: bool,
}

/// Encoded still image (JPEG or PNG) grabbed from a device.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub captured_at: SystemTime,
}

impl EncodedImage {
    /// Time since the still was grabbed; zero if the wall clock went backwards.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed().unwrap_or_default()
    }
}

/// Errors a capture device can report.  All of them end the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("no capture device available: {0}")]
    Unavailable(String),

    #[error("permission to use the capture device was denied: {0}")]
    PermissionDenied(String),

    #[error("capture device disconnected: {0}")]
    Disconnected(String),
}

impl DeviceError {
    pub fn fatal_kind(&self) -> FatalKind {
        match self {
            DeviceError::Unavailable(_) => FatalKind::DeviceUnavailable,
            DeviceError::PermissionDenied(_) => FatalKind::PermissionDenied,
            DeviceError::Disconnected(_) => FatalKind::DeviceDisconnected,
        }
    }
}

// ── Port ──────────────────────────────────────────────────────────────────────

/// Platform capture API.
///
/// Implementations must be `Send + Sync` because grabs run on spawned tasks
/// while the session loop keeps the channel.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// Lists the devices the station could use.
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    /// Opens a device, preferring `preferred` when given.
    async fn open(
        &self,
        preferred: Option<&str>,
        constraints: &CaptureConstraints,
    ) -> Result<DeviceInfo, DeviceError>;

    /// Grabs one encoded still from an open device.
    async fn grab_frame(&self, device_id: &str) -> Result<EncodedImage, DeviceError>;

    /// Closes a device.  Must be idempotent and must not block.
    fn close(&self, device_id: &str);
}

// ── Slot and lease ────────────────────────────────────────────────────────────

/// Process-wide exclusivity token for the capture device.
///
/// Clones share one lock; hand a clone to every session loop that may open
/// the same camera.
#[derive(Debug, Clone, Default)]
pub struct DeviceSlot {
    lock: Arc<Mutex<()>>,
    active: Arc<AtomicBool>,
}

impl DeviceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device indicator: `true` while a lease is held.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Scoped ownership of an open device.  Dropping it releases the device.
pub struct DeviceLease {
    channel: Arc<dyn DeviceChannel>,
    device: DeviceInfo,
    active: Arc<AtomicBool>,
    min_interval: Option<Duration>,
    last_grab: Arc<Mutex<Option<Instant>>>,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceLease {
    /// Waits for the slot, then opens a device through `channel`.
    ///
    /// # Errors
    ///
    /// Propagates the channel's [`DeviceError`]; the slot is freed again.
    pub async fn acquire(
        channel: Arc<dyn DeviceChannel>,
        slot: &DeviceSlot,
        preferred: Option<&str>,
        constraints: &CaptureConstraints,
    ) -> Result<Self, DeviceError> {
        let guard = Arc::clone(&slot.lock).lock_owned().await;
        let device = channel.open(preferred, constraints).await?;
        slot.active.store(true, Ordering::Release);
        info!("device {} acquired ({})", device.device_id, device.label);
        Ok(Self {
            channel,
            device,
            active: Arc::clone(&slot.active),
            min_interval: constraints.min_frame_interval(),
            last_grab: Arc::new(Mutex::new(None)),
            _guard: guard,
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Returns a cheap handle that can grab frames from a spawned task.
    ///
    /// The grabber does not keep the device open: once the lease is
    /// released, grabs fail with [`DeviceError::Disconnected`].
    pub fn grabber(&self) -> FrameGrabber {
        FrameGrabber {
            channel: Arc::clone(&self.channel),
            device_id: self.device.device_id.clone(),
            min_interval: self.min_interval,
            last_grab: Arc::clone(&self.last_grab),
        }
    }

    /// Releases the device now.  Equivalent to dropping the lease.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.channel.close(&self.device.device_id);
        self.active.store(false, Ordering::Release);
        debug!("device {} released", self.device.device_id);
    }
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Grabs frames from a leased device without owning it.
#[derive(Clone)]
pub struct FrameGrabber {
    channel: Arc<dyn DeviceChannel>,
    device_id: String,
    min_interval: Option<Duration>,
    last_grab: Arc<Mutex<Option<Instant>>>,
}

impl FrameGrabber {
    /// Grabs one still, first waiting out the frame-rate ceiling if the
    /// previous grab on this lease was too recent.
    pub async fn grab(&self) -> Result<EncodedImage, DeviceError> {
        let mut last = self.last_grab.lock().await;
        if let (Some(interval), Some(previous)) = (self.min_interval, *last) {
            tokio::time::sleep_until(previous + interval).await;
        }
        *last = Some(Instant::now());
        drop(last);
        self.channel.grab_frame(&self.device_id).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
