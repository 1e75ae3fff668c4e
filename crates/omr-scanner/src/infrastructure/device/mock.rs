//! Mock capture device for unit and integration testing.
//!
//! Serves a fixed JPEG-ish payload, counts acquire/release calls, and lets
//! tests inject open or grab failures without any camera attached.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::application::device_channel::{
    CaptureConstraints, DeviceChannel, DeviceError, DeviceInfo, EncodedImage,
};

#[derive(Default)]
struct MockState {
    open: HashSet<String>,
    open_error: Option<DeviceError>,
    grab_error: Option<DeviceError>,
    open_delay: Option<Duration>,
    grab_delay: Option<Duration>,
}

/// A scriptable [`DeviceChannel`] double.
pub struct MockDevice {
    devices: Vec<DeviceInfo>,
    frame: Vec<u8>,
    state: Mutex<MockState>,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    grabs: AtomicUsize,
}

impl MockDevice {
    /// Creates a mock with one rear-facing device named `mock-rear`.
    pub fn new() -> Self {
        Self {
            devices: vec![DeviceInfo {
                device_id: "mock-rear".to_string(),
                label: "Mock rear camera".to_string(),
                rear_facing: true,
            }],
            frame: b"\xFF\xD8mock-sheet\xFF\xD9".to_vec(),
            state: Mutex::new(MockState::default()),
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            grabs: AtomicUsize::new(0),
        }
    }

    /// The next `open` fails with `err`.
    pub fn fail_next_open(&self, err: DeviceError) {
        self.state.lock().expect("lock poisoned").open_error = Some(err);
    }

    /// Every subsequent grab fails with `err`.
    pub fn fail_grabs(&self, err: DeviceError) {
        self.state.lock().expect("lock poisoned").grab_error = Some(err);
    }

    /// Makes `open` take `delay` (virtual time under `start_paused`).
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().expect("lock poisoned").open_delay = Some(delay);
    }

    /// Makes `grab_frame` take `delay`.
    pub fn set_grab_delay(&self, delay: Duration) {
        self.state.lock().expect("lock poisoned").grab_delay = Some(delay);
    }

    /// Number of successful opens.
    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Number of frames served.
    pub fn grab_count(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }

    /// Returns `true` while any device is open.
    pub fn is_open(&self) -> bool {
        !self.state.lock().expect("lock poisoned").open.is_empty()
    }

    /// The payload every grab returns.
    pub fn frame_bytes(&self) -> &[u8] {
        &self.frame
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceChannel for MockDevice {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(self.devices.clone())
    }

    async fn open(
        &self,
        preferred: Option<&str>,
        _constraints: &CaptureConstraints,
    ) -> Result<DeviceInfo, DeviceError> {
        let (delay, injected) = {
            let mut state = self.state.lock().expect("lock poisoned");
            (state.open_delay, state.open_error.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = injected {
            return Err(err);
        }

        let device = match preferred {
            Some(id) => self
                .devices
                .iter()
                .find(|d| d.device_id == id)
                .cloned()
                .ok_or_else(|| DeviceError::Unavailable(format!("no device '{id}'")))?,
            None => self.devices[0].clone(),
        };
        self.state
            .lock()
            .expect("lock poisoned")
            .open
            .insert(device.device_id.clone());
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(device)
    }

    async fn grab_frame(&self, device_id: &str) -> Result<EncodedImage, DeviceError> {
        let (delay, injected, open) = {
            let state = self.state.lock().expect("lock poisoned");
            (
                state.grab_delay,
                state.grab_error.clone(),
                state.open.contains(device_id),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = injected {
            return Err(err);
        }
        if !open {
            return Err(DeviceError::Disconnected(format!("{device_id} is not open")));
        }
        self.grabs.fetch_add(1, Ordering::SeqCst);
        Ok(EncodedImage {
            bytes: self.frame.clone(),
            captured_at: SystemTime::now(),
        })
    }

    fn close(&self, device_id: &str) {
        self.state
            .lock()
            .expect("lock poisoned")
            .open
            .remove(device_id);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
