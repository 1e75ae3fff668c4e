//! Still-folder capture device.
//!
//! Serves encoded stills from disk instead of a live camera.  Used on
//! headless stations fed by a document scanner drop folder, and on bench rigs
//! replaying a recorded exam.
//!
//! # Layout
//!
//! ```text
//! device_root/
//!   desk/          ← device "desk"
//!     0001.jpg
//!     0002.jpg
//!   rear-phone/    ← device "rear-phone" (rear-facing: name starts with "rear")
//!     sheet.png
//! ```
//!
//! Each subdirectory is one device.  Images are served in file-name order and
//! wrap around when the last one has been sent.
//!
//! Stills are served as stored: the requested width and height are only
//! logged, never used to rescale.  The frame-rate ceiling is enforced by the
//! [`DeviceLease`](crate::application::device_channel::DeviceLease) that
//! wraps every open device, not here.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::application::device_channel::{
    CaptureConstraints, DeviceChannel, DeviceError, DeviceInfo, EncodedImage,
};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

struct OpenDevice {
    files: Vec<PathBuf>,
    next: usize,
}

/// [`DeviceChannel`] backed by directories of still images.
pub struct StillFolderDevice {
    root: PathBuf,
    open: Mutex<HashMap<String, OpenDevice>>,
}

impl StillFolderDevice {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn image_files(dir: &Path) -> Result<Vec<PathBuf>, DeviceError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| map_io(dir, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(dir, e))? {
            let path = entry.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if is_image {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl DeviceChannel for StillFolderDevice {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| map_io(&self.root, e))?;
        let mut devices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| map_io(&self.root, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            devices.push(DeviceInfo {
                rear_facing: name.starts_with("rear"),
                label: format!("Still folder {}", entry.path().display()),
                device_id: name,
            });
        }
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    async fn open(
        &self,
        preferred: Option<&str>,
        constraints: &CaptureConstraints,
    ) -> Result<DeviceInfo, DeviceError> {
        let devices = self.list_devices().await?;
        let chosen = match preferred {
            Some(id) => devices.into_iter().find(|d| d.device_id == id),
            None if constraints.prefer_rear_facing => {
                let rear = devices.iter().position(|d| d.rear_facing);
                match rear {
                    Some(idx) => Some(devices[idx].clone()),
                    None => devices.into_iter().next(),
                }
            }
            None => devices.into_iter().next(),
        };
        let device = chosen.ok_or_else(|| {
            DeviceError::Unavailable(match preferred {
                Some(id) => format!("no still folder named '{id}' under {}", self.root.display()),
                None => format!("no still folders under {}", self.root.display()),
            })
        })?;

        let files = Self::image_files(&self.root.join(&device.device_id)).await?;
        if files.is_empty() {
            return Err(DeviceError::Unavailable(format!(
                "still folder '{}' contains no images",
                device.device_id
            )));
        }
        debug!(
            "still folder {} opened with {} images (requested {}x{} @ {} fps)",
            device.device_id,
            files.len(),
            constraints.width,
            constraints.height,
            constraints.max_fps
        );

        self.open
            .lock()
            .map_err(|_| DeviceError::Unavailable("device table poisoned".into()))?
            .insert(device.device_id.clone(), OpenDevice { files, next: 0 });
        info!("still folder device '{}' opened", device.device_id);
        Ok(device)
    }

    async fn grab_frame(&self, device_id: &str) -> Result<EncodedImage, DeviceError> {
        let path = {
            let mut open = self
                .open
                .lock()
                .map_err(|_| DeviceError::Disconnected("device table poisoned".into()))?;
            let device = open
                .get_mut(device_id)
                .ok_or_else(|| DeviceError::Disconnected(format!("{device_id} is not open")))?;
            let path = device.files[device.next % device.files.len()].clone();
            device.next = device.next.wrapping_add(1);
            path
        };

        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                DeviceError::PermissionDenied(format!("{}: {e}", path.display()))
            }
            _ => DeviceError::Disconnected(format!("{}: {e}", path.display())),
        })?;
        debug!("grabbed {} ({} bytes)", path.display(), bytes.len());
        Ok(EncodedImage {
            bytes,
            captured_at: SystemTime::now(),
        })
    }

    fn close(&self, device_id: &str) {
        if let Ok(mut open) = self.open.lock() {
            if open.remove(device_id).is_some() {
                info!("still folder device '{device_id}' closed");
            }
        }
    }
}

fn map_io(path: &Path, e: io::Error) -> DeviceError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => {
            DeviceError::PermissionDenied(format!("{}: {e}", path.display()))
        }
        _ => DeviceError::Unavailable(format!("{}: {e}", path.display())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
