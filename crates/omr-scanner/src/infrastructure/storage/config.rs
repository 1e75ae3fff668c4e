//! TOML-based configuration for the scanning station.
//!
//! Reads and writes `StationConfig` at the platform-appropriate path, unless
//! `--config <path>` names another file:
//! - Windows:  `%APPDATA%\OmrScanner\config.toml`
//! - Linux:    `~/.config/omrscanner/config.toml`
//! - macOS:    `~/Library/Application Support/OmrScanner/config.toml`
//!
//! # Example
//!
//! ```toml
//! [service]
//! url = "ws://10.0.0.5:8765/scan"
//!
//! [capture]
//! device_root = "/srv/scanner-drop"
//! timeout_secs = 20
//!
//! [[exams]]
//! exam_id = "exam-1"
//! template_id = "tpl-a"
//! question_count = 10
//! max_score = 10.0
//! ```
//!
//! # Serde default values
//!
//! Every section and every field has a default, so an empty file (or no file
//! at all) yields a working station pointed at a local recognition service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::device_channel::CaptureConstraints;
use crate::application::exam_catalog::ExamMetadata;
use crate::application::scan_session::SessionSettings;
use crate::application::session_transport::ReconnectPolicy;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but cannot drive a station.
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level station configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StationConfig {
    #[serde(default)]
    pub station: StationSection,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub capture: CaptureSection,
    /// Exams offered by the bundled catalog.
    #[serde(default)]
    pub exams: Vec<ExamMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationSection {
    /// `tracing` log level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// WebSocket URL of the recognition service.
    #[serde(default = "default_service_url")]
    pub url: String,
    /// Per-attempt connect timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the session goes to `error`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureSection {
    /// Seconds a frame may wait for a terminal event.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Root directory of the still-folder devices.
    #[serde(default = "default_device_root")]
    pub device_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_device: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,
    #[serde(default = "default_true")]
    pub prefer_rear_facing: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_service_url() -> String {
    "ws://127.0.0.1:8765/scan".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    15
}
fn default_device_root() -> PathBuf {
    PathBuf::from("./stills")
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_max_fps() -> u32 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for StationSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            url: default_service_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            device_root: default_device_root(),
            preferred_device: None,
            width: default_width(),
            height: default_height(),
            max_fps: default_max_fps(),
            prefer_rear_facing: default_true(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl StationConfig {
    /// Rejects values that would leave the station unable to connect or capture.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let must_be_positive = [
            ("reconnect.max_attempts", u64::from(self.reconnect.max_attempts)),
            ("capture.timeout_secs", self.capture.timeout_secs),
            ("service.connect_timeout_secs", self.service.connect_timeout_secs),
        ];
        for (field, value) in must_be_positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1",
                });
            }
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            width: self.capture.width,
            height: self.capture.height,
            max_fps: self.capture.max_fps,
            prefer_rear_facing: self.capture.prefer_rear_facing,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            capture_timeout: Duration::from_secs(self.capture.timeout_secs),
            reconnect: self.reconnect_policy(),
            preferred_device: self.capture.preferred_device.clone(),
            constraints: self.capture_constraints(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.service.connect_timeout_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads `StationConfig` from `path`, or from the platform path when `None`.
///
/// A missing file yields `StationConfig::default()`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and
/// [`ConfigError::Invalid`] if a value fails [`StationConfig::validate`].
pub fn load_config(path: Option<&Path>) -> Result<StationConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let config: StationConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StationConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &StationConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory including the `OmrScanner` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("OmrScanner"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("omrscanner"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("OmrScanner")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_default_config_points_at_local_service() {
        let cfg = StationConfig::default();
        assert_eq!(cfg.service.url, "ws://127.0.0.1:8765/scan");
        assert_eq!(cfg.station.log_level, "info");
        assert!(cfg.exams.is_empty());
    }

    #[test]
    fn test_default_session_settings_match_station_defaults() {
        // Arrange / Act
        let settings = StationConfig::default().session_settings();

        // Assert
        assert_eq!(settings, SessionSettings::default());
    }

    // ── Parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: StationConfig = assert_ok!(toml::from_str(""));
        assert_eq!(cfg, StationConfig::default());
    }

    #[test]
    fn test_partial_sections_override_defaults() {
        // Arrange
        let toml_str = r#"
[reconnect]
max_attempts = 5

[capture]
timeout_secs = 20
preferred_device = "desk"

[[exams]]
exam_id = "exam-1"
template_id = "tpl-a"
question_count = 10
max_score = 10.0
"#;

        // Act
        let cfg: StationConfig = assert_ok!(toml::from_str(toml_str));
        let settings = cfg.session_settings();

        // Assert
        assert_eq!(settings.reconnect.max_attempts, 5);
        assert_eq!(settings.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(settings.capture_timeout, Duration::from_secs(20));
        assert_eq!(settings.preferred_device.as_deref(), Some("desk"));
        assert_eq!(cfg.exams.len(), 1);
        assert_eq!(cfg.exams[0].template_id, "tpl-a");
    }

    #[test]
    fn test_exam_without_scoring_fields_defaults_them() {
        let toml_str = r#"
[[exams]]
exam_id = "quiz"
template_id = "tpl-q"
"#;
        let cfg: StationConfig = assert_ok!(toml::from_str(toml_str));
        assert_eq!(cfg.exams[0].question_count, 0);
        assert_eq!(cfg.exams[0].max_score, 0.0);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[[ not valid toml").expect("write");

        let result = load_config(Some(&path));

        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_retry_budget_is_rejected() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[reconnect]\nmax_attempts = 0\n").expect("write");

        // Act
        let result = load_config(Some(&path));

        // Assert
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "reconnect.max_attempts",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_capture_timeout_is_rejected() {
        let mut cfg = StationConfig::default();
        cfg.capture.timeout_secs = 0;

        let result = cfg.validate();

        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "capture.timeout_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_ok!(StationConfig::default().validate());
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");

        let cfg = assert_ok!(load_config(Some(&dir.path().join("absent.toml"))));

        assert_eq!(cfg, StationConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_values() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = StationConfig::default();
        cfg.service.url = "ws://scanner-host:9000/scan".into();
        cfg.capture.preferred_device = Some("rear-phone".into());
        cfg.exams.push(ExamMetadata {
            exam_id: "exam-2".into(),
            template_id: "tpl-b".into(),
            question_count: 40,
            max_score: 100.0,
        });

        // Act
        assert_ok!(save_config(&cfg, &path));
        let restored = assert_ok!(load_config(Some(&path)));

        // Assert
        assert_eq!(restored, cfg);
    }
}
