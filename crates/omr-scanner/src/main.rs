//! OMR scanning station: entry point.
//!
//! Drives a capture device, streams frames to the remote recognition service
//! over a WebSocket, and shows graded results on an interactive console.
//!
//! # Usage
//!
//! ```text
//! omr-scanner [OPTIONS]
//!
//! Options:
//!   --config <PATH>        Config file [default: platform config dir]
//!   --service-url <URL>    Recognition service WebSocket URL
//!   --device-root <DIR>    Root of the still-folder capture devices
//!   --device <ID>          Capture device to open
//!   --exam <EXAM_ID>       Exam used by a bare `start`
//!   --log-level <LEVEL>    Log level when RUST_LOG is unset
//! ```
//!
//! Every flag can also come from an `OMR_*` environment variable; flags win
//! over the environment, and both win over the config file.
//!
//! # Architecture overview
//!
//! ```text
//! stdin ──► console ──► ScanSessionHandle ──► session loop
//!                                               ├─ StillFolderDevice (DeviceLease)
//!                                               └─ TransportHandle ──► WsConnector ──► service
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use omr_core::GenerationCounter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use omr_scanner::application::device_channel::DeviceSlot;
use omr_scanner::application::exam_catalog::ConfiguredCatalog;
use omr_scanner::application::scan_session::ScanSessionHandle;
use omr_scanner::infrastructure::console::run_console;
use omr_scanner::infrastructure::device::StillFolderDevice;
use omr_scanner::infrastructure::storage::config::{load_config, StationConfig};
use omr_scanner::infrastructure::transport::WsConnector;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Live answer-sheet scanning station.
#[derive(Debug, Parser)]
#[command(
    name = "omr-scanner",
    about = "Capture answer sheets and grade them with a remote recognition service",
    version
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "OMR_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket URL of the recognition service.
    #[arg(long, env = "OMR_SERVICE_URL")]
    service_url: Option<String>,

    /// Directory whose subdirectories act as capture devices.
    #[arg(long, env = "OMR_DEVICE_ROOT")]
    device_root: Option<PathBuf>,

    /// Capture device id to open instead of the default choice.
    #[arg(long, env = "OMR_DEVICE")]
    device: Option<String>,

    /// Exam used when `start` is typed without an exam id.
    #[arg(long, env = "OMR_EXAM")]
    exam: Option<String>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, env = "OMR_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Applies the flags on top of the config file values.
    fn apply_to(&self, config: &mut StationConfig) {
        if let Some(url) = &self.service_url {
            config.service.url = url.clone();
        }
        if let Some(root) = &self.device_root {
            config.capture.device_root = root.clone();
        }
        if let Some(device) = &self.device {
            config.capture.preferred_device = Some(device.clone());
        }
        if let Some(level) = &self.log_level {
            config.station.log_level = level.clone();
        }
    }

    /// Loads the config file and layers the flags over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    fn into_station_config(self) -> anyhow::Result<(StationConfig, Option<String>)> {
        let mut config = load_config(self.config.as_deref()).with_context(|| match &self.config {
            Some(path) => format!("loading config from {}", path.display()),
            None => "loading config from the platform config directory".to_string(),
        })?;
        self.apply_to(&mut config);
        Ok((config, self.exam))
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, default_exam) = cli.into_station_config()?;

    // `RUST_LOG` wins; otherwise the configured level applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.station.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        "OMR scanning station starting: service={}, devices={}",
        config.service.url,
        config.capture.device_root.display()
    );

    let device = Arc::new(StillFolderDevice::new(config.capture.device_root.clone()));
    let connector = Arc::new(WsConnector::new(
        config.service.url.clone(),
        config.connect_timeout(),
    ));
    let catalog = Arc::new(ConfiguredCatalog::new(config.exams.clone()));
    let handle = ScanSessionHandle::spawn(
        device,
        connector,
        catalog,
        Arc::new(GenerationCounter::new()),
        DeviceSlot::new(),
        config.session_settings(),
    );

    // ── Ctrl-C → clean stop ──────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; stopping the session");
                on_signal.cancel();
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run_console(handle, stdin, tokio::io::stdout(), default_exam, shutdown).await?;

    info!("OMR scanning station stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
