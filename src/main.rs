//! CLI Entry Point for rust-xray
//!
//! Provides command-line interface for:
//! - Running the capture and correction pipeline (detector plugin or the
//!   built-in synthetic detector)
//! - Inspecting and synthesizing calibration datasets
//! - Inspecting detector driver modules
//!
//! # Usage
//!
//! Run the data path for 200 frames:
//! ```bash
//! rust_xray run --frames 200
//! ```
//!
//! Write a synthetic calibration set and check it:
//! ```bash
//! rust_xray calibration synthesize --output calibration
//! rust_xray calibration status
//! ```
//!
//! Inspect a driver module:
//! ```bash
//! rust_xray plugin inspect target/release/libmock_detector.so
//! ```

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_xray::calibration::acquisition::{self, DefectThresholds};
use rust_xray::calibration::{
    CalibrationDataset, CalibrationFile, CalibrationManager, CalibrationPayload, ScatterParameters,
};
use rust_xray::config::{XrayConfig, DEFAULT_CONFIG_PATH};
use rust_xray::data::FrameRingBuffer;
use rust_xray::frame::FrameBuffer;
use rust_xray::hardware::{
    CaptureAdapter, FrameSource, PluginHandle, PluginLoader, SyntheticDetector,
    SyntheticDetectorConfig,
};
use rust_xray::logging;
use rust_xray::pipeline::{LoggingSink, PipelineSettings, PipelineWorker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust_xray")]
#[command(about = "Real-time frame transfer and correction for digital X-ray detectors", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture, correct and deliver frames
    Run {
        /// Stop after this many frames
        #[arg(long, default_value = "100")]
        frames: u64,

        /// Driver module overriding `[detector] plugin`
        #[arg(long)]
        plugin: Option<PathBuf>,
    },

    /// Calibration dataset tools
    Calibration {
        #[command(subcommand)]
        command: CalibrationCommands,
    },

    /// Detector driver module tools
    Plugin {
        #[command(subcommand)]
        command: PluginCommands,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum CalibrationCommands {
    /// Load the calibration directory and report every dataset
    Status,

    /// Acquire a calibration set from the synthetic detector
    Synthesize {
        /// Output directory (defaults to `[calibration] directory`)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Frames averaged per dataset
        #[arg(long, default_value = "16")]
        frames: usize,
    },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// Load one module and print its manifest
    Inspect {
        /// Path to the shared library
        path: PathBuf,
    },

    /// Load every module in a directory
    Discover {
        /// Directory to scan (defaults to the user plugin directory)
        dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = XrayConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run { frames, plugin } => run_pipeline(&config, frames, plugin),
        Commands::Calibration { command } => match command {
            CalibrationCommands::Status => calibration_status(&config),
            CalibrationCommands::Synthesize { output, frames } => {
                let dir = output.unwrap_or_else(|| config.calibration.directory.clone());
                synthesize_calibration(&config, &dir, frames)
            }
        },
        Commands::Plugin { command } => match command {
            PluginCommands::Inspect { path } => inspect_plugin(&config, &path),
            PluginCommands::Discover { dir } => {
                let dir = match dir {
                    Some(dir) => dir,
                    None => default_plugin_dir()?,
                };
                discover_plugins(&config, &dir)
            }
        },
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn calibration_manager(config: &XrayConfig) -> CalibrationManager {
    let manager = CalibrationManager::new(config.detector.width, config.detector.height);
    match config.calibration.max_age {
        Some(max_age) => manager.with_max_age(max_age),
        None => manager,
    }
}

fn run_pipeline(config: &XrayConfig, frames: u64, plugin: Option<PathBuf>) -> Result<()> {
    let buffer = Arc::new(FrameRingBuffer::new(config.ring_buffer_config())?);

    let calibration = Arc::new(calibration_manager(config));
    for (kind, dataset) in calibration.load_directory(&config.calibration.directory) {
        if let Some(reason) = dataset.invalid_reason() {
            warn!(kind = %kind, %reason, "Calibration rejected");
        }
    }

    let loader = PluginLoader::new().with_driver_config(&config.detector.vendor_config);
    let source: Box<dyn FrameSource> = match plugin.as_ref().or(config.detector.plugin.as_ref()) {
        Some(path) => {
            let handle = loader.load_plugin(path)?;
            let driver = handle.driver().with_context(|| {
                format!(
                    "plugin '{}' does not export capture entry points",
                    handle.manifest().plugin_name
                )
            })?;
            Box::new(driver)
        }
        None => {
            info!("No detector plugin configured, using the synthetic detector");
            Box::new(SyntheticDetector::new(SyntheticDetectorConfig {
                width: config.detector.width,
                height: config.detector.height,
                ..Default::default()
            }))
        }
    };

    let settings = PipelineSettings {
        width: config.detector.width,
        height: config.detector.height,
        engine: config.engine_config(),
        processing: config.processing.clone(),
        poll_interval: Duration::from_millis(50),
    };
    let worker = PipelineWorker::spawn(
        Arc::clone(&buffer),
        calibration,
        settings,
        Box::new(LoggingSink),
    )?;
    let capture = CaptureAdapter::spawn(source, Arc::clone(&buffer), Some(frames))?;

    let capture_stats = capture.join()?;
    buffer.close();
    let pipeline_stats = worker.join()?;
    let buffer_stats = buffer.stats();

    println!("Frames captured:   {}", capture_stats.frames_captured);
    println!("Frames dropped:    {}", buffer_stats.dropped);
    println!("Frames delivered:  {}", pipeline_stats.frames_delivered);
    println!("Frames failed:     {}", pipeline_stats.frames_failed);
    println!("Budget overruns:   {}", pipeline_stats.budget_overruns);
    println!(
        "Max write latency: {:.3} ms",
        capture_stats.max_write_latency.as_secs_f64() * 1000.0
    );
    Ok(())
}

fn calibration_status(config: &XrayConfig) -> Result<()> {
    let manager = calibration_manager(config);
    manager.load_directory(&config.calibration.directory);

    println!("Calibration directory: {}", config.calibration.directory.display());
    for status in manager.status() {
        let state = match (status.loaded, status.valid, status.stale) {
            (false, _, _) => "missing",
            (true, false, _) => "invalid",
            (true, true, true) => "stale",
            (true, true, false) => "ok",
        };
        let acquired = status
            .acquired_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<15} {:<8} acquired {}", status.kind.to_string(), state, acquired);
        if let Some(reason) = status.last_rejection {
            println!("  {:<15} rejected: {}", "", reason);
        }
    }
    Ok(())
}

fn synthesize_calibration(config: &XrayConfig, dir: &Path, frames: usize) -> Result<()> {
    if frames == 0 {
        bail!("at least one frame per dataset is required");
    }
    let (width, height) = (config.detector.width, config.detector.height);
    let mut detector = SyntheticDetector::new(SyntheticDetectorConfig {
        width,
        height,
        ..Default::default()
    });

    let mut acquire = |exposure: bool| -> Vec<FrameBuffer> {
        detector.set_exposure(exposure);
        (0..frames)
            .map(|_| {
                let mut frame = FrameBuffer::new(width, height);
                detector.render(&mut frame.data);
                frame
            })
            .collect()
    };
    let darks = acquire(false);
    let flats = acquire(true);

    let dark = acquisition::average_dark(width, height, &darks)?;
    let response = acquisition::flat_response(&dark, &flats)?;
    let gain = acquisition::gain_from_response(width, height, &response)?;
    let defects = acquisition::detect_defects(&dark, &response, DefectThresholds::default())?;
    let scatter = CalibrationDataset::new(
        width,
        height,
        Utc::now(),
        CalibrationPayload::ScatterParams(ScatterParameters::default()),
    );

    std::fs::create_dir_all(dir)?;
    for dataset in [&dark, &gain, &defects, &scatter] {
        let path = dir.join(dataset.kind.file_name());
        CalibrationFile::write(&path, dataset)?;
        println!("Wrote {} ({})", path.display(), dataset.checksum_hex());
    }
    if let Some(entries) = defects.defect_map() {
        println!("Defective pixels: {}", entries.len());
    }
    Ok(())
}

fn print_plugin(handle: &PluginHandle) {
    let manifest = handle.manifest();
    println!("{}", handle.path().display());
    println!("  vendor:   {}", manifest.vendor);
    println!("  name:     {}", manifest.plugin_name);
    println!("  version:  {}", manifest.version);
    println!("  abi:      {}", manifest.abi_version);
    println!("  state:    {}", handle.state());
    println!("  capture:  {}", handle.supports_capture());
}

fn inspect_plugin(config: &XrayConfig, path: &Path) -> Result<()> {
    let loader = PluginLoader::new().with_driver_config(&config.detector.vendor_config);
    let handle = loader.load_plugin(path)?;
    print_plugin(&handle);
    let name = handle.manifest().plugin_name.clone();
    drop(handle);
    loader.unload_plugin(&name)?;
    Ok(())
}

fn discover_plugins(config: &XrayConfig, dir: &Path) -> Result<()> {
    let loader = PluginLoader::new().with_driver_config(&config.detector.vendor_config);
    let handles = loader
        .discover(dir)
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    if handles.is_empty() {
        println!("No loadable plugins in {}", dir.display());
    }
    for handle in &handles {
        print_plugin(handle);
    }
    if let Some(err) = loader.last_error() {
        println!("Last load error: {err}");
    }
    Ok(())
}

fn default_plugin_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("rust_xray").join("plugins"))
        .context("no local data directory on this platform")
}
