//! calibrate-camera - Chessboard camera calibration
//!
//! Grabs views of a planar chessboard from a V4L2 camera on request, solves
//! for the camera intrinsics and lens distortion, stores them as JSON and
//! then shows live undistorted frames so the result can be checked. Previews
//! and controls are served over HTTP; the terminal accepts the same keys.

mod calibration;
mod camera_model;
mod capture;
mod chessboard;
mod config;
mod corner_refine;
mod gate;
mod pattern;
mod samples;
mod server;
mod session;
mod signals;
mod solver;
mod undistort;
mod validate;
mod vision;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::capture::V4lCamera;
use crate::chessboard::ChessboardDetector;
use crate::config::Config;
use crate::gate::SamplingGate;
use crate::pattern::PatternModel;
use crate::server::{AppState, RemoteDisplay};
use crate::session::{capture_and_store, CaptureSession, CaptureSettings, SessionError};
use crate::signals::SignalHub;
use crate::solver::ZhangSolver;
use crate::undistort::RemapUndistorter;
use crate::validate::ValidationSession;

/// Chessboard camera calibration: capture, solve, store and validate
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Calibration file written after calibrating, or read with --test
    #[arg(short, long, default_value = "calibration.json")]
    file: PathBuf,

    /// Only validate an existing calibration file
    #[arg(short, long)]
    test: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Input video device (e.g., /dev/video0), overrides the configuration
    #[arg(short, long)]
    input: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("calibrate-camera v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load_or_create(&args.config)?;
    if let Some(input) = &args.input {
        config.video.input_device = input.clone();
    }

    info!("Input device: {}", config.video.input_device);
    info!(
        "Pattern: {}x{} inner corners, {} views",
        config.session.pattern.cols, config.session.pattern.rows, config.session.sample_count
    );

    let signals = SignalHub::new();
    let state = Arc::new(AppState::new(signals.clone(), config.server.jpeg_quality));

    if config.server.enabled {
        let addr = format!("{}:{}", config.server.host, config.server.port);
        info!("Starting web server at http://{}", addr);
        let server_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_server(&addr, server_state).await {
                error!("Server error: {}", e);
            }
        });
    }

    if let Err(e) = signals::spawn_stdin_listener(signals.clone()) {
        warn!("Terminal controls unavailable: {}", e);
    }

    let interrupt = signals.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            interrupt.request_abort();
        }
    });

    let validate_only = args.test;
    let file = args.file;
    tokio::task::spawn_blocking(move || run_sessions(&config, &file, validate_only, signals, state))
        .await
        .context("Session task panicked")?
}

/// Calibrate (unless `validate_only`) and then validate, on the calling thread
fn run_sessions(
    config: &Config,
    file: &Path,
    validate_only: bool,
    mut signals: Arc<SignalHub>,
    state: Arc<AppState>,
) -> Result<()> {
    let mut display = RemoteDisplay::new(state);

    let artifact = if validate_only {
        calibration::load(file)?
    } else {
        let camera = V4lCamera::open(&config.video)?;
        let session = CaptureSession::new(
            camera,
            ChessboardDetector::new(config.detector.clone()),
            ZhangSolver::new(config.solver.options()),
            PatternModel::with_square_size(config.session.pattern, config.session.square_size),
            CaptureSettings {
                target_samples: config.session.sample_count,
                refine: config.refine.window(),
            },
            SamplingGate::from_secs_f64(config.session.capture_period),
        );

        // The session, and with it the camera, is dropped before validation reopens it
        match capture_and_store(session, &mut signals, &mut display, file) {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                info!("Calibration aborted, nothing written");
                return Ok(());
            }
            // A read cut short by an interrupt is still a user abort
            Err(SessionError::SourceExhausted) if signals.abort_requested() => {
                info!("Calibration interrupted, nothing written");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    };

    info!("Camera matrix: {:?}", artifact.camera_matrix());
    info!("Distortion coefficients: {:?}", artifact.dist_coeffs());

    let camera = V4lCamera::open(&config.video)?;
    let validation = ValidationSession::new(
        camera,
        RemapUndistorter::new(config.session.alpha),
        artifact,
        SamplingGate::from_secs_f64(config.session.validation_period),
    );
    let reason = validation.run(&mut signals, &mut display);
    info!("Validation finished ({:?})", reason);

    Ok(())
}
