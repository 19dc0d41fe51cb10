//! Configuration management for calibrate-camera

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::chessboard::DetectorParams;
use crate::pattern::PatternSize;
use crate::solver::SolverOptions;
use crate::vision::RefineWindow;

/// Preferred capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CaptureFormat {
    /// Prefer MJPEG (lower bandwidth, decoded in software)
    #[default]
    Mjpeg,
    /// Prefer YUYV (higher bandwidth, no compression artifacts on corners)
    Yuyv,
}

/// Video configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub input_device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Seconds to wait for a frame before the camera counts as stalled
    pub read_timeout: f64,
    /// Preferred capture format (MJPEG or YUYV)
    pub format: CaptureFormat,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            read_timeout: 5.0,
            format: CaptureFormat::default(),
        }
    }
}

impl VideoConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve previews and accept capture/abort requests over HTTP
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub jpeg_quality: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8091,
            jpeg_quality: 70,
        }
    }
}

/// Capture and validation session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Edge length of one chessboard square, in the unit of the solved translations
    pub square_size: f64,
    /// Views collected before solving
    pub sample_count: usize,
    /// Seconds between preview refreshes while capturing
    pub capture_period: f64,
    /// Seconds between rectified frames while validating
    pub validation_period: f64,
    /// 0 keeps only valid pixels after undistortion, 1 keeps all source pixels
    pub alpha: f64,
    /// Inner corners per row and per column
    pub pattern: PatternSize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            square_size: 1.0,
            sample_count: 10,
            capture_period: 4.0,
            validation_period: 1.0,
            alpha: 0.0,
            pattern: PatternSize::default(),
        }
    }
}

/// Sub-pixel corner refinement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    pub half_window: u32,
    pub max_iterations: u32,
    pub epsilon: f64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        let window = RefineWindow::default();
        Self {
            half_window: window.half_size,
            max_iterations: window.max_iterations,
            epsilon: window.epsilon,
        }
    }
}

impl RefineConfig {
    pub fn window(&self) -> RefineWindow {
        RefineWindow {
            half_size: self.half_window,
            max_iterations: self.max_iterations,
            epsilon: self.epsilon,
        }
    }
}

/// Calibration solver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iterations: usize,
    /// Keep the sixth-order radial term at zero
    pub fix_k3: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        let options = SolverOptions::default();
        Self {
            max_iterations: options.max_iterations,
            fix_k3: options.fix_k3,
        }
    }
}

impl SolverConfig {
    pub fn options(&self) -> SolverOptions {
        SolverOptions {
            max_iterations: self.max_iterations,
            fix_k3: self.fix_k3,
            ..SolverOptions::default()
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub detector: DetectorParams,

    #[serde(default)]
    pub refine: RefineConfig,

    #[serde(default)]
    pub solver: SolverConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            config
                .validate()
                .with_context(|| format!("Invalid configuration in {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Reject values no session can run with
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.pattern.cols == 0 || session.pattern.rows == 0 {
            bail!(
                "pattern must have at least one inner corner per row and column, got {}x{}",
                session.pattern.cols,
                session.pattern.rows
            );
        }
        if session.sample_count == 0 {
            bail!("sample_count must be at least 1");
        }
        if !(session.square_size > 0.0) {
            bail!("square_size must be positive, got {}", session.square_size);
        }
        for (name, period) in [
            ("capture_period", session.capture_period),
            ("validation_period", session.validation_period),
        ] {
            if !(period > 0.0 && period.is_finite()) {
                bail!("{} must be a positive number of seconds, got {}", name, period);
            }
        }
        if !(0.0..=1.0).contains(&session.alpha) {
            bail!("alpha must be within [0, 1], got {}", session.alpha);
        }
        if self.video.width == 0 || self.video.height == 0 {
            bail!("video resolution must be non-zero");
        }
        if !(self.video.read_timeout > 0.0 && self.video.read_timeout.is_finite()) {
            bail!(
                "read_timeout must be a positive number of seconds, got {}",
                self.video.read_timeout
            );
        }
        if self.detector.radius == 0 {
            bail!("detector radius must be at least 1");
        }
        if !(1..=100).contains(&self.server.jpeg_quality) {
            bail!("jpeg_quality must be within 1..=100");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session.pattern, PatternSize::new(7, 5));
        assert_eq!(config.session.sample_count, 10);
        assert_eq!(config.session.capture_period, 4.0);
        assert_eq!(config.session.alpha, 0.0);
        assert_eq!(config.refine.window(), RefineWindow::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let reloaded = Config::load_or_create(&path).unwrap();
        assert_eq!(reloaded.session.pattern, created.session.pattern);
        assert_eq!(reloaded.video.input_device, "/dev/video0");
        assert_eq!(reloaded.detector.radius, 5);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[session]\nsample_count = 15\n\n[session.pattern]\ncols = 9\nrows = 6\n",
        )
        .unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.session.sample_count, 15);
        assert_eq!(config.session.pattern, PatternSize::new(9, 6));
        assert_eq!(config.session.validation_period, 1.0);
        assert_eq!(config.server.port, 8091);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        config.session.sample_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.pattern = PatternSize::new(0, 5);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.capture_period = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.alpha = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.video.read_timeout = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_camera_reads_are_bounded() {
        let config = Config::default();
        assert_eq!(config.video.read_timeout(), Duration::from_secs(5));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[video]\nread_timeout = 0.5\n").unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.video.read_timeout(), Duration::from_millis(500));
        assert_eq!(config.video.fps, 30);
    }

    #[test]
    fn test_invalid_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nalpha = -1.0\n").unwrap();

        assert!(Config::load_or_create(&path).is_err());
    }
}
