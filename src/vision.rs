//! Interfaces of the collaborators driven by the capture and validation loops
//!
//! The loops only talk to these traits, so they can run against a V4L2
//! camera and the built-in detector/solver in production, or against
//! deterministic fakes in tests.

use image::{GrayImage, RgbImage};
use nalgebra::{Matrix3, Point2};
use serde::Serialize;
use thiserror::Error;

use crate::calibration::CalibrationArtifact;
use crate::pattern::PatternSize;
use crate::samples::Observation;

/// A colour frame as delivered by a [`FrameSource`]
pub type Frame = RgbImage;

/// Image dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(frame: &Frame) -> Self {
        Self::new(frame.width(), frame.height())
    }
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Parameters of iterative sub-pixel corner refinement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineWindow {
    /// Half side length of the search window; 11 means a 23x23 window
    pub half_size: u32,
    pub max_iterations: u32,
    /// Stop once a refinement step moves the corner less than this (pixels)
    pub epsilon: f64,
}

impl Default for RefineWindow {
    fn default() -> Self {
        Self {
            half_size: 11,
            max_iterations: 30,
            epsilon: 0.001,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolveError {
    #[error("calibration needs at least {needed} views, got {got}")]
    InsufficientViews { needed: usize, got: usize },
    #[error("observation {0} has mismatched or too few correspondences")]
    MismatchedObservation(usize),
    #[error("degenerate calibration: {0}")]
    Degenerate(String),
}

/// Source of camera frames
pub trait FrameSource {
    /// Next frame, or `None` when the source failed or is exhausted
    fn read(&mut self) -> Option<Frame>;
}

/// Chessboard inner-corner detector
pub trait CornerDetector {
    /// Corner pixel positions in pattern order, or `None` when the full grid
    /// was not found
    fn detect(&self, gray: &GrayImage, pattern: PatternSize) -> Option<Vec<Point2<f64>>>;

    /// Sub-pixel refinement of previously detected corners
    fn refine(&self, gray: &GrayImage, corners: &[Point2<f64>], window: RefineWindow) -> Vec<Point2<f64>>;
}

/// Intrinsic calibration from planar correspondences
pub trait CalibrationSolver {
    fn solve(
        &self,
        observations: &[Observation],
        image_size: ImageSize,
    ) -> Result<CalibrationArtifact, SolveError>;
}

/// Lens undistortion of whole frames
pub trait Undistorter {
    /// Rectified camera matrix for `image_size` and the region of the
    /// undistorted image that contains only valid pixels
    fn optimal_matrix(
        &self,
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64],
        image_size: ImageSize,
    ) -> (Matrix3<f64>, Roi);

    fn undistort(
        &mut self,
        frame: &Frame,
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64],
        new_camera_matrix: &Matrix3<f64>,
    ) -> Frame;
}

/// Progress of a running session, published alongside previews
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Progress {
    pub mode: &'static str,
    pub phase: &'static str,
    pub samples: usize,
    pub target: usize,
}

/// Where preview frames are shown
pub trait PreviewSink {
    fn show(&mut self, window: &str, frame: &Frame);

    fn report(&mut self, _progress: &Progress) {}
}

/// User request observed once per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Capture,
    Abort,
}

/// Non-blocking source of user requests
pub trait SignalSource {
    fn poll(&mut self) -> Option<Signal>;
}
