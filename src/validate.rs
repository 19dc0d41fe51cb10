//! Validation loop: replay a stored calibration on live frames
//!
//! Every accepted frame is shown twice, as captured in `Normal` and
//! rectified and cropped to the valid region in `Undistorted`, so the effect
//! of the calibration can be judged by eye.

use image::imageops;
use nalgebra::Matrix3;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::calibration::CalibrationArtifact;
use crate::gate::SamplingGate;
use crate::vision::{
    Frame, FrameSource, ImageSize, PreviewSink, Progress, Roi, Signal, SignalSource, Undistorter,
};

pub const NORMAL_WINDOW: &str = "Normal";
pub const UNDISTORTED_WINDOW: &str = "Undistorted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Aborted,
    SourceExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Running,
    Stopped(StopReason),
}

/// Rectification derived from the artifact for one frame size
struct Rectification {
    size: ImageSize,
    new_camera_matrix: Matrix3<f64>,
    roi: Roi,
}

pub struct ValidationSession<S, U> {
    source: S,
    undistorter: U,
    artifact: CalibrationArtifact,
    gate: SamplingGate,
    state: ValidationState,
    rectification: Option<Rectification>,
    frames_shown: usize,
}

impl<S, U> ValidationSession<S, U>
where
    S: FrameSource,
    U: Undistorter,
{
    pub fn new(source: S, undistorter: U, artifact: CalibrationArtifact, gate: SamplingGate) -> Self {
        Self {
            source,
            undistorter,
            artifact,
            gate,
            state: ValidationState::Running,
            rectification: None,
            frames_shown: 0,
        }
    }

    pub fn state(&self) -> ValidationState {
        self.state
    }

    /// Number of frames rectified and shown so far
    pub fn frames_shown(&self) -> usize {
        self.frames_shown
    }

    /// Run ticks until the loop stops
    pub fn run(mut self, signals: &mut dyn SignalSource, display: &mut dyn PreviewSink) -> StopReason {
        info!("Validating calibration, request abort to stop");
        display.report(&self.progress());

        loop {
            if let ValidationState::Stopped(reason) = self.state() {
                info!("Validation showed {} rectified frames", self.frames_shown());
                return reason;
            }
            self.tick(Instant::now(), signals, display);
        }
    }

    pub fn tick(&mut self, now: Instant, signals: &mut dyn SignalSource, display: &mut dyn PreviewSink) {
        if self.state != ValidationState::Running {
            return;
        }

        let Some(frame) = self.source.read() else {
            warn!("Failed to grab frame from camera");
            self.stop(StopReason::SourceExhausted, display);
            return;
        };

        if self.gate.should_accept(now) {
            let undistorted = self.rectify(&frame);
            display.show(NORMAL_WINDOW, &frame);
            display.show(UNDISTORTED_WINDOW, &undistorted);
            self.frames_shown += 1;
        }

        if signals.poll() == Some(Signal::Abort) {
            info!("Abort requested, stopping validation");
            self.stop(StopReason::Aborted, display);
        }
    }

    fn rectify(&mut self, frame: &Frame) -> Frame {
        let size = ImageSize::of(frame);
        let k = *self.artifact.camera_matrix();

        let stale = self.rectification.as_ref().map_or(true, |r| r.size != size);
        if stale {
            if let Some((w, h)) = self.artifact.image_size() {
                if (w, h) != (size.width, size.height) {
                    warn!(
                        "Frames are {}x{} but the calibration was solved at {}x{}",
                        size.width, size.height, w, h
                    );
                }
            }
            let (new_camera_matrix, roi) =
                self.undistorter
                    .optimal_matrix(&k, self.artifact.dist_coeffs(), size);
            debug!("Rectified camera matrix {:?}, valid region {:?}", new_camera_matrix, roi);
            self.rectification = Some(Rectification {
                size,
                new_camera_matrix,
                roi,
            });
        }
        let Some(rect) = &self.rectification else {
            return frame.clone();
        };

        let undistorted = self.undistorter.undistort(
            frame,
            &k,
            self.artifact.dist_coeffs(),
            &rect.new_camera_matrix,
        );
        crop_to_roi(undistorted, rect.roi)
    }

    fn stop(&mut self, reason: StopReason, display: &mut dyn PreviewSink) {
        debug!("Validation stopped: {:?}", reason);
        self.state = ValidationState::Stopped(reason);
        display.report(&self.progress());
    }

    fn progress(&self) -> Progress {
        Progress {
            mode: "validate",
            phase: match self.state {
                ValidationState::Running => "running",
                ValidationState::Stopped(StopReason::Aborted) => "aborted",
                ValidationState::Stopped(StopReason::SourceExhausted) => "stopped",
            },
            samples: self.frames_shown,
            target: 0,
        }
    }
}

/// Crop to `roi`, clipped to the frame; an empty region keeps the frame
fn crop_to_roi(frame: Frame, roi: Roi) -> Frame {
    if roi.is_empty() || roi.x >= frame.width() || roi.y >= frame.height() {
        return frame;
    }
    let width = roi.width.min(frame.width() - roi.x);
    let height = roi.height.min(frame.height() - roi.y);
    imageops::crop_imm(&frame, roi.x, roi.y, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{FakeSource, RecordingDisplay, ScriptedSignals};
    use crate::undistort::RemapUndistorter;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Yields one blank frame per listed size
    struct ResizingSource(VecDeque<(u32, u32)>);

    impl FrameSource for ResizingSource {
        fn read(&mut self) -> Option<Frame> {
            self.0.pop_front().map(|(w, h)| Frame::new(w, h))
        }
    }

    /// Returns the frame unchanged and reports a fixed region
    struct FakeUndistorter {
        roi: Roi,
        matrix_calls: Cell<usize>,
        undistort_calls: usize,
    }

    impl FakeUndistorter {
        fn with_roi(roi: Roi) -> Self {
            Self {
                roi,
                matrix_calls: Cell::new(0),
                undistort_calls: 0,
            }
        }
    }

    impl Undistorter for FakeUndistorter {
        fn optimal_matrix(&self, k: &Matrix3<f64>, _d: &[f64], _size: ImageSize) -> (Matrix3<f64>, Roi) {
            self.matrix_calls.set(self.matrix_calls.get() + 1);
            (*k, self.roi)
        }

        fn undistort(&mut self, frame: &Frame, _k: &Matrix3<f64>, _d: &[f64], _new_k: &Matrix3<f64>) -> Frame {
            self.undistort_calls += 1;
            frame.clone()
        }
    }

    /// Records frame sizes per window
    #[derive(Default)]
    struct SizeDisplay {
        shown: Vec<(String, (u32, u32))>,
    }

    impl PreviewSink for SizeDisplay {
        fn show(&mut self, window: &str, frame: &Frame) {
            self.shown.push((window.to_string(), frame.dimensions()));
        }
    }

    fn artifact() -> CalibrationArtifact {
        CalibrationArtifact::new(
            Matrix3::new(50.0, 0.0, 31.5, 0.0, 50.0, 23.5, 0.0, 0.0, 1.0),
            vec![0.0; 5],
        )
    }

    fn source(frames: usize) -> FakeSource {
        FakeSource {
            remaining: frames,
            size: (64, 48),
        }
    }

    #[test]
    fn test_shows_normal_and_cropped_undistorted_frames() {
        let roi = Roi { x: 4, y: 2, width: 50, height: 40 };
        let mut v = ValidationSession::new(
            source(5),
            FakeUndistorter::with_roi(roi),
            artifact(),
            SamplingGate::new(Duration::from_secs(1)),
        );
        let mut signals = ScriptedSignals(Default::default());
        let mut display = SizeDisplay::default();

        v.tick(Instant::now(), &mut signals, &mut display);

        assert_eq!(
            display.shown,
            vec![
                (NORMAL_WINDOW.to_string(), (64, 48)),
                (UNDISTORTED_WINDOW.to_string(), (50, 40)),
            ]
        );
    }

    #[test]
    fn test_empty_roi_skips_crop() {
        let mut v = ValidationSession::new(
            source(1),
            FakeUndistorter::with_roi(Roi::default()),
            artifact(),
            SamplingGate::new(Duration::from_secs(1)),
        );
        let mut display = SizeDisplay::default();

        v.tick(Instant::now(), &mut ScriptedSignals(Default::default()), &mut display);

        assert_eq!(display.shown[1], (UNDISTORTED_WINDOW.to_string(), (64, 48)));
    }

    #[test]
    fn test_gate_throttles_rectification() {
        let mut v = ValidationSession::new(
            source(10),
            FakeUndistorter::with_roi(Roi::default()),
            artifact(),
            SamplingGate::new(Duration::from_secs(1)),
        );
        let mut signals = ScriptedSignals(Default::default());
        let mut display = RecordingDisplay::default();
        let t0 = Instant::now();

        for ms in [0, 300, 600, 1000, 1500, 2100] {
            v.tick(t0 + Duration::from_millis(ms), &mut signals, &mut display);
        }

        assert_eq!(v.frames_shown(), 3);
        assert_eq!(v.undistorter.undistort_calls, 3);
        // Same frame size throughout, matrix computed once
        assert_eq!(v.undistorter.matrix_calls.get(), 1);
        assert_eq!(display.shown.len(), 6);
    }

    #[test]
    fn test_rectification_recomputed_on_size_change() {
        let sizes = [(64, 48), (32, 24), (64, 48)];
        let mut v = ValidationSession::new(
            ResizingSource(sizes.into_iter().collect()),
            FakeUndistorter::with_roi(Roi::default()),
            artifact(),
            SamplingGate::new(Duration::from_secs(1)),
        );
        let mut signals = ScriptedSignals(Default::default());
        let mut display = SizeDisplay::default();
        let t0 = Instant::now();

        for i in 0..3 {
            v.tick(t0 + Duration::from_secs(i), &mut signals, &mut display);
        }

        assert_eq!(v.undistorter.matrix_calls.get(), 3);
        let undistorted: Vec<(u32, u32)> = display
            .shown
            .iter()
            .filter(|(window, _)| window == UNDISTORTED_WINDOW)
            .map(|(_, size)| *size)
            .collect();
        assert_eq!(undistorted, sizes);
    }

    #[test]
    fn test_abort_stops_loop() {
        let v = ValidationSession::new(
            source(100),
            FakeUndistorter::with_roi(Roi::default()),
            artifact(),
            SamplingGate::new(Duration::from_secs(1)),
        );
        let mut signals = ScriptedSignals(vec![None, None, Some(Signal::Abort)].into());
        let mut display = RecordingDisplay::default();

        assert_eq!(v.run(&mut signals, &mut display), StopReason::Aborted);
        assert_eq!(display.reports.last().map(|p| p.phase), Some("aborted"));
    }

    #[test]
    fn test_capture_signal_is_ignored() {
        let mut v = ValidationSession::new(
            source(3),
            FakeUndistorter::with_roi(Roi::default()),
            artifact(),
            SamplingGate::new(Duration::from_secs(1)),
        );
        let mut signals = ScriptedSignals::captures(3);
        let mut display = RecordingDisplay::default();

        v.tick(Instant::now(), &mut signals, &mut display);
        assert_eq!(v.state(), ValidationState::Running);
    }

    #[test]
    fn test_exhausted_source_stops_loop() {
        let v = ValidationSession::new(
            source(2),
            RemapUndistorter::new(0.0),
            artifact(),
            SamplingGate::new(Duration::from_secs(1)),
        );
        let mut display = RecordingDisplay::default();

        let reason = v.run(&mut ScriptedSignals(Default::default()), &mut display);

        assert_eq!(reason, StopReason::SourceExhausted);
        assert_eq!(display.shown.first().map(String::as_str), Some(NORMAL_WINDOW));
    }
}
