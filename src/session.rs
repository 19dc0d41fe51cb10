//! Capture session: collect chessboard views until the target count is
//! reached, then solve for the camera intrinsics
//!
//! One tick = one frame read, an optional preview refresh, one signal poll
//! and, on a capture request, one detection attempt. Reaching the target
//! count solves synchronously within the same tick.

use image::imageops;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::calibration::{self, ArtifactError, CalibrationArtifact};
use crate::chessboard::draw_corners;
use crate::gate::SamplingGate;
use crate::pattern::PatternModel;
use crate::samples::{Observation, SampleSet};
use crate::vision::{
    CalibrationSolver, CornerDetector, FrameSource, ImageSize, PreviewSink, Progress, RefineWindow,
    Signal, SignalSource,
};

/// Preview window name used while collecting
pub const PREVIEW_WINDOW: &str = "Preview";

/// Failures that end a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("frame source exhausted")]
    SourceExhausted,
    #[error("calibration solver failed: {0}")]
    SolverDivergence(String),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Phase of a capture session without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Collecting,
    Solving,
    Done,
    Aborted,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Collecting => "collecting",
            Phase::Solving => "solving",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
            Phase::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub enum CaptureState {
    Collecting,
    Solving,
    Done(CalibrationArtifact),
    Aborted,
    Failed(SessionError),
}

impl CaptureState {
    pub fn phase(&self) -> Phase {
        match self {
            CaptureState::Collecting => Phase::Collecting,
            CaptureState::Solving => Phase::Solving,
            CaptureState::Done(_) => Phase::Done,
            CaptureState::Aborted => Phase::Aborted,
            CaptureState::Failed(_) => Phase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptureState::Done(_) | CaptureState::Aborted | CaptureState::Failed(_)
        )
    }
}

/// Tunables of a capture session
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub target_samples: usize,
    pub refine: RefineWindow,
}

/// State machine driving one calibration capture.
///
/// Owns its frame source for its whole lifetime; the source is dropped (and
/// the device released) when the session is.
pub struct CaptureSession<S, D, C> {
    source: S,
    detector: D,
    solver: C,
    pattern: PatternModel,
    settings: CaptureSettings,
    samples: SampleSet,
    gate: SamplingGate,
    state: CaptureState,
    trail: Vec<Phase>,
    last_size: Option<ImageSize>,
}

impl<S, D, C> CaptureSession<S, D, C>
where
    S: FrameSource,
    D: CornerDetector,
    C: CalibrationSolver,
{
    pub fn new(
        source: S,
        detector: D,
        solver: C,
        pattern: PatternModel,
        settings: CaptureSettings,
        gate: SamplingGate,
    ) -> Self {
        let samples = SampleSet::new(settings.target_samples);
        Self {
            source,
            detector,
            solver,
            pattern,
            settings,
            samples,
            gate,
            state: CaptureState::Collecting,
            trail: vec![Phase::Collecting],
            last_size: None,
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    /// Every phase entered so far, in order
    pub fn trail(&self) -> &[Phase] {
        &self.trail
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }

    /// Run ticks until a terminal state is reached
    pub fn run(
        mut self,
        signals: &mut dyn SignalSource,
        display: &mut dyn PreviewSink,
    ) -> CaptureState {
        info!(
            "Grabbing chessboard pictures: {} needed. Request a capture to grab a picture.",
            self.samples.target()
        );
        debug!("Preview refresh period {:?}", self.gate.period());
        display.report(&self.progress());

        while !self.state().is_terminal() {
            self.tick(Instant::now(), signals, display);
        }

        let trail: Vec<&str> = self.trail().iter().map(Phase::as_str).collect();
        info!("Capture session ended: {}", trail.join(" -> "));
        if !matches!(self.state, CaptureState::Done(_)) && !self.samples().is_empty() {
            info!("Discarding {} collected views", self.samples().len());
        }
        self.state
    }

    /// Advance the session by one frame
    pub fn tick(
        &mut self,
        now: Instant,
        signals: &mut dyn SignalSource,
        display: &mut dyn PreviewSink,
    ) {
        if !matches!(self.state, CaptureState::Collecting) {
            return;
        }

        let Some(mut frame) = self.source.read() else {
            warn!("Failed to grab frame from camera");
            self.transition(CaptureState::Failed(SessionError::SourceExhausted), display);
            return;
        };
        self.last_size = Some(ImageSize::of(&frame));

        if self.gate.should_accept(now) {
            display.show(PREVIEW_WINDOW, &frame);
        }

        match signals.poll() {
            None => {}
            Some(Signal::Abort) => {
                info!("Abort requested, closing capture session");
                self.transition(CaptureState::Aborted, display);
            }
            Some(Signal::Capture) => {
                info!("Capturing image {} ...", self.samples.len() + 1);
                let gray = imageops::grayscale(&frame);

                let Some(corners) = self.detector.detect(&gray, self.pattern.size()) else {
                    info!("Unable to find chessboard corners");
                    return;
                };
                info!("Found chessboard corners");

                let refined = self.detector.refine(&gray, &corners, self.settings.refine);
                let observation = match Observation::new(&self.pattern, refined) {
                    Ok(obs) => obs,
                    Err(e) => {
                        warn!("Discarding detection: {}", e);
                        return;
                    }
                };

                draw_corners(&mut frame, self.pattern.size(), observation.image_points());
                if let Err(e) = self.samples.push(observation) {
                    warn!("Discarding detection: {}", e);
                    return;
                }
                info!("Collected {}/{} views", self.samples.len(), self.samples.target());

                // Keep the annotated frame on screen for a full period
                display.show(PREVIEW_WINDOW, &frame);
                self.gate.reset(now);
                display.report(&self.progress());

                if self.samples.is_complete() {
                    self.transition(CaptureState::Solving, display);
                    self.solve(display);
                }
            }
        }
    }

    fn solve(&mut self, display: &mut dyn PreviewSink) {
        let Some(size) = self.last_size else {
            self.transition(CaptureState::Failed(SessionError::SourceExhausted), display);
            return;
        };

        info!(
            "Solving calibration from {} views at {}x{}",
            self.samples.len(),
            size.width,
            size.height
        );
        let next = match self.solver.solve(self.samples.observations(), size) {
            Ok(artifact) => {
                if let Some(rms) = artifact.rms_error() {
                    info!("Calibration converged, RMS reprojection error {:.4} px", rms);
                }
                CaptureState::Done(artifact)
            }
            Err(e) => CaptureState::Failed(SessionError::SolverDivergence(e.to_string())),
        };
        self.transition(next, display);
    }

    fn transition(&mut self, next: CaptureState, display: &mut dyn PreviewSink) {
        debug!("Capture state {:?} -> {:?}", self.state.phase(), next.phase());
        self.trail.push(next.phase());
        self.state = next;
        display.report(&self.progress());
    }

    fn progress(&self) -> Progress {
        Progress {
            mode: "calibrate",
            phase: self.state.phase().as_str(),
            samples: self.samples.len(),
            target: self.samples.target(),
        }
    }
}

/// Run a capture session to the end and persist its result.
///
/// The artifact is written to `path` only when the session reaches `Done`;
/// an abort returns `Ok(None)` and leaves any existing file untouched.
pub fn capture_and_store<S, D, C>(
    session: CaptureSession<S, D, C>,
    signals: &mut dyn SignalSource,
    display: &mut dyn PreviewSink,
    path: &Path,
) -> Result<Option<CalibrationArtifact>, SessionError>
where
    S: FrameSource,
    D: CornerDetector,
    C: CalibrationSolver,
{
    match session.run(signals, display) {
        CaptureState::Done(artifact) => {
            calibration::save(&artifact, path)?;
            Ok(Some(artifact))
        }
        CaptureState::Aborted => Ok(None),
        CaptureState::Failed(e) => Err(e),
        // run() only returns terminal states
        CaptureState::Collecting | CaptureState::Solving => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pattern::PatternSize;
    use crate::vision::{Frame, SolveError};
    use image::GrayImage;
    use nalgebra::{Matrix3, Point2};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Yields a fixed number of blank frames
    pub(crate) struct FakeSource {
        pub remaining: usize,
        pub size: (u32, u32),
    }

    impl FrameSource for FakeSource {
        fn read(&mut self) -> Option<Frame> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            Some(Frame::new(self.size.0, self.size.1))
        }
    }

    /// Succeeds according to a scripted sequence, then always
    struct ScriptedDetector {
        hits: std::cell::RefCell<VecDeque<bool>>,
    }

    impl ScriptedDetector {
        fn always() -> Self {
            Self::scripted(&[])
        }

        fn scripted(hits: &[bool]) -> Self {
            Self {
                hits: std::cell::RefCell::new(hits.iter().copied().collect()),
            }
        }
    }

    impl CornerDetector for ScriptedDetector {
        fn detect(&self, _gray: &GrayImage, pattern: PatternSize) -> Option<Vec<Point2<f64>>> {
            let hit = self.hits.borrow_mut().pop_front().unwrap_or(true);
            hit.then(|| {
                (0..pattern.count())
                    .map(|i| Point2::new((i % pattern.cols) as f64 * 10.0, (i / pattern.cols) as f64 * 10.0))
                    .collect()
            })
        }

        fn refine(&self, _gray: &GrayImage, corners: &[Point2<f64>], _window: RefineWindow) -> Vec<Point2<f64>> {
            corners.iter().map(|p| Point2::new(p.x + 0.25, p.y + 0.25)).collect()
        }
    }

    /// Records the observation count it was called with
    struct FakeSolver {
        diverge: bool,
        seen: std::cell::Cell<Option<(usize, ImageSize)>>,
    }

    impl FakeSolver {
        fn converging() -> Self {
            Self {
                diverge: false,
                seen: std::cell::Cell::new(None),
            }
        }

        fn diverging() -> Self {
            Self {
                diverge: true,
                seen: std::cell::Cell::new(None),
            }
        }
    }

    impl CalibrationSolver for FakeSolver {
        fn solve(
            &self,
            observations: &[Observation],
            image_size: ImageSize,
        ) -> Result<CalibrationArtifact, SolveError> {
            self.seen.set(Some((observations.len(), image_size)));
            if self.diverge {
                return Err(SolveError::Degenerate("points are collinear".to_string()));
            }
            Ok(CalibrationArtifact::new(
                Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0),
                vec![0.0; 5],
            ))
        }
    }

    /// Replays a fixed list of signals, one per poll
    pub(crate) struct ScriptedSignals(pub VecDeque<Option<Signal>>);

    impl ScriptedSignals {
        pub(crate) fn captures(n: usize) -> Self {
            Self((0..n).map(|_| Some(Signal::Capture)).collect())
        }
    }

    impl SignalSource for ScriptedSignals {
        fn poll(&mut self) -> Option<Signal> {
            self.0.pop_front().flatten()
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingDisplay {
        pub shown: Vec<String>,
        pub reports: Vec<Progress>,
    }

    impl PreviewSink for RecordingDisplay {
        fn show(&mut self, window: &str, _frame: &Frame) {
            self.shown.push(window.to_string());
        }

        fn report(&mut self, progress: &Progress) {
            self.reports.push(progress.clone());
        }
    }

    fn session<D: CornerDetector>(
        frames: usize,
        detector: D,
        solver: FakeSolver,
        target: usize,
    ) -> CaptureSession<FakeSource, D, FakeSolver> {
        CaptureSession::new(
            FakeSource {
                remaining: frames,
                size: (64, 48),
            },
            detector,
            solver,
            PatternModel::new(PatternSize::new(7, 5)),
            CaptureSettings {
                target_samples: target,
                refine: RefineWindow::default(),
            },
            SamplingGate::new(Duration::from_secs(4)),
        )
    }

    #[test]
    fn test_ten_detections_reach_done() {
        let mut s = session(10, ScriptedDetector::always(), FakeSolver::converging(), 10);
        let mut signals = ScriptedSignals::captures(10);
        let mut display = RecordingDisplay::default();
        let t0 = Instant::now();

        for i in 0..10 {
            s.tick(t0 + Duration::from_millis(i * 100), &mut signals, &mut display);
        }

        assert_eq!(s.trail(), &[Phase::Collecting, Phase::Solving, Phase::Done]);
        assert_eq!(s.solver.seen.get(), Some((10, ImageSize::new(64, 48))));
        match s.state() {
            CaptureState::Done(artifact) => {
                assert_eq!(artifact.camera_matrix().shape(), (3, 3));
                assert!(!artifact.dist_coeffs().is_empty());
            }
            other => panic!("unexpected state {:?}", other.phase()),
        }
    }

    #[test]
    fn test_observations_match_pattern_length() {
        let mut s = session(3, ScriptedDetector::always(), FakeSolver::converging(), 5);
        let mut signals = ScriptedSignals::captures(3);
        let mut display = RecordingDisplay::default();
        let t0 = Instant::now();

        for i in 0..3 {
            s.tick(t0 + Duration::from_secs(i), &mut signals, &mut display);
        }

        assert_eq!(s.samples().len(), 3);
        for obs in s.samples().observations() {
            assert_eq!(obs.object_points().len(), 35);
            assert_eq!(obs.image_points().len(), 35);
            // refined points, not raw detections
            assert_eq!(obs.image_points()[0], Point2::new(0.25, 0.25));
        }
    }

    #[test]
    fn test_misses_are_discarded_and_solver_sees_exactly_n() {
        let detector = ScriptedDetector::scripted(&[false, true, false, false, true, true]);
        let mut s = session(100, detector, FakeSolver::converging(), 3);
        let mut signals = ScriptedSignals::captures(100);
        let mut display = RecordingDisplay::default();
        let t0 = Instant::now();

        let mut ticks = 0;
        while !s.state().is_terminal() {
            s.tick(t0 + Duration::from_secs(ticks), &mut signals, &mut display);
            ticks += 1;
        }

        assert_eq!(ticks, 6);
        assert_eq!(s.samples().len(), 3);
        assert_eq!(s.solver.seen.get().map(|(n, _)| n), Some(3));
        assert_eq!(s.state().phase(), Phase::Done);
    }

    #[test]
    fn test_exhausted_source_fails_before_target() {
        let s = session(4, ScriptedDetector::always(), FakeSolver::converging(), 10);
        let mut signals = ScriptedSignals::captures(10);
        let mut display = RecordingDisplay::default();

        let state = s.run(&mut signals, &mut display);

        assert!(matches!(state, CaptureState::Failed(SessionError::SourceExhausted)));
    }

    #[test]
    fn test_abort_ends_session_without_artifact() {
        let s = session(10, ScriptedDetector::always(), FakeSolver::converging(), 10);
        let mut signals = ScriptedSignals(
            vec![Some(Signal::Capture), None, Some(Signal::Abort), Some(Signal::Capture)].into(),
        );
        let mut display = RecordingDisplay::default();

        let state = s.run(&mut signals, &mut display);

        assert!(matches!(state, CaptureState::Aborted));
        assert_eq!(signals.0.len(), 1);
    }

    #[test]
    fn test_solver_failure_is_reported() {
        let s = session(10, ScriptedDetector::always(), FakeSolver::diverging(), 2);
        let mut signals = ScriptedSignals::captures(10);
        let mut display = RecordingDisplay::default();

        let state = s.run(&mut signals, &mut display);

        match state {
            CaptureState::Failed(SessionError::SolverDivergence(reason)) => {
                assert!(reason.contains("collinear"));
            }
            other => panic!("unexpected state {:?}", other.phase()),
        }
    }

    #[test]
    fn test_terminal_state_ignores_further_ticks() {
        let mut s = session(10, ScriptedDetector::always(), FakeSolver::converging(), 1);
        let mut signals = ScriptedSignals::captures(10);
        let mut display = RecordingDisplay::default();
        let t0 = Instant::now();

        s.tick(t0, &mut signals, &mut display);
        assert_eq!(s.state().phase(), Phase::Done);

        s.tick(t0 + Duration::from_secs(10), &mut signals, &mut display);
        assert_eq!(s.samples().len(), 1);
        assert_eq!(s.source.remaining, 9);
    }

    #[test]
    fn test_preview_is_throttled_and_reset_on_success() {
        let mut s = session(10, ScriptedDetector::always(), FakeSolver::converging(), 5);
        let mut signals = ScriptedSignals(
            vec![None, None, Some(Signal::Capture), None, None].into(),
        );
        let mut display = RecordingDisplay::default();
        let t0 = Instant::now();

        // t=0 accepted, t=1 rejected, t=2 capture (annotated frame shown),
        // t=5 rejected because the gate restarted at t=2, t=6 accepted
        for secs in [0, 1, 2, 5, 6] {
            s.tick(t0 + Duration::from_secs(secs), &mut signals, &mut display);
        }

        assert_eq!(display.shown.len(), 3);
        assert!(display.shown.iter().all(|w| w == PREVIEW_WINDOW));
    }

    #[test]
    fn test_exhaustion_before_target_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        let s = session(4, ScriptedDetector::always(), FakeSolver::converging(), 10);
        let mut signals = ScriptedSignals::captures(10);
        let mut display = RecordingDisplay::default();

        let result = capture_and_store(s, &mut signals, &mut display, &path);

        assert!(matches!(result, Err(SessionError::SourceExhausted)));
        assert!(!path.exists());
    }

    #[test]
    fn test_done_session_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        let s = session(10, ScriptedDetector::always(), FakeSolver::converging(), 3);
        let mut signals = ScriptedSignals::captures(10);
        let mut display = RecordingDisplay::default();

        let artifact = capture_and_store(s, &mut signals, &mut display, &path)
            .unwrap()
            .unwrap();

        let loaded = calibration::load(&path).unwrap();
        assert_eq!(loaded.camera_matrix(), artifact.camera_matrix());
    }

    #[test]
    fn test_abort_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        std::fs::write(&path, "previous").unwrap();
        let s = session(10, ScriptedDetector::always(), FakeSolver::converging(), 3);
        let mut signals = ScriptedSignals(vec![Some(Signal::Abort)].into());
        let mut display = RecordingDisplay::default();

        let result = capture_and_store(s, &mut signals, &mut display, &path).unwrap();

        assert!(result.is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous");
    }
}
