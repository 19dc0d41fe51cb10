//! Chessboard inner-corner detection
//!
//! Corners are X-junction candidates from the ChESS response (16 samples on
//! a circle around each pixel), thinned by non-maximum suppression. The grid
//! is then grown outwards from a strong seed, predicting every neighbour
//! from the local lattice vectors. A detection is only reported when the
//! grown lattice is exactly the requested pattern.

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut};
use nalgebra::{Point2, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

use crate::corner_refine::refine_corners;
use crate::pattern::PatternSize;
use crate::vision::{CornerDetector, RefineWindow};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Sampling ring radius; 5 for sharp images, up to 10 for heavy blur
    pub radius: u32,
    /// Candidates must exceed this fraction of the strongest response
    pub threshold_rel: f32,
    /// Strongest candidates kept for grid growth
    pub max_candidates: usize,
    /// Strongest candidates tried as grid seeds
    pub max_seeds: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            radius: 5,
            threshold_rel: 0.015,
            max_candidates: 600,
            max_seeds: 25,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChessboardDetector {
    params: DetectorParams,
}

impl ChessboardDetector {
    pub fn new(params: DetectorParams) -> Self {
        Self { params }
    }
}

impl CornerDetector for ChessboardDetector {
    fn detect(&self, gray: &GrayImage, pattern: PatternSize) -> Option<Vec<Point2<f64>>> {
        if pattern.cols < 2 || pattern.rows < 2 {
            return None;
        }

        let response = chess_response(gray, self.params.radius);
        let candidates = find_candidates(&response, &self.params);
        trace!("{} corner candidates", candidates.len());
        if candidates.len() < pattern.count() {
            return None;
        }

        let points: Vec<Point2<f64>> = candidates.iter().map(|c| c.position).collect();
        candidates
            .iter()
            .take(self.params.max_seeds)
            .enumerate()
            .find_map(|(seed, _)| grow_grid(&points, seed, pattern))
    }

    fn refine(&self, gray: &GrayImage, corners: &[Point2<f64>], window: RefineWindow) -> Vec<Point2<f64>> {
        refine_corners(gray, corners, window)
    }
}

/// Dense response map, row-major
struct Response {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Response {
    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    position: Point2<f64>,
    strength: f32,
}

/// The 16 ring offsets, counter-clockwise from +x
fn ring_offsets(radius: u32) -> [(i32, i32); 16] {
    let r = radius as f64;
    let mut ring = [(0, 0); 16];
    for (k, offset) in ring.iter_mut().enumerate() {
        let angle = k as f64 * std::f64::consts::TAU / 16.0;
        *offset = ((r * angle.cos()).round() as i32, (r * angle.sin()).round() as i32);
    }
    ring
}

/// `R = SR - DR - 16 * MR`: sum response minus diff response minus
/// the ring-to-centre mean difference
fn chess_response(gray: &GrayImage, radius: u32) -> Response {
    let width = gray.width() as usize;
    let height = gray.height() as usize;
    let r = radius as usize;
    let ring = ring_offsets(radius);
    let raw = gray.as_raw();

    let mut data = vec![0.0f32; width * height];
    if width <= 2 * r || height <= 2 * r {
        return Response { width, height, data };
    }

    data.par_chunks_mut(width)
        .enumerate()
        .skip(r)
        .take(height - 2 * r)
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate().skip(r).take(width - 2 * r) {
                let px = |dx: i32, dy: i32| {
                    let idx = (y as i32 + dy) as usize * width + (x as i32 + dx) as usize;
                    raw[idx] as f32
                };

                let mut s = [0.0f32; 16];
                for (k, &(dx, dy)) in ring.iter().enumerate() {
                    s[k] = px(dx, dy);
                }

                let sum_response: f32 = (0..4)
                    .map(|n| ((s[n] + s[n + 8]) - (s[n + 4] + s[n + 12])).abs())
                    .sum();
                let diff_response: f32 = (0..8).map(|n| (s[n] - s[n + 8]).abs()).sum();
                let ring_mean = s.iter().sum::<f32>() / 16.0;
                let local_mean = (px(0, 0) + px(1, 0) + px(-1, 0) + px(0, 1) + px(0, -1)) / 5.0;
                let mean_response = (ring_mean - local_mean).abs();

                *out = sum_response - diff_response - 16.0 * mean_response;
            }
        });

    Response { width, height, data }
}

/// Local maxima above the relative threshold, strongest first
fn find_candidates(response: &Response, params: &DetectorParams) -> Vec<Candidate> {
    let max = response.data.iter().copied().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Vec::new();
    }
    let threshold = max * params.threshold_rel;
    let nms = params.radius.max(1) as usize;
    let (w, h) = (response.width, response.height);

    let mut candidates: Vec<Candidate> = (nms..h.saturating_sub(nms))
        .into_par_iter()
        .flat_map_iter(|y| {
            (nms..w.saturating_sub(nms)).filter_map(move |x| {
                let v = response.at(x, y);
                if v <= threshold {
                    return None;
                }
                for ny in y - nms..=y + nms {
                    for nx in x - nms..=x + nms {
                        if (nx, ny) == (x, y) {
                            continue;
                        }
                        let other = response.at(nx, ny);
                        // Ties go to the first pixel in raster order
                        let earlier = (ny, nx) < (y, x);
                        if other > v || (earlier && other == v) {
                            return None;
                        }
                    }
                }
                Some(Candidate {
                    position: Point2::new(x as f64, y as f64),
                    strength: v,
                })
            })
        })
        .collect();

    candidates.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    candidates.truncate(params.max_candidates);
    candidates
}

/// Lattice node: candidate index and local lattice vectors
#[derive(Debug, Clone, Copy)]
struct Node {
    index: usize,
    u: Vector2<f64>,
    v: Vector2<f64>,
}

fn nearest(points: &[Point2<f64>], target: Point2<f64>, radius: f64, used: &[bool]) -> Option<usize> {
    points
        .iter()
        .enumerate()
        .filter(|(i, _)| !used[*i])
        .map(|(i, p)| (i, (p - target).norm()))
        .filter(|(_, d)| *d <= radius)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// Two roughly orthogonal lattice vectors at `seed` from its nearest neighbours
fn seed_axes(points: &[Point2<f64>], seed: usize) -> Option<(Vector2<f64>, Vector2<f64>)> {
    let origin = points[seed];
    let mut neighbours: Vec<Vector2<f64>> = points
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != seed)
        .map(|(_, p)| p - origin)
        .collect();
    neighbours.sort_by(|a, b| a.norm().total_cmp(&b.norm()));

    let u = *neighbours.first()?;
    let step = u.norm();
    if step < 1.0 {
        return None;
    }

    let v = neighbours
        .iter()
        .skip(1)
        .take(8)
        .filter(|n| n.norm() < 1.6 * step && n.norm() > 0.6 * step)
        .map(|n| (n, (n.dot(&u) / (n.norm() * step)).abs()))
        .filter(|(_, cos)| *cos < 0.5)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(n, _)| *n)?;

    Some((u, v))
}

/// Grow a lattice from `seed`; `Some` only for a complete `pattern` grid,
/// returned row-major in canonical orientation
fn grow_grid(points: &[Point2<f64>], seed: usize, pattern: PatternSize) -> Option<Vec<Point2<f64>>> {
    let (u0, v0) = seed_axes(points, seed)?;

    let mut used = vec![false; points.len()];
    let mut grid: HashMap<(i32, i32), Node> = HashMap::new();
    let mut queue = VecDeque::new();

    used[seed] = true;
    grid.insert((0, 0), Node { index: seed, u: u0, v: v0 });
    queue.push_back((0, 0));

    let limit = pattern.cols.max(pattern.rows) as i32;

    while let Some((i, j)) = queue.pop_front() {
        let node = grid[&(i, j)];
        let origin = points[node.index];
        let steps = [
            ((i + 1, j), node.u, true),
            ((i - 1, j), -node.u, true),
            ((i, j + 1), node.v, false),
            ((i, j - 1), -node.v, false),
        ];

        for (key, delta, along_u) in steps {
            if grid.contains_key(&key) {
                continue;
            }
            let tolerance = 0.35 * node.u.norm().min(node.v.norm());
            let Some(found) = nearest(points, origin + delta, tolerance, &used) else {
                continue;
            };

            let measured = points[found] - origin;
            let (u, v) = if along_u {
                (measured * delta.dot(&node.u).signum(), node.v)
            } else {
                (node.u, measured * delta.dot(&node.v).signum())
            };
            used[found] = true;
            grid.insert(key, Node { index: found, u, v });
            queue.push_back(key);

            if grid.len() > pattern.count() {
                return None;
            }
        }
    }

    if grid.len() != pattern.count() {
        return None;
    }

    let (min_i, max_i) = span(grid.keys().map(|k| k.0));
    let (min_j, max_j) = span(grid.keys().map(|k| k.1));
    let (span_i, span_j) = (max_i - min_i + 1, max_j - min_j + 1);
    if span_i > limit || span_j > limit {
        return None;
    }

    let at = |i: i32, j: i32| grid.get(&(i + min_i, j + min_j)).map(|n| points[n.index]);
    let (cols, rows) = (pattern.cols as i32, pattern.rows as i32);

    let mut ordered = Vec::with_capacity(pattern.count());
    if span_i == cols && span_j == rows {
        for j in 0..rows {
            for i in 0..cols {
                ordered.push(at(i, j)?);
            }
        }
    } else if span_i == rows && span_j == cols {
        for i in 0..rows {
            for j in 0..cols {
                ordered.push(at(i, j)?);
            }
        }
    } else {
        return None;
    }

    Some(canonical_order(ordered, pattern))
}

fn span(values: impl Iterator<Item = i32>) -> (i32, i32) {
    values.fold((i32::MAX, i32::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

/// Choose among the orientations that keep rows as rows: the lattice is
/// made right-handed in image coordinates (x right, y down) and, of the two
/// remaining candidates, the one starting nearest the top-left corner wins.
fn canonical_order(points: Vec<Point2<f64>>, pattern: PatternSize) -> Vec<Point2<f64>> {
    let (cols, rows) = (pattern.cols, pattern.rows);
    let remap = |flip_i: bool, flip_j: bool| -> Vec<Point2<f64>> {
        let mut out = Vec::with_capacity(points.len());
        for j in 0..rows {
            for i in 0..cols {
                let si = if flip_i { cols - 1 - i } else { i };
                let sj = if flip_j { rows - 1 - j } else { j };
                out.push(points[sj * cols + si]);
            }
        }
        out
    };

    let u = points[cols - 1] - points[0];
    let v = points[(rows - 1) * cols] - points[0];
    let right_handed = u.x * v.y - u.y * v.x > 0.0;

    let (a, b) = if right_handed {
        (remap(false, false), remap(true, true))
    } else {
        (remap(true, false), remap(false, true))
    };
    let score = |p: &[Point2<f64>]| p[0].x + p[0].y;
    if score(&a) <= score(&b) {
        a
    } else {
        b
    }
}

/// Row colours cycled over the drawn grid
const ROW_COLOURS: [Rgb<u8>; 6] = [
    Rgb([255, 0, 0]),
    Rgb([255, 128, 0]),
    Rgb([200, 200, 0]),
    Rgb([0, 255, 0]),
    Rgb([0, 200, 255]),
    Rgb([160, 0, 255]),
];

/// Overlay detected corners: a circle per corner and a polyline through
/// them in pattern order, coloured per row
pub fn draw_corners(frame: &mut RgbImage, size: PatternSize, corners: &[Point2<f64>]) {
    let cols = size.cols.max(1);
    let radius = 5;

    for (k, corner) in corners.iter().enumerate() {
        let colour = ROW_COLOURS[(k / cols) % ROW_COLOURS.len()];
        draw_hollow_circle_mut(
            frame,
            (corner.x.round() as i32, corner.y.round() as i32),
            radius,
            colour,
        );
        if let Some(next) = corners.get(k + 1) {
            draw_line_segment_mut(
                frame,
                (corner.x as f32, corner.y as f32),
                (next.x as f32, next.y as f32),
                colour,
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// Board with `pattern` inner corners, `square` pixels per square,
    /// rotated by `angle` around `centre`, white margin, 4x4 supersampled
    pub(crate) fn render_board(
        width: u32,
        height: u32,
        pattern: PatternSize,
        square: f64,
        centre: (f64, f64),
        angle: f64,
    ) -> GrayImage {
        let squares_x = pattern.cols as f64 + 1.0;
        let squares_y = pattern.rows as f64 + 1.0;
        let (sin, cos) = angle.sin_cos();

        GrayImage::from_fn(width, height, |x, y| {
            let mut dark = 0u32;
            for sy in 0..4 {
                for sx in 0..4 {
                    let px = x as f64 - 0.375 + sx as f64 * 0.25 - centre.0;
                    let py = y as f64 - 0.375 + sy as f64 * 0.25 - centre.1;
                    let bx = (cos * px + sin * py) / square + squares_x / 2.0;
                    let by = (-sin * px + cos * py) / square + squares_y / 2.0;
                    if bx >= 0.0 && by >= 0.0 && bx < squares_x && by < squares_y {
                        let parity = (bx.floor() as i64 + by.floor() as i64) % 2;
                        if parity == 0 {
                            dark += 1;
                        }
                    }
                }
            }
            Luma([(255 - dark * 255 / 16) as u8])
        })
    }

    /// True inner corner positions of [`render_board`]
    pub(crate) fn board_corners(
        pattern: PatternSize,
        square: f64,
        centre: (f64, f64),
        angle: f64,
    ) -> Vec<Point2<f64>> {
        let (sin, cos) = angle.sin_cos();
        let mut out = Vec::new();
        for j in 1..=pattern.rows {
            for i in 1..=pattern.cols {
                let bx = (i as f64 - (pattern.cols as f64 + 1.0) / 2.0) * square;
                let by = (j as f64 - (pattern.rows as f64 + 1.0) / 2.0) * square;
                out.push(Point2::new(
                    centre.0 + cos * bx - sin * by,
                    centre.1 + sin * bx + cos * by,
                ));
            }
        }
        out
    }

    fn assert_matches_truth(found: &[Point2<f64>], truth: &[Point2<f64>], tolerance: f64) {
        assert_eq!(found.len(), truth.len());
        for p in found {
            let best = truth
                .iter()
                .map(|t| (t - p).norm())
                .fold(f64::INFINITY, f64::min);
            assert!(best < tolerance, "corner {:?} is {} px from any true corner", p, best);
        }
    }

    #[test]
    fn test_detects_axis_aligned_board_in_row_major_order() {
        let pattern = PatternSize::new(7, 5);
        let gray = render_board(400, 320, pattern, 30.0, (200.0, 160.0), 0.0);

        let corners = ChessboardDetector::default().detect(&gray, pattern).unwrap();

        assert_eq!(corners.len(), 35);
        let truth = board_corners(pattern, 30.0, (200.0, 160.0), 0.0);
        assert_matches_truth(&corners, &truth, 1.5);

        // First corner top-left, rows run along +x
        assert!((corners[0] - truth[0]).norm() < 1.5);
        let along_row = corners[1] - corners[0];
        let down = corners[7] - corners[0];
        assert!(along_row.x > 25.0 && along_row.y.abs() < 3.0);
        assert!(down.y > 25.0 && down.x.abs() < 3.0);
    }

    #[test]
    fn test_detects_rotated_board() {
        let pattern = PatternSize::new(7, 5);
        let angle = 20f64.to_radians();
        let gray = render_board(400, 320, pattern, 28.0, (200.0, 160.0), angle);

        let corners = ChessboardDetector::default().detect(&gray, pattern).unwrap();
        let truth = board_corners(pattern, 28.0, (200.0, 160.0), angle);
        assert_matches_truth(&corners, &truth, 1.5);
    }

    #[test]
    fn test_detects_portrait_board() {
        // 5 wide and 7 tall in the image, still reported as 7 per row
        let gray = render_board(320, 400, PatternSize::new(5, 7), 30.0, (160.0, 200.0), 0.0);
        let corners = ChessboardDetector::default()
            .detect(&gray, PatternSize::new(7, 5))
            .unwrap();

        assert_eq!(corners.len(), 35);
        let along_row = corners[1] - corners[0];
        assert!((along_row.norm() - 30.0).abs() < 2.0);
    }

    #[test]
    fn test_blank_image_has_no_board() {
        let gray = GrayImage::from_pixel(320, 240, Luma([200]));
        assert!(ChessboardDetector::default()
            .detect(&gray, PatternSize::new(7, 5))
            .is_none());
    }

    #[test]
    fn test_wrong_pattern_size_is_not_reported() {
        let gray = render_board(400, 320, PatternSize::new(7, 5), 30.0, (200.0, 160.0), 0.0);
        assert!(ChessboardDetector::default()
            .detect(&gray, PatternSize::new(6, 5))
            .is_none());
    }

    #[test]
    fn test_refine_moves_corners_to_subpixel_positions() {
        let pattern = PatternSize::new(7, 5);
        let centre = (200.3, 160.6);
        let gray = render_board(400, 320, pattern, 30.0, centre, 0.0);
        let detector = ChessboardDetector::default();

        let coarse = detector.detect(&gray, pattern).unwrap();
        let window = RefineWindow {
            half_size: 5,
            ..RefineWindow::default()
        };
        let refined = detector.refine(&gray, &coarse, window);

        let truth = board_corners(pattern, 30.0, centre, 0.0);
        assert_matches_truth(&refined, &truth, 0.15);
    }

    #[test]
    fn test_draw_corners_marks_the_frame() {
        let mut frame = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        let corners = vec![Point2::new(20.0, 20.0), Point2::new(60.0, 20.0)];

        draw_corners(&mut frame, PatternSize::new(2, 1), &corners);

        assert_eq!(*frame.get_pixel(40, 20), ROW_COLOURS[0]);
        assert_eq!(*frame.get_pixel(25, 20), ROW_COLOURS[0]);
        assert_eq!(*frame.get_pixel(90, 90), Rgb([0, 0, 0]));
    }
}
