//! Lens undistortion by inverse remapping
//!
//! Every output pixel of the rectified image is mapped back through the new
//! camera matrix, the distortion model and the original camera matrix to a
//! source position, which is sampled bilinearly. The per-pixel map depends
//! only on the calibration and the frame size, so it is built once and
//! reused for every following frame.

use image::RgbImage;
use nalgebra::Matrix3;
use rayon::prelude::*;
use tracing::debug;

use crate::camera_model::{to_normalized, to_pixel, Distortion};
use crate::vision::{Frame, ImageSize, Roi, Undistorter};

/// Grid used to probe the undistorted image boundary
const PROBE_STEPS: usize = 9;

/// Slack when snapping the valid region to whole pixels
const ROUNDING: f64 = 1e-6;

/// Map inputs a remap table was built for
#[derive(Debug, Clone, PartialEq)]
struct RemapKey {
    size: ImageSize,
    camera_matrix: Matrix3<f64>,
    dist_coeffs: Vec<f64>,
    new_camera_matrix: Matrix3<f64>,
}

#[derive(Debug)]
struct RemapTable {
    key: RemapKey,
    /// Source position per output pixel, row-major; NaN outside the source
    map: Vec<(f32, f32)>,
}

/// [`Undistorter`] with a cached remap table
#[derive(Debug, Default)]
pub struct RemapUndistorter {
    /// Free scaling: 0 keeps only valid pixels, 1 keeps every source pixel
    alpha: f64,
    table: Option<RemapTable>,
    builds: usize,
}

impl RemapUndistorter {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            table: None,
            builds: 0,
        }
    }

    fn table_for(&mut self, key: RemapKey) -> &RemapTable {
        if self.table.as_ref().is_some_and(|t| t.key != key) {
            self.table = None;
        }
        let builds = &mut self.builds;
        self.table.get_or_insert_with(|| {
            debug!(
                "Building undistortion map for {}x{}",
                key.size.width, key.size.height
            );
            *builds += 1;
            RemapTable {
                map: build_map(&key),
                key,
            }
        })
    }
}

impl Undistorter for RemapUndistorter {
    fn optimal_matrix(
        &self,
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64],
        image_size: ImageSize,
    ) -> (Matrix3<f64>, Roi) {
        optimal_new_camera_matrix(camera_matrix, dist_coeffs, image_size, self.alpha)
    }

    fn undistort(
        &mut self,
        frame: &Frame,
        camera_matrix: &Matrix3<f64>,
        dist_coeffs: &[f64],
        new_camera_matrix: &Matrix3<f64>,
    ) -> Frame {
        let key = RemapKey {
            size: ImageSize::of(frame),
            camera_matrix: *camera_matrix,
            dist_coeffs: dist_coeffs.to_vec(),
            new_camera_matrix: *new_camera_matrix,
        };
        let table = self.table_for(key);
        remap(frame, &table.map)
    }
}

fn build_map(key: &RemapKey) -> Vec<(f32, f32)> {
    let width = key.size.width as usize;
    let height = key.size.height as usize;
    let distortion = Distortion::from_coeffs(&key.dist_coeffs);
    let (max_x, max_y) = (width as f64 - 1.0, height as f64 - 1.0);

    let mut map = vec![(f32::NAN, f32::NAN); width * height];
    if width == 0 {
        return map;
    }
    map.par_chunks_mut(width).enumerate().for_each(|(v, row)| {
        for (u, out) in row.iter_mut().enumerate() {
            let (x, y) = to_normalized(&key.new_camera_matrix, u as f64, v as f64);
            let (xd, yd) = distortion.distort(x, y);
            let src = to_pixel(&key.camera_matrix, xd, yd);
            // Half a pixel of slack around the border, sampling clamps
            if src.x >= -0.5 && src.y >= -0.5 && src.x <= max_x + 0.5 && src.y <= max_y + 0.5 {
                *out = (src.x as f32, src.y as f32);
            }
        }
    });
    map
}

fn remap(frame: &RgbImage, map: &[(f32, f32)]) -> RgbImage {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = width * 3;

    let mut out = vec![0u8; stride * height];
    if width > 0 {
        out.par_chunks_mut(stride)
            .zip(map.par_chunks(width))
            .for_each(|(row, sources)| {
                for (pixel, &(sx, sy)) in row.chunks_exact_mut(3).zip(sources) {
                    if sx.is_nan() {
                        continue;
                    }
                    pixel.copy_from_slice(&bilinear_rgb(frame, sx, sy));
                }
            });
    }

    // Same dimensions as the input frame
    RgbImage::from_raw(frame.width(), frame.height(), out).unwrap_or_else(|| RgbImage::new(0, 0))
}

/// Bilinear RGB sample at a sub-pixel position, clamped to the frame
#[inline]
fn bilinear_rgb(frame: &RgbImage, x: f32, y: f32) -> [u8; 3] {
    let (max_x, max_y) = (frame.width() - 1, frame.height() - 1);
    let x = x.clamp(0.0, max_x as f32);
    let y = y.clamp(0.0, max_y as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = frame.get_pixel(x0, y0).0;
    let p10 = frame.get_pixel(x1, y0).0;
    let p01 = frame.get_pixel(x0, y1).0;
    let p11 = frame.get_pixel(x1, y1).0;

    let mut rgb = [0u8; 3];
    for (c, out) in rgb.iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *out = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    rgb
}

/// Normalised-coordinate rectangle
#[derive(Debug, Clone, Copy)]
struct Rect {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

/// Largest rectangle inside, and smallest rectangle around, the undistorted
/// image of the full frame (normalised coordinates)
fn undistorted_bounds(k: &Matrix3<f64>, distortion: &Distortion, size: ImageSize) -> (Rect, Rect) {
    let (w, h) = ((size.width as f64 - 1.0).max(0.0), (size.height as f64 - 1.0).max(0.0));
    let n = PROBE_STEPS;
    let mut inner = Rect {
        x0: f64::MIN,
        y0: f64::MIN,
        x1: f64::MAX,
        y1: f64::MAX,
    };
    let mut outer = Rect {
        x0: f64::MAX,
        y0: f64::MAX,
        x1: f64::MIN,
        y1: f64::MIN,
    };

    for j in 0..n {
        for i in 0..n {
            let u = w * i as f64 / (n - 1) as f64;
            let v = h * j as f64 / (n - 1) as f64;
            let (xd, yd) = to_normalized(k, u, v);
            let (x, y) = distortion.undistort(xd, yd);

            outer.x0 = outer.x0.min(x);
            outer.y0 = outer.y0.min(y);
            outer.x1 = outer.x1.max(x);
            outer.y1 = outer.y1.max(y);

            if i == 0 {
                inner.x0 = inner.x0.max(x);
            }
            if i == n - 1 {
                inner.x1 = inner.x1.min(x);
            }
            if j == 0 {
                inner.y0 = inner.y0.max(y);
            }
            if j == n - 1 {
                inner.y1 = inner.y1.min(y);
            }
        }
    }
    (inner, outer)
}

/// New camera matrix for the undistorted image and its valid-pixel region.
///
/// `alpha = 0` zooms in so that every output pixel is valid; `alpha = 1`
/// zooms out so that no source pixel is lost.
pub fn optimal_new_camera_matrix(
    camera_matrix: &Matrix3<f64>,
    dist_coeffs: &[f64],
    size: ImageSize,
    alpha: f64,
) -> (Matrix3<f64>, Roi) {
    let distortion = Distortion::from_coeffs(dist_coeffs);
    let (inner, outer) = undistorted_bounds(camera_matrix, &distortion, size);
    let (w, h) = ((size.width as f64 - 1.0).max(1.0), (size.height as f64 - 1.0).max(1.0));

    let fit = |r: &Rect| {
        let fx = w / (r.x1 - r.x0);
        let fy = h / (r.y1 - r.y0);
        (fx, fy, -fx * r.x0, -fy * r.y0)
    };
    let (fx0, fy0, cx0, cy0) = fit(&inner);
    let (fx1, fy1, cx1, cy1) = fit(&outer);
    let blend = |a: f64, b: f64| a * (1.0 - alpha) + b * alpha;

    let fx = blend(fx0, fx1);
    let fy = blend(fy0, fy1);
    let cx = blend(cx0, cx1);
    let cy = blend(cy0, cy1);
    let new_k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);

    if ![fx, fy, cx, cy].iter().all(|v| v.is_finite()) || inner.x1 <= inner.x0 || inner.y1 <= inner.y0 {
        return (*camera_matrix, Roi::default());
    }

    // Valid region: the inner rectangle seen through the new matrix
    let left = (fx * inner.x0 + cx - ROUNDING).ceil().max(0.0);
    let top = (fy * inner.y0 + cy - ROUNDING).ceil().max(0.0);
    let right = (fx * inner.x1 + cx + ROUNDING).floor().min(w);
    let bottom = (fy * inner.y1 + cy + ROUNDING).floor().min(h);

    let roi = if right >= left && bottom >= top {
        Roi {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32 + 1,
            height: (bottom - top) as u32 + 1,
        }
    } else {
        Roi::default()
    };
    (new_k, roi)
}
