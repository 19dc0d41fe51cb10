//! Iterative sub-pixel corner refinement
//!
//! At a saddle point every image gradient in the neighbourhood is orthogonal
//! to the vector from the corner to the pixel it was taken at. Each
//! iteration solves the weighted least-squares system
//! `sum(g g^T) c = sum(g g^T p)` over the search window for the corner `c`.

use image::GrayImage;
use nalgebra::{Matrix2, Point2, Vector2};
use rayon::prelude::*;

use crate::vision::RefineWindow;

/// Refine every corner independently; corners whose estimate leaves the
/// search window keep their input position
pub fn refine_corners(gray: &GrayImage, corners: &[Point2<f64>], window: RefineWindow) -> Vec<Point2<f64>> {
    corners
        .par_iter()
        .map(|&c| refine_corner(gray, c, window))
        .collect()
}

fn refine_corner(gray: &GrayImage, start: Point2<f64>, window: RefineWindow) -> Point2<f64> {
    let half = window.half_size.max(1) as i32;
    let sigma2 = (half * half) as f64;
    let mut current = start;

    for _ in 0..window.max_iterations.max(1) {
        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();

        for dy in -half..=half {
            for dx in -half..=half {
                let px = current.x + dx as f64;
                let py = current.y + dy as f64;
                let gx = (sample(gray, px + 1.0, py) - sample(gray, px - 1.0, py)) * 0.5;
                let gy = (sample(gray, px, py + 1.0) - sample(gray, px, py - 1.0)) * 0.5;
                let weight = (-((dx * dx + dy * dy) as f64) / sigma2).exp();

                let gxx = gx * gx * weight;
                let gxy = gx * gy * weight;
                let gyy = gy * gy * weight;
                a[(0, 0)] += gxx;
                a[(0, 1)] += gxy;
                a[(1, 0)] += gxy;
                a[(1, 1)] += gyy;
                b[0] += gxx * px + gxy * py;
                b[1] += gxy * px + gyy * py;
            }
        }

        // Flat or edge-only neighbourhoods have no unique solution
        if a.determinant().abs() < 1e-9 {
            break;
        }
        let Some(a_inv) = a.try_inverse() else {
            break;
        };
        let next = a_inv * b;
        let next = Point2::new(next[0], next[1]);
        let step = (next - current).norm();
        current = next;
        if step <= window.epsilon {
            break;
        }
    }

    let drift = current - start;
    let limit = window.half_size as f64;
    if !current.x.is_finite() || !current.y.is_finite() || drift.x.abs() > limit || drift.y.abs() > limit {
        return start;
    }
    current
}

/// Bilinear intensity with coordinates clamped to the image
#[inline]
fn sample(gray: &GrayImage, x: f64, y: f64) -> f64 {
    let max_x = gray.width().saturating_sub(1) as f64;
    let max_y = gray.height().saturating_sub(1) as f64;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(max_x as u32);
    let y1 = (y0 + 1).min(max_y as u32);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p = |x, y| gray.get_pixel(x, y)[0] as f64;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// X-junction at `(cx, cy)`, antialiased by 8x8 supersampling
    fn saddle(width: u32, height: u32, cx: f64, cy: f64) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let mut dark = 0;
            for sy in 0..8 {
                for sx in 0..8 {
                    let u = x as f64 - 0.5 + (sx as f64 + 0.5) / 8.0;
                    let v = y as f64 - 0.5 + (sy as f64 + 0.5) / 8.0;
                    if (u - cx) * (v - cy) > 0.0 {
                        dark += 1;
                    }
                }
            }
            Luma([(255 - dark * 255 / 64) as u8])
        })
    }

    #[test]
    fn test_converges_to_saddle_point() {
        let gray = saddle(64, 64, 31.3, 28.6);
        let refined = refine_corners(&gray, &[Point2::new(33.0, 27.0)], RefineWindow::default());
        assert!((refined[0].x - 31.3).abs() < 0.1, "x = {}", refined[0].x);
        assert!((refined[0].y - 28.6).abs() < 0.1, "y = {}", refined[0].y);
    }

    #[test]
    fn test_flat_region_keeps_input() {
        let gray = GrayImage::from_pixel(40, 40, Luma([128]));
        let start = Point2::new(20.0, 20.0);
        let refined = refine_corners(&gray, &[start], RefineWindow::default());
        assert_eq!(refined[0], start);
    }

    #[test]
    fn test_refines_each_corner_in_order() {
        let gray = saddle(64, 64, 20.5, 40.25);
        let window = RefineWindow {
            half_size: 5,
            ..RefineWindow::default()
        };
        let refined = refine_corners(&gray, &[Point2::new(21.0, 40.0), Point2::new(20.0, 41.0)], window);
        assert_eq!(refined.len(), 2);
        for p in refined {
            assert!((p.x - 20.5).abs() < 0.1 && (p.y - 40.25).abs() < 0.1);
        }
    }
}
