//! Pinhole projection with Brown-Conrady lens distortion
//!
//! Coefficients follow the OpenCV layout `k1, k2, p1, p2[, k3[, k4, k5, k6]]`;
//! missing trailing terms are zero and anything past `k6` is ignored.

use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};

/// Distortion coefficients unpacked from an OpenCV-style vector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub k4: f64,
    pub k5: f64,
    pub k6: f64,
}

impl Distortion {
    pub fn from_coeffs(coeffs: &[f64]) -> Self {
        let at = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        Self {
            k1: at(0),
            k2: at(1),
            p1: at(2),
            p2: at(3),
            k3: at(4),
            k4: at(5),
            k5: at(6),
            k6: at(7),
        }
    }

    /// Five-term vector as produced by the solver
    pub fn to_coeffs5(&self) -> Vec<f64> {
        vec![self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    /// Apply distortion to an ideal normalized image point
    #[inline]
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6)
            / (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6);
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Invert [`Distortion::distort`] by fixed-point iteration
    pub fn undistort(&self, xd: f64, yd: f64) -> (f64, f64) {
        let (mut x, mut y) = (xd, yd);
        for _ in 0..10 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let icdist = (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6)
                / (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6);
            if !icdist.is_finite() || icdist <= 0.0 {
                return (xd, yd);
            }
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) * icdist;
            y = (yd - dy) * icdist;
        }
        (x, y)
    }
}

/// Pixel coordinates of a normalized point under camera matrix `k`
#[inline]
pub fn to_pixel(k: &Matrix3<f64>, x: f64, y: f64) -> Point2<f64> {
    Point2::new(
        k[(0, 0)] * x + k[(0, 1)] * y + k[(0, 2)],
        k[(1, 1)] * y + k[(1, 2)],
    )
}

/// Normalized coordinates of pixel `(u, v)` under camera matrix `k`
#[inline]
pub fn to_normalized(k: &Matrix3<f64>, u: f64, v: f64) -> (f64, f64) {
    let y = (v - k[(1, 2)]) / k[(1, 1)];
    let x = (u - k[(0, 2)] - k[(0, 1)] * y) / k[(0, 0)];
    (x, y)
}

/// Project a world point seen from pose `(rotation, translation)`.
///
/// Returns `None` for points behind or on the camera plane.
pub fn project(
    k: &Matrix3<f64>,
    distortion: &Distortion,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    point: &Point3<f64>,
) -> Option<Point2<f64>> {
    let pc = rotation * point.coords + translation;
    if pc.z <= 1e-12 {
        return None;
    }
    let (xd, yd) = distortion.distort(pc.x / pc.z, pc.y / pc.z);
    Some(to_pixel(k, xd, yd))
}
