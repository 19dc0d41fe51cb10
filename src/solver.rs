//! Planar intrinsic calibration (Zhang's method) with non-linear refinement
//!
//! 1. Per view, a Hartley-normalised DLT homography from board to image.
//! 2. Initial intrinsics: closed form from the homographies when there are
//!    at least three views, otherwise (or if that is degenerate) focal
//!    lengths with the principal point fixed at the image centre.
//! 3. Initial pose of every view from its homography.
//! 4. Levenberg-Marquardt over intrinsics, five distortion coefficients and
//!    all poses, minimising pixel reprojection error.

use nalgebra::{DMatrix, DVector, Matrix3, Point2, Rotation3, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::calibration::CalibrationArtifact;
use crate::camera_model::{project, Distortion};
use crate::samples::Observation;
use crate::vision::{CalibrationSolver, ImageSize, SolveError};

const INTRINSIC_PARAMS: usize = 9;
const POSE_PARAMS: usize = 6;

/// Options of the Levenberg-Marquardt refinement
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Stop when the relative cost decrease falls below this
    pub cost_tolerance: f64,
    /// Keep k3 at zero (the r^6 term tends to overfit narrow lenses)
    pub fix_k3: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-12,
            fix_k3: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ZhangSolver {
    options: SolverOptions,
}

impl ZhangSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl CalibrationSolver for ZhangSolver {
    fn solve(
        &self,
        observations: &[Observation],
        image_size: ImageSize,
    ) -> Result<CalibrationArtifact, SolveError> {
        if observations.is_empty() {
            return Err(SolveError::InsufficientViews { needed: 1, got: 0 });
        }
        for (i, obs) in observations.iter().enumerate() {
            if obs.object_points().len() != obs.image_points().len() || obs.len() < 4 {
                return Err(SolveError::MismatchedObservation(i));
            }
            if obs.object_points().iter().any(|p| p.z.abs() > 1e-9) {
                return Err(SolveError::Degenerate(format!(
                    "view {} has non-planar object points",
                    i
                )));
            }
        }

        let homographies = observations
            .iter()
            .enumerate()
            .map(|(i, obs)| {
                let board: Vec<Point2<f64>> = obs
                    .object_points()
                    .iter()
                    .map(|p| Point2::new(p.x, p.y))
                    .collect();
                estimate_homography(&board, obs.image_points())
                    .map_err(|e| SolveError::Degenerate(format!("view {}: {}", i, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let k0 = initial_intrinsics(&homographies, image_size)?;
        debug!("Initial camera matrix: {:?}", k0);

        let k0_inv = k0
            .try_inverse()
            .ok_or_else(|| SolveError::Degenerate("initial camera matrix is singular".into()))?;
        let poses: Vec<(Rotation3<f64>, Vector3<f64>)> = homographies
            .iter()
            .map(|h| pose_from_homography(&k0_inv, h))
            .collect();

        let mut params = DVector::zeros(INTRINSIC_PARAMS + POSE_PARAMS * observations.len());
        params[0] = k0[(0, 0)];
        params[1] = k0[(1, 1)];
        params[2] = k0[(0, 2)];
        params[3] = k0[(1, 2)];
        for (i, (r, t)) in poses.iter().enumerate() {
            let base = INTRINSIC_PARAMS + POSE_PARAMS * i;
            params.fixed_rows_mut::<3>(base).copy_from(&r.scaled_axis());
            params.fixed_rows_mut::<3>(base + 3).copy_from(t);
        }

        let problem = Reprojection {
            observations,
            fix_k3: self.options.fix_k3,
        };
        let (params, rms) = levenberg_marquardt(&problem, params, &self.options)?;

        let (fx, fy, cx, cy) = (params[0], params[1], params[2], params[3]);
        let distortion = problem.distortion(&params);
        let coeffs = distortion.to_coeffs5();

        let finite = params.iter().all(|v| v.is_finite()) && rms.is_finite();
        if !finite || fx <= 1e-9 || fy <= 1e-9 {
            return Err(SolveError::Degenerate(
                "refinement produced non-finite or non-positive focal length".into(),
            ));
        }

        let k = Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0);
        Ok(CalibrationArtifact::new(k, coeffs)
            .with_image_size(image_size.width, image_size.height)
            .with_rms_error(rms))
    }
}

/// Reprojection residuals for all views
struct Reprojection<'a> {
    observations: &'a [Observation],
    fix_k3: bool,
}

impl Reprojection<'_> {
    fn residual_count(&self) -> usize {
        self.observations.iter().map(|o| 2 * o.len()).sum()
    }

    fn camera(&self, params: &DVector<f64>) -> Matrix3<f64> {
        Matrix3::new(params[0], 0.0, params[2], 0.0, params[1], params[3], 0.0, 0.0, 1.0)
    }

    fn distortion(&self, params: &DVector<f64>) -> Distortion {
        Distortion {
            k1: params[4],
            k2: params[5],
            p1: params[6],
            p2: params[7],
            k3: if self.fix_k3 { 0.0 } else { params[8] },
            ..Distortion::default()
        }
    }

    fn pose(params: &DVector<f64>, view: usize) -> (Rotation3<f64>, Vector3<f64>) {
        let base = INTRINSIC_PARAMS + POSE_PARAMS * view;
        let rvec: Vector3<f64> = params.fixed_rows::<3>(base).into_owned();
        let t: Vector3<f64> = params.fixed_rows::<3>(base + 3).into_owned();
        (Rotation3::new(rvec), t)
    }

    /// Residuals of one view, or `None` if any point falls behind the camera
    fn view_residuals(&self, params: &DVector<f64>, view: usize) -> Option<Vec<f64>> {
        let k = self.camera(params);
        let d = self.distortion(params);
        let (r, t) = Self::pose(params, view);
        let obs = &self.observations[view];

        let mut out = Vec::with_capacity(2 * obs.len());
        for (p3, p2) in obs.object_points().iter().zip(obs.image_points()) {
            let proj = project(&k, &d, &r, &t, p3)?;
            out.push(proj.x - p2.x);
            out.push(proj.y - p2.y);
        }
        Some(out)
    }

    fn residuals(&self, params: &DVector<f64>) -> Option<DVector<f64>> {
        let per_view: Option<Vec<Vec<f64>>> = (0..self.observations.len())
            .into_par_iter()
            .map(|v| self.view_residuals(params, v))
            .collect();
        let flat: Vec<f64> = per_view?.into_iter().flatten().collect();
        Some(DVector::from_vec(flat))
    }

    /// Forward-difference Jacobian; each view only depends on the
    /// intrinsics and its own pose
    fn jacobian(&self, params: &DVector<f64>, residuals: &DVector<f64>) -> DMatrix<f64> {
        let n_params = params.len();
        let mut jac = DMatrix::zeros(self.residual_count(), n_params);

        let mut row = 0;
        for view in 0..self.observations.len() {
            let rows = 2 * self.observations[view].len();
            let base = residuals.rows(row, rows);
            let pose_base = INTRINSIC_PARAMS + POSE_PARAMS * view;
            let columns = (0..INTRINSIC_PARAMS).chain(pose_base..pose_base + POSE_PARAMS);

            for col in columns {
                if self.fix_k3 && col == 8 {
                    continue;
                }
                let step = 1e-6 * params[col].abs().max(1.0);
                let mut perturbed = params.clone();
                perturbed[col] += step;
                if let Some(shifted) = self.view_residuals(&perturbed, view) {
                    for (i, value) in shifted.iter().enumerate() {
                        jac[(row + i, col)] = (value - base[i]) / step;
                    }
                }
            }
            row += rows;
        }
        jac
    }
}

fn levenberg_marquardt(
    problem: &Reprojection<'_>,
    mut params: DVector<f64>,
    options: &SolverOptions,
) -> Result<(DVector<f64>, f64), SolveError> {
    let mut residuals = problem
        .residuals(&params)
        .ok_or_else(|| SolveError::Degenerate("initial poses place points behind the camera".into()))?;
    let mut cost = residuals.norm_squared();
    let mut lambda = 1e-3;

    for iteration in 0..options.max_iterations {
        let jac = problem.jacobian(&params, &residuals);
        let jt = jac.transpose();
        let jtj = &jt * &jac;
        let gradient = &jt * &residuals;

        let mut improved = false;
        while lambda < 1e16 {
            let mut damped = jtj.clone();
            for i in 0..damped.nrows() {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-9);
            }
            let Some(delta) = damped
                .clone()
                .cholesky()
                .map(|c| c.solve(&gradient))
                .or_else(|| damped.lu().solve(&gradient))
            else {
                lambda *= 10.0;
                continue;
            };

            let candidate = &params - &delta;
            match problem.residuals(&candidate) {
                Some(r) if r.norm_squared() < cost => {
                    let new_cost = r.norm_squared();
                    let relative = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
                    params = candidate;
                    residuals = r;
                    cost = new_cost;
                    lambda = (lambda / 10.0).max(1e-12);
                    improved = relative > options.cost_tolerance;
                    break;
                }
                _ => lambda *= 10.0,
            }
        }

        if !improved {
            debug!("Refinement stopped after {} iterations", iteration + 1);
            break;
        }
    }

    let count = (residuals.len() / 2).max(1);
    let rms = (cost / count as f64).sqrt();
    Ok((params, rms))
}

/// Board-to-image homography by normalised DLT
pub fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>, String> {
    if src.len() != dst.len() || src.len() < 4 {
        return Err("homography needs at least 4 paired points".into());
    }

    let (src_n, ts) = normalize_points(src)?;
    let (dst_n, td) = normalize_points(dst)?;

    // At least 9 rows so the thin SVD keeps the null-space vector
    let rows = (2 * src.len()).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (s, d)) in src_n.iter().zip(&dst_n).enumerate() {
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let vt = svd.v_t.ok_or("SVD failed while estimating homography")?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&i, &j| svd.singular_values[i].total_cmp(&svd.singular_values[j]));
    let smallest = order[0];
    let second = svd.singular_values[order[1]];
    let largest = svd.singular_values[order[order.len() - 1]];
    if largest <= 0.0 || second / largest < 1e-9 {
        return Err("image points are degenerate (collinear or coincident)".into());
    }

    let h = vt.row(smallest);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    let td_inv = td.try_inverse().ok_or("normalisation is singular")?;
    let mut hmat = td_inv * hn * ts;
    if hmat[(2, 2)].abs() > 1e-12 {
        hmat /= hmat[(2, 2)];
    }
    Ok(hmat)
}

/// Hartley normalisation: centroid at the origin, mean distance sqrt(2)
fn normalize_points(points: &[Point2<f64>]) -> Result<(Vec<Point2<f64>>, Matrix3<f64>), String> {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist <= 1e-12 || !mean_dist.is_finite() {
        return Err("points are coincident".into());
    }

    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * scale, (p.y - mean_y) * scale))
        .collect();
    let t = Matrix3::new(
        scale,
        0.0,
        -mean_x * scale,
        0.0,
        scale,
        -mean_y * scale,
        0.0,
        0.0,
        1.0,
    );
    Ok((normalized, t))
}

fn initial_intrinsics(
    homographies: &[Matrix3<f64>],
    image_size: ImageSize,
) -> Result<Matrix3<f64>, SolveError> {
    if homographies.len() >= 3 {
        match closed_form_intrinsics(homographies) {
            Some(k) if plausible(&k, image_size) => return Ok(k),
            _ => debug!("Closed-form intrinsics unusable, fixing principal point at centre"),
        }
    }
    centred_intrinsics(homographies, image_size)
        .ok_or_else(|| SolveError::Degenerate("cannot initialise focal length".into()))
}

fn plausible(k: &Matrix3<f64>, size: ImageSize) -> bool {
    let (w, h) = (size.width as f64, size.height as f64);
    k.iter().all(|v| v.is_finite())
        && k[(0, 0)] > 0.0
        && k[(1, 1)] > 0.0
        && (0.0..=w).contains(&k[(0, 2)])
        && (0.0..=h).contains(&k[(1, 2)])
}

/// Zhang's closed-form solution through the image of the absolute conic
fn closed_form_intrinsics(homographies: &[Matrix3<f64>]) -> Option<Matrix3<f64>> {
    let mut v = DMatrix::<f64>::zeros(2 * homographies.len(), 6);
    for (i, h) in homographies.iter().enumerate() {
        let v12 = v_ij(h, 0, 1);
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        for j in 0..6 {
            v[(2 * i, j)] = v12[j];
            v[(2 * i + 1, j)] = v11[j] - v22[j];
        }
    }

    let svd = v.svd(false, true);
    let vt = svd.v_t?;
    let smallest = (0..svd.singular_values.len())
        .min_by(|&i, &j| svd.singular_values[i].total_cmp(&svd.singular_values[j]))?;
    let b = vt.row(smallest);

    // The null vector's sign is arbitrary; B must be positive definite
    let sign = if b[0] < 0.0 { -1.0 } else { 1.0 };
    let (b11, b12, b22, b13, b23, b33) = (
        sign * b[0],
        sign * b[1],
        sign * b[2],
        sign * b[3],
        sign * b[4],
        sign * b[5],
    );

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-18 || b11.abs() < 1e-18 {
        return None;
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda <= 0.0 || denom <= 0.0 {
        return None;
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    // Skew is not modelled by the refinement
    Some(Matrix3::new(alpha, 0.0, u0, 0.0, beta, v0, 0.0, 0.0, 1.0))
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    [
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    ]
}

/// Focal lengths from orthogonality of vanishing points, principal point at
/// the image centre. Works from a single view.
fn centred_intrinsics(homographies: &[Matrix3<f64>], size: ImageSize) -> Option<Matrix3<f64>> {
    let cx = (size.width as f64 - 1.0) * 0.5;
    let cy = (size.height as f64 - 1.0) * 0.5;
    let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);

    let mut a = DMatrix::<f64>::zeros(2 * homographies.len(), 2);
    let mut b = DVector::<f64>::zeros(2 * homographies.len());
    for (i, h) in homographies.iter().enumerate() {
        let hc = shift * h;
        let h1 = hc.column(0).into_owned();
        let h2 = hc.column(1).into_owned();
        let (n1, n2) = (h1.norm(), h2.norm());
        if n1 < 1e-12 || n2 < 1e-12 {
            return None;
        }
        let (h1, h2) = (h1 / n1, h2 / n2);
        let d1 = (h1 + h2) * 0.5;
        let d2 = (h1 - h2) * 0.5;

        a[(2 * i, 0)] = h1[0] * h2[0];
        a[(2 * i, 1)] = h1[1] * h2[1];
        b[2 * i] = -h1[2] * h2[2];
        a[(2 * i + 1, 0)] = d1[0] * d2[0];
        a[(2 * i + 1, 1)] = d1[1] * d2[1];
        b[2 * i + 1] = -d1[2] * d2[2];
    }

    let f = a.svd(true, true).solve(&b, 1e-15).ok()?;
    let (inv_fx2, inv_fy2) = (f[0].abs(), f[1].abs());
    if inv_fx2 < 1e-18 || inv_fy2 < 1e-18 {
        return None;
    }
    let fx = (1.0 / inv_fx2).sqrt();
    let fy = (1.0 / inv_fy2).sqrt();
    Some(Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0))
}

/// Board pose from `H ~ K [r1 r2 t]`, placing the board in front of the camera
fn pose_from_homography(k_inv: &Matrix3<f64>, h: &Matrix3<f64>) -> (Rotation3<f64>, Vector3<f64>) {
    let r1_raw = k_inv * h.column(0);
    let r2_raw = k_inv * h.column(1);
    let t_raw = k_inv * h.column(2);

    let mut scale = 1.0 / r1_raw.norm().max(1e-18);
    if t_raw.z < 0.0 {
        scale = -scale;
    }
    let r1 = r1_raw * scale;
    let r2 = r2_raw * scale;
    let r3 = r1.cross(&r2);
    let t = t_raw * scale;

    let m = Matrix3::from_columns(&[r1, r2, r3]);
    let rotation = Rotation3::from_matrix(&m);
    (rotation, t)
}
