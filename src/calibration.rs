//! Solved camera calibration and its on-disk JSON form
//!
//! The file holds two required fields, `camera_matrix` (3x3) and
//! `dist_coeff` (a single row of at least four coefficients, OpenCV order
//! `k1, k2, p1, p2[, k3]`). Image size and RMS reprojection error are written
//! for reference and ignored when missing.

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Minimum number of distortion coefficients accepted on load
pub const MIN_DIST_COEFFS: usize = 4;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("calibration file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("I/O error on calibration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid calibration file {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
}

/// Camera intrinsics and lens distortion produced by one successful solve
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationArtifact {
    camera_matrix: Matrix3<f64>,
    dist_coeffs: Vec<f64>,
    image_size: Option<(u32, u32)>,
    rms_error: Option<f64>,
}

impl CalibrationArtifact {
    pub fn new(camera_matrix: Matrix3<f64>, dist_coeffs: Vec<f64>) -> Self {
        Self {
            camera_matrix,
            dist_coeffs,
            image_size: None,
            rms_error: None,
        }
    }

    pub fn with_image_size(mut self, width: u32, height: u32) -> Self {
        self.image_size = Some((width, height));
        self
    }

    pub fn with_rms_error(mut self, rms: f64) -> Self {
        self.rms_error = Some(rms);
        self
    }

    pub fn camera_matrix(&self) -> &Matrix3<f64> {
        &self.camera_matrix
    }

    pub fn dist_coeffs(&self) -> &[f64] {
        &self.dist_coeffs
    }

    pub fn image_size(&self) -> Option<(u32, u32)> {
        self.image_size
    }

    pub fn rms_error(&self) -> Option<f64> {
        self.rms_error
    }
}

/// Distortion coefficients as stored: OpenCV writes a 1xK row, hand-written
/// files often use a flat list
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Coefficients {
    Flat(Vec<f64>),
    Rows(Vec<Vec<f64>>),
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactFile {
    camera_matrix: Vec<Vec<f64>>,
    dist_coeff: Coefficients,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_size: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rms_error: Option<f64>,
}

impl From<&CalibrationArtifact> for ArtifactFile {
    fn from(artifact: &CalibrationArtifact) -> Self {
        let k = &artifact.camera_matrix;
        Self {
            camera_matrix: (0..3)
                .map(|r| (0..3).map(|c| k[(r, c)]).collect())
                .collect(),
            dist_coeff: Coefficients::Rows(vec![artifact.dist_coeffs.clone()]),
            image_size: artifact.image_size.map(|(w, h)| [w, h]),
            rms_error: artifact.rms_error,
        }
    }
}

impl ArtifactFile {
    fn into_artifact(self) -> Result<CalibrationArtifact, String> {
        if self.camera_matrix.len() != 3 || self.camera_matrix.iter().any(|row| row.len() != 3) {
            return Err(format!(
                "camera_matrix must be 3x3, got {} rows",
                self.camera_matrix.len()
            ));
        }
        let camera_matrix = Matrix3::from_fn(|r, c| self.camera_matrix[r][c]);

        let dist_coeffs = match self.dist_coeff {
            Coefficients::Flat(values) => values,
            Coefficients::Rows(mut rows) => {
                if rows.len() != 1 {
                    return Err(format!(
                        "dist_coeff must be a single row, got {} rows",
                        rows.len()
                    ));
                }
                rows.remove(0)
            }
        };
        if dist_coeffs.len() < MIN_DIST_COEFFS {
            return Err(format!(
                "dist_coeff needs at least {} values, got {}",
                MIN_DIST_COEFFS,
                dist_coeffs.len()
            ));
        }

        let mut artifact = CalibrationArtifact::new(camera_matrix, dist_coeffs);
        artifact.image_size = self.image_size.map(|[w, h]| (w, h));
        artifact.rms_error = self.rms_error;
        Ok(artifact)
    }
}

/// Write the artifact to `path`, replacing any existing file.
///
/// Content goes to a hidden sibling file first and is renamed into place,
/// so readers never see a partially written calibration.
pub fn save(artifact: &CalibrationArtifact, path: &Path) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    let content = serde_json::to_string_pretty(&ArtifactFile::from(artifact))
        .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp_path = temp_path_for(path);
    let written = File::create(&tmp_path).and_then(|mut file| {
        file.write_all(content.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|_| fs::rename(&tmp_path, path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(e));
    }

    info!("Calibration parameters stored in: {}", path.display());
    Ok(())
}

/// Read an artifact previously written by [`save`]
pub fn load(path: &Path) -> Result<CalibrationArtifact, ArtifactError> {
    info!("Reading calibration parameters from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ArtifactError::NotFound(path.to_path_buf())
        } else {
            ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let parse_err = |reason: String| ArtifactError::Parse {
        path: path.to_path_buf(),
        reason,
    };

    let file: ArtifactFile = serde_json::from_str(&content).map_err(|e| parse_err(e.to_string()))?;
    file.into_artifact().map_err(parse_err)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "calibration".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}
