//! Planar calibration target model

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Number of inner corners of the chessboard along each axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSize {
    pub cols: usize,
    pub rows: usize,
}

impl PatternSize {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self { cols, rows }
    }

    /// Total number of inner corners
    pub fn count(&self) -> usize {
        self.cols * self.rows
    }
}

impl Default for PatternSize {
    fn default() -> Self {
        Self::new(7, 5)
    }
}

/// Fixed 3D coordinates of every inner corner of the target.
///
/// Points lie on the `z = 0` plane and are ordered row by row, `x` varying
/// fastest. Detected image corners are reported in the same order.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternModel {
    size: PatternSize,
    points: Vec<Point3<f64>>,
}

impl PatternModel {
    /// Build the model with a unit spacing between corners
    #[cfg(test)]
    pub fn new(size: PatternSize) -> Self {
        Self::with_square_size(size, 1.0)
    }

    /// Build the model with `square_size` world units between neighbouring corners
    pub fn with_square_size(size: PatternSize, square_size: f64) -> Self {
        let mut points = Vec::with_capacity(size.count());
        for y in 0..size.rows {
            for x in 0..size.cols {
                points.push(Point3::new(
                    x as f64 * square_size,
                    y as f64 * square_size,
                    0.0,
                ));
            }
        }
        Self { size, points }
    }

    pub fn size(&self) -> PatternSize {
        self.size
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}
