//! Accumulation of 3D/2D point correspondences across captured frames

use nalgebra::{Point2, Point3};
use thiserror::Error;

use crate::pattern::PatternModel;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleError {
    #[error("observation has {image} image points for {object} pattern points")]
    LengthMismatch { object: usize, image: usize },
    #[error("sample set already holds the target of {0} observations")]
    Full(usize),
}

/// One frame's matched pattern and image points, in pattern order
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
}

impl Observation {
    pub fn new(pattern: &PatternModel, image_points: Vec<Point2<f64>>) -> Result<Self, SampleError> {
        if image_points.len() != pattern.len() {
            return Err(SampleError::LengthMismatch {
                object: pattern.len(),
                image: image_points.len(),
            });
        }
        Ok(Self {
            object_points: pattern.points().to_vec(),
            image_points,
        })
    }

    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    pub fn image_points(&self) -> &[Point2<f64>] {
        &self.image_points
    }

    pub fn len(&self) -> usize {
        self.object_points.len()
    }
}

/// Append-only set of observations bounded by a target count
#[derive(Debug, Clone)]
pub struct SampleSet {
    target: usize,
    observations: Vec<Observation>,
}

impl SampleSet {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            observations: Vec::with_capacity(target),
        }
    }

    /// Append an observation, refusing to grow past the target
    pub fn push(&mut self, observation: Observation) -> Result<usize, SampleError> {
        if self.is_complete() {
            return Err(SampleError::Full(self.target));
        }
        self.observations.push(observation);
        Ok(self.observations.len())
    }

    pub fn is_complete(&self) -> bool {
        self.observations.len() >= self.target
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }
}
