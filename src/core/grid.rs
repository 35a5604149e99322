use super::errors::{ModelError, ModelResult};
use super::types::{GridSpec, ParameterSet};

/// Strictly increasing experience points for one spouse.
#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    points: Vec<f64>,
}

impl Axis {
    pub fn new(spec: &GridSpec, spouse: usize) -> ModelResult<Self> {
        if spec.n_k < 2 || !(spec.k_max > spec.k_min) || spec.k_min < 0.0 {
            return Err(ModelError::DegenerateGrid {
                spouse,
                reason: "need n_k >= 2 and 0 <= k_min < k_max",
            });
        }
        let span = spec.k_max - spec.k_min;
        let last = (spec.n_k - 1) as f64;
        let mut points: Vec<f64> = (0..spec.n_k)
            .map(|i| spec.k_min + span * (i as f64 / last).powf(spec.phi))
            .collect();
        // Pin the end points so clamping lands exactly on the bounds.
        points[0] = spec.k_min;
        points[spec.n_k - 1] = spec.k_max;
        if points.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(ModelError::DegenerateGrid {
                spouse,
                reason: "points are not strictly increasing",
            });
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[f64] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn min(&self) -> f64 {
        self.points[0]
    }

    pub fn max(&self) -> f64 {
        self.points[self.points.len() - 1]
    }

    /// Index `i` of the cell `[x_i, x_{i+1}]` holding `x` once clamped to the axis range.
    pub fn bracket(&self, x: f64) -> usize {
        let n = self.points.len();
        if x <= self.points[0] {
            return 0;
        }
        if x >= self.points[n - 1] {
            return n - 2;
        }
        // First index with point > x, minus one.
        let upper = self.points.partition_point(|&p| p <= x);
        (upper - 1).min(n - 2)
    }
}

/// Tensor grid over `(K1, K2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub k1: Axis,
    pub k2: Axis,
}

impl Grid {
    pub fn new(params: &ParameterSet) -> ModelResult<Self> {
        Ok(Self {
            k1: Axis::new(&params.grid1, 1)?,
            k2: Axis::new(&params.grid2, 2)?,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.k1.len(), self.k2.len())
    }

    pub fn node_count(&self) -> usize {
        self.k1.len() * self.k2.len()
    }

    /// Row-major flat index to `(i, j)`.
    pub fn unflatten(&self, idx: usize) -> (usize, usize) {
        (idx / self.k2.len(), idx % self.k2.len())
    }

    pub fn node(&self, i: usize, j: usize) -> (f64, f64) {
        (self.k1.points()[i], self.k2.points()[j])
    }
}
