// skelfuse_core/src/parameters.rs

use crate::error::ModelError;
use crate::math;
use nalgebra::{DMatrix, DVector};

/// A multivariate Gaussian belief over a block of articulation parameters:
/// expectation vector plus a symmetric PSD covariance of matching dimension.
///
/// Chain vectors are offset-concatenations of per-node blocks, so the only
/// structural operations needed are extracting and re-inserting a contiguous
/// sub-range. Cross-covariance between blocks is carried while a chain is
/// fused jointly and dropped again on scatter; per-node storage keeps
/// marginals only.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub expectation: DVector<f64>,
    pub variance: DMatrix<f64>,
}

impl Parameters {
    /// Zero-mean belief with identity covariance.
    pub fn zeros(size: usize) -> Self {
        Self {
            expectation: DVector::zeros(size),
            variance: DMatrix::identity(size, size),
        }
    }

    pub fn new(expectation: DVector<f64>, variance: DMatrix<f64>) -> Result<Self, ModelError> {
        if variance.nrows() != expectation.len() || variance.ncols() != expectation.len() {
            return Err(ModelError::DimensionMismatch {
                expected: expectation.len(),
                actual: variance.nrows(),
            });
        }
        Ok(Self {
            expectation,
            variance,
        })
    }

    /// Zero-mean belief with a scaled-identity covariance.
    pub fn isotropic(size: usize, variance: f64) -> Self {
        Self {
            expectation: DVector::zeros(size),
            variance: DMatrix::identity(size, size) * variance,
        }
    }

    pub fn size(&self) -> usize {
        self.expectation.len()
    }

    /// Extracts the belief over `[position, position + size)`. Off-diagonal
    /// covariance with the rest of the vector is discarded.
    pub fn substate(&self, position: usize, size: usize) -> Parameters {
        Parameters {
            expectation: self.expectation.rows(position, size).into_owned(),
            variance: self.variance.view((position, position), (size, size)).into_owned(),
        }
    }

    /// Writes `block` back over `[position, position + block.size())`,
    /// leaving cross-covariance entries untouched.
    pub fn insert_substate(&mut self, position: usize, block: &Parameters) {
        let size = block.size();
        self.expectation.rows_mut(position, size).copy_from(&block.expectation);
        self.variance
            .view_mut((position, position), (size, size))
            .copy_from(&block.variance);
    }

    /// Restores exact covariance symmetry after fusion arithmetic.
    pub fn symmetrize(&mut self) {
        math::symmetrize(&mut self.variance);
    }

    pub fn is_finite(&self) -> bool {
        self.expectation.iter().all(|x| x.is_finite()) && self.variance.iter().all(|x| x.is_finite())
    }
}
