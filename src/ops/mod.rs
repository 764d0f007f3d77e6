//! # Numeric Backend
//!
//! The [`Ops`] trait is everything the layer and its initializers need from a
//! numeric backend. Layers are generic over it; initializers take it as
//! `&mut dyn Ops`.
//!
//! ## Submodules
//!
//! - [`cpu`]: rayon-parallel CPU backend, the default
//! - [`mish`]: scalar Mish activation and derivative
//!
//! ## Extending the Backend
//!
//! A backend implements `gemm`, `gemm_into`, the elementwise Mish pair,
//! `dropout` and the random samplers. `affine`, `sum_rows` and `asarray`
//! have portable default implementations built on those.

pub mod cpu;
pub mod mish;

pub use cpu::CpuOps;

use crate::error::{Error, Result};
use crate::tensors::{Ten64, Tensor, TensorView, TensorViewMut};

/// Numeric primitives used by layers and initializers.
///
/// Shape errors are reported as [`Error::ShapeMismatch`] / [`Error::Rank`]
/// and never translated by callers.
pub trait Ops {
    /// Generalized matrix multiply `op(a) · op(b)`, where `op` transposes its
    /// operand when the matching flag is set.
    fn gemm(
        &self,
        a: TensorView<'_, f64>,
        b: TensorView<'_, f64>,
        trans1: bool,
        trans2: bool,
    ) -> Result<Ten64>;

    /// Like [`Ops::gemm`] but adds the product into `out` instead of
    /// returning it.
    fn gemm_into(
        &self,
        a: TensorView<'_, f64>,
        b: TensorView<'_, f64>,
        trans1: bool,
        trans2: bool,
        out: TensorViewMut<'_, f64>,
    ) -> Result<()>;

    /// Elementwise Mish.
    fn mish(&self, x: &Ten64) -> Ten64;

    /// Gradient through Mish: `dy * mish'(x)` where `x` is the pre-activation.
    fn backprop_mish(&self, dy: &Ten64, x: &Ten64) -> Result<Ten64>;

    /// Applies inverted dropout at `rate`, returning the masked values and
    /// the mask needed to route gradients back.
    fn dropout(&mut self, x: Ten64, rate: f64) -> Result<(Ten64, DropoutMask)>;

    /// Samples uniformly from `[low, high]`.
    fn uniform(&mut self, low: f64, high: f64, shape: &[usize]) -> Ten64;

    /// Samples from the standard normal distribution.
    fn standard_normal(&mut self, shape: &[usize]) -> Ten64;

    /// `y = x · wᵗ + b`, with `b` broadcast over rows.
    ///
    /// `w` is `(n_out, n_in)`, `b` is `(n_out,)`, `x` is `(batch, n_in)`.
    fn affine(
        &self,
        w: TensorView<'_, f64>,
        b: TensorView<'_, f64>,
        x: TensorView<'_, f64>,
    ) -> Result<Ten64> {
        let (n_out, _) = w.dims2("affine")?;
        if b.shape != [n_out] {
            return Err(Error::ShapeMismatch {
                op: "affine",
                lhs: w.shape.to_vec(),
                rhs: b.shape.to_vec(),
            });
        }
        let mut y = self.gemm(x, w, false, true)?;
        if n_out > 0 {
            for row in y.data.chunks_mut(n_out) {
                for (v, bias) in row.iter_mut().zip(b.data) {
                    *v += bias;
                }
            }
        }
        Ok(y)
    }

    /// Sums a `(rows, cols)` matrix over its rows, giving a `(cols,)` vector.
    fn sum_rows(&self, x: TensorView<'_, f64>) -> Result<Ten64> {
        let (_, cols) = x.dims2("sum_rows")?;
        let mut acc = vec![0.0; cols];
        if cols > 0 {
            for row in x.data.chunks(cols) {
                for (a, v) in acc.iter_mut().zip(row) {
                    *a += v;
                }
            }
        }
        Ok(Tensor::new(vec![cols], acc))
    }

    /// Copies raw data into a tensor of the given shape.
    fn asarray(&self, data: &[f64], shape: &[usize]) -> Result<Ten64> {
        Tensor::try_new(shape, data.to_vec())
    }
}

/// The mask produced by [`Ops::dropout`].
///
/// Holds the per-element factor applied on the forward pass: `0` where a unit
/// was dropped, `1 / (1 - rate)` where it was kept. An identity mask (rate of
/// zero) stores nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct DropoutMask {
    shape: Vec<usize>,
    factors: Option<Vec<f64>>,
}

impl DropoutMask {
    /// A mask that keeps every unit unscaled.
    pub fn identity(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            factors: None,
        }
    }

    /// A mask from explicit per-element factors.
    pub fn from_factors(shape: &[usize], factors: Vec<f64>) -> Result<Self> {
        if shape.iter().product::<usize>() != factors.len() {
            return Err(Error::ShapeMismatch {
                op: "dropout",
                lhs: shape.to_vec(),
                rhs: vec![factors.len()],
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            factors: Some(factors),
        })
    }

    /// Whether this mask leaves values untouched.
    pub fn is_identity(&self) -> bool {
        self.factors.is_none()
    }

    /// Per-element factors, or `None` for the identity mask.
    pub fn factors(&self) -> Option<&[f64]> {
        self.factors.as_deref()
    }

    /// Applies the mask to `x`.
    pub fn apply(&self, mut x: Ten64) -> Result<Ten64> {
        self.check(&x)?;
        if let Some(factors) = &self.factors {
            for (v, f) in x.data.iter_mut().zip(factors) {
                *v *= f;
            }
        }
        Ok(x)
    }

    /// Routes a gradient w.r.t. the dropped-out output back to the
    /// activation: dropped positions get zero, kept ones the forward scale.
    pub fn backward(&self, d_out: &Ten64) -> Result<Ten64> {
        self.apply(d_out.clone())
    }

    fn check(&self, x: &Ten64) -> Result<()> {
        if x.shape != self.shape {
            return Err(Error::ShapeMismatch {
                op: "dropout",
                lhs: self.shape.clone(),
                rhs: x.shape.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn affine_adds_bias_to_every_row() {
        let ops = CpuOps::seeded(0);
        let w = tensor!([[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let b = Tensor::new(vec![3], vec![0.5, -0.5, 1.0]);
        let x = Tensor::new(vec![2, 2], vec![2.0, 3.0, -1.0, 4.0]);

        let y = ops.affine(w.view(), b.view(), x.view()).unwrap();

        assert_eq!(y.shape, vec![2, 3]);
        assert_eq!(y.data, vec![2.5, 2.5, 6.0, -0.5, 3.5, 4.0]);
    }

    #[test]
    fn affine_rejects_bias_of_wrong_length() {
        let ops = CpuOps::seeded(0);
        let w = tensor!([[1.0, 0.0], [0.0, 1.0]]);
        let b = tensor!([0.5, 0.5, 1.0]);
        let x = tensor!([[2.0, 3.0]]);
        let err = ops.affine(w.view(), b.view(), x.view()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { op: "affine", .. }));
    }

    #[test]
    fn affine_rejects_input_width_mismatch() {
        let ops = CpuOps::seeded(0);
        let w = tensor!([[1.0, 0.0], [0.0, 1.0]]);
        let b = tensor!([0.0, 0.0]);
        let x = tensor!([[2.0, 3.0, 4.0]]);
        let err = ops.affine(w.view(), b.view(), x.view()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { op: "gemm", .. }));
    }

    #[test]
    fn sum_rows_collapses_batch_axis() {
        let ops = CpuOps::seeded(0);
        let x = tensor!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let s = ops.sum_rows(x.view()).unwrap();
        assert_eq!(s.shape, vec![3]);
        assert_eq!(s.data, vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn asarray_checks_the_shape() {
        let ops = CpuOps::seeded(0);
        let t = ops.asarray(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        assert_eq!(t, tensor!([[1.0, 2.0], [3.0, 4.0]]));
        assert!(ops.asarray(&[1.0, 2.0, 3.0], &[2, 2]).is_err());
    }

    #[test]
    fn dropout_mask_backward_zeroes_dropped_positions() {
        let mask = DropoutMask::from_factors(&[2, 2], vec![2.0, 0.0, 0.0, 2.0]).unwrap();
        let d = mask.backward(&tensor!([[1.0, 1.0], [3.0, 3.0]])).unwrap();
        assert_eq!(d.data, vec![2.0, 0.0, 0.0, 6.0]);
    }

    #[test]
    fn dropout_mask_rejects_other_shapes() {
        let mask = DropoutMask::identity(&[2, 2]);
        assert!(mask.backward(&tensor!([1.0, 2.0, 3.0, 4.0])).is_err());
    }
}
