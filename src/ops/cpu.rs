//! Parallel CPU backend.
//!
//! # CPU Backend
//!
//! The default [`Ops`] implementation. Matrix products are parallelised over
//! output rows and elementwise ops over elements with
//! [`rayon`](https://docs.rs/rayon); sampling is sequential so seeded runs are
//! reproducible.
//!
//! ## Implemented Ops
//!
//! - `gemm` / `gemm_into`: matrix multiplication with optional transposes
//! - `mish` / `backprop_mish`: Mish activation with forward and backward pass
//! - `dropout`: inverted dropout with a reusable mask
//! - `uniform` / `standard_normal`: random sampling for initializers

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

use super::mish::{mish, mish_grad};
use super::{DropoutMask, Ops};
use crate::error::{Error, Result};
use crate::tensors::{Ten64, Tensor, TensorView, TensorViewMut};

/// CPU backend owning the random generator used for dropout and initializers.
#[derive(Debug, Clone)]
pub struct CpuOps {
    rng: StdRng,
}

impl Default for CpuOps {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuOps {
    /// A backend seeded from OS entropy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// A backend with a fixed seed; identical seeds give identical samples.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

/// Operand layout of one `gemm` call after applying the transpose flags.
struct GemmPlan {
    m: usize,
    k: usize,
    n: usize,
    a_cols: usize,
    b_cols: usize,
}

fn plan(
    a: &TensorView<'_, f64>,
    b: &TensorView<'_, f64>,
    trans1: bool,
    trans2: bool,
) -> Result<GemmPlan> {
    let (a_rows, a_cols) = a.dims2("gemm")?;
    let (b_rows, b_cols) = b.dims2("gemm")?;
    let (m, k) = if trans1 {
        (a_cols, a_rows)
    } else {
        (a_rows, a_cols)
    };
    let (k2, n) = if trans2 {
        (b_cols, b_rows)
    } else {
        (b_rows, b_cols)
    };
    if k != k2 {
        return Err(Error::ShapeMismatch {
            op: "gemm",
            lhs: a.shape.to_vec(),
            rhs: b.shape.to_vec(),
        });
    }
    Ok(GemmPlan {
        m,
        k,
        n,
        a_cols,
        b_cols,
    })
}

/// Accumulates `op(a) · op(b)` into `out`, one output row per rayon task.
fn gemm_kernel(a: &[f64], b: &[f64], p: &GemmPlan, trans1: bool, trans2: bool, out: &mut [f64]) {
    if p.m == 0 || p.n == 0 {
        return;
    }
    out.par_chunks_mut(p.n).enumerate().for_each(|(i, row)| {
        for (j, cell) in row.iter_mut().enumerate() {
            let mut sum = 0.0;
            for l in 0..p.k {
                let av = if trans1 {
                    a[l * p.a_cols + i]
                } else {
                    a[i * p.a_cols + l]
                };
                let bv = if trans2 {
                    b[j * p.b_cols + l]
                } else {
                    b[l * p.b_cols + j]
                };
                sum += av * bv;
            }
            *cell += sum;
        }
    });
}

impl Ops for CpuOps {
    fn gemm(
        &self,
        a: TensorView<'_, f64>,
        b: TensorView<'_, f64>,
        trans1: bool,
        trans2: bool,
    ) -> Result<Ten64> {
        let p = plan(&a, &b, trans1, trans2)?;
        let mut out = vec![0.0; p.m * p.n];
        gemm_kernel(a.data, b.data, &p, trans1, trans2, &mut out);
        Ok(Tensor::new(vec![p.m, p.n], out))
    }

    fn gemm_into(
        &self,
        a: TensorView<'_, f64>,
        b: TensorView<'_, f64>,
        trans1: bool,
        trans2: bool,
        out: TensorViewMut<'_, f64>,
    ) -> Result<()> {
        let p = plan(&a, &b, trans1, trans2)?;
        if out.shape != [p.m, p.n] {
            return Err(Error::ShapeMismatch {
                op: "gemm",
                lhs: vec![p.m, p.n],
                rhs: out.shape.to_vec(),
            });
        }
        gemm_kernel(a.data, b.data, &p, trans1, trans2, out.data);
        Ok(())
    }

    fn mish(&self, x: &Ten64) -> Ten64 {
        let data = x.data.par_iter().map(|&v| mish(v)).collect();
        Tensor::new(x.shape.clone(), data)
    }

    fn backprop_mish(&self, dy: &Ten64, x: &Ten64) -> Result<Ten64> {
        if dy.shape != x.shape {
            return Err(Error::ShapeMismatch {
                op: "backprop_mish",
                lhs: dy.shape.clone(),
                rhs: x.shape.clone(),
            });
        }
        let data = dy
            .data
            .par_iter()
            .zip(x.data.par_iter())
            .map(|(&g, &v)| g * mish_grad(v))
            .collect();
        Ok(Tensor::new(x.shape.clone(), data))
    }

    fn dropout(&mut self, x: Ten64, rate: f64) -> Result<(Ten64, DropoutMask)> {
        if rate.is_nan() || rate < 0.0 {
            return Err(Error::Config(format!(
                "dropout rate must be a non-negative number, got {rate}"
            )));
        }
        if rate == 0.0 {
            let mask = DropoutMask::identity(&x.shape);
            return Ok((x, mask));
        }

        let factors: Vec<f64> = if rate >= 1.0 {
            vec![0.0; x.len()]
        } else {
            let scale = 1.0 / (1.0 - rate);
            (0..x.len())
                .map(|_| {
                    if self.rng.random::<f64>() >= rate {
                        scale
                    } else {
                        0.0
                    }
                })
                .collect()
        };

        let mask = DropoutMask::from_factors(&x.shape, factors)?;
        let y = mask.apply(x)?;
        Ok((y, mask))
    }

    fn uniform(&mut self, low: f64, high: f64, shape: &[usize]) -> Ten64 {
        let len = shape.iter().product::<usize>();
        let data = (0..len).map(|_| self.rng.random_range(low..=high)).collect();
        Tensor::new(shape, data)
    }

    fn standard_normal(&mut self, shape: &[usize]) -> Ten64 {
        let len = shape.iter().product::<usize>();
        let data = (0..len)
            .map(|_| self.rng.sample::<f64, _>(StandardNormal))
            .collect();
        Tensor::new(shape, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn gemm_forward_produces_correct_values() {
        let ops = CpuOps::seeded(1);
        let a = tensor!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let b = tensor!([[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]]);

        let c = ops.gemm(a.view(), b.view(), false, false).unwrap();

        assert_eq!(c.shape, vec![2, 2]);
        assert_eq!(c.data, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn gemm_honours_transpose_flags() {
        let ops = CpuOps::seeded(1);
        let a = tensor!([[1.0, 2.0], [3.0, 4.0]]);
        let b = tensor!([[5.0, 6.0], [7.0, 8.0]]);

        // aᵗ · b
        let c = ops.gemm(a.view(), b.view(), true, false).unwrap();
        assert_eq!(c.data, vec![26.0, 30.0, 38.0, 44.0]);

        // a · bᵗ
        let c = ops.gemm(a.view(), b.view(), false, true).unwrap();
        assert_eq!(c.data, vec![17.0, 23.0, 39.0, 53.0]);
    }

    #[test]
    fn gemm_into_accumulates() {
        let ops = CpuOps::seeded(1);
        let a = tensor!([[1.0, 2.0], [3.0, 4.0]]);
        let eye = tensor!([[1.0, 0.0], [0.0, 1.0]]);
        let mut out = tensor!([[10.0, 10.0], [10.0, 10.0]]);

        ops.gemm_into(a.view(), eye.view(), false, false, out.view_mut())
            .unwrap();
        ops.gemm_into(a.view(), eye.view(), false, false, out.view_mut())
            .unwrap();

        assert_eq!(out.data, vec![12.0, 14.0, 16.0, 18.0]);
    }

    #[test]
    fn gemm_rejects_inner_dimension_mismatch() {
        let ops = CpuOps::seeded(1);
        let a = tensor!([[1.0, 2.0, 3.0]]);
        let b = tensor!([[1.0, 2.0], [3.0, 4.0]]);
        let err = ops.gemm(a.view(), b.view(), false, false).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { op: "gemm", .. }));
    }

    #[test]
    fn dropout_zero_rate_is_identity() {
        let mut ops = CpuOps::seeded(3);
        let x = tensor!([[1.0, 2.0], [3.0, 4.0]]);
        let (y, mask) = ops.dropout(x.clone(), 0.0).unwrap();
        assert_eq!(y, x);
        assert!(mask.is_identity());
    }

    #[test]
    fn dropout_full_rate_drops_everything() {
        let mut ops = CpuOps::seeded(3);
        let x = tensor!([[1.0, 2.0], [3.0, 4.0]]);
        let (y, _) = ops.dropout(x, 1.0).unwrap();
        assert!(y.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn dropout_scales_kept_units() {
        let mut ops = CpuOps::seeded(7);
        let x = Tensor::new(vec![1, 4000], vec![1.0; 4000]);
        let (y, mask) = ops.dropout(x, 0.25).unwrap();

        let kept = y.data.iter().filter(|&&v| v != 0.0).count();
        let scaled = |v: f64| v == 0.0 || (v - 1.0 / 0.75).abs() < 1e-12;
        assert!(y.data.iter().all(|&v| scaled(v)));
        let keep_ratio = kept as f64 / 4000.0;
        assert!((keep_ratio - 0.75).abs() < 0.05, "keep ratio {keep_ratio}");
        assert_eq!(mask.factors().unwrap().len(), 4000);
    }

    #[test]
    fn dropout_rejects_negative_rate() {
        let mut ops = CpuOps::seeded(3);
        let x = tensor!([1.0, 2.0]);
        assert!(matches!(ops.dropout(x, -0.1), Err(Error::Config(_))));
    }

    #[test]
    fn seeded_backends_sample_identically() {
        let mut a = CpuOps::seeded(42);
        let mut b = CpuOps::seeded(42);
        assert_eq!(a.standard_normal(&[3, 3]), b.standard_normal(&[3, 3]));
        assert_eq!(a.uniform(-1.0, 1.0, &[5]), b.uniform(-1.0, 1.0, &[5]));
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let mut ops = CpuOps::seeded(9);
        let t = ops.uniform(-0.5, 0.5, &[10, 10]);
        assert!(t.data.iter().all(|v| (-0.5..=0.5).contains(v)));
    }
}
