//! Weight initializers.
//!
//! Every initializer fills a freshly allocated tensor in place and leaves a
//! tensor that already holds a non-zero entry untouched, so running one twice
//! is harmless.

use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::ops::Ops;
use crate::tensors::Ten64;

/// Signature shared by all initializers.
pub type InitFn = fn(&mut Ten64, &mut dyn Ops) -> Result<()>;

/// The initializer attached to a declared parameter.
#[derive(Debug, Clone, Copy, Default)]
pub enum Initializer {
    /// Leave the zero-filled allocation as is.
    #[default]
    Zeros,
    /// See [`lecun_uniform_init`].
    LecunUniform,
    /// See [`svd_orthonormal_init`].
    SvdOrthonormal,
    /// Any function with the initializer signature.
    Custom(InitFn),
}

impl Initializer {
    /// Runs the initializer on `tensor`.
    pub fn apply(self, tensor: &mut Ten64, ops: &mut dyn Ops) -> Result<()> {
        match self {
            Self::Zeros => Ok(()),
            Self::LecunUniform => lecun_uniform_init(tensor, ops),
            Self::SvdOrthonormal => svd_orthonormal_init(tensor, ops),
            Self::Custom(f) => f(tensor, ops),
        }
    }
}

/// Adds `U(-s, s)` noise with `s = sqrt(3 / shape[0])`.
pub fn lecun_uniform_init(w: &mut Ten64, ops: &mut dyn Ops) -> Result<()> {
    if w.any_nonzero() || w.is_empty() {
        return Ok(());
    }
    let Some(&fan) = w.shape.first() else {
        return Err(Error::Rank {
            op: "lecun_uniform_init",
            expected: 1,
            shape: w.shape.clone(),
        });
    };
    let scale = (3.0 / fan as f64).sqrt();
    let noise = ops.uniform(-scale, scale, &w.shape);
    for (v, n) in w.data.iter_mut().zip(noise.data) {
        *v += n;
    }
    Ok(())
}

/// Adds an orthonormal matrix taken from the SVD of a standard-normal draw.
///
/// The tensor is viewed as `(shape[0], product of the remaining dims)`. The
/// thin SVD factor of that shape (left if it fits, right otherwise) is
/// reshaped back and added in.
///
/// # Errors
/// [`Error::Config`] if the tensor has fewer than two dimensions.
pub fn svd_orthonormal_init(w: &mut Ten64, ops: &mut dyn Ops) -> Result<()> {
    if w.any_nonzero() {
        return Ok(());
    }
    if w.rank() < 2 {
        return Err(Error::Config(format!(
            "orthonormal init needs at least 2 dimensions, got shape {:?}",
            w.shape
        )));
    }
    if w.is_empty() {
        return Ok(());
    }

    let rows = w.shape[0];
    let cols: usize = w.shape[1..].iter().product();
    let draw = ops.standard_normal(&[rows, cols]);
    let draw = DMatrix::from_row_slice(rows, cols, &draw.data);
    let svd = draw.svd(true, true);

    let q = match (svd.u, svd.v_t) {
        (Some(u), _) if u.shape() == (rows, cols) => u,
        (_, Some(v_t)) if v_t.shape() == (rows, cols) => v_t,
        _ => {
            return Err(Error::Config(format!(
                "no orthonormal factor of shape ({rows}, {cols})"
            )));
        }
    };

    for r in 0..rows {
        for c in 0..cols {
            w.data[r * cols + c] += q[(r, c)];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::CpuOps;
    use crate::tensors::Tensor;
    use approx::assert_abs_diff_eq;

    /// `a · aᵗ` for a row-major `(rows, cols)` slice.
    fn gram_rows(data: &[f64], rows: usize, cols: usize) -> Vec<f64> {
        let mut g = vec![0.0; rows * rows];
        for i in 0..rows {
            for j in 0..rows {
                g[i * rows + j] = (0..cols)
                    .map(|k| data[i * cols + k] * data[j * cols + k])
                    .sum();
            }
        }
        g
    }

    fn assert_identity(g: &[f64], n: usize) {
        for i in 0..n {
            for j in 0..n {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(g[i * n + j], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn lecun_uniform_respects_scale() {
        let mut ops = CpuOps::seeded(11);
        let mut w: Ten64 = Tensor::zeros(vec![12, 5]);
        lecun_uniform_init(&mut w, &mut ops).unwrap();

        let scale = (3.0f64 / 12.0).sqrt();
        assert!(w.any_nonzero());
        assert!(w.data.iter().all(|v| v.abs() <= scale));
    }

    #[test]
    fn svd_orthonormal_wide_matrix_has_orthonormal_rows() {
        let mut ops = CpuOps::seeded(5);
        let mut w: Ten64 = Tensor::zeros(vec![3, 4]);
        svd_orthonormal_init(&mut w, &mut ops).unwrap();
        assert_identity(&gram_rows(&w.data, 3, 4), 3);
    }

    #[test]
    fn svd_orthonormal_tall_matrix_has_orthonormal_columns() {
        let mut ops = CpuOps::seeded(5);
        let mut w: Ten64 = Tensor::zeros(vec![5, 2]);
        svd_orthonormal_init(&mut w, &mut ops).unwrap();

        // transpose, then the rows of wᵗ are w's columns
        let mut t = vec![0.0; 10];
        for r in 0..5 {
            for c in 0..2 {
                t[c * 5 + r] = w.data[r * 2 + c];
            }
        }
        assert_identity(&gram_rows(&t, 2, 5), 2);
    }

    #[test]
    fn svd_orthonormal_flattens_higher_rank() {
        let mut ops = CpuOps::seeded(8);
        let mut w: Ten64 = Tensor::zeros(vec![2, 2, 3]);
        svd_orthonormal_init(&mut w, &mut ops).unwrap();
        assert_eq!(w.shape, vec![2, 2, 3]);
        assert_identity(&gram_rows(&w.data, 2, 6), 2);
    }

    #[test]
    fn svd_orthonormal_rejects_vectors() {
        let mut ops = CpuOps::seeded(0);
        let mut b: Ten64 = Tensor::zeros(vec![4]);
        assert!(matches!(
            svd_orthonormal_init(&mut b, &mut ops),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn initializers_leave_nonzero_tensors_alone() {
        let mut ops = CpuOps::seeded(0);
        let mut w = Tensor::new(vec![2, 2], vec![0.0, 0.25, 0.0, 0.0]);
        let before = w.clone();

        svd_orthonormal_init(&mut w, &mut ops).unwrap();
        assert_eq!(w, before);
        lecun_uniform_init(&mut w, &mut ops).unwrap();
        assert_eq!(w, before);
    }

    #[test]
    fn custom_initializer_runs() {
        fn fill_ones(t: &mut Ten64, _: &mut dyn Ops) -> Result<()> {
            t.data.iter_mut().for_each(|v| *v = 1.0);
            Ok(())
        }
        let mut ops = CpuOps::seeded(0);
        let mut t: Ten64 = Tensor::zeros(vec![3]);
        let init = Initializer::Custom(fill_ones);
        init.apply(&mut t, &mut ops).unwrap();
        assert_eq!(t.data, vec![1.0; 3]);
    }
}
