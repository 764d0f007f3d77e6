//! Core tensor data structures.
//!
//! # Tensors and Views
//!
//! A [`Tensor`] is an owned, row-major N-dimensional array. Layer parameters
//! do not live in `Tensor`s: they live in one contiguous memory block owned
//! by the parameter store, and are handed out as borrowed [`TensorView`] /
//! [`TensorViewMut`] slices over that block. Every numeric op takes views, so
//! owned tensors and parameter slices go through the same code.
//!
//! ## Design Highlights
//! - `shape` is a `Vec<usize>` checked at runtime
//! - `Ten64` is the element type used throughout the layer
//! - The `tensor!` macro builds tensors from nested literals
//!
//! ## Limitations
//! - Row-major only
//! - No broadcasting or slicing
//!
//! ## Example
//!
//! ```rust
//! use mish_layer::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape, vec![2, 3]);
//! ```

use crate::error::{Error, Result};

/// Represents an N-dimensional tensor with a shape and flat row-major data.
///
/// - `shape` defines the structure, e.g., `[2, 3]` for a 2×3 matrix.
/// - `data` holds the flattened content in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

/// The `f64` tensor used by the layer and its backend.
pub type Ten64 = Tensor<f64>;

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    /// Fallible form of [`Tensor::new`].
    pub fn try_new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        if shape.iter().product::<usize>() != data.len() {
            return Err(Error::ShapeMismatch {
                op: "tensor",
                lhs: shape,
                rhs: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrows the tensor as a view.
    pub fn view(&self) -> TensorView<'_, T> {
        TensorView {
            shape: &self.shape,
            data: &self.data,
        }
    }

    /// Borrows the tensor as a mutable view.
    pub fn view_mut(&mut self) -> TensorViewMut<'_, T> {
        TensorViewMut {
            shape: &self.shape,
            data: &mut self.data,
        }
    }
}

impl<T: Clone + Default> Tensor<T> {
    /// A tensor of the given shape filled with `T::default()`.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![T::default(); len],
        }
    }
}

impl Ten64 {
    /// Whether any element is non-zero.
    pub fn any_nonzero(&self) -> bool {
        self.data.iter().any(|&x| x != 0.0)
    }

    /// `(rows, cols)` of a rank-2 tensor.
    pub fn dims2(&self, op: &'static str) -> Result<(usize, usize)> {
        self.view().dims2(op)
    }
}

/// A borrowed tensor: a shape over a data slice.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a, T> {
    pub shape: &'a [usize],
    pub data: &'a [T],
}

impl<T> TensorView<'_, T> {
    /// `(rows, cols)` of a rank-2 view, or [`Error::Rank`].
    pub fn dims2(&self, op: &'static str) -> Result<(usize, usize)> {
        match *self.shape {
            [rows, cols] => Ok((rows, cols)),
            _ => Err(Error::Rank {
                op,
                expected: 2,
                shape: self.shape.to_vec(),
            }),
        }
    }

    /// Copies the view into an owned tensor.
    pub fn to_tensor(&self) -> Tensor<T>
    where
        T: Clone,
    {
        Tensor {
            shape: self.shape.to_vec(),
            data: self.data.to_vec(),
        }
    }
}

/// A mutably borrowed tensor.
#[derive(Debug)]
pub struct TensorViewMut<'a, T> {
    pub shape: &'a [usize],
    pub data: &'a mut [T],
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use mish_layer::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = &children[0].shape;
        assert!(
            children.iter().all(|c| c.shape == *first_shape),
            "ragged tensor literal (rows have mismatched shapes)"
        );
        let mut shape = vec![children.len()];
        shape.extend_from_slice(first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children {
            data.extend(c.data);
        }
        $crate::tensors::Tensor::new(shape, data)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_new_rejects_mismatched_data() {
        let t = Tensor::try_new(vec![2, 2], vec![1.0, 2.0, 3.0]);
        assert!(matches!(t, Err(Error::ShapeMismatch { op: "tensor", .. })));
    }

    #[test]
    fn dims2_requires_matrix() {
        let v: Ten64 = Tensor::new(vec![3], vec![0.0; 3]);
        assert!(matches!(v.dims2("test"), Err(Error::Rank { expected: 2, .. })));
        let m: Ten64 = Tensor::zeros(vec![2, 5]);
        assert_eq!(m.dims2("test").unwrap(), (2, 5));
    }

    #[test]
    fn any_nonzero_detects_single_entry() {
        let mut t: Ten64 = Tensor::zeros(vec![2, 2]);
        assert!(!t.any_nonzero());
        t.data[3] = -0.5;
        assert!(t.any_nonzero());
    }
}
