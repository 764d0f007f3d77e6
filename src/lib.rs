//! mish_layer: a fully connected Mish layer with lazy parameter shapes.
//!
//! The layer computes `Y = mish(X · Wᵗ + b)`. Its input and output sizes may
//! be left open at construction and are filled in from the first batch of
//! data (and targets), at which point the weights are allocated and
//! initialized. Training runs a forward pass that returns a backward context;
//! the backward pass accumulates gradients and can step an optimizer.
//!
//! # Features
//!
//! - Declarative parameter store with lazy, contiguous allocation.
//! - Mish activation with an overflow-safe derivative.
//! - Inverted dropout whose mask is reused on the backward pass.
//! - Pluggable numeric backend ([`ops::Ops`]), rayon-parallel on the CPU.
//! - SGD and Adam optimizers, or any closure with the optimizer signature.
//!
//! # Modules
//!
//! - [`tensors`]: Owned tensors and borrowed views.
//! - [`ops`]: Numeric backend trait and the CPU backend.
//! - [`init`]: Weight initializers.
//! - [`params`]: Parameter schema, dimensions and memory.
//! - [`optim`]: Optimizers.
//! - [`layers`]: The Mish layer and its backward context.
//! - [`error`]: The crate's error type.
//!
//! # Example
//!
//! ```rust
//! use mish_layer::prelude::*;
//!
//! let mut layer = Mish::new(None, None).unwrap();
//! let x = Tensor::new(vec![2, 4], vec![0.1; 8]);
//! let labels = Tensor::new(vec![2], vec![0.0, 2.0]);
//!
//! // nI = 4 from X, nO = 3 from the largest label
//! layer.ensure_initialized(&x, Some(&labels)).unwrap();
//! assert_eq!(layer.predict(&x).unwrap().shape, vec![2, 3]);
//! ```

pub mod error;
pub mod init;
pub mod layers;
pub mod ops;
pub mod optim;
pub mod params;
pub mod tensors;

pub use error::{Error, Result};

/// The types most callers need.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::init::Initializer;
    pub use crate::layers::{Layer, LayerConfig, Mish, MishBackward, MishConfig};
    pub use crate::ops::{CpuOps, Ops};
    pub use crate::optim::{Adam, Optimizer, Sgd};
    pub use crate::params::LayerId;
    pub use crate::tensor;
    pub use crate::tensors::{Ten64, Tensor};
}
