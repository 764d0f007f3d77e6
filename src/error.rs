//! Crate-wide error type.
//!
//! Every fallible operation in the crate returns [`Result`]. Nothing here is
//! retried or recovered from internally; errors propagate to the caller as-is.

use briny::prelude::ValidationError;
use thiserror::Error;

/// Errors raised by the layer, its parameter store and the numeric backend.
#[derive(Debug, Error)]
pub enum Error {
    /// A component was configured with values it cannot work with.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operand shapes are incompatible for the requested operation.
    #[error("shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        /// The operation that rejected its operands.
        op: &'static str,
        /// Shape of the left-hand (or first) operand.
        lhs: Vec<usize>,
        /// Shape of the right-hand (or second) operand.
        rhs: Vec<usize>,
    },

    /// A tensor has the wrong number of dimensions.
    #[error("{op} expects a rank-{expected} tensor, got shape {shape:?}")]
    Rank {
        /// The operation that rejected its operand.
        op: &'static str,
        /// The rank the operation requires.
        expected: usize,
        /// The shape actually supplied.
        shape: Vec<usize>,
    },

    /// A parameter was requested before every dimension it depends on was known.
    #[error("cannot allocate `{param}`: dimension `{dim}` is unresolved")]
    UnresolvedDimension {
        /// The parameter whose shape could not be computed.
        param: &'static str,
        /// The first dimension found unset.
        dim: &'static str,
    },

    /// A resolved dimension was given a different value.
    #[error("dimension `{dim}` is already {current}, refusing to change it to {requested}")]
    DimensionConflict {
        /// Dimension name.
        dim: &'static str,
        /// The value fixed at first resolution.
        current: usize,
        /// The conflicting value.
        requested: usize,
    },

    /// A name that the layer never declared.
    #[error("`{0}` is not declared by this layer")]
    UnknownParameter(&'static str),

    /// Input data failed validation.
    #[error("invalid data: {0}")]
    InvalidData(#[from] ValidationError),

    /// A backward context was applied to a layer other than the one that produced it.
    #[error("backward context belongs to layer {expected}, not {found}")]
    LayerMismatch {
        /// Identity of the producing layer.
        expected: u64,
        /// Identity of the layer it was applied to.
        found: u64,
    },
}

/// Shorthand for results carrying [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
