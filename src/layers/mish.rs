//! # Mish Feed-Forward Layer
//!
//! `Y = mish(X · Wᵗ + b)`, optionally followed by inverted dropout while
//! training.
//!
//! | name  | kind      | shape      | init               |
//! |-------|-----------|------------|--------------------|
//! | `nB`  | dimension |            | batch size, never enforced |
//! | `nI`  | dimension |            | from `X.shape[1]`  |
//! | `nO`  | dimension |            | from the targets   |
//! | `W`   | parameter | `(nO, nI)` | SVD-orthonormal    |
//! | `b`   | parameter | `(nO,)`    | zeros              |
//! | `d_W` | gradient  | `(nO, nI)` |                    |
//! | `d_b` | gradient  | `(nO,)`    |                    |
//!
//! Parameters are allocated the first time every dimension is known, which
//! is usually the first call to [`Mish::predict`] or [`Mish::begin_update`].
//!
//! ## Example
//!
//! ```rust
//! use mish_layer::prelude::*;
//!
//! let mut layer = Mish::with_config(Some(3), Some(4), MishConfig::default().seed(7)).unwrap();
//! let x = Tensor::new(vec![2, 4], vec![0.5; 8]);
//!
//! let (y, bp) = layer.begin_update(&x, Some(0.0)).unwrap();
//! assert_eq!(y.shape, vec![2, 3]);
//!
//! let d_y = Tensor::new(vec![2, 3], vec![1.0; 6]);
//! let d_x = bp.unwrap().backward(&mut layer, &d_y, None).unwrap();
//! assert_eq!(d_x.shape, vec![2, 4]);
//! ```

use briny::prelude::{TrustedData, Validate, ValidationError};
use tracing::{debug, trace};

use super::{Layer, LayerConfig};
use crate::error::{Error, Result};
use crate::init::Initializer;
use crate::ops::{CpuOps, DropoutMask, Ops};
use crate::optim::Optimizer;
use crate::params::{LayerId, ParamStore, Schema};
use crate::tensors::{Ten64, TensorView};

/// Settings for a [`Mish`] layer.
#[derive(Debug, Clone)]
pub struct MishConfig {
    /// Multiplies the `drop` rate passed to [`Mish::begin_update`].
    pub drop_factor: f64,
    /// Initializer for `W`.
    pub weight_init: Initializer,
    /// Name and seed.
    pub base: LayerConfig,
}

impl Default for MishConfig {
    fn default() -> Self {
        Self {
            drop_factor: 1.0,
            weight_init: Initializer::SvdOrthonormal,
            base: LayerConfig::default(),
        }
    }
}

impl MishConfig {
    /// Scales every dropout rate passed to [`Mish::begin_update`].
    #[must_use]
    pub fn drop_factor(mut self, factor: f64) -> Self {
        self.drop_factor = factor;
        self
    }

    /// Initializer for `W`; `b` always starts at zero.
    #[must_use]
    pub fn weight_init(mut self, init: Initializer) -> Self {
        self.weight_init = init;
        self
    }

    /// Layer name; defaults to `"mish"`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.base = self.base.named(name);
        self
    }

    /// Seeds the CPU backend used for initialization and dropout.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.base = self.base.seeded(seed);
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.drop_factor.is_finite() || self.drop_factor < 0.0 {
            return Err(Error::Config(format!(
                "drop_factor must be a finite non-negative number, got {}",
                self.drop_factor
            )));
        }
        Ok(())
    }
}

fn schema(weight_init: Initializer) -> Schema {
    Schema::new()
        .dimension("nB", "Batch size")
        .dimension("nI", "Input size")
        .dimension("nO", "Output size")
        .parameter(
            "W",
            "Weights matrix",
            |d| Ok(vec![d.require("nO")?, d.require("nI")?]),
            weight_init,
        )
        .parameter(
            "b",
            "Bias vector",
            |d| Ok(vec![d.require("nO")?]),
            Initializer::Zeros,
        )
        .gradient("d_W", "W")
        .gradient("d_b", "b")
}

/// Labels at or above this cannot be turned into a class count.
const MAX_LABEL: f64 = usize::MAX as f64;

/// Integer class labels: finite, non-negative, whole, below [`MAX_LABEL`],
/// and at least one.
struct Labels<'a>(&'a [f64]);

impl Validate for Labels<'_> {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        let is_label = |v: f64| (0.0..MAX_LABEL).contains(&v) && v.fract() == 0.0;
        if self.0.is_empty() || !self.0.iter().all(|&v| is_label(v)) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Fills in `nI` and `nO` from the first batch when they are still unknown.
///
/// `nI` comes from `x.shape[1]`. `nO` comes from `y`: its second axis when
/// `y` is a 2-D one-hot matrix, otherwise `max(label) + 1` for a vector of
/// integer class labels. Resolved dimensions are never touched.
///
/// # Errors
/// - [`Error::Rank`] if `x` is not 2-D and `nI` is unresolved.
/// - [`Error::InvalidData`] if `y` holds anything but whole non-negative labels
///   small enough to count classes with.
pub fn set_dimensions_if_needed(
    store: &mut ParamStore,
    x: &Ten64,
    y: Option<&Ten64>,
) -> Result<()> {
    if store.dim("nI").is_none() {
        let (_, n_i) = x.dims2("mish")?;
        store.set_dim("nI", n_i)?;
    }
    if store.dim("nO").is_none()
        && let Some(y) = y
    {
        let n_o = if y.rank() == 2 {
            y.shape[1]
        } else {
            let labels = TrustedData::new(Labels(&y.data))?.into_inner();
            let max = labels.0.iter().copied().fold(0.0, f64::max);
            max as usize + 1
        };
        store.set_dim("nO", n_o)?;
    }
    Ok(())
}

/// A fully connected layer with Mish activation and optional dropout.
#[derive(Debug)]
pub struct Mish<O: Ops = CpuOps> {
    id: LayerId,
    name: String,
    ops: O,
    store: ParamStore,
    drop_factor: f64,
}

impl Mish<CpuOps> {
    /// A layer with default settings; either size may be left for the data
    /// to decide.
    pub fn new(n_o: Option<usize>, n_i: Option<usize>) -> Result<Self> {
        Self::with_config(n_o, n_i, MishConfig::default())
    }

    /// A layer on the CPU backend, seeded from `config.base.seed` if set.
    pub fn with_config(n_o: Option<usize>, n_i: Option<usize>, config: MishConfig) -> Result<Self> {
        let ops = match config.base.seed {
            Some(seed) => CpuOps::seeded(seed),
            None => CpuOps::new(),
        };
        Self::with_ops(n_o, n_i, config, ops)
    }
}

impl<O: Ops> Mish<O> {
    /// A layer running on a caller-supplied backend.
    ///
    /// # Errors
    /// [`Error::Config`] for an invalid drop factor or a zero size.
    pub fn with_ops(
        n_o: Option<usize>,
        n_i: Option<usize>,
        config: MishConfig,
        ops: O,
    ) -> Result<Self> {
        config.validate()?;
        let mut store = ParamStore::new(schema(config.weight_init));
        if let Some(n_o) = n_o {
            store.set_dim("nO", n_o)?;
        }
        if let Some(n_i) = n_i {
            store.set_dim("nI", n_i)?;
        }
        Ok(Self {
            id: LayerId::next(),
            name: config.base.name.unwrap_or_else(|| "mish".to_owned()),
            ops,
            store,
            drop_factor: config.drop_factor,
        })
    }

    /// Process-unique id, also the key optimizers see.
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// The configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Factor applied to dropout rates.
    pub fn drop_factor(&self) -> f64 {
        self.drop_factor
    }

    /// Input width, once known.
    pub fn n_i(&self) -> Option<usize> {
        self.store.dim("nI")
    }

    /// Output width, once known.
    pub fn n_o(&self) -> Option<usize> {
        self.store.dim("nO")
    }

    /// Batch size, only if set by hand.
    pub fn n_b(&self) -> Option<usize> {
        self.store.dim("nB")
    }

    /// `(nB, nI)`.
    pub fn input_shape(&self) -> (Option<usize>, Option<usize>) {
        (self.n_b(), self.n_i())
    }

    /// `(nB, nO)`.
    pub fn output_shape(&self) -> (Option<usize>, Option<usize>) {
        (self.n_b(), self.n_o())
    }

    /// The parameter store, for inspection.
    pub fn params(&self) -> &ParamStore {
        &self.store
    }

    /// The parameter store, mutably. Lets callers fix `nB` or edit weights.
    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    /// The numeric backend.
    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// `W`, once allocated.
    pub fn weights(&self) -> Result<TensorView<'_, f64>> {
        self.store.param("W")
    }

    /// `b`, once allocated.
    pub fn bias(&self) -> Result<TensorView<'_, f64>> {
        self.store.param("b")
    }

    /// Accumulated `d_W`.
    pub fn d_weights(&self) -> Result<TensorView<'_, f64>> {
        self.store.gradient("d_W")
    }

    /// Accumulated `d_b`.
    pub fn d_bias(&self) -> Result<TensorView<'_, f64>> {
        self.store.gradient("d_b")
    }

    /// Resolves dimensions from a batch (and optional targets) and allocates
    /// the parameters once they are all known.
    ///
    /// Called by [`Mish::predict`] and [`Mish::begin_update`]; call it
    /// directly with targets to infer `nO` before the first forward pass.
    pub fn ensure_initialized(&mut self, x: &Ten64, y: Option<&Ten64>) -> Result<()> {
        if self.store.is_allocated() {
            return Ok(());
        }
        set_dimensions_if_needed(&mut self.store, x, y)?;
        if self.store.ensure_allocated(&mut self.ops)? {
            debug!(
                layer = %self.id,
                name = %self.name,
                n_i = ?self.n_i(),
                n_o = ?self.n_o(),
                "layer initialized"
            );
        }
        Ok(())
    }

    /// `(Y1, Y2)`: pre-activation and activation.
    fn forward(&self, x: &Ten64) -> Result<(Ten64, Ten64)> {
        let y1 = self
            .ops
            .affine(self.store.param("W")?, self.store.param("b")?, x.view())?;
        let y2 = self.ops.mish(&y1);
        Ok((y1, y2))
    }

    /// `mish(X · Wᵗ + b)`, shape `(batch, nO)`.
    pub fn predict(&mut self, x: &Ten64) -> Result<Ten64> {
        self.ensure_initialized(x, None)?;
        let (_, y) = self.forward(x)?;
        trace!(layer = %self.id, input = ?x.shape, output = ?y.shape, "predict");
        Ok(y)
    }

    /// Training forward pass.
    ///
    /// With `drop: Some(d)` the activation goes through dropout at rate
    /// `d * drop_factor`, and the returned [`MishBackward`] carries what the
    /// backward pass needs. `None` is inference: same output as
    /// [`Mish::predict`], no backward context.
    pub fn begin_update(
        &mut self,
        x: &Ten64,
        drop: Option<f64>,
    ) -> Result<(Ten64, Option<MishBackward>)> {
        let Some(drop) = drop else {
            return Ok((self.predict(x)?, None));
        };
        self.ensure_initialized(x, None)?;

        let (y1, y2) = self.forward(x)?;
        let rate = drop * self.drop_factor;
        let (y3, mask) = self.ops.dropout(y2, rate)?;
        trace!(layer = %self.id, input = ?x.shape, rate, "begin_update");

        Ok((
            y3,
            Some(MishBackward {
                layer: self.id,
                x: x.clone(),
                y1,
                mask,
            }),
        ))
    }

    fn finish_update(
        &mut self,
        x: &Ten64,
        y1: &Ten64,
        d_y2: &Ten64,
        sgd: Option<&mut dyn Optimizer>,
    ) -> Result<Ten64> {
        let d_y1 = self.ops.backprop_mish(d_y2, y1)?;

        self.ops.gemm_into(
            d_y1.view(),
            x.view(),
            true,
            false,
            self.store.gradient_mut("d_W")?,
        )?;

        let d_b = self.ops.sum_rows(d_y1.view())?;
        let grad_b = self.store.gradient_mut("d_b")?;
        if grad_b.shape != d_b.shape.as_slice() {
            return Err(Error::ShapeMismatch {
                op: "finish_update",
                lhs: grad_b.shape.to_vec(),
                rhs: d_b.shape,
            });
        }
        for (g, v) in grad_b.data.iter_mut().zip(&d_b.data) {
            *g += v;
        }

        let d_x = self
            .ops
            .gemm(d_y1.view(), self.store.param("W")?, false, false)?;
        trace!(layer = %self.id, d_out = ?d_y2.shape, d_in = ?d_x.shape, "finish_update");

        if let Some(sgd) = sgd
            && let Some(mem) = self.store.memory_mut()
        {
            let (weights, gradient) = mem.blocks_mut();
            sgd.step(weights, gradient, self.id);
        }
        Ok(d_x)
    }
}

impl<O: Ops> Layer for Mish<O> {
    type Backward = MishBackward;

    fn id(&self) -> LayerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&mut self, x: &Ten64) -> Result<Ten64> {
        Mish::predict(self, x)
    }

    fn begin_update(
        &mut self,
        x: &Ten64,
        drop: Option<f64>,
    ) -> Result<(Ten64, Option<MishBackward>)> {
        Mish::begin_update(self, x, drop)
    }
}

/// What a training forward pass of [`Mish`] leaves for its backward pass.
///
/// Owns the input, the pre-activation and the dropout mask. It can be run
/// more than once; every run accumulates into the layer's gradients again.
#[derive(Debug, Clone)]
pub struct MishBackward {
    layer: LayerId,
    x: Ten64,
    y1: Ten64,
    mask: DropoutMask,
}

impl MishBackward {
    /// The layer that produced this context.
    pub fn layer(&self) -> LayerId {
        self.layer
    }

    /// The dropout mask applied on the forward pass.
    pub fn mask(&self) -> &DropoutMask {
        &self.mask
    }

    /// The pre-activation `X · Wᵗ + b`.
    pub fn pre_activation(&self) -> &Ten64 {
        &self.y1
    }

    /// Backward pass from the gradient w.r.t. the layer's (dropped-out) output.
    ///
    /// Routes `d_y3` through the dropout mask, then runs
    /// [`MishBackward::finish_update`]. Returns the gradient w.r.t. the input.
    pub fn backward<O: Ops>(
        &self,
        layer: &mut Mish<O>,
        d_y3: &Ten64,
        sgd: Option<&mut dyn Optimizer>,
    ) -> Result<Ten64> {
        self.check_layer(layer)?;
        let d_y2 = self.mask.backward(d_y3)?;
        layer.finish_update(&self.x, &self.y1, &d_y2, sgd)
    }

    /// Backward pass from the gradient w.r.t. the activation, before dropout.
    ///
    /// Adds `dY1ᵗ · X` into `d_W` and the column sums of `dY1` into `d_b`,
    /// where `dY1 = backprop_mish(d_y2, Y1)`. Returns `dY1 · W` computed with
    /// the weights as they were before `sgd` runs. When `sgd` is given it is
    /// stepped once over the layer's whole parameter memory.
    pub fn finish_update<O: Ops>(
        &self,
        layer: &mut Mish<O>,
        d_y2: &Ten64,
        sgd: Option<&mut dyn Optimizer>,
    ) -> Result<Ten64> {
        self.check_layer(layer)?;
        layer.finish_update(&self.x, &self.y1, d_y2, sgd)
    }

    fn check_layer<O: Ops>(&self, layer: &Mish<O>) -> Result<()> {
        if layer.id != self.layer {
            return Err(Error::LayerMismatch {
                expected: self.layer.get(),
                found: layer.id.get(),
            });
        }
        Ok(())
    }
}
