//! Layers and their shared configuration.

use crate::error::Result;
use crate::params::LayerId;
use crate::tensors::Ten64;

mod mish;
pub use mish::*;

/// Configuration every layer forwards to its base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerConfig {
    /// Overrides the layer's default name.
    pub name: Option<String>,
    /// Seeds the layer's backend for reproducible initialization and dropout.
    pub seed: Option<u64>,
}

impl LayerConfig {
    /// Sets the layer name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the backend seed.
    #[must_use]
    pub fn seeded(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// A trainable layer with a forward pass and a deferred backward pass.
pub trait Layer {
    /// What [`Layer::begin_update`] hands back for the backward pass.
    type Backward;

    /// Stable identity, used by optimizers.
    fn id(&self) -> LayerId;

    /// Display name.
    fn name(&self) -> &str;

    /// Inference forward pass.
    fn predict(&mut self, x: &Ten64) -> Result<Ten64>;

    /// Training forward pass.
    ///
    /// `drop: None` means inference: the output equals [`Layer::predict`] and
    /// no backward context is returned.
    fn begin_update(
        &mut self,
        x: &Ten64,
        drop: Option<f64>,
    ) -> Result<(Ten64, Option<Self::Backward>)>;
}
