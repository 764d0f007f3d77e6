//! Declarative parameter storage for layers.
//!
//! A layer describes itself with a [`Schema`]: named dimensions, named
//! parameters whose shapes are functions of those dimensions, and named
//! gradients paired with parameters. A [`ParamStore`] holds the dimension
//! values and, once every dimension a parameter needs is known, allocates all
//! parameters together in one contiguous [`Memory`] block, with a gradient
//! block of the same layout beside it. Optimizers receive the two blocks
//! whole.
//!
//! ```text
//! weights:  [ W ................ | b .... ]
//! gradient: [ d_W .............. | d_b .. ]
//! ```

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{Error, Result};
use crate::init::Initializer;
use crate::ops::Ops;
use crate::tensors::{Tensor, TensorView, TensorViewMut};

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a layer instance.
///
/// Optimizers key their per-parameter state on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId(u64);

impl LayerId {
    /// Hands out the next unused identity.
    pub fn next() -> Self {
        Self(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identity value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Computes a parameter's shape from the layer's dimensions.
///
/// Returns the name of the first unresolved dimension on failure.
pub type ShapeFn = fn(&Dimensions) -> core::result::Result<Vec<usize>, &'static str>;

/// One entry of a [`Schema`].
#[derive(Debug, Clone, Copy)]
pub enum Descriptor {
    /// A size that starts unknown and is fixed once set.
    Dimension {
        /// Human-readable description.
        doc: &'static str,
    },
    /// A trainable tensor.
    Parameter {
        /// Human-readable description.
        doc: &'static str,
        /// Shape as a function of the dimensions.
        shape: ShapeFn,
        /// Run once, right after allocation.
        init: Initializer,
    },
    /// The gradient accumulator for the named parameter.
    Gradient {
        /// Name of the parameter this accumulates for.
        of: &'static str,
    },
}

/// Ordered table of a layer's declared attributes.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entries: Vec<(&'static str, Descriptor)>,
}

impl Schema {
    /// An empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a dimension.
    #[must_use]
    pub fn dimension(mut self, name: &'static str, doc: &'static str) -> Self {
        self.entries.push((name, Descriptor::Dimension { doc }));
        self
    }

    /// Declares a parameter.
    #[must_use]
    pub fn parameter(
        mut self,
        name: &'static str,
        doc: &'static str,
        shape: ShapeFn,
        init: Initializer,
    ) -> Self {
        self.entries
            .push((name, Descriptor::Parameter { doc, shape, init }));
        self
    }

    /// Declares the gradient of parameter `of`.
    #[must_use]
    pub fn gradient(mut self, name: &'static str, of: &'static str) -> Self {
        self.entries.push((name, Descriptor::Gradient { of }));
        self
    }

    /// Looks up a declaration.
    pub fn describe(&self, name: &str) -> Option<&Descriptor> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, d)| d)
    }

    /// All declarations in order.
    pub fn entries(&self) -> &[(&'static str, Descriptor)] {
        &self.entries
    }
}

/// Current values of a layer's dimensions.
#[derive(Debug, Clone, Default)]
pub struct Dimensions {
    values: Vec<(&'static str, Option<usize>)>,
}

impl Dimensions {
    fn from_schema(schema: &Schema) -> Self {
        let values = schema
            .entries()
            .iter()
            .filter(|(_, d)| matches!(d, Descriptor::Dimension { .. }))
            .map(|(n, _)| (*n, None))
            .collect();
        Self { values }
    }

    /// The dimension's value, or `None` when unset or undeclared.
    pub fn get(&self, name: &str) -> Option<usize> {
        self.values
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, v)| *v)
    }

    /// The dimension's value, or its name when unset. For use in [`ShapeFn`]s.
    pub fn require(&self, name: &'static str) -> core::result::Result<usize, &'static str> {
        self.get(name).ok_or(name)
    }

    /// Sets a dimension.
    ///
    /// Setting a resolved dimension to the value it already has is a no-op;
    /// any other value is a [`Error::DimensionConflict`].
    pub fn set(&mut self, name: &'static str, value: usize) -> Result<()> {
        if value == 0 {
            return Err(Error::Config(format!("dimension `{name}` must be positive")));
        }
        let slot = self
            .values
            .iter_mut()
            .find(|(n, _)| *n == name)
            .ok_or(Error::UnknownParameter(name))?;
        let resolved = slot.1;
        match resolved {
            Some(current) if current != value => Err(Error::DimensionConflict {
                dim: name,
                current,
                requested: value,
            }),
            Some(_) => Ok(()),
            None => {
                slot.1 = Some(value);
                debug!(dim = name, value, "dimension resolved");
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    name: &'static str,
    grad: Option<&'static str>,
    offset: usize,
    shape: Vec<usize>,
}

impl Slot {
    fn range(&self) -> core::ops::Range<usize> {
        self.offset..self.offset + self.shape.iter().product::<usize>()
    }
}

/// Contiguous weight and gradient blocks sharing one layout.
#[derive(Debug, Clone)]
pub struct Memory {
    weights: Vec<f64>,
    gradient: Vec<f64>,
    slots: Vec<Slot>,
}

impl Memory {
    /// The whole weight block.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// The whole gradient block.
    pub fn gradient(&self) -> &[f64] {
        &self.gradient
    }

    /// Both blocks, mutably, for an optimizer step.
    pub fn blocks_mut(&mut self) -> (&mut [f64], &mut [f64]) {
        (self.weights.as_mut_slice(), self.gradient.as_mut_slice())
    }
}

/// A layer's dimensions plus its lazily allocated parameters.
#[derive(Debug, Clone)]
pub struct ParamStore {
    schema: Schema,
    dims: Dimensions,
    memory: Option<Memory>,
}

impl ParamStore {
    /// A store with every dimension unset and nothing allocated.
    pub fn new(schema: Schema) -> Self {
        let dims = Dimensions::from_schema(&schema);
        Self {
            schema,
            dims,
            memory: None,
        }
    }

    /// The declarations this store was built from.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Dimension values.
    pub fn dims(&self) -> &Dimensions {
        &self.dims
    }

    /// Shorthand for `self.dims().get(name)`.
    pub fn dim(&self, name: &str) -> Option<usize> {
        self.dims.get(name)
    }

    /// Sets a dimension; see [`Dimensions::set`].
    ///
    /// Dimensions a parameter depends on cannot change after allocation.
    pub fn set_dim(&mut self, name: &'static str, value: usize) -> Result<()> {
        self.dims.set(name, value)
    }

    /// Whether the parameters exist yet.
    pub fn is_allocated(&self) -> bool {
        self.memory.is_some()
    }

    /// The allocated memory, if any.
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    /// The allocated memory, mutably, if any.
    pub fn memory_mut(&mut self) -> Option<&mut Memory> {
        self.memory.as_mut()
    }

    /// Allocates and initializes every parameter if that has not happened yet.
    ///
    /// Returns `true` when this call did the allocation.
    ///
    /// # Errors
    /// - [`Error::UnresolvedDimension`] if a parameter's shape needs a
    ///   dimension that is still unset.
    /// - [`Error::Config`] if the parameters do not fit in memory.
    ///
    /// Nothing is allocated in either case.
    pub fn ensure_allocated(&mut self, ops: &mut dyn Ops) -> Result<bool> {
        if self.memory.is_some() {
            return Ok(false);
        }

        let mut slots = Vec::new();
        let mut inits = Vec::new();
        let mut total: usize = 0;
        for &(name, desc) in self.schema.entries() {
            if let Descriptor::Parameter { shape, init, .. } = desc {
                let shape = shape(&self.dims)
                    .map_err(|dim| Error::UnresolvedDimension { param: name, dim })?;
                let end = shape
                    .iter()
                    .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                    .and_then(|len| total.checked_add(len))
                    .ok_or_else(|| oversized(name, &shape))?;
                slots.push(Slot {
                    name,
                    grad: None,
                    offset: total,
                    shape,
                });
                inits.push(init);
                total = end;
            }
        }
        for &(name, desc) in self.schema.entries() {
            if let Descriptor::Gradient { of } = desc {
                let slot = slots
                    .iter_mut()
                    .find(|s| s.name == of)
                    .ok_or(Error::UnknownParameter(of))?;
                slot.grad = Some(name);
            }
        }

        let mut weights = zeroed(total)?;
        let gradient = zeroed(total)?;
        for (slot, init) in slots.iter().zip(inits) {
            let range = slot.range();
            let mut t = Tensor::new(slot.shape.clone(), zeroed(range.len())?);
            init.apply(&mut t, ops)?;
            weights[range].copy_from_slice(&t.data);
            debug!(param = slot.name, shape = ?slot.shape, ?init, "parameter allocated");
        }

        self.memory = Some(Memory {
            weights,
            gradient,
            slots,
        });
        Ok(true)
    }

    /// A view of parameter `name`.
    pub fn param(&self, name: &'static str) -> Result<TensorView<'_, f64>> {
        let (mem, slot) = self.slot(name, false)?;
        Ok(TensorView {
            shape: &slot.shape,
            data: &mem.weights[slot.range()],
        })
    }

    /// A mutable view of parameter `name`.
    pub fn param_mut(&mut self, name: &'static str) -> Result<TensorViewMut<'_, f64>> {
        let range = self.slot(name, false)?.1.range();
        let mem = self.memory.as_mut().ok_or(Error::UnknownParameter(name))?;
        let slot = mem
            .slots
            .iter()
            .find(|s| s.name == name)
            .ok_or(Error::UnknownParameter(name))?;
        Ok(TensorViewMut {
            shape: &slot.shape,
            data: &mut mem.weights[range],
        })
    }

    /// A view of gradient `name` (e.g. `d_W`).
    pub fn gradient(&self, name: &'static str) -> Result<TensorView<'_, f64>> {
        let (mem, slot) = self.slot(name, true)?;
        Ok(TensorView {
            shape: &slot.shape,
            data: &mem.gradient[slot.range()],
        })
    }

    /// A mutable view of gradient `name`.
    pub fn gradient_mut(&mut self, name: &'static str) -> Result<TensorViewMut<'_, f64>> {
        let range = self.slot(name, true)?.1.range();
        let mem = self.memory.as_mut().ok_or(Error::UnknownParameter(name))?;
        let slot = mem
            .slots
            .iter()
            .find(|s| s.grad == Some(name))
            .ok_or(Error::UnknownParameter(name))?;
        Ok(TensorViewMut {
            shape: &slot.shape,
            data: &mut mem.gradient[range],
        })
    }

    fn slot(&self, name: &'static str, gradient: bool) -> Result<(&Memory, &Slot)> {
        let Some(mem) = &self.memory else {
            return Err(self.unallocated(name));
        };
        mem.slots
            .iter()
            .find(|s| {
                if gradient {
                    s.grad == Some(name)
                } else {
                    s.name == name
                }
            })
            .map(|s| (mem, s))
            .ok_or(Error::UnknownParameter(name))
    }

    /// Explains why `name` cannot be accessed before allocation.
    fn unallocated(&self, name: &'static str) -> Error {
        let param = match self.schema.describe(name) {
            Some(Descriptor::Parameter { .. }) => name,
            Some(Descriptor::Gradient { of }) => of,
            _ => return Error::UnknownParameter(name),
        };
        match self.schema.describe(param) {
            Some(Descriptor::Parameter { shape, .. }) => match shape(&self.dims) {
                Err(dim) => Error::UnresolvedDimension { param, dim },
                Ok(_) => Error::Config(format!(
                    "`{name}` is resolvable but has not been allocated yet"
                )),
            },
            _ => Error::UnknownParameter(param),
        }
    }
}

fn oversized(param: &str, shape: &[usize]) -> Error {
    Error::Config(format!("`{param}` of shape {shape:?} does not fit in memory"))
}

/// A zero-filled block, or an error instead of an allocation failure abort.
fn zeroed(len: usize) -> Result<Vec<f64>> {
    let mut block = Vec::new();
    block
        .try_reserve_exact(len)
        .map_err(|e| Error::Config(format!("cannot allocate {len} parameters: {e}")))?;
    block.resize(len, 0.0);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::CpuOps;

    fn dense_schema() -> Schema {
        Schema::new()
            .dimension("nI", "Input size")
            .dimension("nO", "Output size")
            .parameter(
                "W",
                "Weights",
                |d| Ok(vec![d.require("nO")?, d.require("nI")?]),
                Initializer::LecunUniform,
            )
            .parameter(
                "b",
                "Bias",
                |d| Ok(vec![d.require("nO")?]),
                Initializer::Zeros,
            )
            .gradient("d_W", "W")
            .gradient("d_b", "b")
    }

    #[test]
    fn layer_ids_are_unique() {
        let a = LayerId::next();
        let b = LayerId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn dimensions_are_fixed_once_set() {
        let mut store = ParamStore::new(dense_schema());
        store.set_dim("nI", 4).unwrap();
        store.set_dim("nI", 4).unwrap();
        let err = store.set_dim("nI", 5).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionConflict {
                dim: "nI",
                current: 4,
                requested: 5,
            }
        ));
        assert_eq!(store.dim("nI"), Some(4));
    }

    #[test]
    fn zero_and_undeclared_dimensions_are_rejected() {
        let mut store = ParamStore::new(dense_schema());
        assert!(matches!(store.set_dim("nO", 0), Err(Error::Config(_))));
        assert!(matches!(store.set_dim("nZ", 2), Err(Error::UnknownParameter("nZ"))));
    }

    #[test]
    fn allocation_waits_for_every_dimension() {
        let mut ops = CpuOps::seeded(0);
        let mut store = ParamStore::new(dense_schema());
        store.set_dim("nI", 4).unwrap();

        let err = store.ensure_allocated(&mut ops).unwrap_err();
        assert!(matches!(
            err,
            Error::UnresolvedDimension {
                param: "W",
                dim: "nO",
            }
        ));
        assert!(!store.is_allocated());
        assert!(matches!(
            store.gradient("d_b"),
            Err(Error::UnresolvedDimension {
                param: "b",
                dim: "nO",
            })
        ));
    }

    #[test]
    fn allocation_lays_out_parameters_contiguously() {
        let mut ops = CpuOps::seeded(0);
        let mut store = ParamStore::new(dense_schema());
        store.set_dim("nI", 4).unwrap();
        store.set_dim("nO", 3).unwrap();

        assert!(store.ensure_allocated(&mut ops).unwrap());
        assert!(!store.ensure_allocated(&mut ops).unwrap());

        let mem = store.memory().unwrap();
        assert_eq!(mem.weights().len(), 15);
        assert_eq!(mem.gradient().len(), 15);
        assert_eq!(store.param("W").unwrap().shape, &[3, 4]);
        assert_eq!(store.param("b").unwrap().shape, &[3]);
        assert_eq!(store.gradient("d_W").unwrap().shape, &[3, 4]);
        assert!(store.param("b").unwrap().data.iter().all(|&v| v == 0.0));
        assert!(store.param("W").unwrap().data.iter().any(|&v| v != 0.0));
        assert!(mem.gradient().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn gradient_views_write_into_the_gradient_block() {
        let mut ops = CpuOps::seeded(0);
        let mut store = ParamStore::new(dense_schema());
        store.set_dim("nI", 2).unwrap();
        store.set_dim("nO", 2).unwrap();
        store.ensure_allocated(&mut ops).unwrap();

        store.gradient_mut("d_b").unwrap().data[1] = 7.0;
        store.param_mut("b").unwrap().data[0] = -1.0;

        let mem = store.memory().unwrap();
        assert_eq!(mem.gradient()[5], 7.0);
        assert_eq!(mem.weights()[4], -1.0);
    }

    #[test]
    fn gradient_of_undeclared_parameter_fails_allocation() {
        let mut ops = CpuOps::seeded(0);
        let schema = Schema::new().dimension("n", "size").gradient("d_Q", "Q");
        let mut store = ParamStore::new(schema);
        store.set_dim("n", 1).unwrap();
        assert!(matches!(
            store.ensure_allocated(&mut ops),
            Err(Error::UnknownParameter("Q"))
        ));
    }

    #[test]
    fn oversized_parameters_fail_without_allocating() {
        let mut ops = CpuOps::seeded(0);
        let mut store = ParamStore::new(dense_schema());
        store.set_dim("nI", 2).unwrap();
        store.set_dim("nO", usize::MAX).unwrap();

        let err = store.ensure_allocated(&mut ops).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!store.is_allocated());
    }
}
