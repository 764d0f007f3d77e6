//! Optimizers.
//!
//! A layer's backward pass hands its optimizer the layer's whole weight
//! block, its whole gradient block and its [`LayerId`]. The optimizer updates
//! the weights in place and must leave the gradient block zeroed; layers only
//! ever accumulate into it.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::trace;

use crate::params::LayerId;

/// An update rule applied to one layer's parameter memory.
pub trait Optimizer {
    /// Updates `weights` from `gradient`, then zeroes `gradient`.
    ///
    /// `key` identifies the layer, so optimizers with per-parameter state can
    /// keep one entry per layer.
    fn step(&mut self, weights: &mut [f64], gradient: &mut [f64], key: LayerId);
}

impl<F> Optimizer for F
where
    F: FnMut(&mut [f64], &mut [f64], LayerId),
{
    fn step(&mut self, weights: &mut [f64], gradient: &mut [f64], key: LayerId) {
        self(weights, gradient, key);
    }
}

/// Plain stochastic gradient descent.
///
/// $$ w := w - \\text{lr} \\cdot \\frac{\\partial L}{\\partial w} $$
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    lr: f64,
}

impl Sgd {
    /// SGD with the given learning rate.
    #[must_use]
    pub const fn with_lr(lr: f64) -> Self {
        Self { lr }
    }

    /// The learning rate.
    pub const fn lr(&self) -> f64 {
        self.lr
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, weights: &mut [f64], gradient: &mut [f64], key: LayerId) {
        let lr = self.lr;
        weights
            .par_iter_mut()
            .zip(gradient.par_iter_mut())
            .for_each(|(w, g)| {
                *w -= lr * *g;
                *g = 0.0;
            });
        trace!(layer = %key, len = weights.len(), "sgd step");
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f64>,
    v: Vec<f64>,
    t: i32,
}

/// Adam, with first/second moment estimates kept per layer.
///
/// # Hyperparameters (hardcoded)
///
/// - beta1 = 0.9
/// - beta2 = 0.999
/// - eps = 1e-8
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    state: HashMap<LayerId, Moments>,
}

impl Adam {
    const BETA1: f64 = 0.9;
    const BETA2: f64 = 0.999;
    const EPS: f64 = 1e-8;

    /// Adam with the given learning rate and no state yet.
    #[must_use]
    pub fn with_lr(lr: f64) -> Self {
        Self {
            lr,
            state: HashMap::new(),
        }
    }

    /// Number of steps taken for `key`, zero if never seen.
    pub fn steps(&self, key: LayerId) -> i32 {
        self.state.get(&key).map_or(0, |s| s.t)
    }
}

impl Optimizer for Adam {
    fn step(&mut self, weights: &mut [f64], gradient: &mut [f64], key: LayerId) {
        let len = weights.len();
        let state = self.state.entry(key).or_insert_with(|| Moments {
            m: vec![0.0; len],
            v: vec![0.0; len],
            t: 0,
        });
        if state.m.len() != len {
            // the layer was re-allocated under the same key; its history no longer applies
            *state = Moments {
                m: vec![0.0; len],
                v: vec![0.0; len],
                t: 0,
            };
        }
        state.t += 1;

        let lr = self.lr;
        let bias1 = 1.0 - Self::BETA1.powi(state.t);
        let bias2 = 1.0 - Self::BETA2.powi(state.t);

        for (((w, g), m), v) in weights
            .iter_mut()
            .zip(gradient.iter_mut())
            .zip(state.m.iter_mut())
            .zip(state.v.iter_mut())
        {
            *m = Self::BETA1 * *m + (1.0 - Self::BETA1) * *g;
            *v = Self::BETA2 * *v + (1.0 - Self::BETA2) * (*g * *g);
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *w -= lr * m_hat / (v_hat.sqrt() + Self::EPS);
            *g = 0.0;
        }
        trace!(layer = %key, t = state.t, "adam step");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sgd_updates_and_zeroes_gradient() {
        let mut w = vec![1.0, 2.0];
        let mut g = vec![0.1, 0.2];
        Sgd::with_lr(0.5).step(&mut w, &mut g, LayerId::next());
        assert_eq!(w, vec![0.95, 1.9]);
        assert_eq!(g, vec![0.0, 0.0]);
    }

    #[test]
    fn adam_first_step_moves_by_lr() {
        let key = LayerId::next();
        let mut adam = Adam::with_lr(0.01);
        let mut w = vec![1.0, -1.0];
        let mut g = vec![0.3, -4.0];
        adam.step(&mut w, &mut g, key);

        // bias-corrected first step is lr * sign(g)
        assert_relative_eq!(w[0], 0.99, epsilon = 1e-6);
        assert_relative_eq!(w[1], -0.99, epsilon = 1e-6);
        assert_eq!(g, vec![0.0, 0.0]);
        assert_eq!(adam.steps(key), 1);
    }

    #[test]
    fn adam_keeps_state_per_layer() {
        let (a, b) = (LayerId::next(), LayerId::next());
        let mut adam = Adam::with_lr(0.01);
        let mut w = vec![0.0];
        adam.step(&mut w, &mut vec![1.0], a);
        adam.step(&mut w, &mut vec![1.0], a);
        adam.step(&mut w, &mut vec![1.0], b);
        assert_eq!(adam.steps(a), 2);
        assert_eq!(adam.steps(b), 1);
    }

    #[test]
    fn closures_are_optimizers() {
        let mut seen = None;
        let key = LayerId::next();
        let mut opt = |w: &mut [f64], g: &mut [f64], k: LayerId| {
            w[0] += g[0];
            g[0] = 0.0;
            seen = Some(k);
        };
        let mut w = vec![1.0];
        let mut g = vec![2.0];
        opt.step(&mut w, &mut g, key);
        assert_eq!(w, vec![3.0]);
        assert_eq!(seen, Some(key));
    }
}
