//! Scalar Mish math shared by the backends.
//!
//! `mish(x) = x * tanh(softplus(x))`. Above [`SOFTPLUS_THRESHOLD`] softplus is
//! indistinguishable from `x` in `f64`, so the activation is the identity there
//! and its derivative is one.

/// Inputs at or above this value pass through Mish unchanged.
pub const SOFTPLUS_THRESHOLD: f64 = 20.0;

/// Mish activation for a single value.
#[inline]
#[must_use]
pub fn mish(x: f64) -> f64 {
    if x >= SOFTPLUS_THRESHOLD {
        x
    } else {
        x * x.exp().ln_1p().tanh()
    }
}

/// Derivative of Mish at `x`.
///
/// Closed form `e^x * omega / delta^2` with
/// `omega = 4(x + 1) + 4e^2x + e^3x + e^x(4x + 6)` and
/// `delta = 2e^x + e^2x + 2`.
#[inline]
#[must_use]
pub fn mish_grad(x: f64) -> f64 {
    if x >= SOFTPLUS_THRESHOLD {
        return 1.0;
    }
    let e = x.exp();
    let e2 = e * e;
    let e3 = e2 * e;
    let omega = 4.0 * (x + 1.0) + 4.0 * e2 + e3 + e * (4.0 * x + 6.0);
    let delta = 2.0 * e + e2 + 2.0;
    e * omega / (delta * delta)
}
