//! Activation functions fused into the end of every convolution stage.
//!
//! Each activation is a zero-sized marker implementing [`Activation`], so the
//! kernels are monomorphized per activation. At setup Identity and Relu are
//! expressed as [`RestrictRange`] and LeakyRelu as [`Prelu`], which keeps the
//! number of kernel instances down.

use num_traits::Float;

use crate::error::{Error, Result};
use crate::param::ActivationKind;
use crate::simd::Lanes;

/// Scalar definitions, shared by the vector kernels (lane by lane) and the
/// reference path.
pub mod scalar {
    use num_traits::Float;

    #[inline(always)]
    fn lit<T: Float>(value: f64) -> T {
        T::from(value).unwrap_or_else(T::nan)
    }

    pub fn restrict_range<T: Float>(value: T, lower: T, upper: T) -> T {
        value.max(lower).min(upper)
    }

    pub fn prelu<T: Float>(value: T, slope: T) -> T {
        value.max(T::zero()) + slope * value.min(T::zero())
    }

    pub fn elu<T: Float>(value: T, alpha: T) -> T {
        if value >= T::zero() {
            value
        } else {
            alpha * (value.exp() - T::one())
        }
    }

    pub fn hswish<T: Float>(value: T, shift: T, scale: T) -> T {
        (value.min(shift) + shift).max(T::zero()) * scale * value
    }

    pub fn mish<T: Float>(value: T, threshold: T) -> T {
        if value > threshold {
            value
        } else {
            value * value.exp().ln_1p().tanh()
        }
    }

    pub fn hard_sigmoid<T: Float>(value: T, scale: T, shift: T) -> T {
        (value * scale + shift).min(T::one()).max(T::zero())
    }

    pub fn swish<T: Float>(value: T, slope: T) -> T {
        value / (T::one() + (-slope * value).exp())
    }

    /// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
    pub fn erf<T: Float>(value: T) -> T {
        let x = value.abs();
        let t = T::one() / (T::one() + lit::<T>(0.327_591_1) * x);
        let poly = t
            * (lit::<T>(0.254_829_592)
                + t * (lit::<T>(-0.284_496_736)
                    + t * (lit::<T>(1.421_413_741)
                        + t * (lit::<T>(-1.453_152_027) + t * lit::<T>(1.061_405_429)))));
        let y = T::one() - poly * (-x * x).exp();
        if value < T::zero() {
            -y
        } else {
            y
        }
    }

    pub fn gelu<T: Float>(value: T) -> T {
        lit::<T>(0.5) * value * (T::one() + erf(value * lit::<T>(std::f64::consts::FRAC_1_SQRT_2)))
    }
}

/// An activation evaluated over whole vectors.
pub trait Activation: Copy + Send + Sync + 'static {
    /// Parameters are one value per channel rather than shared scalars.
    const PER_CHANNEL: bool = false;

    /// Loads the parameters for the `F` channels starting at `channel`.
    #[inline(always)]
    fn params<L: Lanes>(params: &[f32], channel: usize) -> [L::F32; 2] {
        if Self::PER_CHANNEL {
            [L::load_n(params.get(channel..).unwrap_or(&[])), L::splat(0.0)]
        } else {
            let p0 = params.first().copied().unwrap_or(0.0);
            let p1 = params.get(1).copied().unwrap_or(0.0);
            [L::splat(p0), L::splat(p1)]
        }
    }

    fn activate<L: Lanes>(value: L::F32, params: &[L::F32; 2]) -> L::F32;
}

#[derive(Clone, Copy, Debug)]
pub struct RestrictRange;

impl Activation for RestrictRange {
    #[inline(always)]
    fn activate<L: Lanes>(value: L::F32, params: &[L::F32; 2]) -> L::F32 {
        L::min(L::max(params[0], value), params[1])
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Prelu;

impl Activation for Prelu {
    const PER_CHANNEL: bool = true;

    #[inline(always)]
    fn activate<L: Lanes>(value: L::F32, params: &[L::F32; 2]) -> L::F32 {
        let zero = L::splat(0.0);
        L::max(zero, value) + params[0] * L::min(zero, value)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Elu;

impl Activation for Elu {
    #[inline(always)]
    fn activate<L: Lanes>(value: L::F32, params: &[L::F32; 2]) -> L::F32 {
        let mut alpha = [0f32; 1];
        L::store(params[0], &mut alpha);
        L::map(value, |v| scalar::elu(v, alpha[0]))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Hswish;

impl Activation for Hswish {
    #[inline(always)]
    fn activate<L: Lanes>(value: L::F32, params: &[L::F32; 2]) -> L::F32 {
        let zero = L::splat(0.0);
        L::max(L::min(value, params[0]) + params[0], zero) * params[1] * value
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Mish;

impl Activation for Mish {
    #[inline(always)]
    fn activate<L: Lanes>(value: L::F32, params: &[L::F32; 2]) -> L::F32 {
        let mut threshold = [0f32; 1];
        L::store(params[0], &mut threshold);
        L::map(value, |v| scalar::mish(v, threshold[0]))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HardSigmoid;

impl Activation for HardSigmoid {
    #[inline(always)]
    fn activate<L: Lanes>(value: L::F32, params: &[L::F32; 2]) -> L::F32 {
        let t = L::mul_add(value, params[0], params[1]);
        L::max(L::splat(0.0), L::min(t, L::splat(1.0)))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Swish;

impl Activation for Swish {
    #[inline(always)]
    fn activate<L: Lanes>(value: L::F32, params: &[L::F32; 2]) -> L::F32 {
        let mut slope = [0f32; 1];
        L::store(params[0], &mut slope);
        L::map(value, |v| scalar::swish(v, slope[0]))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Gelu;

impl Activation for Gelu {
    #[inline(always)]
    fn activate<L: Lanes>(value: L::F32, _params: &[L::F32; 2]) -> L::F32 {
        L::map(value, scalar::gelu)
    }
}

/// Pass-through, used by partial-sum terms that never activate.
#[derive(Clone, Copy, Debug)]
pub struct Identity;

impl Activation for Identity {
    #[inline(always)]
    fn activate<L: Lanes>(value: L::F32, _params: &[L::F32; 2]) -> L::F32 {
        value
    }
}

/// Number of caller-supplied parameters an activation expects for a
/// convolution with `channels` outputs.
pub fn param_count(kind: ActivationKind, channels: usize) -> usize {
    match kind {
        ActivationKind::Identity | ActivationKind::Relu | ActivationKind::Gelu => 0,
        ActivationKind::LeakyRelu
        | ActivationKind::Elu
        | ActivationKind::Mish
        | ActivationKind::Swish => 1,
        ActivationKind::RestrictRange | ActivationKind::Hswish | ActivationKind::HardSigmoid => 2,
        ActivationKind::Prelu => channels,
    }
}

/// Expands caller parameters into the layout the kernels read.
///
/// Identity and Relu become a range, LeakyRelu becomes one slope per channel.
pub fn expand_params(kind: ActivationKind, params: &[f32], channels: usize) -> Result<Vec<f32>> {
    let need = param_count(kind, channels);
    if params.len() < need {
        return Err(Error::ParamLength {
            name: "activation params",
            expected: need,
            actual: params.len(),
        });
    }
    Ok(match kind {
        ActivationKind::Identity => vec![-f32::MAX, f32::MAX],
        ActivationKind::Relu => vec![0.0, f32::MAX],
        ActivationKind::LeakyRelu => vec![params[0]; channels],
        ActivationKind::Prelu => params[..channels].to_vec(),
        ActivationKind::RestrictRange | ActivationKind::Hswish | ActivationKind::HardSigmoid => {
            vec![params[0], params[1]]
        }
        ActivationKind::Elu | ActivationKind::Mish | ActivationKind::Swish => vec![params[0], 0.0],
        ActivationKind::Gelu => vec![0.0, 0.0],
    })
}

/// Applies `kind` to one value with parameters already expanded by
/// [`expand_params`].
pub fn activate_scalar<T: Float>(kind: ActivationKind, value: T, params: &[T], channel: usize) -> T {
    let p = |i: usize| params.get(i).copied().unwrap_or_else(T::zero);
    match kind {
        ActivationKind::Identity | ActivationKind::Relu | ActivationKind::RestrictRange => {
            scalar::restrict_range(value, p(0), p(1))
        }
        ActivationKind::LeakyRelu | ActivationKind::Prelu => scalar::prelu(value, p(channel)),
        ActivationKind::Elu => scalar::elu(value, p(0)),
        ActivationKind::Hswish => scalar::hswish(value, p(0), p(1)),
        ActivationKind::Mish => scalar::mish(value, p(0)),
        ActivationKind::HardSigmoid => scalar::hard_sigmoid(value, p(0), p(1)),
        ActivationKind::Swish => scalar::swish(value, p(0)),
        ActivationKind::Gelu => scalar::gelu(value),
    }
}

/// Selects the monomorphized instance of a generic function for an activation
/// kind. The callee is named as `$f::<$($pre,)* A $(, $post)*>`.
macro_rules! select_activation {
    ($kind:expr, $f:ident :: < $($pre:ty),* ; _ $(; $post:tt)* >) => {
        match $kind {
            $crate::param::ActivationKind::Identity
            | $crate::param::ActivationKind::Relu
            | $crate::param::ActivationKind::RestrictRange => {
                $f::<$($pre,)* $crate::activation::RestrictRange $(, $post)*>
            }
            $crate::param::ActivationKind::LeakyRelu | $crate::param::ActivationKind::Prelu => {
                $f::<$($pre,)* $crate::activation::Prelu $(, $post)*>
            }
            $crate::param::ActivationKind::Elu => $f::<$($pre,)* $crate::activation::Elu $(, $post)*>,
            $crate::param::ActivationKind::Hswish => {
                $f::<$($pre,)* $crate::activation::Hswish $(, $post)*>
            }
            $crate::param::ActivationKind::Mish => $f::<$($pre,)* $crate::activation::Mish $(, $post)*>,
            $crate::param::ActivationKind::HardSigmoid => {
                $f::<$($pre,)* $crate::activation::HardSigmoid $(, $post)*>
            }
            $crate::param::ActivationKind::Swish => {
                $f::<$($pre,)* $crate::activation::Swish $(, $post)*>
            }
            $crate::param::ActivationKind::Gelu => $f::<$($pre,)* $crate::activation::Gelu $(, $post)*>,
        }
    };
}

pub(crate) use select_activation;
