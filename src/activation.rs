#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Activation functions.
///
/// Derivatives are expressed in terms of the output `y = f(x)`, which is what
/// layers keep for the backward pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Activation {
    #[default]
    Identity,
    Sigmoid,
    Relu,
    /// Relu with a slope of 0.01 for negative inputs.
    LeakyRelu,
    Elu,
    /// Normalized exponential over the whole vector.
    Softmax,
    Tanh,
    /// `e^x / (e^x + e^-x)`, ie a sigmoid of `2x`.
    TanhP1m2,
}

impl Activation {
    /// Computes `y = f(a)`.
    pub fn f(&self, a: &[f32], y: &mut [f32]) {
        debug_assert_eq!(a.len(), y.len());
        match self {
            Self::Softmax => {
                let max = a.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut denom = 0f32;
                for (y, a) in y.iter_mut().zip(a) {
                    *y = (a - max).exp();
                    denom += *y;
                }
                y.iter_mut().for_each(|y| *y /= denom);
            }
            _ => {
                for (y, a) in y.iter_mut().zip(a) {
                    *y = self.f_scalar(*a);
                }
            }
        }
    }
    fn f_scalar(&self, x: f32) -> f32 {
        match self {
            Self::Identity => x,
            Self::Sigmoid => 1. / (1. + (-x).exp()),
            Self::Relu => x.max(0.),
            Self::LeakyRelu => {
                if x > 0. {
                    x
                } else {
                    0.01 * x
                }
            }
            Self::Elu => {
                if x < 0. {
                    x.exp() - 1.
                } else {
                    x
                }
            }
            Self::Tanh => x.tanh(),
            Self::TanhP1m2 => 1. / (1. + (-2. * x).exp()),
            Self::Softmax => unreachable!("softmax is not elementwise"),
        }
    }
    /// The derivative at output `y`.
    ///
    /// Only meaningful when [`one_hot`](Self::one_hot) is true.
    pub fn df(&self, y: f32) -> f32 {
        match self {
            Self::Identity => 1.,
            Self::Sigmoid => y * (1. - y),
            Self::Relu => {
                if y > 0. {
                    1.
                } else {
                    0.
                }
            }
            Self::LeakyRelu => {
                if y > 0. {
                    1.
                } else {
                    0.01
                }
            }
            Self::Elu => {
                if y > 0. {
                    1.
                } else {
                    1. + y
                }
            }
            Self::Tanh => 1. - y * y,
            Self::TanhP1m2 => 2. * y * (1. - y),
            Self::Softmax => y * (1. - y),
        }
    }
    /// Row `i` of the Jacobian, ie `dy_k / da_i` for every `k`.
    pub fn df_vec(&self, y: &[f32], i: usize) -> Vec<f32> {
        match self {
            Self::Softmax => y
                .iter()
                .enumerate()
                .map(|(k, &yk)| {
                    if k == i {
                        yk * (1. - yk)
                    } else {
                        -yk * y[i]
                    }
                })
                .collect(),
            _ => {
                let mut v = vec![0.; y.len()];
                v[i] = self.df(y[i]);
                v
            }
        }
    }
    /// Whether the Jacobian is diagonal.
    pub fn one_hot(&self) -> bool {
        !matches!(self, Self::Softmax)
    }
    /// Target values used for negative and positive classes.
    pub fn scale(&self) -> (f32, f32) {
        match self {
            Self::Softmax => (0., 1.),
            Self::Tanh => (-0.8, 0.8),
            _ => (0.1, 0.9),
        }
    }
    /// Chains `out_grad` through the activation at output `y` into `delta`.
    pub fn backward(&self, y: &[f32], out_grad: &[f32], delta: &mut [f32]) {
        debug_assert_eq!(y.len(), out_grad.len());
        debug_assert_eq!(y.len(), delta.len());
        if self.one_hot() {
            for ((d, g), y) in delta.iter_mut().zip(out_grad).zip(y) {
                *d = g * self.df(*y);
            }
        } else {
            for (i, d) in delta.iter_mut().enumerate() {
                *d = self
                    .df_vec(y, i)
                    .iter()
                    .zip(out_grad)
                    .map(|(j, g)| j * g)
                    .sum();
            }
        }
    }
}
