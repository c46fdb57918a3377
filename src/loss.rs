use crate::activation::Activation;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Loss functions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Loss {
    /// `(y - t)^2 / 2`.
    #[default]
    Mse,
    /// Binary cross entropy, `-t ln(y) - (1 - t) ln(1 - y)`.
    CrossEntropy,
    /// Multiclass cross entropy, `-t ln(y)`.
    CrossEntropyMulticlass,
    /// `|y - t|`.
    Absolute,
    /// `|y - t|` outside `+/- 1 / fraction`, 0 inside.
    AbsoluteEps { fraction: u32 },
}

impl Loss {
    /// Loss of a single output.
    pub fn f(&self, y: f32, t: f32) -> f32 {
        match self {
            Self::Mse => (y - t) * (y - t) / 2.,
            Self::CrossEntropy => -t * y.ln() - (1. - t) * (1. - y).ln(),
            Self::CrossEntropyMulticlass => -t * y.ln(),
            Self::Absolute => (y - t).abs(),
            Self::AbsoluteEps { fraction } => {
                let d = (y - t).abs();
                if d > 1. / *fraction as f32 {
                    d
                } else {
                    0.
                }
            }
        }
    }
    /// `dE / dy` of a single output.
    pub fn df(&self, y: f32, t: f32) -> f32 {
        match self {
            Self::Mse => y - t,
            Self::CrossEntropy => (y - t) / (y * (1. - y)),
            Self::CrossEntropyMulticlass => -t / y,
            Self::Absolute => sign(y - t, 0.),
            Self::AbsoluteEps { fraction } => sign(y - t, 1. / *fraction as f32),
        }
    }
    /// Total loss of an output vector.
    pub fn loss(&self, y: &[f32], t: &[f32]) -> f32 {
        debug_assert_eq!(y.len(), t.len());
        y.iter().zip(t).map(|(y, t)| self.f(*y, *t)).sum()
    }
    /// `dE / dy` of an output vector.
    pub fn gradient(&self, y: &[f32], t: &[f32]) -> Vec<f32> {
        debug_assert_eq!(y.len(), t.len());
        y.iter().zip(t).map(|(y, t)| self.df(*y, *t)).collect()
    }
    /// Whether the delta at the pre-activation collapses to `y - t`.
    pub fn is_canonical_link(&self, activation: Activation) -> bool {
        matches!(
            (activation, self),
            (Activation::Identity, Self::Mse)
                | (Activation::Sigmoid, Self::CrossEntropy)
                | (Activation::Softmax, Self::CrossEntropyMulticlass)
        )
    }
    /// The gradient of the loss with respect to the output layer's activation
    /// input, given output `y` and target `t`.
    pub fn output_delta(&self, activation: Activation, y: &[f32], t: &[f32]) -> Vec<f32> {
        if self.is_canonical_link(activation) {
            canonical_delta(y, t)
        } else {
            self.generic_delta(activation, y, t)
        }
    }
    fn generic_delta(&self, activation: Activation, y: &[f32], t: &[f32]) -> Vec<f32> {
        let de_dy = self.gradient(y, t);
        (0..y.len())
            .map(|i| {
                activation
                    .df_vec(y, i)
                    .iter()
                    .zip(&de_dy)
                    .map(|(j, g)| j * g)
                    .sum()
            })
            .collect()
    }
}

fn sign(d: f32, eps: f32) -> f32 {
    if d > eps {
        1.
    } else if d < -eps {
        -1.
    } else {
        0.
    }
}

fn canonical_delta(y: &[f32], t: &[f32]) -> Vec<f32> {
    y.iter().zip(t).map(|(y, t)| y - t).collect()
}
