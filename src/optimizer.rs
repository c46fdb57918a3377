use ndarray::{Array1, ArrayView1, ArrayViewMut1, Zip};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifies a trainable parameter: the node that owns it and its position
/// among that node's trainable ports (weight then bias).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParameterId {
    pub node: usize,
    pub index: usize,
}

/// Optimizer.
///
/// Optimizers keep their running state per [`ParameterId`], sized to the
/// parameter on first use.
pub trait Optimizer: Send {
    /// Updates `value` given the batch averaged `grad`.
    fn update(&mut self, parameter: ParameterId, grad: ArrayView1<f32>, value: ArrayViewMut1<f32>);
    /// Clears the running state.
    fn reset(&mut self) {}
}

fn state_mut(
    state: &mut HashMap<ParameterId, Array1<f32>>,
    parameter: ParameterId,
    len: usize,
) -> &mut Array1<f32> {
    let value = state
        .entry(parameter)
        .or_insert_with(|| Array1::zeros(len));
    if value.len() != len {
        *value = Array1::zeros(len);
    }
    value
}

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Sgd`].
    pub struct SgdBuilder {
        learning_rate: f32,
        weight_decay: f32,
        momentum: Option<f32>,
    }

    impl SgdBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.01,
                weight_decay: 0.,
                momentum: None,
            }
        }
        /// Learning rate. Default is 0.01.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// L2 penalty added to the gradient. Default is 0.
        pub fn weight_decay(self, weight_decay: f32) -> Self {
            Self {
                weight_decay,
                ..self
            }
        }
        /// Momentum. Default is none.
        ///
        /// With momentum a velocity is kept for each parameter.
        pub fn momentum(self, momentum: f32) -> Self {
            Self {
                momentum: Some(momentum),
                ..self
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> Sgd {
            let Self {
                learning_rate,
                weight_decay,
                momentum,
            } = self;
            Sgd {
                learning_rate,
                weight_decay,
                momentum,
                velocity: HashMap::new(),
            }
        }
    }
}
use builder::*;

/// Stochastic gradient descent, with optional momentum.
///
/// Without momentum: `w -= lr * (dw + decay * w)`.
/// With momentum `mu`: `v = mu * v - lr * (dw + decay * w); w += v`.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sgd {
    learning_rate: f32,
    weight_decay: f32,
    momentum: Option<f32>,
    #[cfg_attr(feature = "serde", serde(skip))]
    velocity: HashMap<ParameterId, Array1<f32>>,
}

impl Sgd {
    /// A builder for creating a [`Sgd`].
    pub fn builder() -> SgdBuilder {
        SgdBuilder::new()
    }
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, parameter: ParameterId, grad: ArrayView1<f32>, value: ArrayViewMut1<f32>) {
        let lr = self.learning_rate;
        let decay = self.weight_decay;
        if let Some(momentum) = self.momentum {
            let velocity = state_mut(&mut self.velocity, parameter, value.len());
            Zip::from(value)
                .and(&grad)
                .and(velocity)
                .for_each(|w, dw, v| {
                    *v = momentum * *v - lr * (dw + decay * *w);
                    *w += *v;
                });
        } else {
            Zip::from(value).and(&grad).for_each(|w, dw| {
                *w -= lr * (dw + decay * *w);
            });
        }
    }
    fn reset(&mut self) {
        self.velocity.clear();
    }
}

/// Adagrad.
///
/// `g += dw^2; w -= lr * dw / (sqrt(g) + eps)`.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Adagrad {
    learning_rate: f32,
    eps: f32,
    #[cfg_attr(feature = "serde", serde(skip))]
    sum_squares: HashMap<ParameterId, Array1<f32>>,
}

impl Adagrad {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            eps: 1e-8,
            sum_squares: HashMap::new(),
        }
    }
}

impl Default for Adagrad {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl Optimizer for Adagrad {
    fn update(&mut self, parameter: ParameterId, grad: ArrayView1<f32>, value: ArrayViewMut1<f32>) {
        let (lr, eps) = (self.learning_rate, self.eps);
        let g = state_mut(&mut self.sum_squares, parameter, value.len());
        Zip::from(value).and(&grad).and(g).for_each(|w, dw, g| {
            *g += dw * dw;
            *w -= lr * dw / (g.sqrt() + eps);
        });
    }
    fn reset(&mut self) {
        self.sum_squares.clear();
    }
}

/// RMSprop.
///
/// `g = mu * g + (1 - mu) * dw^2; w -= lr * dw / sqrt(g + eps)`.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RmsProp {
    learning_rate: f32,
    decay: f32,
    eps: f32,
    #[cfg_attr(feature = "serde", serde(skip))]
    mean_squares: HashMap<ParameterId, Array1<f32>>,
}

impl RmsProp {
    pub fn new(learning_rate: f32, decay: f32) -> Self {
        Self {
            learning_rate,
            decay,
            eps: 1e-8,
            mean_squares: HashMap::new(),
        }
    }
}

impl Default for RmsProp {
    fn default() -> Self {
        Self::new(1e-4, 0.99)
    }
}

impl Optimizer for RmsProp {
    fn update(&mut self, parameter: ParameterId, grad: ArrayView1<f32>, value: ArrayViewMut1<f32>) {
        let (lr, mu, eps) = (self.learning_rate, self.decay, self.eps);
        let g = state_mut(&mut self.mean_squares, parameter, value.len());
        Zip::from(value).and(&grad).and(g).for_each(|w, dw, g| {
            *g = mu * *g + (1. - mu) * dw * dw;
            *w -= lr * dw / (*g + eps).sqrt();
        });
    }
    fn reset(&mut self) {
        self.mean_squares.clear();
    }
}

/// Adam, with a step count per parameter.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    #[cfg_attr(feature = "serde", serde(skip))]
    moment1: HashMap<ParameterId, Array1<f32>>,
    #[cfg_attr(feature = "serde", serde(skip))]
    moment2: HashMap<ParameterId, Array1<f32>>,
    #[cfg_attr(feature = "serde", serde(skip))]
    steps: HashMap<ParameterId, i32>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps: 1e-8,
            moment1: HashMap::new(),
            moment2: HashMap::new(),
            steps: HashMap::new(),
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(1e-3, 0.9, 0.999)
    }
}

impl Optimizer for Adam {
    fn update(&mut self, parameter: ParameterId, grad: ArrayView1<f32>, value: ArrayViewMut1<f32>) {
        let (lr, b1, b2, eps) = (self.learning_rate, self.beta1, self.beta2, self.eps);
        let step = self.steps.entry(parameter).or_insert(0);
        *step += 1;
        let b1_t = b1.powi(*step);
        let b2_t = b2.powi(*step);
        let m = state_mut(&mut self.moment1, parameter, value.len());
        let v = state_mut(&mut self.moment2, parameter, value.len());
        Zip::from(value)
            .and(&grad)
            .and(m)
            .and(v)
            .for_each(|w, dw, m, v| {
                *m = b1 * *m + (1. - b1) * dw;
                *v = b2 * *v + (1. - b2) * dw * dw;
                *w -= lr * (*m / (1. - b1_t)) / (*v / (1. - b2_t) + eps).sqrt();
            });
    }
    fn reset(&mut self) {
        self.moment1.clear();
        self.moment2.clear();
        self.steps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    const ID: ParameterId = ParameterId { node: 0, index: 0 };

    #[test]
    fn sgd_step() {
        let mut sgd = Sgd::builder().learning_rate(0.5).build();
        let mut w = array![1f32, 2.];
        sgd.update(ID, array![1f32, -2.].view(), w.view_mut());
        assert_eq!(w, array![0.5, 3.]);
    }

    #[test]
    fn sgd_momentum_accumulates() {
        let mut sgd = Sgd::builder().learning_rate(1.).momentum(0.5).build();
        let mut w = array![0f32];
        sgd.update(ID, array![1f32].view(), w.view_mut());
        assert_relative_eq!(w[0], -1.);
        sgd.update(ID, array![1f32].view(), w.view_mut());
        assert_relative_eq!(w[0], -2.5);
        sgd.reset();
        sgd.update(ID, array![1f32].view(), w.view_mut());
        assert_relative_eq!(w[0], -3.5);
    }

    #[test]
    fn adagrad_step() {
        let mut opt = Adagrad::new(0.1);
        let mut w = array![1f32];
        opt.update(ID, array![2f32].view(), w.view_mut());
        assert_relative_eq!(w[0], 0.9, epsilon = 1e-6);
    }

    #[test]
    fn adam_first_step_is_learning_rate() {
        let mut opt = Adam::default();
        let mut w = array![1f32, 1.];
        opt.update(ID, array![0.3f32, -5.].view(), w.view_mut());
        assert_relative_eq!(w[0], 1. - 1e-3, epsilon = 1e-5);
        assert_relative_eq!(w[1], 1. + 1e-3, epsilon = 1e-5);
    }

    #[test]
    fn rmsprop_descends() {
        let mut opt = RmsProp::default();
        let mut w = array![1f32];
        opt.update(ID, array![1f32].view(), w.view_mut());
        assert!(w[0] < 1.);
    }

    #[test]
    fn state_is_resized() {
        let mut opt = Adagrad::default();
        let mut a = array![1f32, 1.];
        opt.update(ID, array![1f32, 1.].view(), a.view_mut());
        let mut b = array![1f32, 1., 1.];
        opt.update(ID, array![1f32, 1., 1.].view(), b.view_mut());
        assert_eq!(opt.sum_squares[&ID].len(), 3);
    }
}
