use super::{activated_out_types, apply_activation, backward_activation, Layer};
use crate::{
    activation::Activation,
    shape::{PortKind, Shape3d},
    storage::WorkerState,
    Result,
};

/// Elementwise `f(scale * x + bias)`, with fixed scale and bias.
#[derive(Clone, Debug)]
pub struct Linear {
    shape: Shape3d,
    scale: f32,
    bias: f32,
    activation: Activation,
}

impl Linear {
    /// An identity layer over `shape`.
    pub fn new(shape: Shape3d) -> Self {
        Self {
            shape,
            scale: 1.,
            bias: 0.,
            activation: Activation::Identity,
        }
    }
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }
    pub fn with_bias(mut self, bias: f32) -> Self {
        self.bias = bias;
        self
    }
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
}

impl Layer for Linear {
    fn layer_type(&self) -> &'static str {
        "linear"
    }
    fn in_types(&self) -> Vec<PortKind> {
        vec![PortKind::Data]
    }
    fn out_types(&self) -> Vec<PortKind> {
        activated_out_types()
    }
    fn in_shape(&self) -> Vec<Shape3d> {
        vec![self.shape]
    }
    fn out_shape(&self) -> Vec<Shape3d> {
        vec![self.shape; 2]
    }
    fn activation(&self) -> Activation {
        self.activation
    }
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        _worker: &mut WorkerState,
    ) -> Result<()> {
        for (a, x) in out_data[1].iter_mut().zip(in_data[0]) {
            *a = self.scale * x + self.bias;
        }
        apply_activation(self.activation, out_data);
        Ok(())
    }
    fn back_propagation(
        &self,
        _in_data: &[&[f32]],
        out_data: &[Vec<f32>],
        out_grad: &mut [Vec<f32>],
        in_grad: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        backward_activation(self.activation, out_data, out_grad, worker);
        for (prev, delta) in in_grad[0].iter_mut().zip(&out_grad[1]) {
            *prev += self.scale * delta;
        }
        Ok(())
    }
}
