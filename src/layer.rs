//! Layers.
//!
//! A layer has typed input and output ports, each with a [`Shape3d`]. Data
//! ports carry activations between layers, weight and bias ports are the
//! layer's own trainable parameters, shared by every worker. Whatever a pass
//! writes lives in per worker [`LayerBuffers`](crate::storage::LayerBuffers).
use crate::{
    activation::Activation,
    init::WeightInit,
    optimizer::{Optimizer, ParameterId},
    shape::{PortKind, Shape3d},
    storage::{Scratch, WorkerState},
    weights::WeightReader,
    Result,
};
use derive_more::From;
use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use rand::rngs::SmallRng;
use std::io::Write;

mod concat;
mod convolution;
mod dropout;
mod fully_connected;
mod input;
mod linear;
mod lrn;
mod pooling;

pub use concat::Concat;
pub use convolution::{Convolution, Padding};
pub use dropout::{Dropout, Filter};
pub use fully_connected::FullyConnected;
pub use input::Input;
pub use linear::Linear;
pub use lrn::Lrn;
pub use pooling::{AveragePooling, MaxPooling};

#[cfg(test)]
mod tests;

/// Layer.
///
/// `forward_propagation` and `back_propagation` only read the layer, so the
/// same layer is run by many workers at once, each with its own buffers.
pub trait Layer: Send + Sync {
    /// A stable tag, ie "conv".
    fn layer_type(&self) -> &'static str;
    fn in_types(&self) -> Vec<PortKind>;
    fn out_types(&self) -> Vec<PortKind>;
    /// One shape per input port.
    fn in_shape(&self) -> Vec<Shape3d>;
    /// One shape per output port.
    fn out_shape(&self) -> Vec<Shape3d>;
    /// Incoming connections per unit, used to scale initialization.
    fn fan_in_size(&self) -> usize {
        self.in_shape()[0].width()
    }
    /// Outgoing connections per unit, used to scale initialization.
    fn fan_out_size(&self) -> usize {
        self.out_shape()[0].width()
    }
    fn activation(&self) -> Activation {
        Activation::Identity
    }
    fn weight_init(&self) -> WeightInit {
        WeightInit::default()
    }
    fn bias_init(&self) -> WeightInit {
        WeightInit::Constant(0.)
    }
    fn set_weight_init(&mut self, _init: WeightInit) {}
    fn set_bias_init(&mut self, _init: WeightInit) {}
    /// A filter applied after the activation.
    fn filter(&self) -> Option<&Filter> {
        None
    }
    /// Trainable parameters, in port order.
    fn parameters(&self) -> Vec<&[f32]> {
        Vec::new()
    }
    /// Trainable parameters, in port order.
    fn parameters_mut(&mut self) -> Vec<&mut [f32]> {
        Vec::new()
    }
    /// Per worker state for the backward pass.
    fn new_scratch(&self) -> Scratch {
        Scratch::None
    }
    /// Computes the outputs.
    ///
    /// `in_data` has one slice per input port, parameters included.
    ///
    /// **Errors**
    ///
    /// If the worker's scratch was allocated for a different layer.
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()>;
    /// Computes the input gradients from `out_grad`.
    ///
    /// Data port gradients are written to `in_grad`, which is zeroed by the
    /// caller. Parameter gradients are added to their `in_grad` buffers.
    /// `out_grad` may be used as scratch space.
    ///
    /// **Errors**
    ///
    /// If the worker's scratch was allocated for a different layer.
    fn back_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &[Vec<f32>],
        out_grad: &mut [Vec<f32>],
        in_grad: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()>;
    /// Indices of the trainable input ports.
    fn trainable_ports(&self) -> Vec<usize> {
        self.in_types()
            .iter()
            .enumerate()
            .filter_map(|(i, kind)| kind.is_trainable().then_some(i))
            .collect()
    }
    /// Fills weights with [`weight_init`](Layer::weight_init) and biases with
    /// [`bias_init`](Layer::bias_init).
    fn init_weight(&mut self, rng: &mut SmallRng) {
        let fan_in = self.fan_in_size();
        let fan_out = self.fan_out_size();
        let weight_init = self.weight_init();
        let bias_init = self.bias_init();
        let in_types = self.in_types();
        let kinds = self
            .trainable_ports()
            .into_iter()
            .map(|port| in_types[port]);
        for (kind, param) in kinds.zip(self.parameters_mut()) {
            if kind == PortKind::Weight {
                weight_init.fill(param, fan_in, fan_out, rng);
            } else {
                bias_init.fill(param, fan_in, fan_out, rng);
            }
        }
    }
    /// Applies the accumulated gradients.
    ///
    /// Sums the parameter gradients of every worker, scales them by
    /// `1 / batch_size`, steps the optimizer for the weight then the bias,
    /// and zeroes the worker gradients.
    fn update_weight(
        &mut self,
        node: usize,
        optimizer: &mut dyn Optimizer,
        in_grads: &mut [&mut [Vec<f32>]],
        batch_size: usize,
    ) {
        let scale = 1. / batch_size.max(1) as f32;
        let ports = self.trainable_ports();
        for (index, (port, param)) in ports.into_iter().zip(self.parameters_mut()).enumerate() {
            let mut diff = Array1::<f32>::zeros(param.len());
            for grads in in_grads.iter_mut() {
                diff += &ArrayView1::from(grads[port].as_slice());
                grads[port].fill(0.);
            }
            diff *= scale;
            optimizer.update(
                ParameterId { node, index },
                diff.view(),
                ArrayViewMut1::from(param),
            );
        }
    }
    /// Whether any parameter is not finite.
    fn is_exploded(&self) -> bool {
        self.parameters()
            .iter()
            .any(|param| param.iter().any(|x| !x.is_finite()))
    }
    /// Writes the parameters as whitespace separated text.
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        for param in self.parameters() {
            for x in param {
                write!(writer, "{x} ")?;
            }
        }
        Ok(())
    }
    /// Reads parameters written by [`save`](Layer::save).
    fn load(&mut self, reader: &mut WeightReader) -> Result<()> {
        for param in self.parameters_mut() {
            for x in param.iter_mut() {
                *x = reader.next_value()?;
            }
        }
        Ok(())
    }
    /// Number of parameter values.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}

/// Any layer.
#[derive(Clone, Debug, From)]
pub enum AnyLayer {
    Input(Input),
    FullyConnected(FullyConnected),
    Convolution(Convolution),
    MaxPooling(MaxPooling),
    AveragePooling(AveragePooling),
    Lrn(Lrn),
    Dropout(Dropout),
    Linear(Linear),
    Concat(Concat),
}

macro_rules! dispatch {
    ($self:ident, $layer:ident => $e:expr) => {
        match $self {
            AnyLayer::Input($layer) => $e,
            AnyLayer::FullyConnected($layer) => $e,
            AnyLayer::Convolution($layer) => $e,
            AnyLayer::MaxPooling($layer) => $e,
            AnyLayer::AveragePooling($layer) => $e,
            AnyLayer::Lrn($layer) => $e,
            AnyLayer::Dropout($layer) => $e,
            AnyLayer::Linear($layer) => $e,
            AnyLayer::Concat($layer) => $e,
        }
    };
}

impl Layer for AnyLayer {
    fn layer_type(&self) -> &'static str {
        dispatch!(self, layer => layer.layer_type())
    }
    fn in_types(&self) -> Vec<PortKind> {
        dispatch!(self, layer => layer.in_types())
    }
    fn out_types(&self) -> Vec<PortKind> {
        dispatch!(self, layer => layer.out_types())
    }
    fn in_shape(&self) -> Vec<Shape3d> {
        dispatch!(self, layer => layer.in_shape())
    }
    fn out_shape(&self) -> Vec<Shape3d> {
        dispatch!(self, layer => layer.out_shape())
    }
    fn fan_in_size(&self) -> usize {
        dispatch!(self, layer => layer.fan_in_size())
    }
    fn fan_out_size(&self) -> usize {
        dispatch!(self, layer => layer.fan_out_size())
    }
    fn activation(&self) -> Activation {
        dispatch!(self, layer => layer.activation())
    }
    fn weight_init(&self) -> WeightInit {
        dispatch!(self, layer => layer.weight_init())
    }
    fn bias_init(&self) -> WeightInit {
        dispatch!(self, layer => layer.bias_init())
    }
    fn set_weight_init(&mut self, init: WeightInit) {
        dispatch!(self, layer => layer.set_weight_init(init))
    }
    fn set_bias_init(&mut self, init: WeightInit) {
        dispatch!(self, layer => layer.set_bias_init(init))
    }
    fn filter(&self) -> Option<&Filter> {
        dispatch!(self, layer => layer.filter())
    }
    fn parameters(&self) -> Vec<&[f32]> {
        dispatch!(self, layer => layer.parameters())
    }
    fn parameters_mut(&mut self) -> Vec<&mut [f32]> {
        dispatch!(self, layer => layer.parameters_mut())
    }
    fn new_scratch(&self) -> Scratch {
        dispatch!(self, layer => layer.new_scratch())
    }
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        dispatch!(self, layer => layer.forward_propagation(in_data, out_data, worker))
    }
    fn back_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &[Vec<f32>],
        out_grad: &mut [Vec<f32>],
        in_grad: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        dispatch!(self, layer => layer.back_propagation(in_data, out_data, out_grad, in_grad, worker))
    }
}

/// Ports of a layer with an activation: the output and the pre-activation.
pub(crate) fn activated_out_types() -> Vec<PortKind> {
    vec![PortKind::Data, PortKind::Aux]
}

/// Applies `activation` to the pre-activation in `out_data[1]`, writing
/// `out_data[0]`.
pub(crate) fn apply_activation(activation: Activation, out_data: &mut [Vec<f32>]) {
    let (out, aux) = out_data.split_at_mut(1);
    activation.f(&aux[0], &mut out[0]);
}

/// Chains `out_grad[0]` through `activation` into `out_grad[1]`, which then
/// holds the gradient of the pre-activation.
pub(crate) fn backward_activation(
    activation: Activation,
    out_data: &[Vec<f32>],
    out_grad: &mut [Vec<f32>],
    worker: &WorkerState,
) {
    if worker.delta_ready {
        return;
    }
    let (grad, delta) = out_grad.split_at_mut(1);
    activation.backward(&out_data[0], &grad[0], &mut delta[0]);
}
