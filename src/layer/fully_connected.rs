use super::{activated_out_types, apply_activation, backward_activation, Filter, Layer};
use crate::{
    activation::Activation,
    init::WeightInit,
    shape::{PortKind, Shape3d},
    storage::{Scratch, WorkerState},
    Error, Result,
};
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Zip};

/// Dense / fully connected layer.
///
/// Weights are stored `inputs x outputs`, row major, so `w[i * outputs + o]`
/// connects input `i` to output `o`.
#[derive(Clone, Debug)]
pub struct FullyConnected {
    inputs: usize,
    outputs: usize,
    weight: Vec<f32>,
    bias: Option<Vec<f32>>,
    activation: Activation,
    filter: Option<Filter>,
    weight_init: WeightInit,
    bias_init: WeightInit,
}

impl FullyConnected {
    /// Creates a new [`FullyConnected`] for `inputs` and `outputs`.
    ///
    /// Defaults:
    /// - bias: true
    /// - activation: identity
    /// - filter: none
    ///
    /// Parameters are zero until initialized, see [`Layer::init_weight`].
    ///
    /// **Errors**
    ///
    /// The number of weights must fit in `usize`.
    pub fn from_inputs_outputs(inputs: usize, outputs: usize) -> Result<Self> {
        let len = inputs.checked_mul(outputs).ok_or_else(|| {
            Error::Config(format!("{inputs} x {outputs} weights overflow usize"))
        })?;
        Ok(Self {
            inputs,
            outputs,
            weight: vec![0.; len],
            bias: Some(vec![0.; outputs]),
            activation: Activation::Identity,
            filter: None,
            weight_init: WeightInit::default(),
            bias_init: WeightInit::Constant(0.),
        })
    }
    /// Adds or removes the bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias.then(|| vec![0.; self.outputs]);
        self
    }
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
    /// Adds dropout to the output.
    ///
    /// **Errors**
    ///
    /// See [`Filter::dropout`].
    pub fn with_dropout(mut self, rate: f32) -> Result<Self> {
        self.filter.replace(Filter::dropout(rate)?);
        Ok(self)
    }
    pub fn inputs(&self) -> usize {
        self.inputs
    }
    pub fn outputs(&self) -> usize {
        self.outputs
    }
    fn weight_view<'a>(&self, weight: &'a [f32]) -> Result<ArrayView2<'a, f32>> {
        Ok(ArrayView2::from_shape((self.inputs, self.outputs), weight)?)
    }
}

impl Layer for FullyConnected {
    fn layer_type(&self) -> &'static str {
        "fully-connected"
    }
    fn in_types(&self) -> Vec<PortKind> {
        let mut types = vec![PortKind::Data, PortKind::Weight];
        if self.bias.is_some() {
            types.push(PortKind::Bias);
        }
        types
    }
    fn out_types(&self) -> Vec<PortKind> {
        activated_out_types()
    }
    fn in_shape(&self) -> Vec<Shape3d> {
        let mut shapes = vec![
            Shape3d::vector(self.inputs),
            Shape3d::vector(self.inputs * self.outputs),
        ];
        if self.bias.is_some() {
            shapes.push(Shape3d::vector(self.outputs));
        }
        shapes
    }
    fn out_shape(&self) -> Vec<Shape3d> {
        vec![Shape3d::vector(self.outputs); 2]
    }
    fn fan_in_size(&self) -> usize {
        self.inputs
    }
    fn fan_out_size(&self) -> usize {
        self.outputs
    }
    fn activation(&self) -> Activation {
        self.activation
    }
    fn weight_init(&self) -> WeightInit {
        self.weight_init
    }
    fn bias_init(&self) -> WeightInit {
        self.bias_init
    }
    fn set_weight_init(&mut self, init: WeightInit) {
        self.weight_init = init;
    }
    fn set_bias_init(&mut self, init: WeightInit) {
        self.bias_init = init;
    }
    fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }
    fn parameters(&self) -> Vec<&[f32]> {
        let mut params = vec![self.weight.as_slice()];
        params.extend(self.bias.as_deref());
        params
    }
    fn parameters_mut(&mut self) -> Vec<&mut [f32]> {
        let mut params = vec![self.weight.as_mut_slice()];
        params.extend(self.bias.as_deref_mut());
        params
    }
    fn new_scratch(&self) -> Scratch {
        if self.filter.is_some() {
            Scratch::Mask(vec![true; self.outputs])
        } else {
            Scratch::None
        }
    }
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        let x = ArrayView1::from(in_data[0]);
        let w = self.weight_view(in_data[1])?;
        let mut a = ArrayViewMut1::from(out_data[1].as_mut_slice());
        a.assign(&x.dot(&w));
        if self.bias.is_some() {
            a += &ArrayView1::from(in_data[2]);
        }
        apply_activation(self.activation, out_data);
        if let Some(filter) = self.filter.as_ref() {
            let Scratch::Mask(mask) = &mut *worker.scratch else {
                return Err(Error::Storage(self.layer_type()));
            };
            filter.forward(worker.phase, &mut *worker.rng, &mut out_data[0], mask);
        }
        Ok(())
    }
    fn back_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &[Vec<f32>],
        out_grad: &mut [Vec<f32>],
        in_grad: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        if let Some(filter) = self.filter.as_ref() {
            let Scratch::Mask(mask) = &*worker.scratch else {
                return Err(Error::Storage(self.layer_type()));
            };
            filter.backward(worker.phase, mask, &mut out_grad[0]);
            // out_data[0] holds the filtered output
            let mut y = vec![0.; self.outputs];
            self.activation.f(&out_data[1], &mut y);
            let (grad, delta) = out_grad.split_at_mut(1);
            self.activation.backward(&y, &grad[0], &mut delta[0]);
        } else {
            backward_activation(self.activation, out_data, out_grad, worker);
        }
        let x = ArrayView1::from(in_data[0]);
        let w = self.weight_view(in_data[1])?;
        let delta = ArrayView1::from(out_grad[1].as_slice());
        let (prev, params) = in_grad.split_at_mut(1);
        let mut prev_delta = ArrayViewMut1::from(prev[0].as_mut_slice());
        prev_delta += &w.dot(&delta);
        let mut dw = ArrayViewMut2::from_shape((self.inputs, self.outputs), params[0].as_mut_slice())?;
        Zip::from(dw.rows_mut()).and(&x).for_each(|mut row, &x| {
            row.scaled_add(x, &delta);
        });
        if self.bias.is_some() {
            let mut db = ArrayViewMut1::from(params[1].as_mut_slice());
            db += &delta;
        }
        Ok(())
    }
}
