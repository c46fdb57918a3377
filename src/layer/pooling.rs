use super::{activated_out_types, apply_activation, backward_activation, Layer};
use crate::{
    activation::Activation,
    init::WeightInit,
    shape::{PortKind, Shape3d},
    storage::{Scratch, WorkerState},
    Error, Result,
};

/// Window geometry shared by the pooling layers.
///
/// Windows at the right and bottom edges are clipped to the input.
#[derive(Clone, Debug)]
struct Windows {
    in_shape: Shape3d,
    out_shape: Shape3d,
    pool_size: usize,
    stride: usize,
    /// Input indices of each output, in scan order.
    out2in: Vec<Vec<usize>>,
}

impl Windows {
    fn new(in_shape: Shape3d, pool_size: usize, stride: usize) -> Result<Self> {
        let (w, h) = (in_shape.width(), in_shape.height());
        if pool_size == 0 || stride == 0 {
            return Err(Error::Config(format!(
                "pooling size {pool_size} and stride {stride} must be positive"
            )));
        }
        if pool_size > w || pool_size > h {
            return Err(Error::DimensionMismatch(format!(
                "pooling size {pool_size} does not fit in input {in_shape}"
            )));
        }
        if stride == pool_size && (w % pool_size != 0 || h % pool_size != 0) {
            return Err(Error::DimensionMismatch(format!(
                "width/height of {in_shape} not multiple of pooling size {pool_size}"
            )));
        }
        let out_w = (w - pool_size + stride - 1) / stride + 1;
        let out_h = (h - pool_size + stride - 1) / stride + 1;
        let out_shape = Shape3d::new(out_w, out_h, in_shape.depth())?;
        let mut out2in = Vec::with_capacity(out_shape.size());
        for c in 0..out_shape.depth() {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let (x0, y0) = (ox * stride, oy * stride);
                    let dx_max = pool_size.min(w - x0);
                    let dy_max = pool_size.min(h - y0);
                    let window = (0..dy_max)
                        .flat_map(|dy| (0..dx_max).map(move |dx| (dx, dy)))
                        .map(|(dx, dy)| in_shape.get_index(x0 + dx, y0 + dy, c))
                        .collect();
                    out2in.push(window);
                }
            }
        }
        Ok(Self {
            in_shape,
            out_shape,
            pool_size,
            stride,
            out2in,
        })
    }
    fn channel_of(&self, output: usize) -> usize {
        output / self.out_shape.area()
    }
}

/// Max pooling.
///
/// Records which input won each window, so the backward pass routes the
/// gradient to it alone. Ties go to the first input in scan order.
#[derive(Clone, Debug)]
pub struct MaxPooling {
    windows: Windows,
    activation: Activation,
}

impl MaxPooling {
    /// Pools `in_shape` with square windows of `pool_size`, `stride` apart.
    ///
    /// **Errors**
    ///
    /// The window must fit in the input. When the stride equals the pool size
    /// the input width and height must be multiples of it.
    pub fn new(in_shape: Shape3d, pool_size: usize, stride: usize) -> Result<Self> {
        Ok(Self {
            windows: Windows::new(in_shape, pool_size, stride)?,
            activation: Activation::Identity,
        })
    }
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
    pub fn pool_size(&self) -> usize {
        self.windows.pool_size
    }
    pub fn stride(&self) -> usize {
        self.windows.stride
    }
    /// The recorded winners of the last forward pass in `scratch`.
    pub fn max_indices<'a>(&self, scratch: &'a Scratch) -> Option<&'a [usize]> {
        match scratch {
            Scratch::MaxIndices(indices) => Some(indices),
            _ => None,
        }
    }
}

impl Layer for MaxPooling {
    fn layer_type(&self) -> &'static str {
        "max-pool"
    }
    fn in_types(&self) -> Vec<PortKind> {
        vec![PortKind::Data]
    }
    fn out_types(&self) -> Vec<PortKind> {
        activated_out_types()
    }
    fn in_shape(&self) -> Vec<Shape3d> {
        vec![self.windows.in_shape]
    }
    fn out_shape(&self) -> Vec<Shape3d> {
        vec![self.windows.out_shape; 2]
    }
    fn fan_in_size(&self) -> usize {
        self.windows.pool_size * self.windows.pool_size
    }
    fn fan_out_size(&self) -> usize {
        1
    }
    fn activation(&self) -> Activation {
        self.activation
    }
    fn new_scratch(&self) -> Scratch {
        Scratch::MaxIndices(vec![0; self.windows.out_shape.size()])
    }
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        let Scratch::MaxIndices(indices) = &mut *worker.scratch else {
            return Err(Error::Storage(self.layer_type()));
        };
        let x = in_data[0];
        for ((a, index), window) in out_data[1]
            .iter_mut()
            .zip(indices.iter_mut())
            .zip(&self.windows.out2in)
        {
            let mut max = f32::NEG_INFINITY;
            *index = window[0];
            for &i in window {
                if x[i] > max {
                    max = x[i];
                    *index = i;
                }
            }
            *a = x[*index];
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
        let Scratch::MaxIndices(indices) = &*worker.scratch else {
            return Err(Error::Storage(self.layer_type()));
        };
        backward_activation(self.activation, out_data, out_grad, worker);
        for (&index, delta) in indices.iter().zip(&out_grad[1]) {
            in_grad[0][index] += delta;
        }
        Ok(())
    }
}

/// Average pooling with a trainable scale and bias per channel.
///
/// `a = w[c] * mean(window) + b[c]`, where the mean always divides by the
/// full window area.
#[derive(Clone, Debug)]
pub struct AveragePooling {
    windows: Windows,
    weight: Vec<f32>,
    bias: Vec<f32>,
    activation: Activation,
    weight_init: WeightInit,
    bias_init: WeightInit,
}

impl AveragePooling {
    /// Pools `in_shape` with square windows of `pool_size`, `stride` apart.
    ///
    /// **Errors**
    ///
    /// See [`MaxPooling::new`].
    pub fn new(in_shape: Shape3d, pool_size: usize, stride: usize) -> Result<Self> {
        let depth = in_shape.depth();
        Ok(Self {
            windows: Windows::new(in_shape, pool_size, stride)?,
            weight: vec![0.; depth],
            bias: vec![0.; depth],
            activation: Activation::Identity,
            weight_init: WeightInit::default(),
            bias_init: WeightInit::Constant(0.),
        })
    }
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
    pub fn pool_size(&self) -> usize {
        self.windows.pool_size
    }
    pub fn stride(&self) -> usize {
        self.windows.stride
    }
    fn scale_factor(&self) -> f32 {
        1. / (self.windows.pool_size * self.windows.pool_size) as f32
    }
}

impl Layer for AveragePooling {
    fn layer_type(&self) -> &'static str {
        "ave-pool"
    }
    fn in_types(&self) -> Vec<PortKind> {
        vec![PortKind::Data, PortKind::Weight, PortKind::Bias]
    }
    fn out_types(&self) -> Vec<PortKind> {
        activated_out_types()
    }
    fn in_shape(&self) -> Vec<Shape3d> {
        let depth = self.windows.in_shape.depth();
        vec![
            self.windows.in_shape,
            Shape3d::vector(depth),
            Shape3d::vector(depth),
        ]
    }
    fn out_shape(&self) -> Vec<Shape3d> {
        vec![self.windows.out_shape; 2]
    }
    fn fan_in_size(&self) -> usize {
        self.windows.pool_size * self.windows.pool_size
    }
    fn fan_out_size(&self) -> usize {
        1
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
    fn parameters(&self) -> Vec<&[f32]> {
        vec![self.weight.as_slice(), self.bias.as_slice()]
    }
    fn parameters_mut(&mut self) -> Vec<&mut [f32]> {
        vec![self.weight.as_mut_slice(), self.bias.as_mut_slice()]
    }
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        _worker: &mut WorkerState,
    ) -> Result<()> {
        let (x, w, b) = (in_data[0], in_data[1], in_data[2]);
        let scale = self.scale_factor();
        for (o, (a, window)) in out_data[1]
            .iter_mut()
            .zip(&self.windows.out2in)
            .enumerate()
        {
            let c = self.windows.channel_of(o);
            let sum: f32 = window.iter().map(|&i| x[i]).sum();
            *a = sum * w[c] * scale + b[c];
        }
        apply_activation(self.activation, out_data);
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
        backward_activation(self.activation, out_data, out_grad, worker);
        let (x, w) = (in_data[0], in_data[1]);
        let scale = self.scale_factor();
        let (prev, params) = in_grad.split_at_mut(1);
        let (dw, db) = params.split_at_mut(1);
        for (o, (delta, window)) in out_grad[1].iter().zip(&self.windows.out2in).enumerate() {
            let c = self.windows.channel_of(o);
            let mut sum = 0.;
            for &i in window {
                prev[0][i] += w[c] * scale * delta;
                sum += x[i] * delta;
            }
            dw[0][c] += sum * scale;
            db[0][c] += delta;
        }
        Ok(())
    }
}
