use super::{activated_out_types, apply_activation, backward_activation, Layer};
use crate::{
    activation::Activation,
    connection_table::ConnectionTable,
    init::WeightInit,
    parallel::{for_each_chunk_mut, Parallelism},
    shape::{PortKind, Shape3d},
    storage::{Scratch, WorkerState},
    Error, Result,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Convolution padding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Padding {
    /// No padding, the output shrinks by the kernel size - 1.
    #[default]
    Valid,
    /// Zero padding of `(kernel - 1) / 2` before and the rest after, so that
    /// with stride 1 the output has the input's width and height.
    Same,
}

/// 2D convolution over channels.
///
/// The kernel of output channel `o` and input channel `i` is channel
/// `inputs * o + i` of a `kernel_w x kernel_h x (inputs * outputs)` weight.
#[derive(Clone, Debug)]
pub struct Convolution {
    in_shape: Shape3d,
    in_padded: Shape3d,
    out_shape: Shape3d,
    kernel: Shape3d,
    outputs: usize,
    strides: [usize; 2],
    padding: Padding,
    table: ConnectionTable,
    weight: Vec<f32>,
    bias: Option<Vec<f32>>,
    activation: Activation,
    weight_init: WeightInit,
    bias_init: WeightInit,
}

impl Convolution {
    /// Creates a new [`Convolution`] of `in_shape` to `outputs` channels with
    /// a `[width, height]` kernel.
    ///
    /// Defaults:
    /// - strides: 1
    /// - padding: valid
    /// - connection table: fully connected
    /// - bias: true
    /// - activation: identity
    ///
    /// **Errors**
    ///
    /// The kernel must fit in the input, and no dimension may be 0.
    pub fn new(in_shape: Shape3d, kernel: [usize; 2], outputs: usize) -> Result<Self> {
        if kernel.contains(&0) || outputs == 0 || in_shape.size() == 0 {
            return Err(Error::Config(format!(
                "convolution of {in_shape} with kernel {kernel:?} to {outputs} channels"
            )));
        }
        let kernel = Shape3d::new(kernel[0], kernel[1], in_shape.depth() * outputs)?;
        let mut conv = Self {
            in_shape,
            in_padded: in_shape,
            out_shape: in_shape,
            kernel,
            outputs,
            strides: [1, 1],
            padding: Padding::Valid,
            table: ConnectionTable::new(),
            weight: vec![0.; kernel.size()],
            bias: Some(vec![0.; outputs]),
            activation: Activation::Identity,
            weight_init: WeightInit::default(),
            bias_init: WeightInit::Constant(0.),
        };
        conv.resolve()?;
        Ok(conv)
    }
    /// Sets the `[width, height]` strides.
    ///
    /// **Errors**
    ///
    /// Strides must be positive.
    pub fn with_strides(mut self, strides: [usize; 2]) -> Result<Self> {
        if strides.contains(&0) {
            return Err(Error::Config(format!("strides {strides:?} must be positive")));
        }
        self.strides = strides;
        self.resolve()?;
        Ok(self)
    }
    /// Sets the padding.
    ///
    /// **Errors**
    ///
    /// With [`Padding::Valid`] the kernel must fit in the input.
    pub fn with_padding(mut self, padding: Padding) -> Result<Self> {
        self.padding = padding;
        self.resolve()?;
        Ok(self)
    }
    /// Restricts which channels are connected.
    ///
    /// **Errors**
    ///
    /// A non empty table must be `outputs x inputs`.
    pub fn with_connection_table(mut self, table: ConnectionTable) -> Result<Self> {
        if !table.is_empty()
            && (table.rows() != self.outputs || table.cols() != self.in_shape.depth())
        {
            return Err(Error::DimensionMismatch(format!(
                "connection table {}x{} for {} outputs and {} inputs",
                table.rows(),
                table.cols(),
                self.outputs,
                self.in_shape.depth()
            )));
        }
        self.table = table;
        Ok(self)
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
    pub fn padding(&self) -> Padding {
        self.padding
    }
    pub fn strides(&self) -> [usize; 2] {
        self.strides
    }
    pub fn connection_table(&self) -> &ConnectionTable {
        &self.table
    }
    fn resolve(&mut self) -> Result<()> {
        let (kw, kh) = (self.kernel.width(), self.kernel.height());
        let (w, h, c) = (
            self.in_shape.width(),
            self.in_shape.height(),
            self.in_shape.depth(),
        );
        self.in_padded = match self.padding {
            Padding::Valid => {
                if kw > w || kh > h {
                    return Err(Error::DimensionMismatch(format!(
                        "kernel {kw}x{kh} does not fit in input {}",
                        self.in_shape
                    )));
                }
                self.in_shape
            }
            Padding::Same => Shape3d::new(w + kw - 1, h + kh - 1, c)?,
        };
        let [sw, sh] = self.strides;
        let out_w = (self.in_padded.width() - kw + 1 + sw - 1) / sw;
        let out_h = (self.in_padded.height() - kh + 1 + sh - 1) / sh;
        self.out_shape = Shape3d::new(out_w, out_h, self.outputs)?;
        Ok(())
    }
    fn kernel_area(&self) -> usize {
        self.kernel.area()
    }
    fn kernel_offset(&self, output: usize, input: usize) -> usize {
        self.kernel
            .get_index(0, 0, self.in_shape.depth() * output + input)
    }
    fn pad_offsets(&self) -> (usize, usize) {
        match self.padding {
            Padding::Valid => (0, 0),
            Padding::Same => ((self.kernel.width() - 1) / 2, (self.kernel.height() - 1) / 2),
        }
    }
    fn copy_and_pad(&self, input: &[f32], padded: &mut [f32]) {
        let (px, py) = self.pad_offsets();
        let w = self.in_shape.width();
        padded.fill(0.);
        for c in 0..self.in_shape.depth() {
            for y in 0..self.in_shape.height() {
                let src = self.in_shape.get_index(0, y, c);
                let dst = self.in_padded.get_index(px, py + y, c);
                padded[dst..dst + w].copy_from_slice(&input[src..src + w]);
            }
        }
    }
    fn add_unpadded(&self, padded: &[f32], delta: &mut [f32]) {
        let (px, py) = self.pad_offsets();
        let w = self.in_shape.width();
        for c in 0..self.in_shape.depth() {
            for y in 0..self.in_shape.height() {
                let src = self.in_padded.get_index(px, py + y, c);
                let dst = self.in_shape.get_index(0, y, c);
                for (d, p) in delta[dst..dst + w].iter_mut().zip(&padded[src..src + w]) {
                    *d += p;
                }
            }
        }
    }
    /// Index in a padded input channel of kernel tap `(wx, wy)` at output `(x, y)`.
    fn tap(&self, x: usize, y: usize, wx: usize, wy: usize) -> usize {
        let [sw, sh] = self.strides;
        (y * sh + wy) * self.in_padded.width() + x * sw + wx
    }
    fn propagate_delta(
        &self,
        weight: &[f32],
        delta: &[f32],
        prev_delta: &mut [f32],
        parallelism: Parallelism,
    ) {
        let (kw, kh) = (self.kernel.width(), self.kernel.height());
        let (ow, oh) = (self.out_shape.width(), self.out_shape.height());
        let out_area = self.out_shape.area();
        for_each_chunk_mut(prev_delta, self.in_padded.area(), parallelism, |inc, pd| {
            for o in (0..self.outputs).filter(|o| self.table.is_connected(*o, inc)) {
                let w = &weight[self.kernel_offset(o, inc)..][..self.kernel_area()];
                let d = &delta[o * out_area..][..out_area];
                for y in 0..oh {
                    for x in 0..ow {
                        let dv = d[y * ow + x];
                        for wy in 0..kh {
                            for wx in 0..kw {
                                pd[self.tap(x, y, wx, wy)] += w[wy * kw + wx] * dv;
                            }
                        }
                    }
                }
            }
        });
    }
    fn accumulate_weight_grad(
        &self,
        input: &[f32],
        delta: &[f32],
        dw: &mut [f32],
        parallelism: Parallelism,
    ) {
        let inputs = self.in_shape.depth();
        let (kw, kh) = (self.kernel.width(), self.kernel.height());
        let (ow, oh) = (self.out_shape.width(), self.out_shape.height());
        let out_area = self.out_shape.area();
        let in_area = self.in_padded.area();
        for_each_chunk_mut(dw, self.kernel_area(), parallelism, |channel, dwk| {
            let (o, inc) = (channel / inputs, channel % inputs);
            if !self.table.is_connected(o, inc) {
                return;
            }
            let x_in = &input[inc * in_area..][..in_area];
            let d = &delta[o * out_area..][..out_area];
            for wy in 0..kh {
                for wx in 0..kw {
                    let mut sum = 0.;
                    for y in 0..oh {
                        for x in 0..ow {
                            sum += x_in[self.tap(x, y, wx, wy)] * d[y * ow + x];
                        }
                    }
                    dwk[wy * kw + wx] += sum;
                }
            }
        });
    }
}

impl Layer for Convolution {
    fn layer_type(&self) -> &'static str {
        "conv"
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
        let mut shapes = vec![self.in_shape, self.kernel];
        if self.bias.is_some() {
            shapes.push(Shape3d::vector(self.outputs));
        }
        shapes
    }
    fn out_shape(&self) -> Vec<Shape3d> {
        vec![self.out_shape; 2]
    }
    fn fan_in_size(&self) -> usize {
        self.kernel_area() * self.in_shape.depth()
    }
    fn fan_out_size(&self) -> usize {
        let [sw, sh] = self.strides;
        (self.kernel.width() / sw) * (self.kernel.height() / sh) * self.outputs
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
        match self.padding {
            Padding::Valid => Scratch::None,
            Padding::Same => Scratch::Padded {
                input: vec![0.; self.in_padded.size()],
                delta: vec![0.; self.in_padded.size()],
            },
        }
    }
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        let parallelism = worker.parallelism;
        let input: &[f32] = match (&mut *worker.scratch, self.padding) {
            (Scratch::Padded { input, .. }, Padding::Same) => {
                self.copy_and_pad(in_data[0], input);
                input.as_slice()
            }
            (_, Padding::Valid) => in_data[0],
            _ => return Err(Error::Storage(self.layer_type())),
        };
        let weight = in_data[1];
        let bias = self.bias.as_ref().map(|_| in_data[2]);
        let (kw, kh) = (self.kernel.width(), self.kernel.height());
        let (ow, oh) = (self.out_shape.width(), self.out_shape.height());
        let in_area = self.in_padded.area();
        for_each_chunk_mut(&mut out_data[1], self.out_shape.area(), parallelism, |o, a| {
            a.fill(0.);
            for inc in (0..self.in_shape.depth()).filter(|i| self.table.is_connected(o, *i)) {
                let w = &weight[self.kernel_offset(o, inc)..][..self.kernel_area()];
                let x_in = &input[inc * in_area..][..in_area];
                for y in 0..oh {
                    for x in 0..ow {
                        let mut sum = 0.;
                        for wy in 0..kh {
                            for wx in 0..kw {
                                sum += w[wy * kw + wx] * x_in[self.tap(x, y, wx, wy)];
                            }
                        }
                        a[y * ow + x] += sum;
                    }
                }
            }
            if let Some(bias) = bias {
                a.iter_mut().for_each(|a| *a += bias[o]);
            }
        });
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
        let parallelism = worker.parallelism;
        let delta = out_grad[1].as_slice();
        let weight = in_data[1];
        let (prev, params) = in_grad.split_at_mut(1);
        let (input, padded_delta): (&[f32], Option<&mut Vec<f32>>) =
            match (&mut *worker.scratch, self.padding) {
                (Scratch::Padded { input, delta: padded }, Padding::Same) => {
                    (input.as_slice(), Some(padded))
                }
                (_, Padding::Valid) => (in_data[0], None),
                _ => return Err(Error::Storage(self.layer_type())),
            };
        match padded_delta {
            Some(padded) => {
                padded.fill(0.);
                self.propagate_delta(weight, delta, padded, parallelism);
                self.add_unpadded(padded, &mut prev[0]);
            }
            None => self.propagate_delta(weight, delta, &mut prev[0], parallelism),
        }
        self.accumulate_weight_grad(input, delta, &mut params[0], parallelism);
        if self.bias.is_some() {
            let out_area = self.out_shape.area();
            for (db, d) in params[1].iter_mut().zip(delta.chunks(out_area)) {
                *db += d.iter().sum::<f32>();
            }
        }
        Ok(())
    }
}
