use super::{activated_out_types, apply_activation, backward_activation, Layer};
use crate::{
    activation::Activation,
    shape::{PortKind, Shape3d},
    storage::{Scratch, WorkerState},
    Error, Result,
};

/// Local response normalization across channels.
///
/// `a = x * (1 + alpha / size * sum(x^2))^-beta`, summing over the `size`
/// channels starting `size / 2` before the unit's own channel.
#[derive(Clone, Debug)]
pub struct Lrn {
    shape: Shape3d,
    size: usize,
    alpha: f32,
    beta: f32,
    activation: Activation,
}

impl Lrn {
    /// Normalizes `shape` over windows of `size` channels.
    ///
    /// **Errors**
    ///
    /// The size and the shape must be non empty.
    pub fn new(shape: Shape3d, size: usize, alpha: f32, beta: f32) -> Result<Self> {
        if size == 0 || shape.size() == 0 {
            return Err(Error::Config(format!(
                "normalization of {shape} over {size} channels"
            )));
        }
        Ok(Self {
            shape,
            size,
            alpha,
            beta,
            activation: Activation::Identity,
        })
    }
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
    /// Channels summed for channel `c`.
    fn window(&self, c: usize) -> std::ops::Range<usize> {
        let half = self.size / 2;
        c.saturating_sub(half)..(c + self.size - half).min(self.shape.depth())
    }
    /// Channels whose window contains channel `c`.
    fn windows_containing(&self, c: usize) -> std::ops::RangeInclusive<usize> {
        let half = self.size / 2;
        (c + half + 1).saturating_sub(self.size)..=(c + half).min(self.shape.depth() - 1)
    }
}

impl Layer for Lrn {
    fn layer_type(&self) -> &'static str {
        "norm"
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
    fn new_scratch(&self) -> Scratch {
        Scratch::Lrn(vec![0.; self.shape.size()])
    }
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        let Scratch::Lrn(denom) = &mut *worker.scratch else {
            return Err(Error::Storage(self.layer_type()));
        };
        let x = in_data[0];
        let area = self.shape.area();
        let coef = self.alpha / self.size as f32;
        for c in 0..self.shape.depth() {
            for j in 0..area {
                let sum: f32 = self
                    .window(c)
                    .map(|i| x[i * area + j] * x[i * area + j])
                    .sum();
                let k = c * area + j;
                denom[k] = 1. + coef * sum;
                out_data[1][k] = x[k] * denom[k].powf(-self.beta);
            }
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
        let Scratch::Lrn(denom) = &*worker.scratch else {
            return Err(Error::Storage(self.layer_type()));
        };
        backward_activation(self.activation, out_data, out_grad, worker);
        let (x, g) = (in_data[0], &out_grad[1]);
        let area = self.shape.area();
        let coef = 2. * self.alpha * self.beta / self.size as f32;
        // g * x * denom^(-beta - 1), summed by the channels that see each input
        let t: Vec<f32> = (0..x.len())
            .map(|k| g[k] * x[k] * denom[k].powf(-self.beta - 1.))
            .collect();
        for c in 0..self.shape.depth() {
            for j in 0..area {
                let k = c * area + j;
                let cross: f32 = self
                    .windows_containing(c)
                    .map(|i| t[i * area + j])
                    .sum();
                in_grad[0][k] += g[k] * denom[k].powf(-self.beta) - coef * x[k] * cross;
            }
        }
        Ok(())
    }
}
