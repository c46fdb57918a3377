use super::Layer;
use crate::{
    shape::{PortKind, Shape3d},
    storage::{Phase, Scratch, WorkerState},
    Error, Result,
};
use rand::Rng;
use rand_distr::{Bernoulli, Distribution};

/// A stochastic filter applied to a layer's output.
#[derive(Clone, Copy, Debug)]
pub enum Filter {
    /// Zeroes each unit with probability `rate` while training, scaling the
    /// kept units by `1 / (1 - rate)`.
    Dropout { rate: f32, keep: Bernoulli },
}

impl Filter {
    /// A dropout filter.
    ///
    /// **Errors**
    ///
    /// The rate must be in `[0, 1)`.
    pub fn dropout(rate: f32) -> Result<Self> {
        if !(0. ..1.).contains(&rate) {
            return Err(Error::Config(format!(
                "dropout rate {rate} is not in [0, 1)"
            )));
        }
        let keep = Bernoulli::new(1. - rate as f64)
            .map_err(|e| Error::Config(format!("dropout rate {rate}: {e}")))?;
        Ok(Self::Dropout { rate, keep })
    }
    pub fn rate(&self) -> f32 {
        match self {
            Self::Dropout { rate, .. } => *rate,
        }
    }
    fn scale(&self) -> f32 {
        1. / (1. - self.rate())
    }
    /// Samples a mask and applies it to `values`.
    pub(crate) fn forward<R: Rng + ?Sized>(
        &self,
        phase: Phase,
        rng: &mut R,
        values: &mut [f32],
        mask: &mut [bool],
    ) {
        let Self::Dropout { keep, .. } = self;
        if phase == Phase::Train {
            let scale = self.scale();
            for (x, m) in values.iter_mut().zip(mask.iter_mut()) {
                *m = keep.sample(rng);
                *x = if *m { *x * scale } else { 0. };
            }
        } else {
            mask.fill(true);
        }
    }
    /// Applies the mask of the last forward pass to `grad`.
    pub(crate) fn backward(&self, phase: Phase, mask: &[bool], grad: &mut [f32]) {
        if phase == Phase::Train {
            let scale = self.scale();
            for (g, m) in grad.iter_mut().zip(mask) {
                *g = if *m { *g * scale } else { 0. };
            }
        }
    }
}

/// Dropout.
#[derive(Clone, Debug)]
pub struct Dropout {
    shape: Shape3d,
    filter: Filter,
}

impl Dropout {
    /// Dropout of `rate` over `shape`.
    ///
    /// **Errors**
    ///
    /// See [`Filter::dropout`].
    pub fn new(shape: Shape3d, rate: f32) -> Result<Self> {
        Ok(Self {
            shape,
            filter: Filter::dropout(rate)?,
        })
    }
    pub fn rate(&self) -> f32 {
        self.filter.rate()
    }
}

impl Layer for Dropout {
    fn layer_type(&self) -> &'static str {
        "dropout"
    }
    fn in_types(&self) -> Vec<PortKind> {
        vec![PortKind::Data]
    }
    fn out_types(&self) -> Vec<PortKind> {
        vec![PortKind::Data]
    }
    fn in_shape(&self) -> Vec<Shape3d> {
        vec![self.shape]
    }
    fn out_shape(&self) -> Vec<Shape3d> {
        vec![self.shape]
    }
    fn new_scratch(&self) -> Scratch {
        Scratch::Mask(vec![true; self.shape.size()])
    }
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        let Scratch::Mask(mask) = &mut *worker.scratch else {
            return Err(Error::Storage(self.layer_type()));
        };
        out_data[0].copy_from_slice(in_data[0]);
        self.filter
            .forward(worker.phase, &mut *worker.rng, &mut out_data[0], mask);
        Ok(())
    }
    fn back_propagation(
        &self,
        _in_data: &[&[f32]],
        _out_data: &[Vec<f32>],
        out_grad: &mut [Vec<f32>],
        in_grad: &mut [Vec<f32>],
        worker: &mut WorkerState,
    ) -> Result<()> {
        let Scratch::Mask(mask) = &*worker.scratch else {
            return Err(Error::Storage(self.layer_type()));
        };
        in_grad[0].copy_from_slice(&out_grad[0]);
        self.filter.backward(worker.phase, mask, &mut in_grad[0]);
        Ok(())
    }
}
