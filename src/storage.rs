//! Per worker storage.
//!
//! Weights and biases live in their layer and are shared by every worker.
//! Everything a forward or backward pass writes lives here, one copy per
//! worker, so that workers never touch each other's buffers.

use crate::{layer::Layer, parallel::Parallelism};
use rand::rngs::SmallRng;
use rand::SeedableRng;

/// Whether the network is training or inferring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    Train,
    #[default]
    Test,
}

/// Layer specific state produced by the forward pass and consumed by the
/// backward pass.
#[derive(Clone, Debug, Default)]
pub enum Scratch {
    #[default]
    None,
    /// Input index that produced each output.
    MaxIndices(Vec<usize>),
    /// Kept units.
    Mask(Vec<bool>),
    /// Padded input and padded input delta.
    Padded { input: Vec<f32>, delta: Vec<f32> },
    /// Normalization denominators, before the power.
    Lrn(Vec<f32>),
}

/// The buffers of one layer for one worker.
///
/// `in_grad` holds one buffer per input port, including weight and bias
/// ports, where the parameter gradients accumulate until the next update.
#[derive(Clone, Debug, Default)]
pub struct LayerBuffers {
    pub out_data: Vec<Vec<f32>>,
    pub out_grad: Vec<Vec<f32>>,
    pub in_grad: Vec<Vec<f32>>,
    pub scratch: Scratch,
}

impl LayerBuffers {
    /// Allocates zeroed buffers sized for `layer`.
    pub fn new<L: Layer + ?Sized>(layer: &L) -> Self {
        let zeros = |shapes: Vec<crate::Shape3d>| -> Vec<Vec<f32>> {
            shapes.iter().map(|s| vec![0.; s.size()]).collect()
        };
        Self {
            out_data: zeros(layer.out_shape()),
            out_grad: zeros(layer.out_shape()),
            in_grad: zeros(layer.in_shape()),
            scratch: layer.new_scratch(),
        }
    }
}

/// One execution lane.
#[derive(Clone, Debug)]
pub(crate) struct Worker {
    pub(crate) rng: SmallRng,
    pub(crate) buffers: Vec<LayerBuffers>,
}

impl Worker {
    pub(crate) fn new<'a, L: Layer + 'a>(layers: impl IntoIterator<Item = &'a L>, seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            buffers: layers.into_iter().map(|l| LayerBuffers::new(l)).collect(),
        }
    }
}

/// What a layer sees of its worker during a pass.
pub struct WorkerState<'a> {
    pub phase: Phase,
    pub parallelism: Parallelism,
    pub rng: &'a mut SmallRng,
    pub scratch: &'a mut Scratch,
    /// `out_grad[1]` already holds the pre-activation gradient.
    pub(crate) delta_ready: bool,
}

impl<'a> WorkerState<'a> {
    pub fn new(phase: Phase, rng: &'a mut SmallRng, scratch: &'a mut Scratch) -> Self {
        Self {
            phase,
            parallelism: Parallelism::serial(),
            rng,
            scratch,
            delta_ready: false,
        }
    }
}
