use super::Layer;
use crate::{
    shape::{PortKind, Shape3d},
    storage::WorkerState,
    Result,
};

/// Passes its input through unchanged.
///
/// Every sequential network starts with one.
#[derive(Clone, Debug)]
pub struct Input {
    shape: Shape3d,
}

impl Input {
    pub fn new(shape: Shape3d) -> Self {
        Self { shape }
    }
}

impl Layer for Input {
    fn layer_type(&self) -> &'static str {
        "input"
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
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        _worker: &mut WorkerState,
    ) -> Result<()> {
        out_data[0].copy_from_slice(in_data[0]);
        Ok(())
    }
    fn back_propagation(
        &self,
        _in_data: &[&[f32]],
        _out_data: &[Vec<f32>],
        out_grad: &mut [Vec<f32>],
        in_grad: &mut [Vec<f32>],
        _worker: &mut WorkerState,
    ) -> Result<()> {
        in_grad[0].copy_from_slice(&out_grad[0]);
        Ok(())
    }
}
