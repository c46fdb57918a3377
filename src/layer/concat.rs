use super::Layer;
use crate::{
    shape::{PortKind, Shape3d},
    storage::WorkerState,
    Error, Result,
};

/// Joins its inputs along depth.
#[derive(Clone, Debug)]
pub struct Concat {
    in_shapes: Vec<Shape3d>,
    out_shape: Shape3d,
}

impl Concat {
    /// Concatenates inputs of `in_shapes`.
    ///
    /// **Errors**
    ///
    /// There must be at least one input, and every input must have the same
    /// width and height.
    pub fn new(in_shapes: Vec<Shape3d>) -> Result<Self> {
        let first = *in_shapes
            .first()
            .ok_or_else(|| Error::Config("concat needs at least one input".into()))?;
        let mut depth = 0;
        for shape in in_shapes.iter() {
            if shape.width() != first.width() || shape.height() != first.height() {
                return Err(Error::DimensionMismatch(format!(
                    "concat inputs {first} and {shape} differ in width x height"
                )));
            }
            depth += shape.depth();
        }
        let out_shape = Shape3d::new(first.width(), first.height(), depth)?;
        Ok(Self {
            in_shapes,
            out_shape,
        })
    }
}

impl Layer for Concat {
    fn layer_type(&self) -> &'static str {
        "concat"
    }
    fn in_types(&self) -> Vec<PortKind> {
        vec![PortKind::Data; self.in_shapes.len()]
    }
    fn out_types(&self) -> Vec<PortKind> {
        vec![PortKind::Data]
    }
    fn in_shape(&self) -> Vec<Shape3d> {
        self.in_shapes.clone()
    }
    fn out_shape(&self) -> Vec<Shape3d> {
        vec![self.out_shape]
    }
    fn forward_propagation(
        &self,
        in_data: &[&[f32]],
        out_data: &mut [Vec<f32>],
        _worker: &mut WorkerState,
    ) -> Result<()> {
        let mut offset = 0;
        for x in in_data {
            out_data[0][offset..offset + x.len()].copy_from_slice(x);
            offset += x.len();
        }
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
        let mut offset = 0;
        for prev in in_grad.iter_mut() {
            let len = prev.len();
            prev.copy_from_slice(&out_grad[0][offset..offset + len]);
            offset += len;
        }
        Ok(())
    }
}
