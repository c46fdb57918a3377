//! Layer graphs.
//!
//! Layers live in an arena and are addressed by index. A connection is a
//! pair of endpoints: the consumer reads the producer's output buffer of the
//! same worker, nothing is copied.
use crate::{
    layer::{AnyLayer, Input, Layer},
    optimizer::Optimizer,
    parallel::Parallelism,
    shape::PortKind,
    storage::{LayerBuffers, Phase, Worker, WorkerState},
    weights::WeightReader,
    Error, Result,
};
use rand::{rngs::SmallRng, SeedableRng};
use std::{collections::VecDeque, io::Write};

/// A node in a [`Graph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Endpoint {
    node: usize,
    port: usize,
}

/// The gradient fed into an output node.
#[derive(Clone, Copy, Debug)]
pub(crate) enum OutputGrad<'a> {
    /// With respect to the output.
    Output(&'a [f32]),
    /// With respect to the output's pre-activation.
    PreActivation(&'a [f32]),
}

/// Builder for a general layer graph.
///
/// ```
/// # use convnet::{Graph, layer::{Concat, FullyConnected, Input}, Shape3d};
/// # fn main() -> convnet::Result<()> {
/// let mut graph = Graph::new();
/// let (left, right) = (Shape3d::new(1, 1, 2)?, Shape3d::new(1, 1, 3)?);
/// let a = graph.add(Input::new(left));
/// let b = graph.add(Input::new(right));
/// let concat = graph.add(Concat::new(vec![left, right])?);
/// let fc = graph.add(FullyConnected::from_inputs_outputs(5, 1)?);
/// graph.connect(a, 0, concat, 0)?;
/// graph.connect(b, 0, concat, 1)?;
/// graph.connect(concat, 0, fc, 0)?;
/// let nodes = graph.build(&[a, b], &[fc])?;
/// assert_eq!(nodes.len(), 4);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct Graph {
    layers: Vec<AnyLayer>,
    prev: Vec<Vec<Option<Endpoint>>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }
    /// Adds a layer.
    pub fn add(&mut self, layer: impl Into<AnyLayer>) -> NodeId {
        let layer = layer.into();
        self.prev.push(vec![None; layer.in_types().len()]);
        self.layers.push(layer);
        NodeId(self.layers.len() - 1)
    }
    /// Connects output `from_port` of `from` to input `to_port` of `to`.
    ///
    /// **Errors**
    ///
    /// Both ports must be data ports of equal size, and the input must not
    /// already be connected.
    pub fn connect(
        &mut self,
        from: NodeId,
        from_port: usize,
        to: NodeId,
        to_port: usize,
    ) -> Result<()> {
        let producer = self
            .layers
            .get(from.0)
            .ok_or_else(|| Error::Config(format!("no node {}", from.0)))?;
        let consumer = self
            .layers
            .get(to.0)
            .ok_or_else(|| Error::Config(format!("no node {}", to.0)))?;
        check_connection(producer, from_port, consumer, to_port)?;
        let slot = &mut self.prev[to.0][to_port];
        if slot.is_some() {
            return Err(Error::Config(format!(
                "input {to_port} of node {} is already connected",
                to.0
            )));
        }
        *slot = Some(Endpoint {
            node: from.0,
            port: from_port,
        });
        Ok(())
    }
    /// Sorts the graph.
    ///
    /// `inputs` receive the external inputs, in order, and `outputs` produce
    /// the results.
    ///
    /// **Errors**
    ///
    /// - Every input must have exactly one, unconnected, data port.
    /// - Every other data port must be connected.
    /// - The graph must be acyclic.
    pub fn build(self, inputs: &[NodeId], outputs: &[NodeId]) -> Result<Nodes> {
        let Self { layers, prev } = self;
        let n = layers.len();
        if inputs.is_empty() || outputs.is_empty() {
            return Err(Error::Config("graph needs inputs and outputs".into()));
        }
        for id in inputs.iter().chain(outputs) {
            if id.0 >= n {
                return Err(Error::Config(format!("no node {}", id.0)));
            }
        }
        for (id, layer) in layers.iter().enumerate() {
            let is_input = inputs.iter().any(|i| i.0 == id);
            let data_ports: Vec<usize> = layer
                .in_types()
                .iter()
                .enumerate()
                .filter_map(|(port, kind)| (*kind == PortKind::Data).then_some(port))
                .collect();
            if is_input {
                if data_ports.len() != 1 || prev[id][data_ports[0]].is_some() {
                    return Err(Error::Config(format!(
                        "input node {id} must have one unconnected data port"
                    )));
                }
            } else if let Some(port) = data_ports.iter().find(|p| prev[id][**p].is_none()) {
                return Err(Error::Config(format!(
                    "input {port} of {} node {id} is not connected",
                    layer.layer_type()
                )));
            }
        }
        // Kahn's algorithm, lowest index first
        let mut consumers = vec![Vec::new(); n];
        let mut pending = vec![0usize; n];
        for (id, ports) in prev.iter().enumerate() {
            for endpoint in ports.iter().flatten() {
                consumers[endpoint.node].push(id);
                pending[id] += 1;
            }
        }
        let mut ready: VecDeque<usize> = (0..n).filter(|id| pending[*id] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for &next in consumers[id].iter() {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != n {
            return Err(Error::Config("graph contains a cycle".into()));
        }
        Ok(Nodes {
            layers,
            prev,
            order,
            inputs: inputs.iter().map(|i| i.0).collect(),
            outputs: outputs.iter().map(|i| i.0).collect(),
            sequential: false,
        })
    }
}

fn check_connection(
    producer: &AnyLayer,
    from_port: usize,
    consumer: &AnyLayer,
    to_port: usize,
) -> Result<()> {
    let out_kind = producer.out_types().get(from_port).copied();
    let in_kind = consumer.in_types().get(to_port).copied();
    if out_kind != Some(PortKind::Data) || in_kind != Some(PortKind::Data) {
        return Err(Error::Config(format!(
            "cannot connect port {from_port} of {} to port {to_port} of {}",
            producer.layer_type(),
            consumer.layer_type()
        )));
    }
    let out_shape = producer.out_shape()[from_port];
    let in_shape = consumer.in_shape()[to_port];
    if out_shape.size() != in_shape.size() {
        return Err(Error::DimensionMismatch(format!(
            "output {from_port} of {} is {out_shape} ({} values) but input {to_port} of {} is {in_shape} ({} values)",
            producer.layer_type(),
            out_shape.size(),
            consumer.layer_type(),
            in_shape.size(),
        )));
    }
    Ok(())
}

/// A sorted layer graph.
#[derive(Clone, Debug, Default)]
pub struct Nodes {
    layers: Vec<AnyLayer>,
    prev: Vec<Vec<Option<Endpoint>>>,
    order: Vec<usize>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    sequential: bool,
}

impl Nodes {
    /// An empty chain.
    pub(crate) fn sequential() -> Self {
        Self {
            sequential: true,
            ..Self::default()
        }
    }
    /// Appends `layer` to the chain, connected to the tail.
    ///
    /// An [`Input`] is inserted before the first layer.
    pub(crate) fn push(&mut self, layer: AnyLayer) -> Result<usize> {
        if !self.sequential {
            return Err(Error::Config(
                "layers can only be appended to a sequential network".into(),
            ));
        }
        if self.layers.is_empty() {
            let shape = layer
                .in_shape()
                .first()
                .copied()
                .ok_or_else(|| Error::Config(format!("{} has no input", layer.layer_type())))?;
            self.layers.push(Input::new(shape).into());
            self.prev.push(vec![None]);
            self.order.push(0);
            self.inputs = vec![0];
        }
        let tail = self.layers.len() - 1;
        check_connection(&self.layers[tail], 0, &layer, 0)?;
        let mut prev = vec![None; layer.in_types().len()];
        prev[0] = Some(Endpoint {
            node: tail,
            port: 0,
        });
        self.layers.push(layer);
        self.prev.push(prev);
        let id = self.layers.len() - 1;
        self.order.push(id);
        self.outputs = vec![id];
        Ok(id)
    }
    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
    pub fn layer(&self, index: usize) -> Option<&AnyLayer> {
        self.layers.get(index)
    }
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut AnyLayer> {
        self.layers.get_mut(index)
    }
    pub fn iter(&self) -> impl Iterator<Item = &AnyLayer> {
        self.layers.iter()
    }
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut AnyLayer> {
        self.layers.iter_mut()
    }
    /// Input sizes, in order.
    pub fn input_sizes(&self) -> Vec<usize> {
        self.inputs
            .iter()
            .map(|&id| self.layers[id].in_shape()[0].size())
            .collect()
    }
    /// Output sizes, in order.
    pub fn output_sizes(&self) -> Vec<usize> {
        self.outputs
            .iter()
            .map(|&id| self.layers[id].out_shape()[0].size())
            .collect()
    }
    pub(crate) fn output_layers(&self) -> impl Iterator<Item = &AnyLayer> {
        self.outputs.iter().map(|&id| &self.layers[id])
    }
    /// Allocates a worker.
    pub(crate) fn new_worker(&self, seed: u64) -> Worker {
        Worker::new(self.layers.iter(), seed)
    }
    /// Whether `worker` was allocated for these layers.
    pub(crate) fn fits(&self, worker: &Worker) -> bool {
        worker.buffers.len() == self.layers.len()
            && worker
                .buffers
                .iter()
                .zip(self.layers.iter())
                .all(|(buffers, layer)| {
                    buffers
                        .out_data
                        .iter()
                        .map(Vec::len)
                        .eq(layer.out_shape().iter().map(|s| s.size()))
                })
    }
    fn gather<'a>(
        &'a self,
        id: usize,
        buffers: &'a [LayerBuffers],
        inputs: &[&'a [f32]],
    ) -> Result<Vec<&'a [f32]>> {
        let layer = &self.layers[id];
        let mut params = layer.parameters().into_iter();
        layer
            .in_types()
            .iter()
            .enumerate()
            .map(|(port, kind)| {
                if kind.is_trainable() {
                    params.next().ok_or(Error::Storage(layer.layer_type()))
                } else if let Some(endpoint) = self.prev[id][port] {
                    Ok(buffers[endpoint.node].out_data[endpoint.port].as_slice())
                } else {
                    self.inputs
                        .iter()
                        .position(|&i| i == id)
                        .and_then(|k| inputs.get(k).copied())
                        .ok_or_else(|| {
                            Error::Data(format!("missing input for {} node {id}", layer.layer_type()))
                        })
                }
            })
            .collect()
    }
    /// Runs the forward pass of every layer for one sample.
    pub(crate) fn forward(
        &self,
        worker: &mut Worker,
        phase: Phase,
        parallelism: Parallelism,
        inputs: &[&[f32]],
    ) -> Result<()> {
        for &id in self.order.iter() {
            let mut own = std::mem::take(&mut worker.buffers[id]);
            let result = (|| -> Result<()> {
                let in_data = self.gather(id, &worker.buffers, inputs)?;
                own.out_grad.iter_mut().for_each(|g| g.fill(0.));
                let LayerBuffers {
                    out_data, scratch, ..
                } = &mut own;
                let mut state = WorkerState {
                    phase,
                    parallelism,
                    rng: &mut worker.rng,
                    scratch,
                    delta_ready: false,
                };
                self.layers[id].forward_propagation(&in_data, out_data, &mut state)
            })();
            worker.buffers[id] = own;
            result?;
        }
        Ok(())
    }
    /// Outputs of the last forward pass.
    pub(crate) fn outputs<'w>(&self, worker: &'w Worker) -> Vec<&'w [f32]> {
        self.outputs
            .iter()
            .map(|&id| worker.buffers[id].out_data[0].as_slice())
            .collect()
    }
    /// Output of node `index` from the last forward pass.
    pub(crate) fn output_of<'w>(&self, worker: &'w Worker, index: usize) -> Option<&'w [f32]> {
        worker
            .buffers
            .get(index)
            .and_then(|b| b.out_data.first())
            .map(Vec::as_slice)
    }
    /// Runs the backward pass of every layer, after [`forward`](Self::forward)
    /// with the same inputs.
    ///
    /// Parameter gradients accumulate in the worker until
    /// [`update_weights`](Self::update_weights).
    pub(crate) fn backward(
        &self,
        worker: &mut Worker,
        phase: Phase,
        parallelism: Parallelism,
        inputs: &[&[f32]],
        grads: &[OutputGrad],
    ) -> Result<()> {
        let mut delta_ready = vec![false; self.layers.len()];
        for (&id, grad) in self.outputs.iter().zip(grads) {
            let out_grad = &mut worker.buffers[id].out_grad;
            let (port, grad) = match grad {
                OutputGrad::Output(grad) => (0, grad),
                OutputGrad::PreActivation(grad) => {
                    delta_ready[id] = true;
                    (1, grad)
                }
            };
            let target = out_grad
                .get_mut(port)
                .filter(|g| g.len() == grad.len())
                .ok_or_else(|| Error::Data("output gradient dimension mismatch".into()))?;
            target.copy_from_slice(grad);
        }
        for &id in self.order.iter().rev() {
            let mut own = std::mem::take(&mut worker.buffers[id]);
            let result = (|| -> Result<()> {
                let layer = &self.layers[id];
                for (grad, kind) in own.in_grad.iter_mut().zip(layer.in_types()) {
                    if !kind.is_trainable() {
                        grad.fill(0.);
                    }
                }
                {
                    let in_data = self.gather(id, &worker.buffers, inputs)?;
                    let LayerBuffers {
                        out_data,
                        out_grad,
                        in_grad,
                        scratch,
                    } = &mut own;
                    let mut state = WorkerState {
                        phase,
                        parallelism,
                        rng: &mut worker.rng,
                        scratch,
                        delta_ready: delta_ready[id],
                    };
                    layer.back_propagation(&in_data, out_data, out_grad, in_grad, &mut state)?;
                }
                for (port, endpoint) in self.prev[id].iter().enumerate() {
                    if let Some(endpoint) = endpoint {
                        let target = &mut worker.buffers[endpoint.node].out_grad[endpoint.port];
                        for (g, d) in target.iter_mut().zip(&own.in_grad[port]) {
                            *g += d;
                        }
                    }
                }
                Ok(())
            })();
            worker.buffers[id] = own;
            result?;
        }
        Ok(())
    }
    /// Zeroes the parameter gradients of `worker`.
    pub(crate) fn clear_grads(&self, worker: &mut Worker) {
        for (buffers, layer) in worker.buffers.iter_mut().zip(self.layers.iter()) {
            for port in layer.trainable_ports() {
                buffers.in_grad[port].fill(0.);
            }
        }
    }
    /// Merges the gradients of `workers` and steps `optimizer`.
    pub(crate) fn update_weights(
        &mut self,
        optimizer: &mut dyn Optimizer,
        workers: &mut [Worker],
        batch_size: usize,
    ) {
        for (id, layer) in self.layers.iter_mut().enumerate() {
            if layer.trainable_ports().is_empty() {
                continue;
            }
            let mut grads: Vec<&mut [Vec<f32>]> = workers
                .iter_mut()
                .map(|w| w.buffers[id].in_grad.as_mut_slice())
                .collect();
            layer.update_weight(id, optimizer, &mut grads, batch_size);
        }
    }
    /// Initializes layer `id` from `seed + id`.
    pub(crate) fn init_layer(&mut self, id: usize, seed: u64) {
        if let Some(layer) = self.layers.get_mut(id) {
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(id as u64));
            layer.init_weight(&mut rng);
        }
    }
    /// Initializes every layer.
    pub(crate) fn init_weight(&mut self, seed: u64) {
        for id in 0..self.layers.len() {
            self.init_layer(id, seed);
        }
    }
    pub(crate) fn is_exploded(&self) -> bool {
        self.layers.iter().any(|l| l.is_exploded())
    }
    pub(crate) fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.parameter_count()).sum()
    }
    pub(crate) fn save(&self, writer: &mut dyn Write) -> Result<()> {
        for layer in self.layers.iter() {
            layer.save(writer)?;
        }
        Ok(())
    }
    pub(crate) fn load(&mut self, reader: &mut WeightReader) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.load(reader)?;
        }
        Ok(())
    }
}
