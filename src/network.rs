//! Networks.
//!
//! A [`Network`] owns its layers and an optimizer. Inference runs on a single
//! worker; training partitions each batch across a pool of workers, merges
//! their gradients, and steps the optimizer once per batch.
use crate::{
    layer::{AnyLayer, Layer},
    loss::Loss,
    nodes::{Nodes, OutputGrad},
    optimizer::{Optimizer, Sgd},
    parallel::{partition, Parallelism},
    storage::{Phase, Worker},
    weights::WeightReader,
    Error, Graph, NodeId, Result, WeightInit,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};

mod config;
mod result;

pub use config::{builder, TrainConfig};
pub use result::TestResult;

/// A training signal.
///
/// Class labels are expanded to vectors of the output activation's
/// [`scale`](crate::Activation::scale), vectors are used as is.
pub trait Target: Sync {
    /// Checks that the target fits `out_dim` outputs.
    ///
    /// **Errors**
    ///
    /// Returns [`Error::Data`] if it doesn't.
    fn check(&self, out_dim: usize) -> Result<()>;
    /// The target vector.
    fn to_vector(&self, out_dim: usize, scale: (f32, f32)) -> Vec<f32>;
}

impl Target for usize {
    fn check(&self, out_dim: usize) -> Result<()> {
        if *self < out_dim {
            Ok(())
        } else {
            Err(Error::Data(format!(
                "output dimension mismatch: label {self} with {out_dim} outputs"
            )))
        }
    }
    fn to_vector(&self, out_dim: usize, (min, max): (f32, f32)) -> Vec<f32> {
        let mut t = vec![min; out_dim];
        t[*self] = max;
        t
    }
}

impl Target for Vec<f32> {
    fn check(&self, out_dim: usize) -> Result<()> {
        if self.len() == out_dim {
            Ok(())
        } else {
            Err(Error::Data(format!(
                "output dimension mismatch: target has {} values for {out_dim} outputs",
                self.len()
            )))
        }
    }
    fn to_vector(&self, _out_dim: usize, _scale: (f32, f32)) -> Vec<f32> {
        self.clone()
    }
}

/// Where training is, passed to the callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    /// The current epoch, starting at 0.
    pub epoch: usize,
    /// The current batch of the epoch, starting at 0.
    pub batch: usize,
    /// Samples processed this epoch.
    pub processed: usize,
}

/// How [`Network::train`] ended.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainStatus {
    /// Every epoch ran.
    Completed,
    /// A parameter became non-finite and training stopped.
    Exploded,
}

impl TrainStatus {
    pub fn is_completed(&self) -> bool {
        *self == Self::Completed
    }
}

/// Which elements [`Network::gradient_check`] checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GradCheck {
    All,
    /// 10 random elements of every parameter.
    Random,
}

/// State of one [`Network::train`] call.
struct TrainingContext {
    pool: ThreadPool,
    workers: Vec<Worker>,
    parallelism: Parallelism,
}

impl TrainingContext {
    fn new(nodes: &Nodes, config: &TrainConfig) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_count())
            .build()?;
        let mut rng = SmallRng::seed_from_u64(config.seed());
        let workers = (0..config.worker_count())
            .map(|_| nodes.new_worker(rng.gen()))
            .collect();
        let parallelism = Parallelism::new(
            config.batch_size() < config.worker_count(),
            config.grain_size(),
        );
        Ok(Self {
            pool,
            workers,
            parallelism,
        })
    }
}

/// A neural network.
///
/// ```
/// # use convnet::{Network, Loss, Activation, optimizer::Sgd, layer::FullyConnected};
/// # fn main() -> convnet::Result<()> {
/// let mut network = Network::new(Loss::Mse, Sgd::default());
/// network.add(FullyConnected::from_inputs_outputs(2, 3)?.with_activation(Activation::Tanh))?;
/// network.add(FullyConnected::from_inputs_outputs(3, 1)?)?;
/// let y = network.predict(&[0.5, -0.5])?;
/// assert_eq!(y.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Network<O = Sgd> {
    name: String,
    loss: Loss,
    optimizer: O,
    nodes: Nodes,
    seed: u64,
    grain_size: usize,
    worker: Option<Worker>,
}

impl<O: Optimizer> Network<O> {
    /// An empty sequential network.
    pub fn new(loss: Loss, optimizer: O) -> Self {
        Self {
            name: String::new(),
            loss,
            optimizer,
            nodes: Nodes::sequential(),
            seed: 0,
            grain_size: 1,
            worker: None,
        }
    }
    /// A network of a built [`Graph`].
    ///
    /// **Errors**
    ///
    /// See [`Graph::build`].
    pub fn from_graph(
        graph: Graph,
        inputs: &[NodeId],
        outputs: &[NodeId],
        loss: Loss,
        optimizer: O,
    ) -> Result<Self> {
        let mut network = Self::new(loss, optimizer);
        network.nodes = graph.build(inputs, outputs)?;
        network.nodes.init_weight(network.seed);
        Ok(network)
    }
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    /// Sets the seed of weight initialization and re-initializes.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.nodes.init_weight(seed);
        self
    }
    /// Sets the minimum channels per task of inference.
    pub fn with_grain_size(mut self, grain_size: usize) -> Self {
        self.grain_size = grain_size.max(1);
        self
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn loss(&self) -> Loss {
        self.loss
    }
    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }
    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }
    /// Appends `layer`, connected to the current tail.
    ///
    /// The first call also inserts an [`Input`](crate::layer::Input). The
    /// layer is initialized from the network seed.
    ///
    /// **Errors**
    ///
    /// - The layer's input size must equal the tail's output size.
    /// - Layers can't be appended to a graph network.
    pub fn add(&mut self, layer: impl Into<AnyLayer>) -> Result<()> {
        let id = self.nodes.push(layer.into())?;
        self.nodes.init_layer(id, self.seed);
        self.worker = None;
        Ok(())
    }
    /// Number of layers, the input layer included.
    pub fn depth(&self) -> usize {
        self.nodes.len()
    }
    pub fn layer(&self, index: usize) -> Option<&AnyLayer> {
        self.nodes.layer(index)
    }
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut AnyLayer> {
        self.nodes.layer_mut(index)
    }
    pub fn layers(&self) -> impl Iterator<Item = &AnyLayer> {
        self.nodes.iter()
    }
    /// Size of the single input.
    ///
    /// **Errors**
    ///
    /// If the network is empty or has several inputs.
    pub fn in_dim(&self) -> Result<usize> {
        single(self.nodes.input_sizes(), "input")
    }
    /// Size of the single output.
    ///
    /// **Errors**
    ///
    /// If the network is empty or has several outputs.
    pub fn out_dim(&self) -> Result<usize> {
        single(self.nodes.output_sizes(), "output")
    }
    /// Re-initializes every layer from the network seed.
    pub fn init_weight(&mut self) {
        self.nodes.init_weight(self.seed);
    }
    /// Sets the weight initializer of every layer and re-initializes.
    ///
    /// **Errors**
    ///
    /// See [`WeightInit::validate`].
    pub fn set_weight_init(&mut self, init: WeightInit) -> Result<()> {
        init.validate()?;
        for layer in self.nodes.iter_mut() {
            layer.set_weight_init(init);
        }
        self.init_weight();
        Ok(())
    }
    /// Sets the bias initializer of every layer and re-initializes.
    ///
    /// **Errors**
    ///
    /// See [`WeightInit::validate`].
    pub fn set_bias_init(&mut self, init: WeightInit) -> Result<()> {
        init.validate()?;
        for layer in self.nodes.iter_mut() {
            layer.set_bias_init(init);
        }
        self.init_weight();
        Ok(())
    }
    /// Runs every input through the network.
    ///
    /// **Errors**
    ///
    /// There must be one input per network input, each of the network's
    /// input size.
    pub fn predict_multi(&mut self, inputs: &[&[f32]]) -> Result<Vec<Vec<f32>>> {
        let sizes = self.nodes.input_sizes();
        if sizes.is_empty() {
            return Err(Error::Config("network has no layers".into()));
        }
        if inputs.len() != sizes.len() {
            return Err(Error::Data(format!(
                "input dimension mismatch: {} inputs for {} network inputs",
                inputs.len(),
                sizes.len()
            )));
        }
        for (input, size) in inputs.iter().zip(sizes) {
            check_input(input, size)?;
        }
        let parallelism = Parallelism::new(true, self.grain_size);
        let Self {
            nodes,
            worker,
            seed,
            ..
        } = self;
        if !worker.as_ref().is_some_and(|worker| nodes.fits(worker)) {
            *worker = None;
        }
        let worker = worker.get_or_insert_with(|| nodes.new_worker(*seed));
        nodes.forward(worker, Phase::Test, parallelism, inputs)?;
        Ok(nodes.outputs(worker).into_iter().map(<[f32]>::to_vec).collect())
    }
    /// Runs `input` through a single input single output network.
    ///
    /// **Errors**
    ///
    /// See [`predict_multi`](Self::predict_multi).
    pub fn predict(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let outputs = self.predict_multi(&[input])?;
        outputs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config("network has no outputs".into()))
    }
    /// Index of the largest output, the first on ties.
    pub fn predict_label(&mut self, input: &[f32]) -> Result<usize> {
        Ok(max_index(&self.predict(input)?))
    }
    /// Value of the largest output.
    pub fn predict_max_value(&mut self, input: &[f32]) -> Result<f32> {
        Ok(self
            .predict(input)?
            .into_iter()
            .fold(f32::NEG_INFINITY, f32::max))
    }
    /// Output of layer `index` from the last prediction.
    pub fn layer_output(&self, index: usize) -> Option<&[f32]> {
        self.worker
            .as_ref()
            .and_then(|worker| self.nodes.output_of(worker, index))
    }
    /// Validates training data.
    ///
    /// **Errors**
    ///
    /// - There must be as many inputs as targets.
    /// - Every input must have the network's input size.
    /// - Every target must fit the network's output size.
    pub fn check_training_data<T: Target>(&self, inputs: &[Vec<f32>], targets: &[T]) -> Result<()> {
        let in_dim = self.in_dim()?;
        let out_dim = self.out_dim()?;
        if inputs.len() != targets.len() {
            return Err(Error::Data(
                "number of training data must be equal to label data".into(),
            ));
        }
        for (input, target) in inputs.iter().zip(targets) {
            check_input(input, in_dim)?;
            target.check(out_dim)?;
        }
        Ok(())
    }
    fn target_vectors<T: Target>(&self, targets: &[T]) -> Result<Vec<Vec<f32>>> {
        let out_dim = self.out_dim()?;
        let scale = self
            .nodes
            .output_layers()
            .next()
            .map(|layer| layer.activation().scale())
            .unwrap_or((0., 1.));
        Ok(targets.iter().map(|t| t.to_vector(out_dim, scale)).collect())
    }
    /// Trains the network.
    ///
    /// Every epoch walks `inputs` in batches of the configured size. Each
    /// batch is split across the workers, whose gradients are then merged into
    /// one optimizer step. `on_batch` runs after every batch, `on_epoch` after
    /// every epoch.
    ///
    /// Training stops with [`TrainStatus::Exploded`] when a parameter becomes
    /// non-finite, checked every
    /// [`explosion_check_interval`](TrainConfig::explosion_check_interval)
    /// batches and at the end of every epoch.
    ///
    /// **Errors**
    ///
    /// See [`check_training_data`](Self::check_training_data). Nothing runs
    /// if the data is invalid.
    pub fn train<T, B, E>(
        &mut self,
        inputs: &[Vec<f32>],
        targets: &[T],
        config: &TrainConfig,
        mut on_batch: B,
        mut on_epoch: E,
    ) -> Result<TrainStatus>
    where
        T: Target,
        B: FnMut(&mut Self, Progress),
        E: FnMut(&mut Self, Progress),
    {
        config.validate()?;
        self.check_training_data(inputs, targets)?;
        let targets = self.target_vectors(targets)?;
        let mut context = TrainingContext::new(&self.nodes, config)?;
        if config.reset_weights() {
            self.init_weight();
        }
        self.optimizer.reset();
        let batch_size = config.batch_size();
        for epoch in 0..config.epochs() {
            let mut processed = 0;
            for (batch, start) in (0..inputs.len()).step_by(batch_size).enumerate() {
                let end = (start + batch_size).min(inputs.len());
                self.train_once(&mut context, &inputs[start..end], &targets[start..end])?;
                processed = end;
                on_batch(
                    &mut *self,
                    Progress {
                        epoch,
                        batch,
                        processed,
                    },
                );
                if (batch + 1) % config.explosion_check_interval() == 0 && self.nodes.is_exploded()
                {
                    log::warn!("non-finite parameter in epoch {epoch}, stopped training");
                    return Ok(TrainStatus::Exploded);
                }
            }
            if self.nodes.is_exploded() {
                log::warn!("non-finite parameter in epoch {epoch}, stopped training");
                return Ok(TrainStatus::Exploded);
            }
            log::debug!(
                "{} epoch {}/{} finished, {processed} samples",
                self.name,
                epoch + 1,
                config.epochs()
            );
            on_epoch(
                &mut *self,
                Progress {
                    epoch,
                    batch: (inputs.len() + batch_size - 1) / batch_size,
                    processed,
                },
            );
        }
        Ok(TrainStatus::Completed)
    }
    /// [`train`](Self::train) without callbacks.
    pub fn fit<T: Target>(
        &mut self,
        inputs: &[Vec<f32>],
        targets: &[T],
        config: &TrainConfig,
    ) -> Result<TrainStatus> {
        self.train(inputs, targets, config, |_, _| {}, |_, _| {})
    }
    fn train_once(
        &mut self,
        context: &mut TrainingContext,
        inputs: &[Vec<f32>],
        targets: &[Vec<f32>],
    ) -> Result<()> {
        if !context.workers.iter().all(|worker| self.nodes.fits(worker)) {
            return Err(Error::Config("network changed during training".into()));
        }
        let TrainingContext {
            pool,
            workers,
            parallelism,
        } = context;
        let nodes = &self.nodes;
        let loss = self.loss;
        let parallelism = *parallelism;
        let ranges = partition(inputs.len(), workers.len());
        pool.install(|| {
            workers
                .par_iter_mut()
                .zip(ranges)
                .try_for_each(|(worker, range)| -> Result<()> {
                    for i in range {
                        forward_backward(
                            nodes,
                            loss,
                            worker,
                            Phase::Train,
                            parallelism,
                            &inputs[i],
                            &targets[i],
                        )?;
                    }
                    Ok(())
                })
        })?;
        self.nodes
            .update_weights(&mut self.optimizer, workers, inputs.len());
        Ok(())
    }
    /// Classifies every input and compares with `labels`.
    ///
    /// **Errors**
    ///
    /// See [`check_training_data`](Self::check_training_data).
    pub fn test(&mut self, inputs: &[Vec<f32>], labels: &[usize]) -> Result<TestResult> {
        self.check_training_data(inputs, labels)?;
        let mut result = TestResult::default();
        for (input, actual) in inputs.iter().zip(labels) {
            let predicted = self.predict_label(input)?;
            result.record(predicted, *actual);
        }
        Ok(result)
    }
    /// Predictions for every input, computed in parallel.
    ///
    /// **Errors**
    ///
    /// Every input must have the network's input size.
    pub fn test_regression(&self, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let in_dim = self.in_dim()?;
        for input in inputs {
            check_input(input, in_dim)?;
        }
        let nodes = &self.nodes;
        let seed = self.seed;
        inputs
            .par_iter()
            .map_init(
                || nodes.new_worker(seed),
                |worker, input| -> Result<Vec<f32>> {
                    nodes.forward(worker, Phase::Test, Parallelism::serial(), &[input.as_slice()])?;
                    Ok(nodes.outputs(worker)[0].to_vec())
                },
            )
            .collect()
    }
    /// Summed loss over every sample.
    ///
    /// **Errors**
    ///
    /// See [`check_training_data`](Self::check_training_data).
    pub fn get_loss<T: Target>(&mut self, inputs: &[Vec<f32>], targets: &[T]) -> Result<f32> {
        self.check_training_data(inputs, targets)?;
        let targets = self.target_vectors(targets)?;
        let mut total = 0.;
        for (input, target) in inputs.iter().zip(targets.iter()) {
            let y = self.predict(input)?;
            total += self.loss.loss(&y, target);
        }
        Ok(total)
    }
    /// Compares back propagated gradients against centered differences.
    ///
    /// Returns whether every checked element of every weight and bias is
    /// within `tolerance` of `(E(w + h) - E(w - h)) / 2h`, with `E` summed over
    /// the samples.
    ///
    /// **Errors**
    ///
    /// See [`check_training_data`](Self::check_training_data).
    pub fn gradient_check<T: Target>(
        &mut self,
        inputs: &[Vec<f32>],
        targets: &[T],
        tolerance: f32,
        mode: GradCheck,
    ) -> Result<bool> {
        const STEP: f32 = 5e-3;
        self.check_training_data(inputs, targets)?;
        let targets = self.target_vectors(targets)?;
        let mut worker = self.nodes.new_worker(self.seed);
        let parallelism = Parallelism::serial();
        self.nodes.clear_grads(&mut worker);
        for (input, target) in inputs.iter().zip(targets.iter()) {
            forward_backward(
                &self.nodes,
                self.loss,
                &mut worker,
                Phase::Test,
                parallelism,
                input,
                target,
            )?;
        }
        let mut rng = SmallRng::seed_from_u64(self.seed);
        for id in 0..self.nodes.len() {
            let (ports, sizes) = match self.nodes.layer(id) {
                Some(layer) => (
                    layer.trainable_ports(),
                    layer.parameters().iter().map(|p| p.len()).collect::<Vec<_>>(),
                ),
                None => continue,
            };
            for (index, (port, len)) in ports.into_iter().zip(sizes).enumerate() {
                if len == 0 {
                    continue;
                }
                let elements: Vec<usize> = match mode {
                    GradCheck::All => (0..len).collect(),
                    GradCheck::Random => (0..10).map(|_| rng.gen_range(0..len)).collect(),
                };
                for i in elements {
                    let analytic = worker.buffers[id].in_grad[port][i];
                    let value = self.parameter(id, index, i);
                    self.set_parameter(id, index, i, value + STEP);
                    let plus = self.total_loss(&mut worker, inputs, &targets)?;
                    self.set_parameter(id, index, i, value - STEP);
                    let minus = self.total_loss(&mut worker, inputs, &targets)?;
                    self.set_parameter(id, index, i, value);
                    let numeric = (plus - minus) / (2. * STEP as f64);
                    if (analytic as f64 - numeric).abs() > tolerance as f64 {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }
    fn parameter(&self, id: usize, index: usize, i: usize) -> f32 {
        self.nodes
            .layer(id)
            .and_then(|layer| layer.parameters().get(index).and_then(|p| p.get(i)).copied())
            .unwrap_or(0.)
    }
    fn set_parameter(&mut self, id: usize, index: usize, i: usize, value: f32) {
        if let Some(layer) = self.nodes.layer_mut(id) {
            if let Some(x) = layer
                .parameters_mut()
                .into_iter()
                .nth(index)
                .and_then(|p| p.get_mut(i))
            {
                *x = value;
            }
        }
    }
    fn total_loss(
        &self,
        worker: &mut Worker,
        inputs: &[Vec<f32>],
        targets: &[Vec<f32>],
    ) -> Result<f64> {
        let mut total = 0f64;
        for (input, target) in inputs.iter().zip(targets) {
            self.nodes
                .forward(worker, Phase::Test, Parallelism::serial(), &[input.as_slice()])?;
            let y = self.nodes.outputs(worker)[0];
            total += y
                .iter()
                .zip(target)
                .map(|(y, t)| self.loss.f(*y, *t) as f64)
                .sum::<f64>();
        }
        Ok(total)
    }
    /// Whether both networks have the same layer types and parameters within
    /// `eps`.
    pub fn has_same_weights<O2: Optimizer>(&self, other: &Network<O2>, eps: f32) -> bool {
        self.nodes.len() == other.nodes.len()
            && self.nodes.iter().zip(other.nodes.iter()).all(|(a, b)| {
                let (pa, pb) = (a.parameters(), b.parameters());
                a.layer_type() == b.layer_type()
                    && pa.len() == pb.len()
                    && pa.iter().zip(pb.iter()).all(|(pa, pb)| {
                        pa.len() == pb.len()
                            && pa.iter().zip(pb.iter()).all(|(x, y)| (x - y).abs() <= eps)
                    })
            })
    }
    /// Writes every parameter as text, layer by layer, weight then bias.
    ///
    /// **Errors**
    ///
    /// If writing fails.
    pub fn save(&self, mut writer: impl Write) -> Result<()> {
        self.nodes.save(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
    /// Reads parameters written by [`save`](Self::save) into a network of the
    /// same topology.
    ///
    /// **Errors**
    ///
    /// If reading fails, a value doesn't parse, or the stream is too short.
    pub fn load(&mut self, mut reader: impl Read) -> Result<()> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        let mut values = WeightReader::new(&text, self.nodes.parameter_count());
        self.nodes.load(&mut values)
    }
    /// [`save`](Self::save) to a file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.save(BufWriter::new(File::create(path)?))
    }
    /// [`load`](Self::load) from a file.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.load(File::open(path)?)
    }
}

fn single(sizes: Vec<usize>, what: &str) -> Result<usize> {
    match sizes.as_slice() {
        [size] => Ok(*size),
        [] => Err(Error::Config("network has no layers".into())),
        _ => Err(Error::Config(format!(
            "network has {} {what}s, expected one",
            sizes.len()
        ))),
    }
}

fn check_input(input: &[f32], size: usize) -> Result<()> {
    if input.len() == size {
        Ok(())
    } else {
        Err(Error::Data(format!(
            "input dimension mismatch: expected {size} values, found {}",
            input.len()
        )))
    }
}

fn max_index(values: &[f32]) -> usize {
    let mut index = 0;
    for (i, x) in values.iter().enumerate() {
        if *x > values[index] {
            index = i;
        }
    }
    index
}

/// Forward and backward passes of one sample, accumulating parameter
/// gradients in `worker`.
fn forward_backward(
    nodes: &Nodes,
    loss: Loss,
    worker: &mut Worker,
    phase: Phase,
    parallelism: Parallelism,
    input: &[f32],
    target: &[f32],
) -> Result<()> {
    nodes.forward(worker, phase, parallelism, &[input])?;
    let tail = nodes
        .output_layers()
        .next()
        .ok_or_else(|| Error::Config("network has no outputs".into()))?;
    let y = nodes.outputs(worker)[0];
    let activation = tail.activation();
    let canonical = loss.is_canonical_link(activation)
        && tail.out_types().len() > 1
        && tail.filter().is_none();
    let (grad, pre_activation) = if canonical {
        (loss.output_delta(activation, y, target), true)
    } else {
        (loss.gradient(y, target), false)
    };
    let grad = if pre_activation {
        OutputGrad::PreActivation(&grad)
    } else {
        OutputGrad::Output(&grad)
    };
    nodes.backward(worker, phase, parallelism, &[input], &[grad])
}
