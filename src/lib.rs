/*!
# convnet
A layer graph neural network engine.

Networks are chains or graphs of layers: fully connected, convolution, max
and average pooling, local response normalization, dropout, linear, and
concatenation. Training splits every minibatch across a pool of workers, each
with its own activations and gradient buffers, then merges the gradients into
a single optimizer step.

# Example
```
# use convnet::{Network, Loss, Activation, TrainConfig, optimizer::Sgd, layer::FullyConnected};
# fn main() -> convnet::Result<()> {
let mut network = Network::new(Loss::Mse, Sgd::builder().learning_rate(0.5).build());
network.add(FullyConnected::from_inputs_outputs(2, 4)?.with_activation(Activation::Sigmoid))?;
network.add(FullyConnected::from_inputs_outputs(4, 1)?.with_activation(Activation::Sigmoid))?;
let inputs = vec![vec![0., 0.], vec![0., 1.], vec![1., 0.], vec![1., 1.]];
let targets = vec![vec![0.], vec![1.], vec![1.], vec![0.]];
let config = TrainConfig::builder().batch_size(4).epochs(10).worker_count(2).build()?;
let status = network.fit(&inputs, &targets, &config)?;
assert!(status.is_completed());
# Ok(())
# }
```

# Features
- "serde": Derives `Serialize` and `Deserialize` for configuration types.
- "mnist": Parsers for the MNIST IDX format, see [`dataset::mnist`].
*/

mod activation;
mod connection_table;
pub mod dataset;
mod error;
pub mod factory;
mod init;
pub mod layer;
mod loss;
pub mod network;
mod nodes;
/// Optimizers.
pub mod optimizer;
mod parallel;
mod shape;
pub mod storage;
mod weights;

pub use activation::Activation;
pub use connection_table::ConnectionTable;
pub use error::{Error, Result};
pub use init::WeightInit;
pub use loss::Loss;
pub use network::{GradCheck, Network, Progress, Target, TestResult, TrainConfig, TrainStatus};
pub use nodes::{Graph, NodeId, Nodes};
pub use parallel::Parallelism;
pub use shape::{PortKind, Shape3d};
pub use weights::WeightReader;
