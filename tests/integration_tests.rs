use anyhow::{ensure, Result};
use approx::assert_relative_eq;
use convnet::{
    factory::{build_network, NodeDescriptor},
    layer::{Concat, FullyConnected, Input, Layer},
    optimizer::Sgd,
    Activation, Error, GradCheck, Graph, Loss, Network, Shape3d, TrainConfig, TrainStatus,
    WeightInit,
};
use libtest_mimic::{Arguments, Trial};

fn main() {
    let args = Arguments::from_args();
    let tests = [1, 4].into_iter().flat_map(tests).collect();
    libtest_mimic::run(&args, tests).exit()
}

fn worker_test(
    worker_count: usize,
    name: &str,
    f: impl Fn(usize) -> Result<()> + Send + Sync + 'static,
) -> Trial {
    Trial::test(format!("{name}_workers{worker_count}"), move || {
        f(worker_count).map_err(|e| format!("{e:#}").into())
    })
}

fn tests(worker_count: usize) -> Vec<Trial> {
    vec![
        worker_test(worker_count, "fully_connected_ones", fully_connected_ones),
        worker_test(worker_count, "mismatched_training_data", mismatched_training_data),
        worker_test(worker_count, "save_load", save_load),
        worker_test(worker_count, "gradient_check", gradient_check),
        worker_test(worker_count, "explosion", explosion),
        worker_test(worker_count, "training_reduces_loss", training_reduces_loss),
        worker_test(worker_count, "concat_graph", concat_graph),
        worker_test(worker_count, "factory_network", factory_network),
        worker_test(worker_count, "test_accuracy", test_accuracy),
        worker_test(worker_count, "worker_count_invariant", worker_count_invariant),
        worker_test(worker_count, "invalid_weight_init", invalid_weight_init),
    ]
}

fn sgd(learning_rate: f32) -> Sgd {
    Sgd::builder().learning_rate(learning_rate).build()
}

fn config(worker_count: usize, batch_size: usize, epochs: usize) -> Result<TrainConfig> {
    Ok(TrainConfig::builder()
        .batch_size(batch_size)
        .epochs(epochs)
        .worker_count(worker_count)
        .build()?)
}

fn fill(network: &mut Network, index: usize, weight: &[f32], bias: &[f32]) -> Result<()> {
    let layer = network
        .layer_mut(index)
        .ok_or_else(|| anyhow::anyhow!("no layer {index}"))?;
    let mut parameters = layer.parameters_mut();
    parameters[0].copy_from_slice(weight);
    parameters[1].copy_from_slice(bias);
    Ok(())
}

fn fully_connected_ones(_worker_count: usize) -> Result<()> {
    let mut network = Network::new(Loss::Mse, sgd(0.1));
    network.add(FullyConnected::from_inputs_outputs(2, 2)?)?;
    network.add(FullyConnected::from_inputs_outputs(2, 1)?)?;
    fill(&mut network, 1, &[1.; 4], &[0.; 2])?;
    fill(&mut network, 2, &[1.; 2], &[0.])?;
    let output = network.predict(&[1., 2.])?;
    ensure!(output == [6.], "output {output:?}");
    let hidden = network.layer_output(1).map(<[f32]>::to_vec);
    ensure!(hidden.as_deref() == Some(&[3., 3.][..]), "hidden {hidden:?}");
    Ok(())
}

fn mismatched_training_data(worker_count: usize) -> Result<()> {
    let mut network = Network::new(Loss::Mse, sgd(0.1));
    network.add(FullyConnected::from_inputs_outputs(3, 2)?)?;
    let inputs = vec![vec![0.; 3]; 10];
    let labels = vec![0usize; 9];
    let error = network
        .fit(&inputs, &labels, &config(worker_count, 2, 1)?)
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected an error"))?;
    ensure!(
        error
            .to_string()
            .contains("number of training data must be equal to label data"),
        "{error}"
    );
    Ok(())
}

fn classifier(worker_count: usize) -> Result<(Network, Vec<Vec<f32>>, Vec<usize>)> {
    let mut network = Network::new(Loss::CrossEntropyMulticlass, sgd(0.1)).with_seed(7);
    network.add(FullyConnected::from_inputs_outputs(4, 6)?.with_activation(Activation::Tanh))?;
    network.add(FullyConnected::from_inputs_outputs(6, 3)?.with_activation(Activation::Softmax))?;
    let inputs: Vec<Vec<f32>> = (0..12)
        .map(|i| (0..4).map(|j| ((i * 4 + j) % 7) as f32 / 7.).collect())
        .collect();
    let labels: Vec<usize> = (0..12).map(|i| i % 3).collect();
    let status = network.fit(&inputs, &labels, &config(worker_count, 4, 2)?)?;
    ensure!(status.is_completed());
    Ok((network, inputs, labels))
}

fn save_load(worker_count: usize) -> Result<()> {
    let (mut network, inputs, _) = classifier(worker_count)?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("weights.txt");
    network.save_to_file(&path)?;
    let mut loaded = Network::new(Loss::CrossEntropyMulticlass, sgd(0.1)).with_seed(99);
    loaded.add(FullyConnected::from_inputs_outputs(4, 6)?.with_activation(Activation::Tanh))?;
    loaded.add(FullyConnected::from_inputs_outputs(6, 3)?.with_activation(Activation::Softmax))?;
    ensure!(!loaded.has_same_weights(&network, 1e-6));
    loaded.load_from_file(&path)?;
    ensure!(loaded.has_same_weights(&network, 1e-5));
    for input in inputs.iter() {
        let (a, b) = (network.predict(input)?, loaded.predict(input)?);
        for (a, b) in a.iter().zip(b.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }
    Ok(())
}

fn gradient_check(_worker_count: usize) -> Result<()> {
    let mut network = Network::new(Loss::Mse, sgd(0.1)).with_seed(3);
    network.add(FullyConnected::from_inputs_outputs(3, 4)?)?;
    network.add(FullyConnected::from_inputs_outputs(4, 2)?)?;
    let inputs = vec![vec![0.5, -0.25, 0.75], vec![-0.5, 0.1, 0.3]];
    let targets = vec![vec![0.2, -0.4], vec![0.6, 0.1]];
    ensure!(network.gradient_check(&inputs, &targets, 1e-4, GradCheck::All)?);
    ensure!(network.gradient_check(&inputs, &targets, 1e-4, GradCheck::Random)?);
    Ok(())
}

fn explosion(worker_count: usize) -> Result<()> {
    let mut network = Network::new(Loss::Mse, sgd(0.1));
    network.add(FullyConnected::from_inputs_outputs(2, 1)?)?;
    fill(&mut network, 1, &[f32::NAN, 1.], &[0.])?;
    let inputs = vec![vec![1., 1.]; 8];
    let targets = vec![vec![1.]; 8];
    let config = TrainConfig::builder()
        .batch_size(2)
        .epochs(3)
        .worker_count(worker_count)
        .reset_weights(false)
        .explosion_check_interval(1)
        .build()?;
    let mut batches = 0;
    let status = network.train(&inputs, &targets, &config, |_, _| batches += 1, |_, _| {})?;
    ensure!(status == TrainStatus::Exploded, "{status:?}");
    ensure!(batches == 1, "{batches} batches");
    Ok(())
}

fn training_reduces_loss(worker_count: usize) -> Result<()> {
    let mut network = Network::new(Loss::Mse, sgd(0.05)).with_seed(1);
    network.add(FullyConnected::from_inputs_outputs(2, 1)?)?;
    let inputs: Vec<Vec<f32>> = (0..16)
        .map(|i| vec![(i % 4) as f32 / 4., (i / 4) as f32 / 4.])
        .collect();
    let targets: Vec<Vec<f32>> = inputs.iter().map(|x| vec![x[0] + 2. * x[1]]).collect();
    let config = TrainConfig::builder()
        .batch_size(4)
        .epochs(30)
        .worker_count(worker_count)
        .reset_weights(false)
        .build()?;
    let before = network.get_loss(&inputs, &targets)?;
    let mut epochs = 0;
    let status = network.train(&inputs, &targets, &config, |_, _| {}, |_, _| epochs += 1)?;
    ensure!(status.is_completed());
    ensure!(epochs == 30);
    let after = network.get_loss(&inputs, &targets)?;
    ensure!(after < before, "loss {before} -> {after}");
    Ok(())
}

fn concat_graph(_worker_count: usize) -> Result<()> {
    let mut graph = Graph::new();
    let a = graph.add(Input::new(Shape3d::new(1, 1, 2)?));
    let b = graph.add(Input::new(Shape3d::new(1, 1, 3)?));
    let concat = graph.add(Concat::new(vec![
        Shape3d::new(1, 1, 2)?,
        Shape3d::new(1, 1, 3)?,
    ])?);
    let fc = graph.add(FullyConnected::from_inputs_outputs(5, 1)?);
    graph.connect(a, 0, concat, 0)?;
    graph.connect(b, 0, concat, 1)?;
    graph.connect(concat, 0, fc, 0)?;
    let mut network = Network::from_graph(graph, &[a, b], &[fc], Loss::Mse, sgd(0.1))?;
    fill(&mut network, fc.index(), &[1.; 5], &[0.])?;
    let outputs = network.predict_multi(&[&[1., 2.][..], &[3., 4., 5.][..]])?;
    ensure!(outputs == [vec![15.]], "{outputs:?}");
    ensure!(network.predict(&[1., 2.]).is_err());
    Ok(())
}

fn factory_network(_worker_count: usize) -> Result<()> {
    let descriptors = [
        NodeDescriptor::new("input", Shape3d::vector(4)),
        NodeDescriptor::new("fully-connected", Shape3d::vector(4))
            .with_attribute("outputs", 2.)
            .with_activation(Activation::Relu)
            .with_weights(vec![1., 1., 1., 1., -1., -1., -1., -1.])
            .with_bias(vec![0.5, 0.5]),
    ];
    let mut network = build_network(&descriptors, Loss::Mse, sgd(0.1))?;
    ensure!(network.depth() == 2);
    let output = network.predict(&[1., 2., 3., 4.])?;
    ensure!(output == [10.5, 0.], "{output:?}");
    Ok(())
}

fn test_accuracy(_worker_count: usize) -> Result<()> {
    let mut network = Network::new(Loss::Mse, sgd(0.1));
    network.add(FullyConnected::from_inputs_outputs(2, 2)?)?;
    fill(&mut network, 1, &[1., 0., 0., 1.], &[0., 0.])?;
    let inputs = vec![vec![1., 0.], vec![0., 1.], vec![1., 0.]];
    let result = network.test(&inputs, &[0, 1, 1])?;
    ensure!(result.num_success == 2 && result.num_total == 3, "{result}");
    assert_relative_eq!(result.accuracy(), 200. / 3., epsilon = 1e-9);
    Ok(())
}

fn two_layer() -> Result<Network> {
    let mut network = Network::new(Loss::Mse, sgd(0.5)).with_seed(11);
    network.add(FullyConnected::from_inputs_outputs(3, 5)?.with_activation(Activation::Tanh))?;
    network.add(FullyConnected::from_inputs_outputs(5, 2)?.with_activation(Activation::Sigmoid))?;
    Ok(network)
}

fn one_batch(worker_count: usize, inputs: &[Vec<f32>], targets: &[usize]) -> Result<Network> {
    let mut network = two_layer()?;
    let config = TrainConfig::builder()
        .batch_size(inputs.len())
        .worker_count(worker_count)
        .reset_weights(false)
        .build()?;
    ensure!(network.fit(inputs, targets, &config)?.is_completed());
    Ok(network)
}

fn worker_count_invariant(worker_count: usize) -> Result<()> {
    let inputs: Vec<Vec<f32>> = (0..7)
        .map(|i| (0..3).map(|j| ((i + 2 * j) % 5) as f32 / 5. - 0.4).collect())
        .collect();
    let targets: Vec<usize> = (0..7).map(|i| i % 2).collect();
    let serial = one_batch(1, &inputs, &targets)?;
    for workers in [worker_count, 3] {
        let parallel = one_batch(workers, &inputs, &targets)?;
        ensure!(
            parallel.has_same_weights(&serial, 1e-5),
            "{workers} workers diverged from 1 worker"
        );
    }
    ensure!(!two_layer()?.has_same_weights(&serial, 1e-5));
    Ok(())
}

fn invalid_weight_init(_worker_count: usize) -> Result<()> {
    let mut network = Network::new(Loss::Mse, sgd(0.1));
    network.add(FullyConnected::from_inputs_outputs(2, 2)?)?;
    for init in [
        WeightInit::Xavier { scale: -6. },
        WeightInit::Lecun { scale: f32::INFINITY },
    ] {
        ensure!(matches!(network.set_weight_init(init), Err(Error::Config(_))));
    }
    ensure!(matches!(
        network.set_bias_init(WeightInit::Gaussian { sigma: f32::NAN }),
        Err(Error::Config(_))
    ));
    network.set_weight_init(WeightInit::lecun())?;
    ensure!(network.predict(&[1., 1.])?.iter().all(|y| y.is_finite()));
    Ok(())
}
