use super::*;
use crate::{
    storage::{LayerBuffers, Phase},
    ConnectionTable, Error,
};
use approx::assert_abs_diff_eq;
use rand::{Rng, SeedableRng};

fn shape(w: usize, h: usize, d: usize) -> Shape3d {
    Shape3d::new(w, h, d).unwrap()
}

fn run_forward(
    layer: &AnyLayer,
    inputs: &[&[f32]],
    buffers: &mut LayerBuffers,
    phase: Phase,
    rng: &mut SmallRng,
) -> Vec<f32> {
    let mut in_data = inputs.to_vec();
    in_data.extend(layer.parameters());
    let mut state = WorkerState::new(phase, rng, &mut buffers.scratch);
    layer
        .forward_propagation(&in_data, &mut buffers.out_data, &mut state)
        .unwrap();
    buffers.out_data[0].clone()
}

fn forward(layer: &AnyLayer, input: &[f32]) -> Vec<f32> {
    let mut buffers = LayerBuffers::new(layer);
    let mut rng = SmallRng::seed_from_u64(0);
    run_forward(layer, &[input], &mut buffers, Phase::Test, &mut rng)
}

/// Back propagates `coef` through `layer` at `input`, returning the input
/// gradients, parameters included.
fn backward(layer: &AnyLayer, input: &[f32], coef: &[f32]) -> Vec<Vec<f32>> {
    let mut buffers = LayerBuffers::new(layer);
    let mut rng = SmallRng::seed_from_u64(0);
    run_forward(layer, &[input], &mut buffers, Phase::Test, &mut rng);
    buffers.out_grad[0].copy_from_slice(coef);
    let mut in_data = vec![input];
    in_data.extend(layer.parameters());
    let LayerBuffers {
        out_data,
        out_grad,
        in_grad,
        scratch,
    } = &mut buffers;
    let mut state = WorkerState::new(Phase::Test, &mut rng, scratch);
    layer
        .back_propagation(&in_data, out_data, out_grad, in_grad, &mut state)
        .unwrap();
    buffers.in_grad
}

/// Checks every input and parameter gradient of `sum(coef * y)` against
/// centered differences.
fn check_gradients(mut layer: AnyLayer, input: Vec<f32>, seed: u64) {
    const STEP: f32 = 1e-2;
    let mut rng = SmallRng::seed_from_u64(seed);
    layer.init_weight(&mut rng);
    for param in layer.parameters_mut() {
        for x in param.iter_mut() {
            *x += rng.gen_range(-0.1..0.1);
        }
    }
    let out_size = layer.out_shape()[0].size();
    let coef: Vec<f32> = (0..out_size).map(|_| rng.gen_range(-1f32..1.)).collect();
    let objective = |layer: &AnyLayer, input: &[f32]| -> f64 {
        forward(layer, input)
            .iter()
            .zip(coef.iter())
            .map(|(y, c)| *y as f64 * *c as f64)
            .sum()
    };
    let grads = backward(&layer, &input, &coef);
    for i in 0..input.len() {
        let mut x = input.clone();
        x[i] += STEP;
        let plus = objective(&layer, &x);
        x[i] -= 2. * STEP;
        let minus = objective(&layer, &x);
        let numeric = (plus - minus) / (2. * STEP as f64);
        assert_abs_diff_eq!(grads[0][i] as f64, numeric, epsilon = 2e-3);
    }
    for (index, port) in layer.trainable_ports().into_iter().enumerate() {
        let len = layer.parameters()[index].len();
        for i in 0..len {
            let mut perturbed = layer.clone();
            perturbed.parameters_mut()[index][i] += STEP;
            let plus = objective(&perturbed, &input);
            perturbed.parameters_mut()[index][i] -= 2. * STEP;
            let minus = objective(&perturbed, &input);
            let numeric = (plus - minus) / (2. * STEP as f64);
            assert_abs_diff_eq!(grads[port][i] as f64, numeric, epsilon = 2e-3);
        }
    }
}

fn random_input(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1f32..1.)).collect()
}

/// Distinct values at least 0.1 apart.
fn spread_input(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 7) % len) as f32 * 0.1 - 1.).collect()
}

fn catalogue() -> Vec<AnyLayer> {
    vec![
        Input::new(shape(3, 2, 2)).into(),
        FullyConnected::from_inputs_outputs(6, 4).unwrap().into(),
        FullyConnected::from_inputs_outputs(6, 4)
            .unwrap()
            .with_bias(false)
            .with_dropout(0.5)
            .unwrap()
            .into(),
        Convolution::new(shape(6, 5, 2), [3, 3], 4).unwrap().into(),
        Convolution::new(shape(6, 5, 2), [3, 3], 4)
            .unwrap()
            .with_padding(Padding::Same)
            .unwrap()
            .with_strides([2, 2])
            .unwrap()
            .into(),
        MaxPooling::new(shape(4, 4, 3), 2, 2).unwrap().into(),
        MaxPooling::new(shape(5, 5, 1), 3, 2).unwrap().into(),
        AveragePooling::new(shape(4, 6, 2), 2, 2).unwrap().into(),
        Lrn::new(shape(2, 2, 5), 3, 1e-1, 0.75).unwrap().into(),
        Dropout::new(shape(10, 1, 1), 0.25).unwrap().into(),
        Linear::new(shape(3, 3, 1)).with_scale(2.).into(),
    ]
}

#[test]
fn zero_input_output_sizes() {
    for layer in catalogue() {
        let input = vec![0.; layer.in_shape()[0].size()];
        let output = forward(&layer, &input);
        assert_eq!(
            output.len(),
            layer.out_shape()[0].size(),
            "{}",
            layer.layer_type()
        );
        assert_eq!(layer.out_types().len(), layer.out_shape().len());
        assert_eq!(layer.in_types().len(), layer.in_shape().len());
    }
}

#[test]
fn concat_joins_depth() {
    let layer: AnyLayer = Concat::new(vec![shape(2, 1, 1), shape(2, 1, 2)])
        .unwrap()
        .into();
    assert_eq!(layer.out_shape()[0], shape(2, 1, 3));
    let mut buffers = LayerBuffers::new(&layer);
    let mut rng = SmallRng::seed_from_u64(0);
    let y = run_forward(
        &layer,
        &[&[1., 2.][..], &[3., 4., 5., 6.][..]],
        &mut buffers,
        Phase::Test,
        &mut rng,
    );
    assert_eq!(y, [1., 2., 3., 4., 5., 6.]);
    assert!(matches!(
        Concat::new(vec![shape(2, 1, 1), shape(1, 2, 1)]),
        Err(Error::DimensionMismatch(_))
    ));
}

#[test]
fn fully_connected_forward() {
    let mut layer: AnyLayer = FullyConnected::from_inputs_outputs(2, 2).unwrap().into();
    layer.parameters_mut()[0].fill(1.);
    assert_eq!(forward(&layer, &[1., 2.]), [3., 3.]);
}

#[test]
fn max_pool_deterministic() {
    let layer: AnyLayer = MaxPooling::new(shape(4, 4, 2), 2, 2).unwrap().into();
    let input = random_input(32, 3);
    let mut rng = SmallRng::seed_from_u64(0);
    let mut first = LayerBuffers::new(&layer);
    let mut second = LayerBuffers::new(&layer);
    let a = run_forward(&layer, &[input.as_slice()], &mut first, Phase::Test, &mut rng);
    let b = run_forward(&layer, &[input.as_slice()], &mut second, Phase::Test, &mut rng);
    assert_eq!(a, b);
    let AnyLayer::MaxPooling(pool) = &layer else {
        unreachable!()
    };
    assert_eq!(
        pool.max_indices(&first.scratch).unwrap(),
        pool.max_indices(&second.scratch).unwrap()
    );
}

#[test]
fn max_pool_routes_gradient_to_first_max() {
    let layer: AnyLayer = MaxPooling::new(shape(2, 2, 1), 2, 2).unwrap().into();
    let input = [0.5, 2., 2., -1.];
    assert_eq!(forward(&layer, &input), [2.]);
    let grads = backward(&layer, &input, &[3.]);
    assert_eq!(grads[0], [0., 3., 0., 0.]);
}

#[test]
fn same_padding_keeps_size() {
    for kernel in [1, 3, 5] {
        let conv = Convolution::new(shape(7, 6, 2), [kernel, kernel], 3)
            .unwrap()
            .with_padding(Padding::Same)
            .unwrap();
        assert_eq!(conv.out_shape()[0], shape(7, 6, 3));
    }
}

#[test]
fn valid_strided_size() {
    let conv = Convolution::new(shape(7, 6, 1), [3, 2], 1)
        .unwrap()
        .with_strides([2, 3])
        .unwrap();
    // ceil(5 / 2) x ceil(5 / 3)
    assert_eq!(conv.out_shape()[0], shape(3, 2, 1));
}

#[test]
fn convolution_forward() {
    let mut layer: AnyLayer = Convolution::new(shape(3, 3, 1), [2, 2], 1).unwrap().into();
    {
        let mut params = layer.parameters_mut();
        params[0].copy_from_slice(&[1., 0., 0., 1.]);
        params[1][0] = 0.5;
    }
    let input: Vec<f32> = (1..=9).map(|x| x as f32).collect();
    assert_eq!(forward(&layer, &input), [6.5, 8.5, 12.5, 14.5]);
}

#[test]
fn connection_table_skips_channels() {
    let table = ConnectionTable::from_groups(2, 2, 2).unwrap();
    let mut layer: AnyLayer = Convolution::new(shape(1, 1, 2), [1, 1], 2)
        .unwrap()
        .with_connection_table(table)
        .unwrap()
        .with_bias(false)
        .into();
    layer.parameters_mut()[0].fill(1.);
    assert_eq!(forward(&layer, &[2., 3.]), [2., 3.]);
}

#[test]
fn fully_connected_gradients() {
    check_gradients(
        FullyConnected::from_inputs_outputs(5, 3)
            .unwrap()
            .with_activation(Activation::Tanh)
            .into(),
        random_input(5, 1),
        1,
    );
}

#[test]
fn softmax_gradients() {
    check_gradients(
        FullyConnected::from_inputs_outputs(4, 3)
            .unwrap()
            .with_activation(Activation::Softmax)
            .into(),
        random_input(4, 2),
        2,
    );
}

#[test]
fn convolution_gradients() {
    check_gradients(
        Convolution::new(shape(5, 4, 2), [3, 2], 3)
            .unwrap()
            .with_activation(Activation::Sigmoid)
            .into(),
        random_input(40, 3),
        3,
    );
}

#[test]
fn same_strided_convolution_gradients() {
    let table = ConnectionTable::from_groups(2, 2, 2).unwrap();
    check_gradients(
        Convolution::new(shape(5, 5, 2), [3, 3], 2)
            .unwrap()
            .with_padding(Padding::Same)
            .unwrap()
            .with_strides([2, 2])
            .unwrap()
            .with_connection_table(table)
            .unwrap()
            .into(),
        random_input(50, 4),
        4,
    );
}

#[test]
fn max_pooling_gradients() {
    check_gradients(
        MaxPooling::new(shape(5, 5, 2), 3, 2).unwrap().into(),
        spread_input(50),
        5,
    );
}

#[test]
fn average_pooling_gradients() {
    check_gradients(
        AveragePooling::new(shape(4, 4, 2), 2, 2)
            .unwrap()
            .with_activation(Activation::Tanh)
            .into(),
        random_input(32, 6),
        6,
    );
}

#[test]
fn lrn_gradients() {
    check_gradients(
        Lrn::new(shape(2, 2, 6), 5, 0.5, 0.75).unwrap().into(),
        random_input(24, 7),
        7,
    );
}

#[test]
fn linear_gradients() {
    check_gradients(
        Linear::new(shape(6, 1, 1))
            .with_scale(0.5)
            .with_bias(0.1)
            .with_activation(Activation::Elu)
            .into(),
        random_input(6, 8),
        8,
    );
}

#[test]
fn dropout_phases() {
    let layer: AnyLayer = Dropout::new(shape(1000, 1, 1), 0.5).unwrap().into();
    let input = vec![1.; 1000];
    let mut buffers = LayerBuffers::new(&layer);
    let mut rng = SmallRng::seed_from_u64(9);
    let test = run_forward(&layer, &[input.as_slice()], &mut buffers, Phase::Test, &mut rng);
    assert_eq!(test, input);
    let train = run_forward(&layer, &[input.as_slice()], &mut buffers, Phase::Train, &mut rng);
    let kept = train.iter().filter(|x| **x == 2.).count();
    assert!(train.iter().all(|x| *x == 0. || *x == 2.));
    assert!((400..600).contains(&kept), "{kept}");
}

#[test]
fn construction_errors() {
    assert!(matches!(
        Convolution::new(shape(2, 2, 1), [3, 3], 1),
        Err(Error::DimensionMismatch(_))
    ));
    assert!(matches!(
        Convolution::new(shape(4, 4, 1), [3, 3], 1)
            .unwrap()
            .with_strides([0, 1]),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        MaxPooling::new(shape(5, 4, 1), 2, 2),
        Err(Error::DimensionMismatch(_))
    ));
    assert!(matches!(
        Dropout::new(shape(4, 1, 1), 1.),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Lrn::new(shape(4, 1, 1), 0, 1., 0.75),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Convolution::new(shape(4, 4, 2), [3, 3], 3)
            .unwrap()
            .with_connection_table(ConnectionTable::from_groups(1, 2, 2).unwrap()),
        Err(Error::DimensionMismatch(_))
    ));
    assert!(matches!(
        FullyConnected::from_inputs_outputs(usize::MAX / 2, 3),
        Err(Error::Config(_))
    ));
}

#[test]
fn init_weight_is_idempotent() {
    let mut a: AnyLayer = Convolution::new(shape(4, 4, 2), [3, 3], 2).unwrap().into();
    let mut b = a.clone();
    a.init_weight(&mut SmallRng::seed_from_u64(11));
    b.init_weight(&mut SmallRng::seed_from_u64(11));
    assert_eq!(a.parameters(), b.parameters());
    assert!(a.parameters()[0].iter().any(|x| *x != 0.));
}
