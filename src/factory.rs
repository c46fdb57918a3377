//! Layers from converted model descriptions.
//!
//! A model converter parses some external format and hands over one
//! [`NodeDescriptor`] per layer. [`create_layer`] maps the type tag to a
//! layer, [`load_weights`] copies the raw blobs into it, and
//! [`build_network`] chains a sequence of descriptors.
use crate::{
    activation::Activation,
    connection_table::ConnectionTable,
    layer::{
        AnyLayer, AveragePooling, Convolution, Dropout, FullyConnected, Input, Layer, Linear,
        Lrn, MaxPooling, Padding,
    },
    network::Network,
    optimizer::Optimizer,
    shape::{PortKind, Shape3d},
    Error, Loss, Result, WeightInit,
};
use std::collections::BTreeMap;

/// A layer of a converted model.
///
/// Attributes are numeric:
///
/// | type              | attributes                                                                 |
/// |-------------------|----------------------------------------------------------------------------|
/// | `fully-connected` | `outputs`, `bias` (1), `dropout`                                            |
/// | `conv`            | `outputs`, `kernel` or `kernel_w` and `kernel_h`, `stride` (1), `stride_w`, `stride_h`, `pad` (0), `group` (1), `bias` (1) |
/// | `max-pool`        | `pool`, `stride` (`pool`)                                                   |
/// | `ave-pool`        | `pool`, `stride` (`pool`)                                                   |
/// | `norm`            | `size` (5), `alpha` (1), `beta` (0.75), `within_channel` (0)                |
/// | `dropout`         | `rate` (0.5)                                                                |
/// | `linear`          | `scale` (1), `bias` (0)                                                     |
///
/// Attributes without a default are required.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeDescriptor {
    pub layer_type: String,
    pub in_shape: Shape3d,
    /// When set, must equal the shape the layer derives.
    pub out_shape: Option<Shape3d>,
    pub activation: Activation,
    pub attributes: BTreeMap<String, f32>,
    /// Weight blob, output major for fully connected layers.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl NodeDescriptor {
    pub fn new(layer_type: impl Into<String>, in_shape: Shape3d) -> Self {
        Self {
            layer_type: layer_type.into(),
            in_shape,
            ..Self::default()
        }
    }
    pub fn with_out_shape(mut self, out_shape: Shape3d) -> Self {
        self.out_shape.replace(out_shape);
        self
    }
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
    pub fn with_attribute(mut self, name: impl Into<String>, value: f32) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
    pub fn with_weights(mut self, weights: Vec<f32>) -> Self {
        self.weights = weights;
        self
    }
    pub fn with_bias(mut self, bias: Vec<f32>) -> Self {
        self.bias = bias;
        self
    }
    fn attribute(&self, name: &str) -> Option<f32> {
        self.attributes.get(name).copied()
    }
    fn required(&self, name: &str) -> Result<f32> {
        self.attribute(name).ok_or_else(|| Error::MissingParameter {
            layer_type: self.layer_type.clone(),
            parameter: name.into(),
        })
    }
    fn count(&self, name: &str, default: Option<usize>) -> Result<usize> {
        let value = match (self.attribute(name), default) {
            (Some(value), _) => value,
            (None, Some(default)) => return Ok(default),
            (None, None) => self.required(name)?,
        };
        if !(0. ..=u32::MAX as f32).contains(&value) || value.fract() != 0. {
            return Err(Error::Config(format!(
                "{} attribute {name} = {value} is not a count",
                self.layer_type
            )));
        }
        Ok(value as usize)
    }
    fn flag(&self, name: &str, default: bool) -> bool {
        self.attribute(name).map_or(default, |value| value != 0.)
    }
}

/// Creates the layer `desc` describes, with zeroed parameters.
///
/// **Errors**
///
/// - [`Error::UnknownLayerType`] for an unknown tag.
/// - [`Error::MissingParameter`] when a required attribute is absent.
/// - [`Error::DimensionMismatch`] when the derived output shape is not
///   [`out_shape`](NodeDescriptor::out_shape).
/// - [`Error::Config`] for unsupported padding or normalization.
pub fn create_layer(desc: &NodeDescriptor) -> Result<AnyLayer> {
    let in_shape = desc.in_shape;
    let layer: AnyLayer = match desc.layer_type.as_str() {
        "input" => Input::new(in_shape).into(),
        "fully-connected" => {
            let outputs = desc.count("outputs", None)?;
            let fc = FullyConnected::from_inputs_outputs(in_shape.size(), outputs)?
                .with_bias(desc.flag("bias", true))
                .with_activation(desc.activation);
            match desc.attribute("dropout") {
                Some(rate) => fc.with_dropout(rate)?.into(),
                None => fc.into(),
            }
        }
        "conv" => create_convolution(desc)?.into(),
        "max-pool" => {
            let pool = desc.count("pool", None)?;
            let stride = desc.count("stride", Some(pool))?;
            MaxPooling::new(in_shape, pool, stride)?
                .with_activation(desc.activation)
                .into()
        }
        "ave-pool" => {
            let pool = desc.count("pool", None)?;
            let stride = desc.count("stride", Some(pool))?;
            let mut layer: AnyLayer = AveragePooling::new(in_shape, pool, stride)?
                .with_activation(desc.activation)
                .into();
            // the layer already scales by 1 / pool^2
            layer.set_weight_init(WeightInit::Constant(1.));
            layer
        }
        "norm" => {
            if desc.flag("within_channel", false) {
                return Err(Error::Config(
                    "local response normalization within channels is not supported".into(),
                ));
            }
            let size = desc.count("size", Some(5))?;
            let alpha = desc.attribute("alpha").unwrap_or(1.);
            let beta = desc.attribute("beta").unwrap_or(0.75);
            Lrn::new(in_shape, size, alpha, beta)?
                .with_activation(desc.activation)
                .into()
        }
        "dropout" => Dropout::new(in_shape, desc.attribute("rate").unwrap_or(0.5))?.into(),
        "linear" => Linear::new(in_shape)
            .with_scale(desc.attribute("scale").unwrap_or(1.))
            .with_bias(desc.attribute("bias").unwrap_or(0.))
            .with_activation(desc.activation)
            .into(),
        other => return Err(Error::UnknownLayerType(other.into())),
    };
    if let Some(expected) = desc.out_shape {
        let derived = layer.out_shape()[0];
        if derived != expected {
            return Err(Error::DimensionMismatch(format!(
                "{} layer derives output {derived} but the model declares {expected}",
                desc.layer_type
            )));
        }
    }
    Ok(layer)
}

fn create_convolution(desc: &NodeDescriptor) -> Result<Convolution> {
    let in_shape = desc.in_shape;
    let outputs = desc.count("outputs", None)?;
    let (kw, kh) = match desc.attribute("kernel") {
        Some(_) => {
            let k = desc.count("kernel", None)?;
            (k, k)
        }
        None => (desc.count("kernel_w", None)?, desc.count("kernel_h", None)?),
    };
    let stride = desc.count("stride", Some(1))?;
    let strides = [
        desc.count("stride_w", Some(stride))?,
        desc.count("stride_h", Some(stride))?,
    ];
    let pad = desc.count("pad", Some(0))?;
    let padding = if pad == 0 {
        Padding::Valid
    } else if kw == kh && pad == (kw - 1) / 2 {
        Padding::Same
    } else {
        return Err(Error::Config(format!(
            "padding {pad} with kernel {kw}x{kh} is not supported"
        )));
    };
    let groups = desc.count("group", Some(1))?;
    let table = if groups > 1 {
        ConnectionTable::from_groups(groups, outputs, in_shape.depth())?
    } else {
        ConnectionTable::new()
    };
    Ok(Convolution::new(in_shape, [kw, kh], outputs)?
        .with_padding(padding)?
        .with_strides(strides)?
        .with_connection_table(table)?
        .with_bias(desc.flag("bias", true))
        .with_activation(desc.activation))
}

/// Copies the blobs of `desc` into `layer`.
///
/// Fully connected weights are transposed from `outputs x inputs`.
/// Convolution blobs only hold the kernels of connected channels. Empty blobs
/// leave the parameters as they are.
///
/// **Errors**
///
/// [`Error::DimensionMismatch`] if a blob does not fit the layer.
pub fn load_weights(layer: &mut AnyLayer, desc: &NodeDescriptor) -> Result<()> {
    let mismatch = |what: &str, expected: usize, found: usize| {
        Error::DimensionMismatch(format!(
            "{} {what} blob has {found} values, expected {expected}",
            desc.layer_type
        ))
    };
    let (inputs, outputs) = (layer.in_shape()[0], layer.out_shape()[0]);
    let table = match &*layer {
        AnyLayer::Convolution(conv) => Some(conv.connection_table().clone()),
        _ => None,
    };
    let is_fc = matches!(layer, AnyLayer::FullyConnected(_));
    let kinds: Vec<PortKind> = layer
        .in_types()
        .into_iter()
        .filter(PortKind::is_trainable)
        .collect();
    let (mut weight, mut bias) = (None, None);
    for (kind, param) in kinds.into_iter().zip(layer.parameters_mut()) {
        match kind {
            PortKind::Weight => weight = Some(param),
            PortKind::Bias => bias = Some(param),
            _ => (),
        }
    }
    if !desc.weights.is_empty() {
        let weight = weight.ok_or_else(|| mismatch("weight", 0, desc.weights.len()))?;
        if is_fc {
            let (n_in, n_out) = (inputs.size(), outputs.size());
            if desc.weights.len() != weight.len() {
                return Err(mismatch("weight", weight.len(), desc.weights.len()));
            }
            for o in 0..n_out {
                for i in 0..n_in {
                    weight[i * n_out + o] = desc.weights[o * n_in + i];
                }
            }
        } else if let Some(table) = table.filter(|table| !table.is_empty()) {
            let (n_in, n_out) = (inputs.depth(), outputs.depth());
            let window = weight.len() / (n_in * n_out).max(1);
            let connected = (0..n_out)
                .flat_map(|o| (0..n_in).map(move |i| (o, i)))
                .filter(|(o, i)| table.is_connected(*o, *i))
                .count();
            if desc.weights.len() != connected * window {
                return Err(mismatch("weight", connected * window, desc.weights.len()));
            }
            let mut src = desc.weights.chunks_exact(window);
            for (k, dst) in weight.chunks_exact_mut(window).enumerate() {
                let (o, i) = (k / n_in, k % n_in);
                if table.is_connected(o, i) {
                    if let Some(src) = src.next() {
                        dst.copy_from_slice(src);
                    }
                }
            }
        } else {
            if desc.weights.len() != weight.len() {
                return Err(mismatch("weight", weight.len(), desc.weights.len()));
            }
            weight.copy_from_slice(&desc.weights);
        }
    }
    if !desc.bias.is_empty() {
        let bias = bias.ok_or_else(|| mismatch("bias", 0, desc.bias.len()))?;
        if desc.bias.len() != bias.len() {
            return Err(mismatch("bias", bias.len(), desc.bias.len()));
        }
        bias.copy_from_slice(&desc.bias);
    }
    Ok(())
}

/// Builds a sequential network from `descriptors`.
///
/// A leading `input` descriptor is optional. Layers without blobs keep their
/// initialized parameters.
///
/// **Errors**
///
/// See [`create_layer`], [`load_weights`], and [`Network::add`].
pub fn build_network<O: Optimizer>(
    descriptors: &[NodeDescriptor],
    loss: Loss,
    optimizer: O,
) -> Result<Network<O>> {
    let mut network = Network::new(loss, optimizer);
    let count = descriptors.len();
    for (index, desc) in descriptors.iter().enumerate() {
        let layer = create_layer(desc)?;
        if index == 0 && matches!(layer, AnyLayer::Input(_)) {
            continue;
        }
        let (in_shape, out_shape) = (layer.in_shape()[0], layer.out_shape()[0]);
        network.add(layer)?;
        let last = network.depth() - 1;
        if let Some(layer) = network.layer_mut(last) {
            load_weights(layer, desc)?;
        }
        log::info!(
            "converted {} layer {}/{count}: {in_shape} -> {out_shape}",
            desc.layer_type,
            index + 1
        );
    }
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Sgd;

    #[test]
    fn unknown_type() {
        let desc = NodeDescriptor::new("deconv", Shape3d::vector(4));
        assert!(matches!(
            create_layer(&desc),
            Err(Error::UnknownLayerType(tag)) if tag == "deconv"
        ));
    }

    #[test]
    fn missing_parameter() {
        let desc = NodeDescriptor::new("conv", Shape3d::new(5, 5, 1).unwrap())
            .with_attribute("outputs", 2.);
        match create_layer(&desc) {
            Err(Error::MissingParameter {
                layer_type,
                parameter,
            }) => {
                assert_eq!(layer_type, "conv");
                assert_eq!(parameter, "kernel_w");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn declared_shape_mismatch() {
        let desc = NodeDescriptor::new("max-pool", Shape3d::new(4, 4, 2).unwrap())
            .with_attribute("pool", 2.)
            .with_out_shape(Shape3d::new(3, 3, 2).unwrap());
        assert!(matches!(
            create_layer(&desc),
            Err(Error::DimensionMismatch(_))
        ));
    }

    #[test]
    fn unsupported_padding() {
        let desc = NodeDescriptor::new("conv", Shape3d::new(8, 8, 1).unwrap())
            .with_attribute("outputs", 1.)
            .with_attribute("kernel", 5.)
            .with_attribute("pad", 1.);
        assert!(matches!(create_layer(&desc), Err(Error::Config(_))));
    }

    #[test]
    fn fully_connected_transposed() {
        // outputs x inputs: [[1, 2, 3], [4, 5, 6]]
        let desc = NodeDescriptor::new("fully-connected", Shape3d::vector(3))
            .with_attribute("outputs", 2.)
            .with_weights(vec![1., 2., 3., 4., 5., 6.])
            .with_bias(vec![0.5, -0.5]);
        let mut layer = create_layer(&desc).unwrap();
        load_weights(&mut layer, &desc).unwrap();
        let params = layer.parameters();
        assert_eq!(params[0], &[1., 4., 2., 5., 3., 6.]);
        assert_eq!(params[1], &[0.5, -0.5]);
    }

    #[test]
    fn grouped_convolution_blob() {
        let desc = NodeDescriptor::new("conv", Shape3d::new(3, 3, 2).unwrap())
            .with_attribute("outputs", 2.)
            .with_attribute("kernel", 1.)
            .with_attribute("group", 2.)
            .with_attribute("bias", 0.)
            .with_weights(vec![7., 9.]);
        let mut layer = create_layer(&desc).unwrap();
        load_weights(&mut layer, &desc).unwrap();
        assert_eq!(layer.parameters()[0], &[7., 0., 0., 9.]);
    }

    #[test]
    fn bias_only_blob() {
        let desc = NodeDescriptor::new("ave-pool", Shape3d::new(2, 2, 2).unwrap())
            .with_attribute("pool", 2.)
            .with_bias(vec![5., 7.]);
        let mut layer = create_layer(&desc).unwrap();
        load_weights(&mut layer, &desc).unwrap();
        assert_eq!(layer.parameters()[0], &[0., 0.]);
        assert_eq!(layer.parameters()[1], &[5., 7.]);
    }

    #[test]
    fn count_out_of_range() {
        for outputs in [1e20, f32::INFINITY, -1., 2.5] {
            let desc = NodeDescriptor::new("fully-connected", Shape3d::vector(4))
                .with_attribute("outputs", outputs);
            assert!(matches!(create_layer(&desc), Err(Error::Config(_))));
        }
    }

    #[test]
    fn blob_size_mismatch() {
        let desc = NodeDescriptor::new("fully-connected", Shape3d::vector(3))
            .with_attribute("outputs", 2.)
            .with_weights(vec![1.; 5]);
        let mut layer = create_layer(&desc).unwrap();
        assert!(matches!(
            load_weights(&mut layer, &desc),
            Err(Error::DimensionMismatch(_))
        ));
    }

    #[test]
    fn network_from_descriptors() {
        let descriptors = [
            NodeDescriptor::new("input", Shape3d::new(4, 4, 1).unwrap()),
            NodeDescriptor::new("ave-pool", Shape3d::new(4, 4, 1).unwrap())
                .with_attribute("pool", 2.),
            NodeDescriptor::new("fully-connected", Shape3d::new(2, 2, 1).unwrap())
                .with_attribute("outputs", 1.)
                .with_weights(vec![1.; 4])
                .with_bias(vec![0.]),
        ];
        let mut network = build_network(&descriptors, Loss::Mse, Sgd::default()).unwrap();
        assert_eq!(network.depth(), 3);
        assert_eq!(network.layer(1).unwrap().parameters()[0], &[1.]);
        let y = network.predict(&[1.; 16]).unwrap();
        assert_eq!(y, [4.]);
    }
}
