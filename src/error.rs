use thiserror::Error;

/// Errors raised while building, running, or persisting a network.
///
/// Nothing is downgraded to a warning: every variant is returned to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Connected ports disagree in size, or a layer's geometry is impossible.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    /// Unsupported layer or training configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A converter descriptor lacks a parameter the layer needs.
    #[error("missing required parameter {parameter:?} for {layer_type:?} layer")]
    MissingParameter {
        /// The layer type tag.
        layer_type: String,
        /// The parameter name.
        parameter: String,
    },
    /// A converter descriptor names a layer type the factory does not know.
    #[error("unknown layer type {0:?}")]
    UnknownLayerType(String),
    /// Training or test data does not fit the network.
    #[error("{0}")]
    Data(String),
    /// Failure reading or writing a stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A token or header could not be parsed.
    #[error("parse error at {position}: {message}")]
    Parse {
        /// Token or byte position of the failure.
        position: usize,
        /// What went wrong.
        message: String,
    },
    /// A weight stream ended early.
    #[error("weight stream ended after {read} of {expected} values")]
    UnexpectedEof {
        /// Values read.
        read: usize,
        /// Values expected.
        expected: usize,
    },
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    /// Worker storage does not match the layer it was allocated for.
    #[error("worker storage mismatch for {0} layer")]
    Storage(&'static str),
}

/// Result type with [`Error`] as the default error.
pub type Result<T, E = Error> = std::result::Result<T, E>;
