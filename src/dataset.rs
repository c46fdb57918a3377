//! Datasets.

#[cfg(feature = "mnist")]
pub mod mnist;
