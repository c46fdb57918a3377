use crate::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Training configuration.
///
/// ```
/// # use convnet::TrainConfig;
/// # fn main() -> convnet::Result<()> {
/// let config = TrainConfig::builder()
///     .batch_size(16)
///     .epochs(10)
///     .worker_count(4)
///     .build()?;
/// assert_eq!(config.batch_size(), 16);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainConfig {
    batch_size: usize,
    epochs: usize,
    worker_count: usize,
    reset_weights: bool,
    explosion_check_interval: usize,
    grain_size: usize,
    seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            epochs: 1,
            worker_count: rayon::current_num_threads(),
            reset_weights: true,
            explosion_check_interval: 10,
            grain_size: 1,
            seed: 0,
        }
    }
}

impl TrainConfig {
    pub fn builder() -> builder::TrainConfigBuilder {
        builder::TrainConfigBuilder::default()
    }
    /// Samples per optimizer step.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
    pub fn epochs(&self) -> usize {
        self.epochs
    }
    /// Number of concurrent workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
    /// Whether weights are re-initialized before the first epoch.
    pub fn reset_weights(&self) -> bool {
        self.reset_weights
    }
    /// Batches between checks for non-finite parameters.
    pub fn explosion_check_interval(&self) -> usize {
        self.explosion_check_interval
    }
    /// Minimum channels per task of intra layer parallelism.
    pub fn grain_size(&self) -> usize {
        self.grain_size
    }
    /// Seed of the worker random engines.
    pub fn seed(&self) -> u64 {
        self.seed
    }
    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker count must be positive".into()));
        }
        if self.explosion_check_interval == 0 {
            return Err(Error::Config(
                "explosion check interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub mod builder {
    use super::*;

    /// Builder for [`TrainConfig`].
    #[derive(Clone, Debug, Default)]
    pub struct TrainConfigBuilder {
        config: TrainConfig,
    }

    impl TrainConfigBuilder {
        pub fn batch_size(mut self, batch_size: usize) -> Self {
            self.config.batch_size = batch_size;
            self
        }
        pub fn epochs(mut self, epochs: usize) -> Self {
            self.config.epochs = epochs;
            self
        }
        pub fn worker_count(mut self, worker_count: usize) -> Self {
            self.config.worker_count = worker_count;
            self
        }
        pub fn reset_weights(mut self, reset_weights: bool) -> Self {
            self.config.reset_weights = reset_weights;
            self
        }
        pub fn explosion_check_interval(mut self, interval: usize) -> Self {
            self.config.explosion_check_interval = interval;
            self
        }
        pub fn grain_size(mut self, grain_size: usize) -> Self {
            self.config.grain_size = grain_size;
            self
        }
        pub fn seed(mut self, seed: u64) -> Self {
            self.config.seed = seed;
            self
        }
        /// Builds the config.
        ///
        /// **Errors**
        ///
        /// The batch size, worker count, and explosion check interval must
        /// be positive.
        pub fn build(self) -> Result<TrainConfig> {
            self.config.validate()?;
            Ok(self.config)
        }
    }
}
