use candle_core::{Device, Error, Result};

/// Configuration for the trainable probe placed on top of frozen features.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub embed_dim: usize,
    pub num_labels: usize,
    /// Epsilon added to the variance inside the non-affine batch norm.
    pub norm_eps: f64,
    /// Update factor for the batch-norm running statistics.
    pub norm_momentum: f64,
    /// Standard deviation of the normal initializer for the linear weight.
    pub init_std: f64,
    pub seed: u64,
    pub device: Device,
}

impl ClassifierConfig {
    pub fn new(embed_dim: usize, num_labels: usize) -> Self {
        Self {
            embed_dim,
            num_labels,
            norm_eps: 1e-6,
            norm_momentum: 0.1,
            init_std: 0.01,
            seed: 0,
            device: Device::Cpu,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 {
            return Err(Error::Msg("embed_dim must be greater than zero".into()));
        }
        if self.num_labels == 0 {
            return Err(Error::Msg("num_labels must be greater than zero".into()));
        }
        if self.norm_eps <= 0.0 {
            return Err(Error::Msg("norm_eps must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.norm_momentum) {
            return Err(Error::Msg("norm_momentum must be in [0, 1]".into()));
        }
        if self.init_std < 0.0 || !self.init_std.is_finite() {
            return Err(Error::Msg("init_std must be a finite, non-negative value".into()));
        }
        Ok(())
    }
}
