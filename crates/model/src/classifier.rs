use std::collections::HashMap;

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::config::ClassifierConfig;

pub const WEIGHT: &str = "head.linear.weight";
pub const BIAS: &str = "head.linear.bias";
pub const RUNNING_MEAN: &str = "head.norm.running_mean";
pub const RUNNING_VAR: &str = "head.norm.running_var";

/// Linear probe: a batch norm without affine parameters followed by a dense layer.
///
/// Only the dense layer is trainable. The norm's running statistics are
/// buffers; they are refreshed on every training-mode forward pass and used
/// as-is in evaluation mode.
#[derive(Debug)]
pub struct LinearClassifier {
    config: ClassifierConfig,
    weight: Var,
    bias: Var,
    running_mean: Var,
    running_var: Var,
    training: bool,
}

impl LinearClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device.clone();

        let normal =
            Normal::new(0.0f64, config.init_std).map_err(|err| Error::Msg(err.to_string()))?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let values: Vec<f32> = (0..config.num_labels * config.embed_dim)
            .map(|_| normal.sample(&mut rng) as f32)
            .collect();
        let weight = Tensor::from_vec(values, (config.num_labels, config.embed_dim), &device)?;
        let bias = Tensor::zeros(config.num_labels, DType::F32, &device)?;
        let running_mean = Tensor::zeros(config.embed_dim, DType::F32, &device)?;
        let running_var = Tensor::ones(config.embed_dim, DType::F32, &device)?;

        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
            running_mean: Var::from_tensor(&running_mean)?,
            running_var: Var::from_tensor(&running_var)?,
            config,
            training: true,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.config.device
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Produces logits shaped `(batch, num_labels)` from `(batch, embed_dim)` features.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let dims = features.dims();
        if dims.len() != 2 || dims[1] != self.config.embed_dim {
            return Err(Error::Msg(format!(
                "classifier expected features [batch, {}] got {:?}",
                self.config.embed_dim, dims
            )));
        }
        let features = features.to_dtype(DType::F32)?;
        let normalized = if self.training {
            self.normalize_with_batch_stats(&features)?
        } else {
            self.normalize_with_running_stats(&features)?
        };
        normalized
            .matmul(&self.weight.as_tensor().t()?)?
            .broadcast_add(self.bias.as_tensor())
    }

    fn normalize_with_batch_stats(&self, features: &Tensor) -> Result<Tensor> {
        let batch = features.dim(0)?;
        if batch == 0 {
            return Err(Error::Msg("classifier received an empty batch".into()));
        }
        let mean = features.mean_keepdim(0)?;
        let centered = features.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(0)?;
        let normalized = centered.broadcast_div(&(var.clone() + self.config.norm_eps)?.sqrt()?)?;

        let momentum = self.config.norm_momentum;
        let batch_mean = mean.squeeze(0)?.detach();
        let next_mean = ((self.running_mean.as_tensor() * (1.0 - momentum))?
            + (batch_mean * momentum)?)?;
        self.running_mean.set(&next_mean)?;

        // Running variance tracks the unbiased estimate; a single sample carries none.
        if batch > 1 {
            let correction = batch as f64 / (batch - 1) as f64;
            let batch_var = var.squeeze(0)?.detach().affine(correction, 0.0)?;
            let next_var = ((self.running_var.as_tensor() * (1.0 - momentum))?
                + (batch_var * momentum)?)?;
            self.running_var.set(&next_var)?;
        }
        Ok(normalized)
    }

    fn normalize_with_running_stats(&self, features: &Tensor) -> Result<Tensor> {
        let mean = self.running_mean.as_tensor().unsqueeze(0)?;
        let denom = (self.running_var.as_tensor() + self.config.norm_eps)?
            .sqrt()?
            .unsqueeze(0)?;
        features.broadcast_sub(&mean)?.broadcast_div(&denom)
    }

    /// Trainable parameters in a stable order.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            (WEIGHT.to_string(), self.weight.clone()),
            (BIAS.to_string(), self.bias.clone()),
        ]
    }

    /// Non-trainable state that still has to be replicated and persisted.
    pub fn buffers(&self) -> Vec<(String, Var)> {
        vec![
            (RUNNING_MEAN.to_string(), self.running_mean.clone()),
            (RUNNING_VAR.to_string(), self.running_var.clone()),
        ]
    }

    pub fn num_trainable_parameters(&self) -> usize {
        self.weight.as_tensor().elem_count() + self.bias.as_tensor().elem_count()
    }

    /// Snapshot of every parameter and buffer, keyed by name.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        self.parameters()
            .into_iter()
            .chain(self.buffers())
            .map(|(name, var)| (name, var.as_tensor().detach()))
            .collect()
    }

    /// Restores parameters and buffers. Every entry must be present with a
    /// matching shape.
    pub fn load_state_tensors(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in self.parameters().into_iter().chain(self.buffers()) {
            let source = tensors
                .get(&name)
                .ok_or_else(|| Error::Msg(format!("state is missing tensor '{}'", name)))?;
            if source.dims() != var.as_tensor().dims() {
                return Err(Error::Msg(format!(
                    "shape mismatch for '{}': expected {:?}, found {:?}",
                    name,
                    var.as_tensor().dims(),
                    source.dims()
                )));
            }
            let source = source
                .to_device(var.as_tensor().device())?
                .to_dtype(var.as_tensor().dtype())?;
            var.set(&source)?;
        }
        Ok(())
    }
}
