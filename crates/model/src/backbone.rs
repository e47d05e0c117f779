//! Frozen feature extractors.
//!
//! A backbone maps an input batch `(batch, ...)` to one embedding per sample.
//! Nothing in this crate ever registers backbone weights with an optimizer, and
//! [`BackboneHandle::embed`] detaches the output so no gradient can flow back
//! into the extractor regardless of how the caller builds its graph.

use std::{fmt, sync::Arc};

use candle_core::{DType, Device, Error, Result, Tensor};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Opaque, frozen, differentiable feature extractor.
pub trait Backbone: Send + Sync {
    /// Size of the embedding produced for each sample.
    fn embed_dim(&self) -> usize;

    /// Computes embeddings shaped `(batch, embed_dim)` (or any shape whose
    /// trailing dimensions flatten to `embed_dim`).
    fn forward(&self, inputs: &Tensor) -> Result<Tensor>;

    fn name(&self) -> &str {
        "backbone"
    }
}

/// Shared, cheaply clonable reference to the frozen backbone.
///
/// Inputs are cast to `compute_dtype` before the forward pass; the resulting
/// features are flattened, detached and handed to the classifier in `f32`.
#[derive(Clone)]
pub struct BackboneHandle {
    inner: Arc<dyn Backbone>,
    compute_dtype: DType,
}

impl BackboneHandle {
    pub fn new<B>(backbone: B) -> Self
    where
        B: Backbone + 'static,
    {
        Self {
            inner: Arc::new(backbone),
            compute_dtype: DType::F32,
        }
    }

    pub fn from_arc(inner: Arc<dyn Backbone>) -> Self {
        Self {
            inner,
            compute_dtype: DType::F32,
        }
    }

    pub fn with_compute_dtype(mut self, dtype: DType) -> Self {
        self.compute_dtype = dtype;
        self
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn embed_dim(&self) -> usize {
        self.inner.embed_dim()
    }

    pub fn embed(&self, inputs: &Tensor) -> Result<Tensor> {
        let inputs = if inputs.dtype() == self.compute_dtype {
            inputs.clone()
        } else {
            inputs.to_dtype(self.compute_dtype)?
        };
        let features = self.inner.forward(&inputs)?.detach();
        let features = if features.rank() > 2 {
            features.flatten_from(1)?
        } else {
            features
        };
        let width = features.dim(features.rank().saturating_sub(1))?;
        if width != self.embed_dim() {
            return Err(Error::Msg(format!(
                "backbone '{}' produced {} features, expected {}",
                self.inner.name(),
                width,
                self.embed_dim()
            )));
        }
        features.to_dtype(DType::F32)
    }
}

impl fmt::Debug for BackboneHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackboneHandle")
            .field("name", &self.inner.name())
            .field("embed_dim", &self.inner.embed_dim())
            .field("compute_dtype", &self.compute_dtype)
            .finish()
    }
}

/// Treats the inputs as precomputed features.
#[derive(Debug, Clone)]
pub struct Identity {
    embed_dim: usize,
}

impl Identity {
    pub fn new(embed_dim: usize) -> Self {
        Self { embed_dim }
    }
}

impl Backbone for Identity {
    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        if inputs.rank() > 2 {
            inputs.flatten_from(1)
        } else {
            Ok(inputs.clone())
        }
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// Fixed random projection followed by `tanh`.
///
/// The projection is drawn once from a seeded normal distribution scaled by
/// `1/sqrt(input_dim)`, so every worker that uses the same seed holds the same
/// extractor.
#[derive(Debug, Clone)]
pub struct FrozenProjection {
    input_dim: usize,
    embed_dim: usize,
    weight: Tensor,
}

impl FrozenProjection {
    pub fn new(input_dim: usize, embed_dim: usize, seed: u64, device: &Device) -> Result<Self> {
        if input_dim == 0 || embed_dim == 0 {
            return Err(Error::Msg(
                "frozen projection dimensions must be greater than zero".into(),
            ));
        }
        let std = 1.0 / (input_dim as f64).sqrt();
        let normal = Normal::new(0.0f64, std).map_err(|err| Error::Msg(err.to_string()))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<f32> = (0..input_dim * embed_dim)
            .map(|_| normal.sample(&mut rng) as f32)
            .collect();
        let weight = Tensor::from_vec(values, (embed_dim, input_dim), device)?;
        Ok(Self {
            input_dim,
            embed_dim,
            weight,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }
}

impl Backbone for FrozenProjection {
    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let inputs = if inputs.rank() > 2 {
            inputs.flatten_from(1)?
        } else {
            inputs.clone()
        };
        let weight = self.weight.to_dtype(inputs.dtype())?;
        inputs.matmul(&weight.t()?)?.tanh()
    }

    fn name(&self) -> &str {
        "frozen_projection"
    }
}
