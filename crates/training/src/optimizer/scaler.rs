use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::Precision, TrainingError};

/// Dynamic loss-scale parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LossScaleConfig {
    pub initial_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f64.powi(16),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 2f64.powi(24),
        }
    }
}

/// Persisted form of an enabled scaler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradientScalerState {
    pub scale: f64,
    pub growth_tracker: usize,
    pub config: LossScaleConfig,
}

/// Multiplies the loss before backward so small reduced-precision gradients
/// survive, and adapts the factor to overflow events.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    inner: Option<GradientScalerState>,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    /// Scaling is enabled for every reduced precision; `fp32` yields a no-op scaler.
    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if precision == Precision::Fp32 {
            return Self { inner: None };
        }
        let config = sanitize_config(config);
        Self {
            inner: Some(GradientScalerState {
                scale: config.initial_scale,
                growth_tracker: 0,
                config,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn loss_scale(&self) -> f64 {
        self.inner.as_ref().map_or(1.0, |state| state.scale)
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.inner {
            None => Ok(tensor.clone()),
            Some(state) => tensor.affine(state.scale, 0.0).map_err(to_runtime_error),
        }
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.inner {
            None => Ok(tensor.clone()),
            Some(state) => tensor
                .affine(1.0 / state.scale, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        for tensor in tensors {
            if contains_non_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Backs off after an overflow, grows after `growth_interval` clean steps.
    pub fn update(&mut self, found_inf: bool) {
        let Some(state) = self.inner.as_mut() else {
            return;
        };
        if found_inf {
            state.scale = (state.scale * state.config.backoff_factor).max(state.config.min_scale);
            state.growth_tracker = 0;
            log::warn!("gradient overflow, reducing loss scale to {}", state.scale);
            return;
        }
        state.growth_tracker += 1;
        if state.growth_tracker >= state.config.growth_interval {
            state.scale = (state.scale * state.config.growth_factor).min(state.config.max_scale);
            state.growth_tracker = 0;
        }
    }

    /// `None` when scaling is disabled.
    pub fn state(&self) -> Option<GradientScalerState> {
        self.inner.clone()
    }

    pub fn load_state(&mut self, state: GradientScalerState) -> Result<(), TrainingError> {
        if self.inner.is_none() {
            log::warn!("ignoring saved loss-scale state because scaling is disabled");
            return Ok(());
        }
        if !(state.scale.is_finite() && state.scale > 0.0) {
            return Err(TrainingError::checkpoint(format!(
                "saved loss scale {} is not a positive finite value",
                state.scale
            )));
        }
        let config = sanitize_config(state.config);
        self.inner = Some(GradientScalerState {
            scale: state.scale,
            growth_tracker: state.growth_tracker,
            config,
        });
        Ok(())
    }
}

pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F64)
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f64>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(config.backoff_factor > 0.0 && config.backoff_factor < 1.0) {
        config.backoff_factor = 0.5;
    }
    config.growth_interval = config.growth_interval.max(1);
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn tensor_from(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn grows_after_interval() {
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            Precision::Bf16,
        );

        assert!(scaler.is_enabled());
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 1024.0);
    }

    #[test]
    fn backs_off_on_overflow_and_resets_growth() {
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                backoff_factor: 0.25,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        );

        scaler.update(false);
        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 256.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 256.0);
    }

    #[test]
    fn detects_non_finite_gradients() {
        let scaler = GradientScaler::new(Precision::Fp16);
        let finite = tensor_from(&[1.0, -3.0, 3.0e38]);
        let overflow = tensor_from(&[f32::INFINITY]);
        let nan = tensor_from(&[0.0, f32::NAN]);
        assert!(!scaler.has_overflow([&finite]).unwrap());
        assert!(scaler.has_overflow([&overflow]).unwrap());
        assert!(scaler.has_overflow([&nan]).unwrap());
    }

    #[test]
    fn no_op_for_fp32() {
        let scaler = GradientScaler::new(Precision::Fp32);
        assert!(!scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 1.0);
        assert!(scaler.state().is_none());

        let tensor = tensor_from(&[2.0, 4.0]);
        assert_eq!(
            scaler.scale(&tensor).unwrap().to_vec1::<f32>().unwrap(),
            vec![2.0, 4.0]
        );
    }

    #[test]
    fn state_round_trips() {
        let mut scaler = GradientScaler::new(Precision::Fp16);
        scaler.update(true);
        scaler.update(false);
        let saved = scaler.state().unwrap();

        let mut restored = GradientScaler::new(Precision::Fp16);
        restored.load_state(saved.clone()).unwrap();
        assert_eq!(restored.state(), Some(saved));
        assert_eq!(restored.loss_scale(), 2f64.powi(15));
    }
}
