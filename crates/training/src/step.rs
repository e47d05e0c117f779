use candle_core::{backprop::GradStore, DType, Tensor, Var};
use model::{BackboneHandle, LinearClassifier};

use crate::{
    data::DataBatch,
    distributed::DistributedContext,
    loss::{Criterion, LossOutput},
    optimizer::{GradientScaler, Optimizer},
    TrainingError,
};

/// Result of feeding one micro-batch through [`ScaledGradientStep`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Gradients were accumulated; no update happened yet.
    Accumulating { loss: f64 },
    /// The window closed. `loss` is the mean of its micro-batch losses.
    Stepped {
        loss: f64,
        micro_steps: usize,
        grad_norm: f64,
        /// The optimizer update was skipped because of non-finite gradients.
        skipped: bool,
    },
}

impl StepOutcome {
    pub fn loss(&self) -> f64 {
        match *self {
            StepOutcome::Accumulating { loss } | StepOutcome::Stepped { loss, .. } => loss,
        }
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self, StepOutcome::Stepped { .. })
    }
}

/// Losses of a window that ended before its boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscardedWindow {
    pub loss: f64,
    pub micro_steps: usize,
}

/// Runs the frozen backbone, the classifier and the criterion for one batch.
pub fn forward_loss(
    backbone: &BackboneHandle,
    classifier: &LinearClassifier,
    criterion: &dyn Criterion,
    batch: &DataBatch,
) -> Result<LossOutput, TrainingError> {
    let features = backbone.embed(&batch.inputs).map_err(to_runtime_error)?;
    let logits = classifier.forward(&features).map_err(to_runtime_error)?;
    criterion.compute(&logits, &batch.targets)
}

/// Accumulates scaled gradients over `accum_iter` micro-batches and applies
/// one optimizer update per window.
pub struct ScaledGradientStep {
    accum_iter: usize,
    max_norm: Option<f64>,
    scaler: GradientScaler,
    parameters: Vec<Var>,
    grads: Option<GradStore>,
    window_loss: f64,
    window_len: usize,
}

impl ScaledGradientStep {
    pub fn new(
        parameters: Vec<Var>,
        accum_iter: usize,
        max_norm: Option<f64>,
        scaler: GradientScaler,
    ) -> Result<Self, TrainingError> {
        if accum_iter == 0 {
            return Err(TrainingError::initialization(
                "accum_iter must be greater than 0",
            ));
        }
        if parameters.is_empty() {
            return Err(TrainingError::initialization(
                "gradient step requires at least one parameter",
            ));
        }
        Ok(Self {
            accum_iter,
            max_norm,
            scaler,
            parameters,
            grads: None,
            window_loss: 0.0,
            window_len: 0,
        })
    }

    pub fn accum_iter(&self) -> usize {
        self.accum_iter
    }

    pub fn scaler(&self) -> &GradientScaler {
        &self.scaler
    }

    pub fn scaler_mut(&mut self) -> &mut GradientScaler {
        &mut self.scaler
    }

    /// True on the first micro-step of a window, where the schedule is applied.
    pub fn is_window_start(&self, step_index: usize) -> bool {
        step_index % self.accum_iter == 0
    }

    pub fn is_window_end(&self, step_index: usize) -> bool {
        (step_index + 1) % self.accum_iter == 0
    }

    /// Micro-steps accumulated in the open window.
    pub fn pending(&self) -> usize {
        self.window_len
    }

    pub fn micro_step(
        &mut self,
        output: &LossOutput,
        epoch: usize,
        step_index: usize,
        optimizer: &mut dyn Optimizer,
        ctx: &DistributedContext,
    ) -> Result<StepOutcome, TrainingError> {
        if !output.value.is_finite() {
            println!("Loss is {}, stopping training", output.value);
            self.clear();
            return Err(TrainingError::NonFiniteLoss {
                value: output.value,
                epoch,
                step: step_index,
            });
        }

        let normalized = output
            .loss
            .affine(1.0 / self.accum_iter as f64, 0.0)
            .map_err(to_runtime_error)?;
        let scaled = self.scaler.scale(&normalized)?;
        let micro_grads = scaled.backward().map_err(to_runtime_error)?;
        match self.grads.as_mut() {
            Some(accum) => merge_gradient_store(&self.parameters, accum, micro_grads)?,
            None => self.grads = Some(micro_grads),
        }
        self.window_loss += output.value;
        self.window_len += 1;

        if !self.is_window_end(step_index) {
            return Ok(StepOutcome::Accumulating { loss: output.value });
        }

        let outcome = self.apply(optimizer, ctx);
        self.clear();
        outcome
    }

    /// Drops an unfinished window without touching the parameters.
    pub fn discard(&mut self) -> Option<DiscardedWindow> {
        let window = (self.window_len > 0).then(|| DiscardedWindow {
            loss: self.window_loss / self.window_len as f64,
            micro_steps: self.window_len,
        });
        if let Some(window) = &window {
            log::debug!(
                "discarding {} accumulated micro-steps without an update",
                window.micro_steps
            );
        }
        self.clear();
        window
    }

    fn apply(
        &mut self,
        optimizer: &mut dyn Optimizer,
        ctx: &DistributedContext,
    ) -> Result<StepOutcome, TrainingError> {
        let loss = self.window_loss / self.window_len as f64;
        let micro_steps = self.window_len;
        let Some(mut grads) = self.grads.take() else {
            return Err(TrainingError::runtime("closing a window without gradients"));
        };

        if ctx.is_distributed() {
            average_gradients(&self.parameters, &mut grads, ctx)?;
        }
        let (found_inf, grad_norm) = self.unscale_gradients(&mut grads)?;

        if !found_inf {
            if let Some(max_norm) = self.max_norm {
                clip_gradients(&self.parameters, &mut grads, max_norm, grad_norm)?;
            }
            optimizer.step(&grads)?;
        }
        self.scaler.update(found_inf);

        Ok(StepOutcome::Stepped {
            loss,
            micro_steps,
            grad_norm,
            skipped: found_inf,
        })
    }

    fn unscale_gradients(&self, grads: &mut GradStore) -> Result<(bool, f64), TrainingError> {
        let mut found_inf = false;
        let mut sum_squares = 0.0f64;
        for var in &self.parameters {
            let tensor = var.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                let unscaled = self.scaler.unscale(&grad)?;
                if !found_inf && self.scaler.has_overflow([&unscaled])? {
                    found_inf = true;
                }
                sum_squares += squared_norm(&unscaled)?;
                grads.insert(tensor, unscaled);
            }
        }
        Ok((found_inf, sum_squares.sqrt()))
    }

    fn clear(&mut self) {
        self.grads = None;
        self.window_loss = 0.0;
        self.window_len = 0;
    }
}

fn merge_gradient_store(
    parameters: &[Var],
    accum: &mut GradStore,
    mut new_grads: GradStore,
) -> Result<(), TrainingError> {
    for var in parameters {
        let tensor = var.as_tensor();
        if let Some(grad) = new_grads.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}

/// Replaces every parameter gradient with its cross-worker mean, using one
/// collective over all parameters in order. Missing gradients contribute zeros.
fn average_gradients(
    parameters: &[Var],
    grads: &mut GradStore,
    ctx: &DistributedContext,
) -> Result<(), TrainingError> {
    let mut flat = Vec::new();
    let mut shapes = Vec::with_capacity(parameters.len());
    for var in parameters {
        let tensor = var.as_tensor();
        let numel = tensor.elem_count();
        match grads.get(tensor) {
            Some(grad) => {
                let values = grad
                    .to_dtype(DType::F64)
                    .and_then(|g| g.flatten_all())
                    .and_then(|g| g.to_vec1::<f64>())
                    .map_err(to_runtime_error)?;
                flat.extend(values);
            }
            None => flat.extend(std::iter::repeat(0.0).take(numel)),
        }
        shapes.push((tensor.dims().to_vec(), numel, grads.get(tensor).map(|g| g.dtype())));
    }

    ctx.all_reduce_mean_in_place(&mut flat)?;

    let mut offset = 0;
    for (var, (shape, numel, dtype)) in parameters.iter().zip(shapes) {
        let tensor = var.as_tensor();
        let values = flat[offset..offset + numel].to_vec();
        offset += numel;
        let dtype = dtype.unwrap_or(DType::F32);
        let averaged = Tensor::from_vec(values, shape, tensor.device())
            .and_then(|t| t.to_dtype(dtype))
            .map_err(to_runtime_error)?;
        grads.insert(tensor, averaged);
    }
    Ok(())
}

fn clip_gradients(
    parameters: &[Var],
    grads: &mut GradStore,
    max_norm: f64,
    total_norm: f64,
) -> Result<(), TrainingError> {
    if total_norm <= max_norm {
        return Ok(());
    }
    let clip_coef = max_norm / (total_norm + 1e-6);
    for var in parameters {
        let tensor = var.as_tensor();
        if let Some(grad) = grads.remove(tensor) {
            let clipped = grad.affine(clip_coef, 0.0).map_err(to_runtime_error)?;
            grads.insert(tensor, clipped);
        }
    }
    Ok(())
}

fn squared_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    tensor
        .to_dtype(DType::F64)
        .and_then(|t| t.sqr())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f64>())
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Precision,
        optimizer::{ParamGroup, Sgd, SgdConfig},
    };
    use candle_core::Device;

    /// loss = coef * sum(w), so dloss/dw = coef for every element.
    fn linear_loss(weight: &Var, coef: f64) -> LossOutput {
        let loss = weight
            .as_tensor()
            .sum_all()
            .unwrap()
            .affine(coef, 0.0)
            .unwrap();
        let value = loss.to_vec0::<f32>().unwrap() as f64;
        LossOutput {
            loss,
            value,
            batch_size: 1,
        }
    }

    fn setup(accum_iter: usize, max_norm: Option<f64>) -> (Var, Sgd, ScaledGradientStep) {
        let weight = Var::from_slice(&[1.0f32, 1.0], 2, &Device::Cpu).unwrap();
        let group = ParamGroup::new("head", vec![("w".into(), weight.clone())], 1.0, 0.0);
        let sgd = Sgd::new(vec![group], SgdConfig { momentum: 0.0 }).unwrap();
        let step = ScaledGradientStep::new(
            vec![weight.clone()],
            accum_iter,
            max_norm,
            GradientScaler::new(Precision::Fp32),
        )
        .unwrap();
        (weight, sgd, step)
    }

    #[test]
    fn steps_once_per_window_with_mean_gradient() {
        let (weight, mut sgd, mut step) = setup(2, None);
        let ctx = DistributedContext::standalone();

        let first = step
            .micro_step(&linear_loss(&weight, 1.0), 0, 0, &mut sgd, &ctx)
            .unwrap();
        assert_eq!(first, StepOutcome::Accumulating { loss: 2.0 });
        assert_eq!(sgd.steps(), 0);

        let second = step
            .micro_step(&linear_loss(&weight, 3.0), 0, 1, &mut sgd, &ctx)
            .unwrap();
        let StepOutcome::Stepped {
            loss,
            micro_steps,
            grad_norm,
            skipped,
        } = second
        else {
            panic!("expected a boundary step");
        };
        assert_eq!(loss, 4.0);
        assert_eq!(micro_steps, 2);
        assert!(!skipped);
        // mean gradient is 2 per element
        assert!((grad_norm - 8f64.sqrt()).abs() < 1e-6);
        assert_eq!(sgd.steps(), 1);
        assert_eq!(weight.as_tensor().to_vec1::<f32>().unwrap(), vec![-1.0, -1.0]);
        assert_eq!(step.pending(), 0);
    }

    #[test]
    fn four_micro_steps_match_one_step_on_the_mean_loss() {
        let quadratic = |weight: &Var, coef: f64| {
            let loss = weight
                .as_tensor()
                .sqr()
                .and_then(|t| t.sum_all())
                .and_then(|t| t.affine(coef, 0.0))
                .unwrap();
            let value = loss.to_vec0::<f32>().unwrap() as f64;
            LossOutput {
                loss,
                value,
                batch_size: 1,
            }
        };
        let ctx = DistributedContext::standalone();
        let coefs = [0.5, 1.0, 1.5, 3.0];

        let (accumulated, mut sgd, mut step) = setup(4, None);
        for (index, coef) in coefs.into_iter().enumerate() {
            step.micro_step(&quadratic(&accumulated, coef), 0, index, &mut sgd, &ctx)
                .unwrap();
        }
        assert_eq!(sgd.steps(), 1);

        let (single, mut reference_sgd, mut reference) = setup(1, None);
        let mean = coefs.iter().sum::<f64>() / coefs.len() as f64;
        reference
            .micro_step(&quadratic(&single, mean), 0, 0, &mut reference_sgd, &ctx)
            .unwrap();

        let lhs = accumulated.as_tensor().to_vec1::<f32>().unwrap();
        let rhs = single.as_tensor().to_vec1::<f32>().unwrap();
        for (a, b) in lhs.iter().zip(&rhs) {
            assert!((a - b).abs() < 1e-6, "{:?} vs {:?}", lhs, rhs);
        }
    }

    #[test]
    fn non_finite_loss_is_fatal() {
        let (weight, mut sgd, mut step) = setup(1, None);
        let mut output = linear_loss(&weight, 1.0);
        output.value = f64::NAN;

        let err = step
            .micro_step(&output, 3, 7, &mut sgd, &DistributedContext::standalone())
            .unwrap_err();

        match err {
            TrainingError::NonFiniteLoss { epoch, step, value } => {
                assert_eq!((epoch, step), (3, 7));
                assert!(value.is_nan());
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(sgd.steps(), 0);
    }

    #[test]
    fn clipping_bounds_the_update() {
        let (weight, mut sgd, mut step) = setup(1, Some(1.0));

        let outcome = step
            .micro_step(
                &linear_loss(&weight, 3.0),
                0,
                0,
                &mut sgd,
                &DistributedContext::standalone(),
            )
            .unwrap();

        // reported norm is the pre-clip norm
        let StepOutcome::Stepped { grad_norm, .. } = outcome else {
            panic!("expected a boundary step");
        };
        assert!((grad_norm - 18f64.sqrt()).abs() < 1e-6);
        let values = weight.as_tensor().to_vec1::<f32>().unwrap();
        let moved = ((1.0 - values[0]) as f64).hypot((1.0 - values[1]) as f64);
        assert!((moved - 1.0).abs() < 1e-4);
    }

    #[test]
    fn overflow_skips_update_and_backs_off() {
        let weight = Var::from_slice(&[1.0f32, 1.0], 2, &Device::Cpu).unwrap();
        let group = ParamGroup::new("head", vec![("w".into(), weight.clone())], 1.0, 0.0);
        let mut sgd = Sgd::new(vec![group], SgdConfig { momentum: 0.0 }).unwrap();
        let mut step = ScaledGradientStep::new(
            vec![weight.clone()],
            1,
            None,
            GradientScaler::new(Precision::Fp16),
        )
        .unwrap();
        let initial_scale = step.scaler().loss_scale();

        // finite loss value whose gradient overflows f32 once scaled
        let loss = weight
            .as_tensor()
            .sum_all()
            .unwrap()
            .affine(1e36, 0.0)
            .unwrap();
        let output = LossOutput {
            loss,
            value: 1.0,
            batch_size: 1,
        };
        let outcome = step
            .micro_step(&output, 0, 0, &mut sgd, &DistributedContext::standalone())
            .unwrap();

        assert!(matches!(outcome, StepOutcome::Stepped { skipped: true, .. }));
        assert_eq!(sgd.steps(), 0);
        assert_eq!(weight.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
        assert_eq!(step.scaler().loss_scale(), initial_scale * 0.5);
    }

    #[test]
    fn discard_reports_partial_window() {
        let (weight, mut sgd, mut step) = setup(4, None);
        let ctx = DistributedContext::standalone();
        for (index, coef) in [1.0, 2.0].into_iter().enumerate() {
            step.micro_step(&linear_loss(&weight, coef), 0, index, &mut sgd, &ctx)
                .unwrap();
        }

        let window = step.discard().unwrap();

        assert_eq!(window.micro_steps, 2);
        assert_eq!(window.loss, 3.0);
        assert_eq!(sgd.steps(), 0);
        assert!(step.discard().is_none());
    }
}
