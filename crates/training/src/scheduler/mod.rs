use std::f64::consts::PI;

use crate::{config, optimizer::Optimizer, TrainingError};

/// Maps a fractional epoch to a learning rate.
pub trait LRScheduler: Send {
    fn lr_at(&self, fractional_epoch: f64) -> f64;

    /// Sets every group to `lr * lr_scale` and returns the largest group lr.
    fn apply(&self, optimizer: &mut dyn Optimizer, fractional_epoch: f64) -> f64 {
        apply_lr(optimizer, self.lr_at(fractional_epoch))
    }
}

/// Linear warmup to `base_lr`, then half-cycle cosine to `min_lr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupCosine {
    pub base_lr: f64,
    pub min_lr: f64,
    pub warmup_epochs: f64,
    pub total_epochs: f64,
}

impl WarmupCosine {
    pub fn new(
        base_lr: f64,
        min_lr: f64,
        warmup_epochs: f64,
        total_epochs: f64,
    ) -> Result<Self, TrainingError> {
        if !(base_lr > 0.0) {
            return Err(TrainingError::initialization(
                "scheduler base_lr must be positive",
            ));
        }
        if min_lr < 0.0 || warmup_epochs < 0.0 || total_epochs <= 0.0 {
            return Err(TrainingError::initialization(format!(
                "invalid schedule (min_lr={}, warmup_epochs={}, total_epochs={})",
                min_lr, warmup_epochs, total_epochs
            )));
        }
        Ok(Self {
            base_lr,
            min_lr,
            warmup_epochs,
            total_epochs,
        })
    }

    pub fn from_config(cfg: &config::ProbeConfig, world_size: usize) -> Result<Self, TrainingError> {
        Self::new(
            cfg.effective_lr(world_size),
            cfg.optimizer.min_lr,
            cfg.scheduler.warmup_epochs,
            cfg.scheduler.epochs as f64,
        )
    }
}

impl LRScheduler for WarmupCosine {
    fn lr_at(&self, fractional_epoch: f64) -> f64 {
        compute_lr(
            fractional_epoch,
            self.base_lr,
            self.min_lr,
            self.warmup_epochs,
            self.total_epochs,
        )
    }
}

pub fn compute_lr(
    fractional_epoch: f64,
    base_lr: f64,
    min_lr: f64,
    warmup_epochs: f64,
    total_epochs: f64,
) -> f64 {
    if fractional_epoch < warmup_epochs {
        return base_lr * fractional_epoch / warmup_epochs;
    }
    let span = total_epochs - warmup_epochs;
    if span <= 0.0 {
        // Warmup fills the whole run: hold the peak at its end, then rest at the floor.
        return if fractional_epoch <= warmup_epochs {
            base_lr
        } else {
            min_lr
        };
    }
    let progress = ((fractional_epoch - warmup_epochs) / span).clamp(0.0, 1.0);
    min_lr + (base_lr - min_lr) * 0.5 * (1.0 + (PI * progress).cos())
}

/// `epoch + step / steps_per_epoch`.
pub fn fractional_epoch(epoch: usize, step: usize, steps_per_epoch: usize) -> f64 {
    epoch as f64 + step as f64 / steps_per_epoch.max(1) as f64
}

pub fn apply_lr(optimizer: &mut dyn Optimizer, lr: f64) -> f64 {
    let mut max_lr = 0.0f64;
    for group in optimizer.param_groups_mut() {
        group.lr = lr * group.lr_scale;
        max_lr = max_lr.max(group.lr);
    }
    max_lr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{test_support::var, Optimizer, ParamGroup, Sgd, SgdConfig};

    fn schedule() -> WarmupCosine {
        WarmupCosine::new(0.4, 0.01, 5.0, 50.0).unwrap()
    }

    #[test]
    fn warmup_is_monotone_and_reaches_base_lr() {
        let schedule = schedule();
        let mut previous = -1.0;
        for i in 0..=500 {
            let epoch = i as f64 * 0.01;
            let lr = schedule.lr_at(epoch);
            assert!(lr >= previous, "lr decreased at epoch {}", epoch);
            previous = lr;
        }
        assert_eq!(schedule.lr_at(0.0), 0.0);
        assert!((schedule.lr_at(5.0) - 0.4).abs() < 1e-15);
    }

    #[test]
    fn decays_to_min_lr_at_and_after_end() {
        let schedule = schedule();
        assert!((schedule.lr_at(27.5) - (0.01 + 0.39 * 0.5)).abs() < 1e-12);
        for epoch in [50.0, 50.5, 120.0] {
            assert!((schedule.lr_at(epoch) - 0.01).abs() < 1e-15);
        }
    }

    #[test]
    fn empty_decay_span_peaks_at_end_of_warmup() {
        let schedule = WarmupCosine::new(0.4, 0.02, 3.0, 3.0).unwrap();
        assert!((schedule.lr_at(1.5) - 0.2).abs() < 1e-15);
        assert!((schedule.lr_at(2.999) - 0.4).abs() < 1e-3);
        assert_eq!(schedule.lr_at(3.0), 0.4);
        assert_eq!(schedule.lr_at(3.5), 0.02);
    }

    #[test]
    fn schedule_is_continuous_at_end_of_warmup() {
        for (warmup, total) in [(5.0, 50.0), (3.0, 3.0), (0.5, 1.0)] {
            let schedule = WarmupCosine::new(0.4, 0.02, warmup, total).unwrap();
            let before = schedule.lr_at(warmup - 1e-9);
            let at = schedule.lr_at(warmup);
            assert!((before - at).abs() < 1e-6, "jump at warmup={} total={}", warmup, total);
        }
    }

    #[test]
    fn fractional_epoch_interpolates_steps() {
        assert_eq!(fractional_epoch(2, 25, 100), 2.25);
        assert_eq!(fractional_epoch(0, 0, 0), 0.0);
    }

    #[test]
    fn apply_respects_group_lr_scale() {
        let groups = vec![
            ParamGroup::new("a", vec![("a".into(), var(&[1.0], &[1]))], 0.0, 0.0),
            ParamGroup {
                lr_scale: 0.5,
                ..ParamGroup::new("b", vec![("b".into(), var(&[1.0], &[1]))], 0.0, 0.0)
            },
        ];
        let mut sgd = Sgd::new(groups, SgdConfig { momentum: 0.9 }).unwrap();

        let reported = apply_lr(&mut sgd, 0.2);

        assert_eq!(reported, 0.2);
        assert_eq!(sgd.param_groups()[0].lr, 0.2);
        assert_eq!(sgd.param_groups()[1].lr, 0.1);
    }
}
