use crate::error::{Result, SimsError};
use serde::{Deserialize, Serialize};

/// Learning rate schedulers
///
/// Epoch-indexed schedules are pure functions of the epoch; plateau
/// reduction carries its own state, which is saved with checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LearningRateScheduler {
    /// Constant learning rate
    Constant { lr: f64 },
    /// Step decay: multiply by gamma every step_size epochs
    Step { lr: f64, step_size: usize, gamma: f64 },
    /// Exponential decay: lr * gamma^epoch
    Exponential { lr: f64, gamma: f64 },
    /// Cosine annealing
    Cosine { lr: f64, t_max: usize, eta_min: f64 },
    /// Multiply by `factor` once the monitored loss has not improved for
    /// more than `patience` epochs
    ReduceOnPlateau {
        lr: f64,
        factor: f64,
        patience: usize,
        min_lr: f64,
        #[serde(default)]
        best: Option<f64>,
        #[serde(default)]
        num_bad_epochs: usize,
    },
}

impl LearningRateScheduler {
    /// Create constant scheduler
    pub fn constant(lr: f64) -> Self {
        Self::Constant { lr }
    }

    /// Create step scheduler
    pub fn step(lr: f64, step_size: usize, gamma: f64) -> Self {
        Self::Step { lr, step_size, gamma }
    }

    /// Create exponential scheduler
    pub fn exponential(lr: f64, gamma: f64) -> Self {
        Self::Exponential { lr, gamma }
    }

    /// Create cosine annealing scheduler
    pub fn cosine(lr: f64, t_max: usize, eta_min: f64) -> Self {
        Self::Cosine { lr, t_max, eta_min }
    }

    /// Create reduce on plateau scheduler
    pub fn reduce_on_plateau(lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self::ReduceOnPlateau {
            lr,
            factor,
            patience,
            min_lr,
            best: None,
            num_bad_epochs: 0,
        }
    }

    /// Parse a scheduler name as accepted on the command line
    pub fn from_name(name: &str, lr: f64, epochs: usize) -> Result<Self> {
        match name {
            "constant" => Ok(Self::constant(lr)),
            "step" => Ok(Self::step(lr, 10, 0.5)),
            "exponential" => Ok(Self::exponential(lr, 0.95)),
            "cosine" => Ok(Self::cosine(lr, epochs.max(1), lr * 0.01)),
            "plateau" | "reduce_on_plateau" => Ok(Self::reduce_on_plateau(lr, 0.75, 2, 1e-6)),
            other => Err(SimsError::InvalidConfig(format!("unknown lr scheduler {other:?}"))),
        }
    }

    /// Learning rate for an epoch (0-based)
    pub fn get_lr(&self, epoch: usize) -> f64 {
        match *self {
            Self::Constant { lr } => lr,
            Self::Step { lr, step_size, gamma } => {
                let num_steps = epoch / step_size.max(1);
                lr * gamma.powi(num_steps as i32)
            }
            Self::Exponential { lr, gamma } => lr * gamma.powi(epoch as i32),
            Self::Cosine { lr, t_max, eta_min } => {
                if epoch >= t_max {
                    eta_min
                } else {
                    let progress = epoch as f64 / t_max as f64;
                    eta_min + (lr - eta_min) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
                }
            }
            Self::ReduceOnPlateau { lr, .. } => lr,
        }
    }

    /// Feed the monitored loss after an epoch; lower is better
    pub fn step_with_metric(&mut self, metric: f64) {
        if let Self::ReduceOnPlateau {
            lr,
            factor,
            patience,
            min_lr,
            best,
            num_bad_epochs,
        } = self
        {
            if !metric.is_finite() {
                return;
            }
            match *best {
                Some(b) if metric >= b => *num_bad_epochs += 1,
                _ => {
                    *best = Some(metric);
                    *num_bad_epochs = 0;
                }
            }

            if *num_bad_epochs > *patience {
                let new_lr = (*lr * *factor).max(*min_lr);
                if new_lr < *lr {
                    tracing::info!("Reducing learning rate to {:.3e}", new_lr);
                    *lr = new_lr;
                }
                *num_bad_epochs = 0;
            }
        }
    }

    /// Initial learning rate
    pub fn base_lr(&self) -> f64 {
        match *self {
            Self::Constant { lr }
            | Self::Step { lr, .. }
            | Self::Exponential { lr, .. }
            | Self::Cosine { lr, .. }
            | Self::ReduceOnPlateau { lr, .. } => lr,
        }
    }
}

impl Default for LearningRateScheduler {
    fn default() -> Self {
        Self::reduce_on_plateau(1e-3, 0.75, 2, 1e-6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LearningRateScheduler::constant(0.001);
        assert_eq!(scheduler.get_lr(0), 0.001);
        assert_eq!(scheduler.get_lr(100), 0.001);
    }

    #[test]
    fn test_step_scheduler() {
        let scheduler = LearningRateScheduler::step(0.001, 10, 0.5);
        assert_eq!(scheduler.get_lr(0), 0.001);
        assert_eq!(scheduler.get_lr(9), 0.001);
        assert_eq!(scheduler.get_lr(10), 0.0005);
        assert_eq!(scheduler.get_lr(20), 0.00025);
    }

    #[test]
    fn test_exponential_scheduler() {
        let scheduler = LearningRateScheduler::exponential(0.001, 0.9);
        assert_eq!(scheduler.get_lr(0), 0.001);
        assert!((scheduler.get_lr(1) - 0.0009).abs() < 1e-10);
    }

    #[test]
    fn test_cosine_scheduler() {
        let scheduler = LearningRateScheduler::cosine(0.001, 100, 0.0001);
        assert!((scheduler.get_lr(0) - 0.001).abs() < 1e-12);
        assert_eq!(scheduler.get_lr(100), 0.0001);
        let mid_lr = scheduler.get_lr(50);
        assert!((mid_lr - 0.00055).abs() < 1e-9);
    }

    #[test]
    fn test_plateau_tracks_best() {
        let mut s = LearningRateScheduler::reduce_on_plateau(1.0, 0.5, 1, 0.1);
        s.step_with_metric(1.0);
        s.step_with_metric(0.9); // improvement resets the counter
        s.step_with_metric(0.95);
        assert_eq!(s.get_lr(3), 1.0);
        s.step_with_metric(0.95); // second bad epoch exceeds patience
        assert_eq!(s.get_lr(4), 0.5);

        for _ in 0..10 {
            s.step_with_metric(5.0);
        }
        assert_eq!(s.get_lr(20), 0.1);
    }

    #[test]
    fn test_scheduler_state_serializes() {
        let mut s = LearningRateScheduler::default();
        s.step_with_metric(1.0);
        s.step_with_metric(2.0);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("reduce_on_plateau"));
        let back: LearningRateScheduler = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            LearningRateScheduler::from_name("constant", 0.01, 5).unwrap(),
            LearningRateScheduler::constant(0.01)
        );
        assert!(LearningRateScheduler::from_name("warp", 0.01, 5).is_err());
    }
}
