pub mod callbacks;
pub mod scheduler;
pub mod sink;
pub mod trainer;

use crate::data::schema::SchemaMode;
use crate::data::SplitConfig;
use crate::error::{Result, SimsError};
use crate::model::checkpoint::{Checkpoint, TrainingProgress};
use crate::model::loss::metrics::ClassificationMetrics;
use scheduler::LearningRateScheduler;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Metric that drives early stopping and best-checkpoint selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Monitor {
    #[default]
    ValLoss,
    ValAccuracy,
    ValMacroF1,
    ValMedianF1,
}

impl Monitor {
    /// Whether larger values are better
    pub fn higher_is_better(&self) -> bool {
        !matches!(self, Monitor::ValLoss)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Monitor::ValLoss => "val_loss",
            Monitor::ValAccuracy => "val_accuracy",
            Monitor::ValMacroF1 => "val_macro_f1",
            Monitor::ValMedianF1 => "val_median_f1",
        }
    }

    /// Whether `current` beats `best` by more than `min_delta`
    pub fn improves(&self, current: f64, best: Option<f64>, min_delta: f64) -> bool {
        if !current.is_finite() {
            return false;
        }
        match best {
            None => true,
            Some(best) if self.higher_is_better() => current > best + min_delta,
            Some(best) => current < best - min_delta,
        }
    }
}

impl std::str::FromStr for Monitor {
    type Err = SimsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "val_loss" | "loss" => Ok(Monitor::ValLoss),
            "val_accuracy" | "accuracy" => Ok(Monitor::ValAccuracy),
            "val_macro_f1" | "macro_f1" => Ok(Monitor::ValMacroF1),
            "val_median_f1" | "median_f1" => Ok(Monitor::ValMedianF1),
            other => Err(SimsError::InvalidConfig(format!("unknown monitor {other:?}"))),
        }
    }
}

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    /// Weight decay (L2 penalty inside Adam)
    pub weight_decay: f64,
    /// Learning rate scheduler; its `lr` is replaced by `learning_rate`
    pub lr_scheduler: LearningRateScheduler,
    /// Early stopping patience in epochs (0 = disabled)
    pub patience: usize,
    /// Minimum change that counts as an improvement
    pub min_delta: f64,
    /// Fraction of rows held out for validation
    pub val_ratio: f32,
    /// Random seed for the split and batch order
    pub seed: u64,
    /// Metric for early stopping and best checkpoint
    pub monitor: Monitor,
    /// Threads assembling batches (0 = rayon default)
    pub num_workers: usize,
    /// How source gene sets form the schema
    pub schema_mode: SchemaMode,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 256,
            learning_rate: 1e-3,
            weight_decay: 1e-3,
            lr_scheduler: LearningRateScheduler::default(),
            patience: 10,
            min_delta: 0.0,
            val_ratio: 0.2,
            seed: 2026,
            monitor: Monitor::ValLoss,
            num_workers: 0,
            schema_mode: SchemaMode::Union,
        }
    }
}

impl TrainingConfig {
    /// Create configuration for quick testing
    pub fn quick_test() -> Self {
        Self {
            epochs: 5,
            batch_size: 64,
            learning_rate: 0.01,
            lr_scheduler: LearningRateScheduler::constant(0.01),
            patience: 2,
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| SimsError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(SimsError::InvalidConfig(msg));
        if self.epochs == 0 {
            return fail("epochs must be positive".to_string());
        }
        if self.batch_size == 0 {
            return fail("batch_size must be positive".to_string());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return fail(format!("weight_decay must be non-negative, got {}", self.weight_decay));
        }
        if !(0.0..1.0).contains(&self.val_ratio) {
            return fail(format!("val_ratio must be in [0, 1), got {}", self.val_ratio));
        }
        if !(self.min_delta.is_finite() && self.min_delta >= 0.0) {
            return fail(format!("min_delta must be non-negative, got {}", self.min_delta));
        }
        Ok(())
    }

    /// Train/validation split settings
    pub fn split(&self) -> SplitConfig {
        SplitConfig {
            val_ratio: self.val_ratio,
            seed: self.seed,
        }
    }

    /// The scheduler with its base rate set to `learning_rate`
    pub fn scheduler(&self) -> LearningRateScheduler {
        let mut scheduler = self.lr_scheduler.clone();
        match &mut scheduler {
            LearningRateScheduler::Constant { lr }
            | LearningRateScheduler::Step { lr, .. }
            | LearningRateScheduler::Exponential { lr, .. }
            | LearningRateScheduler::Cosine { lr, .. }
            | LearningRateScheduler::ReduceOnPlateau { lr, .. } => *lr = self.learning_rate,
        }
        scheduler
    }
}

/// Loss and scores of one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train: ClassificationMetrics,
    /// Absent when no rows are held out
    pub val_loss: Option<f64>,
    pub val: Option<ClassificationMetrics>,
}

impl EpochMetrics {
    /// Value of the monitored metric, falling back to training scores
    /// when there is no validation split
    pub fn monitored(&self, monitor: Monitor) -> f64 {
        let scores = self.val.as_ref().unwrap_or(&self.train);
        match monitor {
            Monitor::ValLoss => self.val_loss.unwrap_or(self.train_loss),
            Monitor::ValAccuracy => scores.accuracy,
            Monitor::ValMacroF1 => scores.macro_f1,
            Monitor::ValMedianF1 => scores.median_f1,
        }
    }

    /// Flat (name, value) pairs for metric sinks
    pub fn named_values(&self) -> Vec<(&'static str, f64)> {
        let mut values = vec![
            ("learning_rate", self.learning_rate),
            ("train_loss", self.train_loss),
            ("train_accuracy", self.train.accuracy),
            ("train_macro_precision", self.train.macro_precision),
            ("train_macro_recall", self.train.macro_recall),
            ("train_macro_f1", self.train.macro_f1),
            ("train_median_f1", self.train.median_f1),
        ];
        if let Some(loss) = self.val_loss {
            values.push(("val_loss", loss));
        }
        if let Some(val) = &self.val {
            values.extend([
                ("val_accuracy", val.accuracy),
                ("val_macro_precision", val.macro_precision),
                ("val_macro_recall", val.macro_recall),
                ("val_macro_f1", val.macro_f1),
                ("val_median_f1", val.median_f1),
            ]);
        }
        values
    }
}

/// Training state
#[derive(Debug, Clone, Default)]
pub struct TrainingState {
    /// Completed epochs
    pub epoch: usize,
    /// Current global step
    pub global_step: usize,
    /// Best monitored value
    pub best_score: Option<f64>,
    /// 1-based epoch of `best_score`
    pub best_epoch: Option<usize>,
    /// Number of epochs without improvement
    pub epochs_without_improvement: usize,
    /// Learning rate of the last epoch
    pub learning_rate: f64,
    /// Monitored value per epoch
    pub history: Vec<f64>,
    /// Full metrics of the last epoch
    pub last_metrics: Option<EpochMetrics>,
}

impl TrainingState {
    /// Create new training state
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from a checkpoint's progress
    pub fn from_progress(progress: &TrainingProgress) -> Self {
        Self {
            epoch: progress.epochs_completed,
            global_step: progress.global_step,
            best_score: progress.best_score,
            best_epoch: progress.best_epoch,
            epochs_without_improvement: progress.epochs_without_improvement,
            learning_rate: progress.learning_rate,
            history: progress.history.clone(),
            last_metrics: None,
        }
    }

    /// Progress record for a checkpoint
    pub fn progress(&self) -> TrainingProgress {
        TrainingProgress {
            epochs_completed: self.epoch,
            global_step: self.global_step,
            best_epoch: self.best_epoch,
            best_score: self.best_score,
            epochs_without_improvement: self.epochs_without_improvement,
            learning_rate: self.learning_rate,
            history: self.history.clone(),
        }
    }

    /// Update after epoch; returns whether the monitored value improved
    pub fn update_epoch(&mut self, metrics: EpochMetrics, monitor: Monitor, min_delta: f64) -> bool {
        let score = metrics.monitored(monitor);
        self.epoch = metrics.epoch;
        self.learning_rate = metrics.learning_rate;
        self.history.push(score);
        self.last_metrics = Some(metrics);

        let improved = monitor.improves(score, self.best_score, min_delta);
        if improved {
            self.best_score = Some(score);
            self.best_epoch = Some(self.epoch);
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }
        improved
    }
}

/// Training result
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Final training state
    pub state: TrainingState,
    /// Best checkpoint, as stored under the `best` key
    pub best: Option<Checkpoint>,
    /// A hook asked to stop before `epochs` was reached
    pub stopped_early: bool,
    /// Training duration in seconds
    pub duration_secs: f64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn epoch_with_val_loss(epoch: usize, val_loss: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            learning_rate: 1e-3,
            train_loss: 1.0,
            train: ClassificationMetrics::default(),
            val_loss: Some(val_loss),
            val: Some(ClassificationMetrics::default()),
        }
    }

    #[test]
    fn test_state_tracks_best() {
        let mut state = TrainingState::new();
        assert!(state.update_epoch(epoch_with_val_loss(1, 1.0), Monitor::ValLoss, 0.0));
        assert!(!state.update_epoch(epoch_with_val_loss(2, 1.1), Monitor::ValLoss, 0.0));
        assert_eq!(state.epochs_without_improvement, 1);
        assert!(state.update_epoch(epoch_with_val_loss(3, 0.9), Monitor::ValLoss, 0.0));
        assert_eq!(state.best_epoch, Some(3));
        assert_eq!(state.history, vec![1.0, 1.1, 0.9]);

        let restored = TrainingState::from_progress(&state.progress());
        assert_eq!(restored.epoch, 3);
        assert_eq!(restored.best_score, Some(0.9));
    }

    #[test]
    fn test_monitor_direction() {
        assert!(Monitor::ValLoss.improves(0.5, Some(0.6), 0.0));
        assert!(!Monitor::ValLoss.improves(0.59, Some(0.6), 0.05));
        assert!(Monitor::ValMacroF1.improves(0.7, Some(0.6), 0.0));
        assert!(!Monitor::ValAccuracy.improves(f64::NAN, None, 0.0));
        assert_eq!("val_median_f1".parse::<Monitor>().unwrap(), Monitor::ValMedianF1);
    }

    #[test]
    fn test_config_from_partial_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(
            &path,
            r#"{"epochs": 7, "monitor": "val_macro_f1", "lr_scheduler": {"kind": "constant", "lr": 0.5}}"#,
        )
        .unwrap();

        let config = TrainingConfig::from_file(&path).unwrap();
        assert_eq!(config.epochs, 7);
        assert_eq!(config.monitor, Monitor::ValMacroF1);
        assert_eq!(config.batch_size, TrainingConfig::default().batch_size);
        // base rate always comes from learning_rate
        assert_eq!(config.scheduler().get_lr(0), config.learning_rate);
    }

    #[test]
    fn test_config_validation() {
        let bad = TrainingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(SimsError::InvalidConfig(_))));

        let bad = TrainingConfig {
            val_ratio: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(TrainingConfig::quick_test().validate().is_ok());
    }
}
