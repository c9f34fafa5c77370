use crate::training::{EpochMetrics, Monitor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a hook asks the loop to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// Read-only view of training handed to hooks
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    /// 1-based epoch the extension point belongs to
    pub epoch: usize,
    pub total_epochs: usize,
    /// 0-based batch index, set at `post_batch`
    pub batch: Option<usize>,
    pub batches_per_epoch: usize,
    /// Loss of the batch just taken, set at `post_batch`
    pub batch_loss: Option<f64>,
    pub learning_rate: f64,
    pub global_step: usize,
    /// Metrics of the epoch just finished, set at `post_epoch`
    pub metrics: Option<EpochMetrics>,
    pub best_score: Option<f64>,
    pub best_epoch: Option<usize>,
    pub epochs_without_improvement: usize,
}

/// Training hook trait
///
/// Hooks run synchronously in registration order at three extension
/// points and may request a stop.
pub trait TrainingHook: Send {
    /// Called before each epoch
    fn pre_epoch(&mut self, _snapshot: &MetricSnapshot) -> Control {
        Control::Continue
    }

    /// Called after each optimizer step
    fn post_batch(&mut self, _snapshot: &MetricSnapshot) -> Control {
        Control::Continue
    }

    /// Called after each epoch's validation
    fn post_epoch(&mut self, _snapshot: &MetricSnapshot) -> Control {
        Control::Continue
    }

    /// Called once when training resumes from a checkpoint
    fn restore(&mut self, _snapshot: &MetricSnapshot) {}
}

/// Ordered collection of hooks
#[derive(Default)]
pub struct HookSet {
    hooks: Vec<Box<dyn TrainingHook>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook
    pub fn add<H: TrainingHook + 'static>(&mut self, hook: H) {
        self.hooks.push(Box::new(hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn run(&mut self, mut f: impl FnMut(&mut dyn TrainingHook) -> Control) -> Control {
        // every hook sees the event even if an earlier one asked to stop
        let mut control = Control::Continue;
        for hook in &mut self.hooks {
            if f(hook.as_mut()) == Control::Stop {
                control = Control::Stop;
            }
        }
        control
    }

    pub fn pre_epoch(&mut self, snapshot: &MetricSnapshot) -> Control {
        self.run(|h| h.pre_epoch(snapshot))
    }

    pub fn post_batch(&mut self, snapshot: &MetricSnapshot) -> Control {
        self.run(|h| h.post_batch(snapshot))
    }

    pub fn post_epoch(&mut self, snapshot: &MetricSnapshot) -> Control {
        self.run(|h| h.post_epoch(snapshot))
    }

    pub fn restore(&mut self, snapshot: &MetricSnapshot) {
        for hook in &mut self.hooks {
            hook.restore(snapshot);
        }
    }
}

/// Stops once the monitored metric has not improved for `patience` epochs
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: Monitor,
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    counter: usize,
}

impl EarlyStopping {
    /// Create new early stopping hook
    pub fn new(monitor: Monitor, patience: usize) -> Self {
        Self {
            monitor,
            patience,
            min_delta: 0.0,
            best: None,
            counter: 0,
        }
    }

    /// Minimum change that counts as improvement
    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// Epochs since the last improvement
    pub fn counter(&self) -> usize {
        self.counter
    }
}

impl TrainingHook for EarlyStopping {
    fn post_epoch(&mut self, snapshot: &MetricSnapshot) -> Control {
        let Some(metrics) = &snapshot.metrics else {
            return Control::Continue;
        };
        let current = metrics.monitored(self.monitor);

        if self.monitor.improves(current, self.best, self.min_delta) {
            self.best = Some(current);
            self.counter = 0;
        } else {
            self.counter += 1;
        }

        if self.patience > 0 && self.counter >= self.patience {
            tracing::info!(
                "Early stopping at epoch {}: {} has not improved for {} epochs (best {:?})",
                snapshot.epoch,
                self.monitor.name(),
                self.counter,
                self.best
            );
            Control::Stop
        } else {
            Control::Continue
        }
    }

    fn restore(&mut self, snapshot: &MetricSnapshot) {
        self.best = snapshot.best_score;
        self.counter = snapshot.epochs_without_improvement;
    }
}

/// Logs a one-line epoch summary
#[derive(Debug, Clone)]
pub struct ProgressLogger {
    log_frequency: usize,
}

impl ProgressLogger {
    /// Create new progress logger
    pub fn new(log_frequency: usize) -> Self {
        Self {
            log_frequency: log_frequency.max(1),
        }
    }
}

impl TrainingHook for ProgressLogger {
    fn post_epoch(&mut self, snapshot: &MetricSnapshot) -> Control {
        if let Some(m) = &snapshot.metrics {
            if m.epoch % self.log_frequency == 0 {
                match (m.val_loss, &m.val) {
                    (Some(val_loss), Some(val)) => tracing::info!(
                        "Epoch {}/{} - loss: {:.4}, val_loss: {:.4}, val_acc: {:.4}, val_macro_f1: {:.4}, lr: {:.2e}",
                        m.epoch,
                        snapshot.total_epochs,
                        m.train_loss,
                        val_loss,
                        val.accuracy,
                        val.macro_f1,
                        m.learning_rate
                    ),
                    _ => tracing::info!(
                        "Epoch {}/{} - loss: {:.4}, acc: {:.4}, lr: {:.2e}",
                        m.epoch,
                        snapshot.total_epochs,
                        m.train_loss,
                        m.train.accuracy,
                        m.learning_rate
                    ),
                }
            }
        }
        Control::Continue
    }
}

/// Cooperative cancellation checked at every epoch boundary
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing flag, e.g. one set by a Ctrl-C handler
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// Request a stop at the next epoch boundary
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

impl TrainingHook for StopSignal {
    fn pre_epoch(&mut self, snapshot: &MetricSnapshot) -> Control {
        if self.is_triggered() {
            tracing::warn!("Interrupted before epoch {}", snapshot.epoch);
            Control::Stop
        } else {
            Control::Continue
        }
    }
}

/// Timer hook that tracks epoch durations
#[derive(Debug, Clone, Default)]
pub struct EpochTimer {
    started: Option<Instant>,
    durations: Arc<std::sync::Mutex<Vec<Duration>>>,
}

impl EpochTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durations of completed epochs; shared with clones of this timer
    pub fn durations(&self) -> Vec<Duration> {
        self.durations.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Get average epoch time
    pub fn average_epoch_time(&self) -> Option<Duration> {
        let durations = self.durations();
        if durations.is_empty() {
            None
        } else {
            let total: Duration = durations.iter().sum();
            Some(total / durations.len() as u32)
        }
    }
}

impl TrainingHook for EpochTimer {
    fn pre_epoch(&mut self, _snapshot: &MetricSnapshot) -> Control {
        self.started = Some(Instant::now());
        Control::Continue
    }

    fn post_epoch(&mut self, snapshot: &MetricSnapshot) -> Control {
        if let Some(start) = self.started.take() {
            let elapsed = start.elapsed();
            tracing::debug!("Epoch {} took {:.2?}", snapshot.epoch, elapsed);
            if let Ok(mut d) = self.durations.lock() {
                d.push(elapsed);
            }
        }
        Control::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::tests::epoch_with_val_loss;

    fn snapshot_after(epoch: usize, val_loss: f64) -> MetricSnapshot {
        MetricSnapshot {
            epoch,
            total_epochs: 10,
            metrics: Some(epoch_with_val_loss(epoch, val_loss)),
            ..Default::default()
        }
    }

    #[test]
    fn test_early_stopping() {
        let mut hook = EarlyStopping::new(Monitor::ValLoss, 2);

        assert_eq!(hook.post_epoch(&snapshot_after(1, 1.0)), Control::Continue);
        assert_eq!(hook.post_epoch(&snapshot_after(2, 1.1)), Control::Continue);
        assert_eq!(hook.post_epoch(&snapshot_after(3, 1.2)), Control::Stop);
    }

    #[test]
    fn test_early_stopping_restores_counter() {
        let mut hook = EarlyStopping::new(Monitor::ValLoss, 2);
        hook.restore(&MetricSnapshot {
            best_score: Some(0.5),
            epochs_without_improvement: 1,
            ..Default::default()
        });
        assert_eq!(hook.post_epoch(&snapshot_after(5, 0.6)), Control::Stop);
    }

    #[test]
    fn test_zero_patience_never_stops() {
        let mut hook = EarlyStopping::new(Monitor::ValLoss, 0);
        for epoch in 1..10 {
            assert_eq!(hook.post_epoch(&snapshot_after(epoch, epoch as f64)), Control::Continue);
        }
    }

    #[test]
    fn test_stop_signal_shared_flag() {
        let signal = StopSignal::new();
        let mut hooks = HookSet::new();
        hooks.add(signal.clone());

        let snapshot = MetricSnapshot::default();
        assert_eq!(hooks.pre_epoch(&snapshot), Control::Continue);
        signal.trigger();
        assert_eq!(hooks.pre_epoch(&snapshot), Control::Stop);
    }

    #[test]
    fn test_all_hooks_run_when_one_stops() {
        let signal = StopSignal::new();
        signal.trigger();
        let timer = EpochTimer::new();

        let mut hooks = HookSet::new();
        hooks.add(signal);
        hooks.add(timer.clone());
        hooks.add(ProgressLogger::new(1));
        assert_eq!(hooks.len(), 3);

        assert_eq!(hooks.pre_epoch(&snapshot_after(1, 1.0)), Control::Stop);
        assert_eq!(hooks.post_epoch(&snapshot_after(1, 1.0)), Control::Continue);
        assert_eq!(timer.durations().len(), 1);
        assert!(timer.average_epoch_time().is_some());
    }
}
