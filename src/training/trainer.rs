use crate::data::dataset::{batches, DatasetSplit, MultiSourceDataset};
use crate::data::labels::LabelCodec;
use crate::data::Sample;
use crate::error::{Result, SimsError};
use crate::model::architecture::SequentialAttentionNetwork;
use crate::model::checkpoint::{
    decode_record, encode_record, Checkpoint, CheckpointMeta, CheckpointStore, BEST_KEY, LAST_KEY,
};
use crate::model::loss::metrics::ConfusionMatrix;
use crate::model::loss::WeightedCrossEntropy;
use crate::model::{argmax_rows, to_host, NetworkConfig};
use crate::training::callbacks::{Control, EarlyStopping, HookSet, MetricSnapshot, ProgressLogger, TrainingHook};
use crate::training::sink::{self, MetricSink};
use crate::training::{EpochMetrics, TrainingConfig, TrainingResult, TrainingState};
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, TensorData};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::ThreadPool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Verdict of the bookkeeping at the end of an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochOutcome {
    /// Monitored metric improved; the checkpoint becomes the best one
    pub improved: bool,
    /// A hook asked to stop
    pub stop: bool,
}

/// Row fetching, optionally on a dedicated rayon pool
struct Fetcher<'a> {
    dataset: &'a MultiSourceDataset,
    pool: Option<ThreadPool>,
}

impl<'a> Fetcher<'a> {
    fn new(dataset: &'a MultiSourceDataset, workers: usize) -> Result<Self> {
        let pool = if workers == 0 {
            None
        } else {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .build()
                    .map_err(|e| SimsError::InvalidConfig(format!("cannot start {workers} workers: {e}")))?,
            )
        };
        Ok(Self { dataset, pool })
    }

    fn fetch(&self, indices: &[usize]) -> Result<Vec<Sample>> {
        match &self.pool {
            Some(pool) => pool.install(|| self.dataset.get_many(indices)),
            None => self.dataset.get_many(indices),
        }
    }
}

/// Stack labeled samples into (features, targets) tensors
pub(crate) fn batch_tensors<Bk: Backend>(
    samples: &[Sample],
    width: usize,
    device: &Bk::Device,
) -> Result<(Tensor<Bk, 2>, Tensor<Bk, 1, Int>, Vec<usize>)> {
    let mut flat = Vec::with_capacity(samples.len() * width);
    let mut targets = Vec::with_capacity(samples.len());
    for sample in samples {
        flat.extend_from_slice(&sample.features);
        let label = sample
            .label
            .ok_or_else(|| SimsError::InvalidConfig("training rows must carry labels".to_string()))?;
        targets.push(label);
    }

    let n = samples.len();
    let x = Tensor::from_data(TensorData::new(flat, [n, width]), device);
    let y = Tensor::from_data(
        TensorData::new(targets.iter().map(|&t| t as i64).collect::<Vec<_>>(), [n]),
        device,
    );
    Ok((x, y, targets))
}

/// Loss and confusion matrix over `indices`, without parameter updates
#[allow(clippy::too_many_arguments)]
fn evaluate<Bk: Backend>(
    network: &SequentialAttentionNetwork<Bk>,
    loss_fn: &WeightedCrossEntropy<Bk>,
    lambda_sparse: f64,
    fetcher: &Fetcher<'_>,
    indices: &[usize],
    batch_size: usize,
    device: &Bk::Device,
) -> Result<(f64, ConfusionMatrix)> {
    let n_classes = network.output_dim();
    let mut cm = ConfusionMatrix::new(n_classes);
    let mut loss_sum = 0.0;

    for chunk in indices.chunks(batch_size) {
        let samples = fetcher.fetch(chunk)?;
        let (x, y, targets) = batch_tensors::<Bk>(&samples, network.input_dim(), device)?;
        let output = network.forward(x)?;
        let loss = loss_fn.forward(output.logits.clone(), y) - output.sparsity_loss.mul_scalar(lambda_sparse);
        let value: f64 = loss.into_scalar().elem();
        loss_sum += value * chunk.len() as f64;

        let predictions = argmax_rows(&to_host(output.logits), n_classes);
        for (&t, &p) in targets.iter().zip(&predictions) {
            cm.add(t, p);
        }
    }

    Ok((loss_sum / indices.len().max(1) as f64, cm))
}

/// Drives optimisation of a [`SequentialAttentionNetwork`]
pub struct TrainingLoop<B: AutodiffBackend> {
    config: TrainingConfig,
    network: NetworkConfig,
    device: B::Device,
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn MetricSink>,
    hooks: HookSet,
    resume: Option<Checkpoint>,
    show_progress: bool,
}

impl<B: AutodiffBackend> TrainingLoop<B> {
    /// Create new training loop.
    ///
    /// `network` supplies the architecture; its input and output sizes are
    /// taken from the dataset at `fit`. Early stopping and progress logging
    /// are registered first, in that order.
    pub fn new(
        config: TrainingConfig,
        network: NetworkConfig,
        device: B::Device,
        store: Arc<dyn CheckpointStore>,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        let mut hooks = HookSet::new();
        hooks.add(EarlyStopping::new(config.monitor, config.patience).with_min_delta(config.min_delta));
        hooks.add(ProgressLogger::new(1));

        Self {
            config,
            network,
            device,
            store,
            sink,
            hooks,
            resume: None,
            show_progress: false,
        }
    }

    /// Register another hook after the built-in ones
    pub fn with_hook<H: TrainingHook + 'static>(mut self, hook: H) -> Self {
        self.hooks.add(hook);
        self
    }

    /// Show an indicatif bar per epoch
    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Continue from a checkpoint instead of starting fresh
    pub fn resume_from(mut self, checkpoint: Checkpoint) -> Self {
        self.resume = Some(checkpoint);
        self
    }

    fn snapshot(&self, state: &TrainingState, epoch: usize, batches: usize, lr: f64) -> MetricSnapshot {
        MetricSnapshot {
            epoch,
            total_epochs: self.config.epochs,
            batch: None,
            batches_per_epoch: batches,
            batch_loss: None,
            learning_rate: lr,
            global_step: state.global_step,
            metrics: None,
            best_score: state.best_score,
            best_epoch: state.best_epoch,
            epochs_without_improvement: state.epochs_without_improvement,
        }
    }

    fn progress_bar(&self, len: usize, epoch: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::with_template("epoch {msg} [{bar:30}] {pos}/{len} batches ({elapsed})") {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_message(format!("{}/{}", epoch, self.config.epochs));
        pb
    }

    /// Record the epoch in `state` and run the post-epoch hooks
    fn close_epoch(&mut self, state: &mut TrainingState, metrics: EpochMetrics) -> EpochOutcome {
        let epoch = metrics.epoch;
        let lr = metrics.learning_rate;
        let improved = state.update_epoch(metrics.clone(), self.config.monitor, self.config.min_delta);
        if improved {
            info!(
                "New best {}: {:.4} at epoch {}",
                self.config.monitor.name(),
                state.best_score.unwrap_or(f64::NAN),
                epoch
            );
        }

        let mut snapshot = self.snapshot(state, epoch, 0, lr);
        snapshot.metrics = Some(metrics);
        let stop = self.hooks.post_epoch(&snapshot) == Control::Stop;
        EpochOutcome { improved, stop }
    }

    /// Write `last`, and `best` too when the epoch improved
    fn persist(&self, checkpoint: &Checkpoint, improved: bool) -> Result<()> {
        let blob = checkpoint.encode()?;
        self.store.put(LAST_KEY, &blob)?;
        if improved {
            self.store.put(BEST_KEY, &blob)?;
        }
        debug!(
            "Checkpointed epoch {} ({} bytes{})",
            checkpoint.meta.progress.epochs_completed,
            blob.len(),
            if improved { ", best" } else { "" }
        );
        Ok(())
    }

    fn check_resume(checkpoint: &Checkpoint, dataset: &MultiSourceDataset) -> Result<()> {
        if checkpoint.meta.schema != *dataset.schema() {
            return Err(SimsError::SchemaMismatch {
                origin: "resume checkpoint".to_string(),
                detail: format!(
                    "checkpoint schema has {} genes, dataset schema has {}",
                    checkpoint.meta.schema.len(),
                    dataset.schema().len()
                ),
            });
        }
        if checkpoint.meta.labels.space() != dataset.label_space() {
            return Err(SimsError::InvalidConfig(
                "label space of the dataset differs from the resume checkpoint".to_string(),
            ));
        }
        Ok(())
    }

    /// Train on `dataset`, checkpointing after every epoch
    pub fn fit(&mut self, dataset: &MultiSourceDataset, codec: &LabelCodec) -> Result<TrainingResult> {
        self.config.validate()?;
        info!("Starting training with configuration: {:?}", self.config);
        let start_time = Instant::now();

        if codec.space() != dataset.label_space() {
            return Err(SimsError::InvalidConfig(
                "label codec and dataset use different label spaces".to_string(),
            ));
        }

        let split = DatasetSplit::new(dataset.len(), &self.config.split())?;
        if split.train.is_empty() {
            return Err(SimsError::InvalidConfig("no rows left for training".to_string()));
        }
        let train_labels = dataset.encoded_labels(&split.train)?;
        let weights = codec.recount(train_labels).class_weights();
        debug!("Class weights: {:?}", weights);

        let fetcher = Fetcher::new(dataset, self.config.num_workers)?;

        let (network_config, mut model, mut state, mut scheduler, optim_bytes) = match self.resume.take() {
            Some(checkpoint) => {
                Self::check_resume(&checkpoint, dataset)?;
                let model = checkpoint.network::<B>(&self.device)?;
                let state = TrainingState::from_progress(&checkpoint.meta.progress);
                let scheduler = checkpoint
                    .meta
                    .scheduler
                    .clone()
                    .unwrap_or_else(|| self.config.scheduler());
                info!("Resuming after epoch {} (step {})", state.epoch, state.global_step);
                (checkpoint.meta.network, model, state, scheduler, checkpoint.optimizer)
            }
            None => {
                let mut network_config = self.network.clone();
                network_config.input_dim = dataset.schema().len();
                network_config.output_dim = codec.space().len();
                let model = network_config.init::<B>(&self.device)?;
                (network_config, model, TrainingState::new(), self.config.scheduler(), Vec::new())
            }
        };

        let mut optim = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(self.config.weight_decay as f32)))
            .init::<B, SequentialAttentionNetwork<B>>();
        if !optim_bytes.is_empty() {
            optim = optim.load_record(decode_record::<B, _>(&optim_bytes, &self.device)?);
        }
        if state.epoch > 0 {
            let snapshot = self.snapshot(&state, state.epoch, 0, state.learning_rate);
            self.hooks.restore(&snapshot);
        }

        let train_loss_fn = WeightedCrossEntropy::<B>::new(&weights, &self.device);
        let val_loss_fn = WeightedCrossEntropy::<B::InnerBackend>::new(&weights, &self.device);
        let lambda = network_config.lambda_sparse;
        let width = dataset.schema().len();
        let n_classes = codec.space().len();
        let batch_size = self.config.batch_size;
        let mut stopped_early = false;

        for epoch_idx in state.epoch..self.config.epochs {
            let epoch = epoch_idx + 1;
            let order = batches(&split.train, batch_size, self.config.seed.wrapping_add(epoch_idx as u64));
            let lr = scheduler.get_lr(epoch_idx);

            let mut snapshot = self.snapshot(&state, epoch, order.len(), lr);
            if self.hooks.pre_epoch(&snapshot) == Control::Stop {
                stopped_early = true;
                break;
            }

            let pb = self.progress_bar(order.len(), epoch);
            let mut loss_sum = 0.0;
            let mut seen = 0usize;
            let mut train_cm = ConfusionMatrix::new(n_classes);
            let mut abandoned = false;

            for (batch, indices) in order.iter().enumerate() {
                let samples = fetcher.fetch(indices)?;
                let (x, y, targets) = batch_tensors::<B>(&samples, width, &self.device)?;

                let output = model.forward(x)?;
                let loss = train_loss_fn.forward(output.logits.clone(), y)
                    - output.sparsity_loss.mul_scalar(lambda);
                let value: f64 = loss.clone().into_scalar().elem();
                if !value.is_finite() {
                    pb.abandon();
                    return Err(SimsError::NumericInstability { epoch, batch, value });
                }

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);
                state.global_step += 1;

                let predictions = argmax_rows(&to_host(output.logits), n_classes);
                for (&t, &p) in targets.iter().zip(&predictions) {
                    train_cm.add(t, p);
                }
                loss_sum += value * indices.len() as f64;
                seen += indices.len();
                pb.inc(1);

                snapshot.batch = Some(batch);
                snapshot.batch_loss = Some(value);
                snapshot.global_step = state.global_step;
                if self.hooks.post_batch(&snapshot) == Control::Stop {
                    abandoned = true;
                    break;
                }
            }
            pb.finish_and_clear();

            if abandoned {
                warn!("Epoch {} abandoned, keeping the previous checkpoint", epoch);
                stopped_early = true;
                break;
            }

            let (val_loss, val) = if split.val.is_empty() {
                (None, None)
            } else {
                let valid = model.valid();
                let (loss, cm) = evaluate::<B::InnerBackend>(
                    &valid,
                    &val_loss_fn,
                    lambda,
                    &fetcher,
                    &split.val,
                    batch_size,
                    &self.device,
                )?;
                (Some(loss), Some(cm.metrics()))
            };

            let metrics = EpochMetrics {
                epoch,
                learning_rate: lr,
                train_loss: loss_sum / seen.max(1) as f64,
                train: train_cm.metrics(),
                val_loss,
                val,
            };
            sink::report(self.sink.as_ref(), epoch, &metrics.named_values());
            scheduler.step_with_metric(metrics.val_loss.unwrap_or(metrics.train_loss));

            let outcome = self.close_epoch(&mut state, metrics);

            let meta = CheckpointMeta::new(
                dataset.schema().clone(),
                codec.clone(),
                network_config.clone(),
                state.progress(),
                Some(scheduler.clone()),
            );
            let optim_record = encode_record::<B, _>(optim.to_record())?;
            let checkpoint = Checkpoint::from_network(&model, meta, optim_record)?;
            self.persist(&checkpoint, outcome.improved)?;

            if outcome.stop {
                stopped_early = true;
                break;
            }
        }

        if let Err(e) = self.sink.flush() {
            warn!("Failed to flush metrics: {}", e);
        }

        let best = match self.store.get(BEST_KEY)? {
            Some(blob) => Some(Checkpoint::decode(&blob)?),
            None => None,
        };
        let duration_secs = start_time.elapsed().as_secs_f64();
        info!(
            "Training finished after {} epochs in {:.1}s (best epoch {:?})",
            state.epoch, duration_secs, state.best_epoch
        );

        Ok(TrainingResult {
            state,
            best,
            stopped_early,
            duration_secs,
        })
    }
}
