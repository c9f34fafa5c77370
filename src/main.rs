use anyhow::{bail, Context, Result};
use scsims::cli::{parse_args, setup_logging, Commands, EvaluateArgs, ExplainArgs, PredictArgs, TrainArgs};
use scsims::data::dataset::MultiSourceDataset;
use scsims::data::labels::LabelCodec;
use scsims::data::loader::{load_labels, open_matrix};
use scsims::data::schema::FeatureSchema;
use scsims::data::{LabelSource, SourceDescriptor};
use scsims::model::checkpoint::{load_checkpoint, Checkpoint, FsCheckpointStore, BEST_KEY};
use scsims::predict::{InferenceEngine, ScoringInput};
use scsims::training::callbacks::{EpochTimer, StopSignal};
use scsims::training::sink::{FanoutSink, JsonFileSink, TracingSink};
use scsims::training::trainer::TrainingLoop;
use scsims::utils::{create_output, ensure_dir, format_duration};
use scsims::{DefaultBackend, SimsError, TrainingBackend};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", scsims::info());

    let result = match cli.command {
        Commands::Train(args) => run_train(args),
        Commands::Predict(args) => run_predict(args),
        Commands::Explain(args) => run_explain(args),
        Commands::Evaluate(args) => run_evaluate(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        let code = e.downcast_ref::<SimsError>().map_or(1, SimsError::exit_code);
        std::process::exit(code);
    }
}

/// A checkpoint file, or the `best` entry of a checkpoint directory
fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    if path.is_dir() {
        let store = FsCheckpointStore::new(path)?;
        return Ok(load_checkpoint(&store, BEST_KEY)?);
    }
    let blob = std::fs::read(path).with_context(|| format!("Failed to read checkpoint {:?}", path))?;
    Ok(Checkpoint::decode(&blob)?)
}

fn load_engine(model: &Path, batch_size: usize) -> Result<InferenceEngine<DefaultBackend>> {
    info!("Loading model from {:?}", model);
    let checkpoint = read_checkpoint(model)?;
    let engine = InferenceEngine::from_checkpoint(&checkpoint, &Default::default())?;
    Ok(engine.with_batch_size(batch_size))
}

fn load_input(path: &Path) -> Result<ScoringInput> {
    let file = open_matrix(path).with_context(|| format!("Failed to load matrix from {:?}", path))?;
    Ok(ScoringInput::from(file))
}

fn run_train(args: TrainArgs) -> Result<()> {
    info!("Starting training...");
    let config = args.training_config()?;
    let network = args.network.network_config();
    ensure_dir(&args.output)?;

    let mut descriptors = Vec::new();
    let mut observed = Vec::new();
    for (matrix_path, label_path) in args.sources()? {
        let file = open_matrix(&matrix_path).with_context(|| format!("Failed to load matrix from {:?}", matrix_path))?;
        let (labels, alignment) = load_labels(
            &label_path,
            &args.columns.label_column,
            args.columns.index_column.as_deref(),
            &file.cell_ids,
        )
        .with_context(|| format!("Failed to load labels from {:?}", label_path))?;
        observed.extend(labels.iter().cloned());

        let labels: Arc<dyn LabelSource> = Arc::new(labels);
        descriptors.push(
            SourceDescriptor::labeled(
                matrix_path.display().to_string(),
                file.matrix,
                labels,
                args.columns.label_column.as_str(),
            )
            .with_alignment(alignment),
        );
    }

    let schema = FeatureSchema::build(descriptors.iter().map(|d| d.matrix.gene_ids()), config.schema_mode)?;
    let codec = LabelCodec::fit(observed.iter().map(String::as_str))?;
    info!("{} genes, {} classes: {:?}", schema.len(), codec.space().len(), codec.space().classes());
    let dataset = MultiSourceDataset::new(descriptors, schema, codec.space().clone())?;
    info!("{} cells across {} sources", dataset.len(), dataset.n_sources());

    let store = Arc::new(FsCheckpointStore::new(args.output.join("checkpoints"))?);
    let sink = Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(JsonFileSink::new(args.output.join("metrics.json")))),
    );

    let stop = StopSignal::new();
    let flag = stop.flag();
    ctrlc::set_handler(move || {
        warn!("Interrupt received, stopping after the current epoch");
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let timer = EpochTimer::new();
    let mut training = TrainingLoop::<TrainingBackend>::new(config, network, Default::default(), store.clone(), sink)
        .with_hook(stop)
        .with_hook(timer.clone())
        .with_progress_bar(!args.no_progress);
    if let Some(path) = &args.resume {
        info!("Resuming from {:?}", path);
        training = training.resume_from(read_checkpoint(path)?);
    }

    let result = training.fit(&dataset, &codec).context("Training failed")?;

    info!("=== Training Results ===");
    info!("Epochs completed: {}", result.state.epoch);
    if let (Some(epoch), Some(score)) = (result.state.best_epoch, result.state.best_score) {
        info!("Best epoch: {} (score {:.4})", epoch, score);
    }
    if let Some(avg) = timer.average_epoch_time() {
        info!("Average epoch time: {}", format_duration(avg.as_secs_f64()));
    }
    info!("Training time: {}", format_duration(result.duration_secs));
    if result.stopped_early {
        info!("Stopped before the configured epoch count");
    }
    info!("Checkpoints in {:?}", store.dir());

    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let engine = load_engine(&args.model, args.batch_size)?;
    let input = load_input(&args.input)?;

    let predictions = engine.predict(&input).context("Prediction failed")?;
    predictions.summary.print();

    let mut out = create_output(&args.output)?;
    match args.format.as_str() {
        "csv" => predictions.write_csv(&mut out)?,
        "json" => serde_json::to_writer_pretty(&mut out, &predictions)?,
        other => bail!("Unsupported output format: {}", other),
    }
    out.flush()?;

    info!("Predictions saved to: {:?}", args.output);
    Ok(())
}

fn run_explain(args: ExplainArgs) -> Result<()> {
    let engine = load_engine(&args.model, args.batch_size)?;
    let input = load_input(&args.input)?;

    let explanation = engine.explain(&input, args.normalize).context("Explanation failed")?;
    let attributions = &explanation.attributions;

    let mut out = create_output(&args.output)?;
    attributions.write_csv(&mut out)?;
    out.flush()?;
    info!("Attributions saved to: {:?}", args.output);

    for (gene, importance) in attributions.top_features(10) {
        info!("  {}: {:.4}", gene, importance);
    }

    if let Some(path) = &args.importances {
        let mut w = csv::Writer::from_writer(create_output(path)?);
        w.write_record(["gene", "importance"])?;
        for (gene, importance) in attributions.top_features(attributions.n_genes()) {
            w.write_record([gene, importance.to_string()])?;
        }
        w.flush()?;
        info!("Gene importances saved to: {:?}", path);
    }

    if let Some(path) = &args.predictions {
        let mut out = create_output(path)?;
        explanation.predictions.write_csv(&mut out)?;
        out.flush()?;
        info!("Predictions saved to: {:?}", path);
    }

    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    let engine = load_engine(&args.model, args.batch_size)?;
    let input = load_input(&args.input)?;
    let (labels, alignment) = load_labels(
        &args.labels,
        &args.columns.label_column,
        args.columns.index_column.as_deref(),
        &input.cell_ids,
    )
    .with_context(|| format!("Failed to load labels from {:?}", args.labels))?;

    let report = engine.evaluate(&input, &labels, &alignment).context("Evaluation failed")?;
    report.print();

    if let Some(output) = args.output {
        std::fs::write(&output, report.to_json()?)?;
        info!("Evaluation report saved to: {:?}", output);
    }

    Ok(())
}
