use crate::error::{Result, SimsError};
use crate::model::NetworkConfig;
use crate::training::scheduler::LearningRateScheduler;
use crate::training::TrainingConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// scsims: interpretable single-cell classification
#[derive(Parser, Debug)]
#[command(name = "scsims")]
#[command(about = "Interpretable single-cell classification with sequential attention")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a classifier on one or more labeled matrices
    Train(TrainArgs),

    /// Predict labels for a matrix
    Predict(PredictArgs),

    /// Predict and write per-gene attributions
    Explain(ExplainArgs),

    /// Score predictions against known labels
    Evaluate(EvaluateArgs),
}

/// Label file layout shared by train and evaluate
#[derive(Args, Debug, Clone)]
pub struct LabelColumns {
    /// Column holding the class label
    #[arg(short = 'l', long, default_value = "class")]
    pub label_column: String,

    /// Column holding cell ids that align labels to matrix rows
    #[arg(long)]
    pub index_column: Option<String>,
}

/// Network hyperparameters
#[derive(Args, Debug, Clone)]
pub struct NetworkArgs {
    /// Number of decision steps
    #[arg(long, default_value = "3")]
    pub n_steps: usize,

    /// Decision representation width
    #[arg(long, default_value = "8")]
    pub n_d: usize,

    /// Attention representation width
    #[arg(long, default_value = "8")]
    pub n_a: usize,

    /// Feature reuse relaxation (>= 1)
    #[arg(long, default_value = "1.3")]
    pub relaxation: f64,

    /// Step-specific GLU layers
    #[arg(long, default_value = "2")]
    pub n_independent: usize,

    /// Shared GLU layers
    #[arg(long, default_value = "2")]
    pub n_shared: usize,

    /// Weight of the mask sparsity term
    #[arg(long, default_value = "0.001")]
    pub lambda_sparse: f64,
}

impl NetworkArgs {
    /// Architecture with input and output sizes left for the trainer to fill
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig::new(0, 0)
            .with_n_steps(self.n_steps)
            .with_n_d(self.n_d)
            .with_n_a(self.n_a)
            .with_relaxation(self.relaxation)
            .with_n_independent(self.n_independent)
            .with_n_shared(self.n_shared)
            .with_lambda_sparse(self.lambda_sparse)
    }
}

/// Training arguments
#[derive(Parser, Debug)]
pub struct TrainArgs {
    /// Expression matrix (CSV/TSV, optionally gzipped); repeat for several sources
    #[arg(short, long = "data", required = true)]
    pub data: Vec<PathBuf>,

    /// Label file for each --data, in the same order
    #[arg(long = "labels", required = true)]
    pub labels: Vec<PathBuf>,

    #[command(flatten)]
    pub columns: LabelColumns,

    /// Output directory for checkpoints and metrics
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Training configuration file (JSON); flags below override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub network: NetworkArgs,

    /// Number of training epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Batch size
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Learning rate
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Adam weight decay
    #[arg(long)]
    pub weight_decay: Option<f64>,

    /// Learning rate schedule (constant, step, exponential, cosine, plateau)
    #[arg(long)]
    pub lr_scheduler: Option<String>,

    /// Early stopping patience (0 disables)
    #[arg(long)]
    pub patience: Option<usize>,

    /// Metric deciding early stopping and the best checkpoint
    #[arg(long)]
    pub monitor: Option<String>,

    /// Validation ratio
    #[arg(long)]
    pub val_ratio: Option<f32>,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Gene schema from the union or intersection of sources
    #[arg(long)]
    pub schema_mode: Option<String>,

    /// Threads assembling batches
    #[arg(long)]
    pub num_workers: Option<usize>,

    /// Resume from a checkpoint file
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// Quick test mode (fewer epochs)
    #[arg(long)]
    pub quick: bool,

    /// Hide the per-epoch progress bar
    #[arg(long)]
    pub no_progress: bool,
}

impl TrainArgs {
    /// Config file (or defaults) with explicit flags applied on top
    pub fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_file(path)?,
            None if self.quick => TrainingConfig::quick_test(),
            None => TrainingConfig::default(),
        };

        if let Some(v) = self.epochs {
            config.epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            config.learning_rate = v;
        }
        if let Some(v) = self.weight_decay {
            config.weight_decay = v;
        }
        if let Some(v) = self.patience {
            config.patience = v;
        }
        if let Some(v) = self.val_ratio {
            config.val_ratio = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.num_workers {
            config.num_workers = v;
        }
        if let Some(v) = &self.monitor {
            config.monitor = v.parse()?;
        }
        if let Some(v) = &self.schema_mode {
            config.schema_mode = v.parse()?;
        }
        if let Some(name) = &self.lr_scheduler {
            config.lr_scheduler = LearningRateScheduler::from_name(name, config.learning_rate, config.epochs)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Matrix and label paths paired by position
    pub fn sources(&self) -> Result<Vec<(PathBuf, PathBuf)>> {
        if self.data.len() != self.labels.len() {
            return Err(SimsError::InvalidConfig(format!(
                "{} --data paths but {} --labels paths",
                self.data.len(),
                self.labels.len()
            )));
        }
        Ok(self.data.iter().cloned().zip(self.labels.iter().cloned()).collect())
    }
}

/// Prediction arguments
#[derive(Parser, Debug)]
pub struct PredictArgs {
    /// Expression matrix to score
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Checkpoint file, or a checkpoint directory (uses `best`)
    #[arg(short, long, required = true)]
    pub model: PathBuf,

    /// Output file for predictions
    #[arg(short, long, default_value = "predictions.csv")]
    pub output: PathBuf,

    /// Output format (csv, json)
    #[arg(short, long, default_value = "csv")]
    pub format: String,

    /// Rows per forward pass
    #[arg(short, long, default_value = "1024")]
    pub batch_size: usize,
}

/// Explanation arguments
#[derive(Parser, Debug)]
pub struct ExplainArgs {
    /// Expression matrix to explain
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Checkpoint file, or a checkpoint directory (uses `best`)
    #[arg(short, long, required = true)]
    pub model: PathBuf,

    /// Output file for the cells x genes attribution matrix
    #[arg(short, long, default_value = "attributions.csv")]
    pub output: PathBuf,

    /// Scale each cell's attributions to sum to 1
    #[arg(long)]
    pub normalize: bool,

    /// Also write global gene importances here
    #[arg(long)]
    pub importances: Option<PathBuf>,

    /// Also write predictions here
    #[arg(long)]
    pub predictions: Option<PathBuf>,

    /// Rows per forward pass
    #[arg(short, long, default_value = "1024")]
    pub batch_size: usize,
}

/// Evaluation arguments
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Expression matrix to score
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Label file with ground truth
    #[arg(long, required = true)]
    pub labels: PathBuf,

    #[command(flatten)]
    pub columns: LabelColumns,

    /// Checkpoint file, or a checkpoint directory (uses `best`)
    #[arg(short, long, required = true)]
    pub model: PathBuf,

    /// Output file for evaluation report (JSON)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Rows per forward pass
    #[arg(short, long, default_value = "1024")]
    pub batch_size: usize,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging; `RUST_LOG` wins over the verbosity flag
pub fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::schema::SchemaMode;
    use crate::training::Monitor;
    use tempfile::TempDir;

    #[test]
    fn test_train_parse_multiple_sources() {
        let cli = Cli::parse_from([
            "scsims", "train",
            "-d", "a.csv", "--labels", "a_labels.csv",
            "-d", "b.tsv.gz", "--labels", "b_labels.csv",
            "-l", "cell_type",
            "--n-steps", "5",
        ]);

        match cli.command {
            Commands::Train(args) => {
                let sources = args.sources().unwrap();
                assert_eq!(sources.len(), 2);
                assert_eq!(sources[1].0, PathBuf::from("b.tsv.gz"));
                assert_eq!(args.columns.label_column, "cell_type");
                assert_eq!(args.network.network_config().n_steps, 5);
                assert_eq!(args.network.network_config().n_d, 8);

                let config = args.training_config().unwrap();
                assert_eq!(config.epochs, 100);
            }
            _ => panic!("Expected Train command"),
        }
    }

    #[test]
    fn test_unpaired_sources_rejected() {
        let cli = Cli::parse_from(["scsims", "train", "-d", "a.csv", "-d", "b.csv", "--labels", "a.csv"]);
        match cli.command {
            Commands::Train(args) => assert!(args.sources().is_err()),
            _ => panic!("Expected Train command"),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(&path, r#"{"epochs": 40, "patience": 3, "monitor": "val_macro_f1"}"#).unwrap();

        let cli = Cli::parse_from([
            "scsims", "train",
            "-d", "a.csv", "--labels", "l.csv",
            "--config", path.to_str().unwrap(),
            "--epochs", "7",
            "--schema-mode", "intersection",
            "--lr-scheduler", "cosine",
        ]);
        let Commands::Train(args) = cli.command else {
            panic!("Expected Train command");
        };
        let config = args.training_config().unwrap();
        assert_eq!(config.epochs, 7);
        assert_eq!(config.patience, 3);
        assert_eq!(config.monitor, Monitor::ValMacroF1);
        assert_eq!(config.schema_mode, SchemaMode::Intersection);
        assert!(matches!(config.lr_scheduler, LearningRateScheduler::Cosine { .. }));
    }

    #[test]
    fn test_bad_monitor_is_config_error() {
        let cli = Cli::parse_from(["scsims", "train", "-d", "a.csv", "--labels", "l.csv", "--monitor", "auroc"]);
        let Commands::Train(args) = cli.command else {
            panic!("Expected Train command");
        };
        assert!(matches!(args.training_config(), Err(SimsError::InvalidConfig(_))));
    }

    #[test]
    fn test_explain_args() {
        let cli = Cli::parse_from([
            "scsims", "explain",
            "-i", "input.csv",
            "-m", "output/checkpoints",
            "--normalize",
            "--importances", "genes.csv",
        ]);

        match cli.command {
            Commands::Explain(args) => {
                assert_eq!(args.model, PathBuf::from("output/checkpoints"));
                assert!(args.normalize);
                assert_eq!(args.importances, Some(PathBuf::from("genes.csv")));
                assert_eq!(args.output, PathBuf::from("attributions.csv"));
            }
            _ => panic!("Expected Explain command"),
        }
    }

    #[test]
    fn test_evaluate_args() {
        let cli = Cli::parse_from([
            "scsims", "evaluate",
            "-i", "input.csv",
            "--labels", "truth.csv",
            "--index-column", "cell",
            "-m", "best.ckpt",
        ]);

        match cli.command {
            Commands::Evaluate(args) => {
                assert_eq!(args.columns.label_column, "class");
                assert_eq!(args.columns.index_column.as_deref(), Some("cell"));
                assert_eq!(args.batch_size, 1024);
            }
            _ => panic!("Expected Evaluate command"),
        }
    }
}
