use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mstcn_core::batch::BatchAssembler;
use mstcn_core::dataset::read_list;
use mstcn_core::{
    CheckpointStore, ClassMap, Device, DiskSource, ModelConfig, Predictor, TrainConfig, Trainer,
};

#[derive(Debug, Parser)]
#[command(name = "mstcn")]
#[command(about = "Multi-stage temporal convolutional network for action segmentation", long_about = None)]
struct Cli {
    /// Enable debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train on a video list, checkpointing every epoch.
    Train(TrainArgs),
    /// Write per-frame predictions for a video list.
    Predict(PredictArgs),
}

/// Dataset locations shared by both subcommands.
#[derive(Debug, Args)]
struct DataArgs {
    /// Directory holding `<stem>.npy` feature matrices.
    #[arg(long)]
    features_dir: PathBuf,

    /// Class mapping file, one `<index> <name>` pair per line.
    #[arg(long)]
    mapping: PathBuf,

    /// Directory for `epoch-N.model` / `epoch-N.opt`.
    #[arg(long)]
    model_dir: PathBuf,

    /// JSON run config (`{"model": {..}, "train": {..}}`); flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Temporal subsampling stride.
    #[arg(long)]
    sample_rate: Option<usize>,

    #[arg(long)]
    device: Option<String>,
}

#[derive(Debug, Args)]
struct TrainArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Directory holding one ground-truth label file per video.
    #[arg(long)]
    gt_dir: PathBuf,

    /// Training video list.
    #[arg(long)]
    train_list: PathBuf,

    /// Held-out video list, evaluated after every epoch.
    #[arg(long)]
    test_list: PathBuf,

    #[arg(long)]
    num_stages: Option<usize>,
    #[arg(long)]
    num_layers: Option<usize>,
    #[arg(long)]
    num_f_maps: Option<usize>,
    #[arg(long)]
    features_dim: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    num_epochs: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f32>,
    #[arg(long)]
    seed: Option<u64>,

    /// Continue from the checkpoint of this epoch.
    #[arg(long, conflicts_with = "resume_latest")]
    resume_epoch: Option<usize>,

    /// Continue from the newest checkpoint in `--model-dir`, if there is one.
    #[arg(long, default_value_t = false)]
    resume_latest: bool,
}

#[derive(Debug, Args)]
struct PredictArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Video list to label.
    #[arg(long)]
    list: PathBuf,

    /// Output directory for per-video `.txt` label files.
    #[arg(long)]
    results_dir: PathBuf,

    /// Checkpoint epoch to load; defaults to the newest in `--model-dir`.
    #[arg(long)]
    epoch: Option<usize>,
}

/// Network shape without the class count, which comes from the mapping file.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ModelShape {
    num_stages: usize,
    num_layers: usize,
    num_f_maps: usize,
    features_dim: usize,
}

impl Default for ModelShape {
    fn default() -> Self {
        let cfg = ModelConfig::mstcn(2048, 0);
        ModelShape {
            num_stages: cfg.num_stages,
            num_layers: cfg.num_layers,
            num_f_maps: cfg.num_f_maps,
            features_dim: cfg.features_dim,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunConfig {
    model: ModelShape,
    train: TrainConfig,
}

impl RunConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(RunConfig::default());
        };
        let json = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parse config {}", path.display()))
    }

    fn apply_data_flags(&mut self, data: &DataArgs) -> Result<()> {
        if let Some(v) = data.sample_rate {
            self.train.sample_rate = v;
        }
        if let Some(d) = &data.device {
            self.train.device = d.parse::<Device>()?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Command::Train(args) => run_train(args),
        Command::Predict(args) => run_predict(args),
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let mut run = RunConfig::load(args.data.config.as_deref())?;
    run.apply_data_flags(&args.data)?;
    let shape = &mut run.model;
    if let Some(v) = args.num_stages { shape.num_stages = v; }
    if let Some(v) = args.num_layers { shape.num_layers = v; }
    if let Some(v) = args.num_f_maps { shape.num_f_maps = v; }
    if let Some(v) = args.features_dim { shape.features_dim = v; }
    let cfg = &mut run.train;
    if let Some(v) = args.batch_size { cfg.batch_size = v; }
    if let Some(v) = args.num_epochs { cfg.num_epochs = v; }
    if let Some(v) = args.learning_rate { cfg.learning_rate = v; }
    if let Some(v) = args.seed { cfg.seed = v; }
    run.train.validate().context("training config")?;

    let classes = ClassMap::from_mapping_file(&args.data.mapping).context("load class mapping")?;
    let model_cfg = ModelConfig {
        num_stages: run.model.num_stages,
        num_layers: run.model.num_layers,
        num_f_maps: run.model.num_f_maps,
        features_dim: run.model.features_dim,
        num_classes: classes.len(),
    };
    let cfg = &run.train;
    info!(?model_cfg, ?cfg, "configuration");

    let source = DiskSource::new(&args.data.features_dir, &args.gt_dir);
    let mut train = BatchAssembler::new(&source, classes.clone(), cfg.sample_rate)?.with_seed(cfg.seed);
    train
        .read_list(&args.train_list)
        .with_context(|| format!("read train list {}", args.train_list.display()))?;
    let mut test = BatchAssembler::new(&source, classes, cfg.sample_rate)?.with_seed(cfg.seed.wrapping_add(1));
    test.read_list(&args.test_list)
        .with_context(|| format!("read test list {}", args.test_list.display()))?;

    let store = CheckpointStore::new(&args.data.model_dir);
    let resume_epoch = if args.resume_latest {
        store.latest_epoch().context("scan model directory")?
    } else {
        args.resume_epoch
    };
    let mut trainer = match resume_epoch {
        Some(epoch) => Trainer::resume(&store, epoch, cfg.seed).context("resume from checkpoint")?,
        None => Trainer::new(&model_cfg, cfg.seed).context("initialize model")?,
    };
    if trainer.model.config != model_cfg {
        anyhow::bail!(
            "checkpoint model {:?} does not match requested model {:?}",
            trainer.model.config,
            model_cfg
        );
    }

    let reports = trainer.train(&mut train, &mut test, &store, cfg).context("training")?;
    if let Some(last) = reports.last() {
        println!("{}", serde_json::to_string(last)?);
    }
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let mut run = RunConfig::load(args.data.config.as_deref())?;
    run.apply_data_flags(&args.data)?;

    let classes = ClassMap::from_mapping_file(&args.data.mapping).context("load class mapping")?;
    let store = CheckpointStore::new(&args.data.model_dir);
    let epoch = match args.epoch {
        Some(epoch) => epoch,
        None => store
            .latest_epoch()
            .context("scan model directory")?
            .with_context(|| format!("no checkpoints in {}", args.data.model_dir.display()))?,
    };
    let predictor = Predictor::load(&store, epoch, classes, run.train.sample_rate)
        .with_context(|| format!("load epoch {epoch} from {}", args.data.model_dir.display()))?;
    info!(epoch, model = ?predictor.model().config, "loaded checkpoint");

    let ids = read_list(&args.list).with_context(|| format!("read video list {}", args.list.display()))?;
    // Labels are not read at prediction time.
    let source = DiskSource::new(&args.data.features_dir, PathBuf::new());
    let written = predictor.predict(&ids, &source, &args.results_dir).context("prediction")?;
    info!(videos = written.len(), dir = %args.results_dir.display(), "done");
    Ok(())
}
