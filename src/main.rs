use std::path::PathBuf;

use anyhow::Context;
use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use burn::optim::RmsPropConfig;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mnist_tracker::model::ModelConfig;
use mnist_tracker::tracking::{print_run_info, ActiveRun, TrackingError, TrackingStore};
use mnist_tracker::training::{self, LoggingModes, TrainingConfig};

type TrainBackend = Autodiff<NdArray>;

// burn exports no runtime version string, so the pinned one is recorded.
const BURN_VERSION: &str = "0.13.2";

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Experiment name; the default experiment is used when absent.
    #[clap(long)]
    experiment_name: Option<String>,

    /// Registered model name.
    #[clap(long)]
    model_name: Option<String>,

    /// Path to an .npz dataset archive; the bundled download is used when absent.
    #[clap(long)]
    data_path: Option<PathBuf>,

    /// Epochs.
    #[clap(long, default_value_t = 5)]
    epochs: usize,

    /// Batch size.
    #[clap(long, default_value_t = 128)]
    batch_size: usize,

    /// Explicitly log params, metrics, and the model.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    custom_log: bool,

    /// Automatically log per-epoch training metrics.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    learner_autolog: bool,

    /// Automatically log backend and device information.
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set)]
    backend_autolog: bool,

    /// Automatically log params, per-epoch metrics, and the model.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    autolog: bool,

    /// Root directory of the tracking store.
    #[clap(long, default_value = "runs")]
    tracking_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(?args, "options");

    let model_name = args
        .model_name
        .filter(|name| !name.is_empty() && name != "None");
    let modes = LoggingModes::resolve(
        args.custom_log,
        args.learner_autolog,
        args.backend_autolog,
        args.autolog,
    );

    let store = TrackingStore::new(&args.tracking_dir).context("failed to open tracking store")?;
    let registry = store.registry();
    let experiment_id = match &args.experiment_name {
        Some(name) => store.get_or_create_experiment(name)?,
        None => store.default_experiment()?,
    };

    let config = TrainingConfig::new(ModelConfig::new(), RmsPropConfig::new())
        .with_num_epochs(args.epochs)
        .with_batch_size(args.batch_size);

    let run = store.start_run(&experiment_id)?;
    let run_id = run.run_id().to_string();
    info!(run_id = %run_id, experiment_id = %run.experiment_id(), "tracking run started");

    tag_run(&run, &modes)?;

    // The run handle seals the run on every exit path; an early return here
    // drops it and records the run as failed.
    let outcome = training::train::<TrainBackend>(
        &run,
        &registry,
        &config,
        &modes,
        model_name.as_deref(),
        args.data_path.as_deref(),
        NdArrayDevice::Cpu,
    )
    .context("training failed")?;
    run.end()?;

    info!(
        test_acc = outcome.test_accuracy,
        test_loss = outcome.test_loss,
        "run finished"
    );

    let recorded = store.get_run(&run_id)?;
    print_run_info(&store, &recorded)?;

    Ok(())
}

/// Library-version and logging-mode tags recorded on every run.
fn tag_run(run: &ActiveRun, modes: &LoggingModes) -> Result<(), TrackingError> {
    run.set_tag("version.app", env!("CARGO_PKG_VERSION"))?;
    run.set_tag("version.burn", BURN_VERSION)?;
    run.set_tag("version.backend", "ndarray")?;
    run.set_tag("custom_log", &modes.custom.to_string())?;
    run.set_tag("learner_autolog", &modes.learner.to_string())?;
    run.set_tag("backend_autolog", &modes.backend.to_string())?;
    run.set_tag("autolog", &modes.global.to_string())?;
    Ok(())
}
