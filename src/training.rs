use std::path::Path;

use burn::{
    config::Config,
    data::dataloader::DataLoaderBuilder,
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer, RmsPropConfig},
    record::CompactRecorder,
    tensor::{
        backend::{AutodiffBackend, Backend},
        loss::cross_entropy_with_logits,
        ElementConversion, Tensor,
    },
};
use thiserror::Error;
use tracing::{debug, info};

use crate::data::{DataError, MnistBatcher, MnistSource};
use crate::inference::{load_prediction_data, preview};
use crate::model::ModelConfig;
use crate::tracking::{ActiveRun, ModelRegistry, TrackingError};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("tracking error: {0}")]
    Tracking(#[from] TrackingError),
    #[error("data error: {0}")]
    Data(#[from] DataError),
    #[error("failed to record model: {0}")]
    Record(#[from] burn::record::RecorderError),
    #[error("failed to serialize model architecture: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: RmsPropConfig,
    #[config(default = 5)]
    pub num_epochs: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 1)]
    pub num_workers: usize,
}

/// Which logging paths are active for a run. The three autolog modes are
/// independent and may overlap; overlapping modes issue duplicate logging
/// calls on purpose, with no conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingModes {
    /// Explicit param/metric/model logging calls.
    pub custom: bool,
    /// Per-epoch training metrics, as a learner callback would record them.
    pub learner: bool,
    /// Backend and device information.
    pub backend: bool,
    /// Everything: params, per-epoch metrics, and the model artifact.
    pub global: bool,
}

impl LoggingModes {
    /// Applies the caller's flags. When every autolog flag is off, custom
    /// logging is forced on so at least one logging path always runs, even
    /// if the caller explicitly disabled it.
    pub fn resolve(custom: bool, learner: bool, backend: bool, global: bool) -> Self {
        let custom = custom || (!learner && !backend && !global);
        Self {
            custom,
            learner,
            backend,
            global,
        }
    }
}

/// Scalar results of the test-split evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TrainOutcome {
    pub test_accuracy: f64,
    pub test_loss: f64,
}

/// Trains the fixed two-layer classifier and records the run.
///
/// Follows one straight line: load data, build and fit the model, evaluate
/// on the test split, then log according to the active modes. Failures
/// propagate; the caller's run handle seals the run on the way out.
pub fn train<B: AutodiffBackend>(
    run: &ActiveRun,
    registry: &ModelRegistry,
    config: &TrainingConfig,
    modes: &LoggingModes,
    model_name: Option<&str>,
    data_path: Option<&Path>,
    device: B::Device,
) -> Result<TrainOutcome, TrainError> {
    B::seed(config.seed);

    let dataloader_train = DataLoaderBuilder::new(MnistBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(MnistSource::train(data_path)?);
    let dataloader_test =
        DataLoaderBuilder::new(MnistBatcher::<B::InnerBackend>::new(device.clone()))
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .build(MnistSource::test(data_path)?);

    let mut model = config.model.init::<B>(&device);
    let mut optim = config.optimizer.init();

    if modes.backend {
        run.set_tag("backend.name", &B::name())?;
        run.set_tag("backend.device", &format!("{device:?}"))?;
        run.log_param("num_params", &model.num_params().to_string())?;
    }
    if modes.global {
        run.log_param("epochs", &config.num_epochs.to_string())?;
        run.log_param("batch_size", &config.batch_size.to_string())?;
        run.log_param("learning_rate", &config.learning_rate.to_string())?;
        run.log_param("optimizer", "rmsprop")?;
    }

    info!(
        epochs = config.num_epochs,
        batch_size = config.batch_size,
        "fitting model"
    );

    for epoch in 1..=config.num_epochs {
        let mut epoch_loss = 0.0;
        let mut batches = 0usize;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for (iteration, batch) in dataloader_train.iter().enumerate() {
            let output = model.forward(batch.images);
            let loss = cross_entropy_with_logits(output.clone(), batch.targets.clone());
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            let (batch_correct, batch_total) = count_correct(&output, &batch.targets);
            epoch_loss += loss_value;
            batches += 1;
            correct += batch_correct;
            seen += batch_total;

            debug!(epoch, iteration, loss = loss_value, "train step");

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);
        }

        let train_loss = epoch_loss / batches.max(1) as f64;
        let train_accuracy = correct as f64 / seen.max(1) as f64;
        info!(epoch, train_loss, train_accuracy, "epoch complete");

        // Each active autolog mode issues its own metric calls, so enabling
        // several of them appends duplicate observations.
        for enabled in [modes.learner, modes.global] {
            if enabled {
                run.log_metric("train_loss", train_loss, epoch)?;
                run.log_metric("train_accuracy", train_accuracy, epoch)?;
            }
        }
    }

    if modes.global {
        save_model(run, &model, config)?;
    }

    let model_valid = model.valid();

    let mut total_loss = 0.0;
    let mut correct = 0usize;
    let mut seen = 0usize;
    for batch in dataloader_test.iter() {
        let output = model_valid.forward(batch.images);
        let loss = cross_entropy_with_logits(output.clone(), batch.targets.clone());
        let [batch_size, _] = output.dims();

        total_loss += loss.into_scalar().elem::<f64>() * batch_size as f64;
        let (batch_correct, batch_total) = count_correct(&output, &batch.targets);
        correct += batch_correct;
        seen += batch_total;
    }
    let outcome = TrainOutcome {
        test_accuracy: correct as f64 / seen.max(1) as f64,
        test_loss: total_loss / seen.max(1) as f64,
    };
    info!(
        test_acc = outcome.test_accuracy,
        test_loss = outcome.test_loss,
        "evaluation complete"
    );

    if modes.custom {
        run.log_param("epochs", &config.num_epochs.to_string())?;
        run.log_param("batch_size", &config.batch_size.to_string())?;
        run.log_metric("test_acc", outcome.test_accuracy, 0)?;
        run.log_metric("test_loss", outcome.test_loss, 0)?;

        save_model(run, &model, config)?;
        run.log_artifact_bytes("model_summary.txt", model.summary().as_bytes())?;

        // A model name alongside custom logging registers the serialized
        // model as well, like logging a model with a registered name does.
        if let Some(name) = model_name {
            registry.register_model(run, name)?;
        }
    } else if let Some(name) = model_name {
        registry.register_model(run, name)?;
    }

    let architecture = serde_json::to_vec_pretty(&model.architecture())?;
    run.log_artifact_bytes("model.json", &architecture)?;

    let input = load_prediction_data(data_path)?;
    let predictions = model_valid
        .predict(input.to_tensor(&device))
        .into_data()
        .convert::<f32>();
    let [rows, cols] = predictions.shape.dims;
    println!("{}", preview(rows, cols, &predictions.value, 10));

    Ok(outcome)
}

fn save_model<B: AutodiffBackend>(
    run: &ActiveRun,
    model: &crate::model::Model<B>,
    config: &TrainingConfig,
) -> Result<(), TrainError> {
    let model_dir = run.artifact_dir("model")?;
    model
        .clone()
        .save_file(model_dir.join("model"), &CompactRecorder::new())?;
    config.save(model_dir.join("config.json"))?;
    Ok(())
}

/// Counts argmax agreements between logits and one-hot targets.
fn count_correct<B: Backend>(output: &Tensor<B, 2>, targets: &Tensor<B, 2>) -> (usize, usize) {
    let [batch_size, _] = output.dims();
    let predicted = output.clone().argmax(1).reshape([batch_size]);
    let expected = targets.clone().argmax(1).reshape([batch_size]);
    let correct = predicted
        .equal(expected)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();

    (correct as usize, batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::IMAGE_DIM;
    use crate::tracking::TrackingStore;
    use burn::tensor::Data;
    use ndarray::{Array1, Array3};
    use ndarray_npy::NpzWriter;
    use std::fs::File;
    use std::path::PathBuf;

    type TestBackend = burn::backend::NdArray;
    type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;

    /// Writes a small train split and a full-size test split, the row count
    /// the prediction reader assumes for `.npz` archives.
    fn write_archive(dir: &Path) -> PathBuf {
        let path = dir.join("mnist.npz");
        let x_train = Array3::<u8>::from_elem((64, IMAGE_DIM, IMAGE_DIM), 128);
        let y_train = Array1::<u8>::from_iter((0..64).map(|i| (i % 10) as u8));
        let x_test = Array3::<u8>::from_elem((10_000, IMAGE_DIM, IMAGE_DIM), 128);
        let y_test = Array1::<u8>::from_iter((0..10_000).map(|i| (i % 10) as u8));

        let mut writer = NpzWriter::new(File::create(&path).unwrap());
        writer.add_array("x_train", &x_train).unwrap();
        writer.add_array("y_train", &y_train).unwrap();
        writer.add_array("x_test", &x_test).unwrap();
        writer.add_array("y_test", &y_test).unwrap();
        writer.finish().unwrap();

        path
    }

    #[test]
    fn all_autolog_flags_off_forces_custom_logging_on() {
        // Even an explicit `false` for custom logging is overridden.
        let modes = LoggingModes::resolve(false, false, false, false);
        assert!(modes.custom);
        assert!(!modes.learner && !modes.backend && !modes.global);
    }

    #[test]
    fn explicit_custom_false_is_honored_when_an_autolog_is_on() {
        let modes = LoggingModes::resolve(false, true, false, false);
        assert!(!modes.custom);
        assert!(modes.learner);
    }

    #[test]
    fn defaults_keep_every_requested_mode() {
        let modes = LoggingModes::resolve(true, true, false, true);
        assert_eq!(
            modes,
            LoggingModes {
                custom: true,
                learner: true,
                backend: false,
                global: true
            }
        );
    }

    #[test]
    fn count_correct_compares_argmax_rows() {
        let device = Default::default();
        let output = Tensor::<TestBackend, 2>::from_data(
            Data::<f32, 2>::from([[0.9, 0.1, 0.0], [0.1, 0.2, 0.7], [0.5, 0.4, 0.1]]).convert(),
            &device,
        );
        let targets = Tensor::<TestBackend, 2>::from_data(
            Data::<f32, 2>::from([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]]).convert(),
            &device,
        );

        assert_eq!(count_correct(&output, &targets), (2, 3));
    }

    #[test]
    fn one_epoch_run_is_recorded_even_with_all_logging_off() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path());

        let store = TrackingStore::new(dir.path().join("runs")).unwrap();
        let registry = store.registry();
        let experiment = store.default_experiment().unwrap();
        let run = store.start_run(&experiment).unwrap();
        let run_id = run.run_id().to_string();

        let config = TrainingConfig::new(ModelConfig::new(), RmsPropConfig::new())
            .with_num_epochs(1)
            .with_batch_size(250);
        let modes = LoggingModes::resolve(false, false, false, false);

        let outcome = train::<TestAutodiffBackend>(
            &run,
            &registry,
            &config,
            &modes,
            None,
            Some(archive.as_path()),
            Default::default(),
        )
        .unwrap();
        run.end().unwrap();

        assert!((0.0..=1.0).contains(&outcome.test_accuracy));
        assert!(outcome.test_loss >= 0.0);

        // The forced custom-logging path recorded the run despite every
        // flag being off.
        let recorded = store.get_run(&run_id).unwrap();
        assert_eq!(recorded.params["epochs"], "1");
        assert_eq!(recorded.params["batch_size"], "250");
        assert_eq!(recorded.metrics["test_acc"], outcome.test_accuracy);
        assert_eq!(recorded.metrics["test_loss"], outcome.test_loss);
        assert!(!recorded.metrics.contains_key("train_loss"));

        let artifacts = store.list_artifacts(&run_id, "").unwrap();
        assert!(artifacts.contains(&"model.json".to_string()));
        assert!(artifacts.contains(&"model_summary.txt".to_string()));
        assert!(artifacts.contains(&"model/model.mpk".to_string()));
        assert!(artifacts.contains(&"model/config.json".to_string()));
    }

    #[test]
    fn training_config_defaults_match_the_cli_contract() {
        let config = TrainingConfig::new(ModelConfig::new(), RmsPropConfig::new());
        assert_eq!(config.num_epochs, 5);
        assert_eq!(config.batch_size, 128);
    }
}
