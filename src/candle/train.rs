use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use ndarray::{concatenate, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::candle::checkpoint::{load_checkpoint, save_checkpoint, CheckpointMeta};
use crate::candle::loss::quantile_loss;
use crate::candle::metrics::{
    ordering_rate, point_metrics, predictions_array, r_squared_per_horizon, targets_array,
};
use crate::candle::model::{build_seeded, CognitiveModel, ModelConfig};
use crate::constants::{files, train, HORIZON_COUNT};
use crate::data::dataset::{PatientDataset, Split};
use crate::data::embeddings::{EmbeddingSource, NpyEmbeddingStore};
use crate::data::PatientStore;
use crate::error::{ForecastError, Result};
use crate::history::training::{EpochRecord, TrainingHistory};
use crate::normalize::ScalarStats;
use crate::utils::create_folder_if_not_exists;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Epochs without a validation MAE improvement before stopping
    pub patience: usize,
    pub seed: u64,
    pub train_ratio: f64,
    /// Refit covariate statistics on the training split instead of the fixed defaults
    pub fit_scalar_stats: bool,
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub training_dir: PathBuf,
    pub model: ModelConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: train::EPOCHS,
            batch_size: train::BATCH_SIZE,
            learning_rate: train::LEARNING_RATE,
            patience: train::PATIENCE,
            seed: train::SEED,
            train_ratio: train::TRAIN_RATIO,
            fit_scalar_stats: false,
            data_dir: PathBuf::from(files::DATA_PATH),
            checkpoint_dir: PathBuf::from(files::CHECKPOINT_PATH),
            training_dir: PathBuf::from(files::TRAINING_PATH),
            model: ModelConfig::default(),
        }
    }
}

/// Averages over batches plus whole-split statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f32,
    pub mae: f32,
    pub rmse: f32,
    pub r2: [f32; HORIZON_COUNT],
    /// Share of predictions with `q10 <= q50` and with `q50 <= q90`
    pub ordering_rate: [f32; 2],
}

/// Written to `{checkpoint_dir}/results.json` at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResults {
    pub run_id: Uuid,
    pub n_params: usize,
    pub n_train: usize,
    pub n_test: usize,
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_val_mae: f32,
    pub test: Evaluation,
    pub config: TrainConfig,
}

/// Loads the dataset from `config.data_dir` and trains.
pub fn train(config: &TrainConfig) -> Result<TrainingResults> {
    let store = PatientStore::load(&config.data_dir)?;
    let embeddings = NpyEmbeddingStore::new(&config.data_dir);
    info!(patients = store.len(), data_dir = %config.data_dir.display(), "Loaded patient store");
    train_on(config, &store, &embeddings)
}

/// Full training run: seeded split, AdamW on the quantile loss, checkpoint on best
/// validation MAE, early stopping, then a final evaluation of the best checkpoint.
pub fn train_on(
    config: &TrainConfig,
    store: &PatientStore,
    embeddings: &dyn EmbeddingSource,
) -> Result<TrainingResults> {
    let device = Device::cuda_if_available(0)?;
    info!(?device, "Using device");

    let train_set = PatientDataset::load(store, embeddings, Split::Train, config.train_ratio, config.seed)?;
    let test_set = PatientDataset::load(store, embeddings, Split::Test, config.train_ratio, config.seed)?;
    if train_set.is_empty() {
        return Err(ForecastError::EmptyDataset("train"));
    }
    if test_set.is_empty() {
        return Err(ForecastError::EmptyDataset("test"));
    }
    info!(train = train_set.len(), test = test_set.len(), "Split dataset");

    let mut model_config = config.model.clone();
    if config.fit_scalar_stats {
        if let Some(stats) = ScalarStats::fit(&train_set.scalar_rows()) {
            info!(mean = ?stats.mean, std = ?stats.std, "Fitted covariate statistics");
            model_config.fusion.scalar_stats = stats;
        }
    }

    let (varmap, model) = build_seeded(&model_config, config.seed, &device)?;
    let n_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
    info!(n_params, "Built model");

    let mut opt = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    let run_id = Uuid::new_v4();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut history = TrainingHistory::default();
    let mut best_val_mae = f32::INFINITY;
    let mut best_epoch = 0;
    let mut stale_epochs = 0;

    for epoch in 1..=config.epochs {
        let trained = train_epoch(&model, &train_set, &mut opt, config.batch_size, &mut rng, &device)?;
        let val = evaluate(&model, &test_set, config.batch_size, &device)?;

        history.record(EpochRecord {
            train_loss: trained.loss,
            val_loss: val.loss,
            train_mae: trained.mae,
            val_mae: val.mae,
            train_rmse: trained.rmse,
            val_rmse: val.rmse,
            val_ordering: val.ordering_rate[0].min(val.ordering_rate[1]),
        });
        info!(
            epoch,
            train_loss = trained.loss,
            train_mae = trained.mae,
            val_loss = val.loss,
            val_mae = val.mae,
            val_rmse = val.rmse,
            "Epoch finished"
        );

        if val.mae < best_val_mae {
            best_val_mae = val.mae;
            best_epoch = epoch;
            stale_epochs = 0;
            save_checkpoint(
                &config.checkpoint_dir,
                &varmap,
                &CheckpointMeta {
                    run_id,
                    saved_at: chrono::Utc::now().to_rfc3339(),
                    epoch,
                    val_mae: val.mae,
                    val_rmse: val.rmse,
                    model: model_config.clone(),
                },
            )?;
            info!(epoch, val_mae = val.mae, "Saved new best model");
        } else {
            stale_epochs += 1;
            debug!(stale_epochs, "No improvement");
            if stale_epochs >= config.patience {
                info!(epoch, "Early stopping");
                break;
            }
        }
    }

    history.write_reports(&config.training_dir)?;

    if best_epoch == 0 {
        return Err(ForecastError::CheckpointLoad(
            "validation MAE never improved, no checkpoint was written".to_string(),
        ));
    }
    let best = load_checkpoint(&config.checkpoint_dir, &device)?;
    let test = evaluate(&best.model, &test_set, config.batch_size, &device)?;
    info!(
        test_loss = test.loss,
        test_mae = test.mae,
        test_rmse = test.rmse,
        r2_18m = test.r2[0],
        r2_24m = test.r2[1],
        "Final evaluation"
    );

    let results = TrainingResults {
        run_id,
        n_params,
        n_train: train_set.len(),
        n_test: test_set.len(),
        epochs_run: history.epochs(),
        best_epoch,
        best_val_mae,
        test,
        config: config.clone(),
    };
    create_folder_if_not_exists(&config.checkpoint_dir)?;
    let file = File::create(config.checkpoint_dir.join(files::RESULTS_FILE))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &results)?;

    Ok(results)
}

fn train_epoch(
    model: &CognitiveModel,
    dataset: &PatientDataset,
    opt: &mut AdamW,
    batch_size: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Evaluation> {
    let batches = dataset.batches(batch_size, Some(rng), device)?;
    let mut loss_sum = 0.0;
    let mut mae_sum = 0.0;
    let mut rmse_sum = 0.0;

    for (i, (batch, targets)) in batches.iter().enumerate() {
        let preds = model.forward(batch, true)?;
        let loss = quantile_loss(&preds, targets)?;
        opt.backward_step(&loss)?;

        let metrics = point_metrics(predictions_array(&preds)?.view(), &targets_array(targets)?);
        let loss = loss.to_scalar::<f32>()?;
        debug!(batch = i, size = batch.len(), loss, mae = metrics.mae, "Train step");
        loss_sum += loss;
        mae_sum += metrics.mae;
        rmse_sum += metrics.rmse;
    }

    let n = batches.len().max(1) as f32;
    Ok(Evaluation {
        loss: loss_sum / n,
        mae: mae_sum / n,
        rmse: rmse_sum / n,
        ..Default::default()
    })
}

/// Eval-mode pass over `dataset` in order. Loss, MAE and RMSE are batch means;
/// R² and ordering are computed over the whole split.
pub fn evaluate(
    model: &CognitiveModel,
    dataset: &PatientDataset,
    batch_size: usize,
    device: &Device,
) -> Result<Evaluation> {
    let batches = dataset.batches(batch_size, None, device)?;
    let mut loss_sum = 0.0;
    let mut mae_sum = 0.0;
    let mut rmse_sum = 0.0;
    let mut all_preds: Vec<Array3<f32>> = Vec::with_capacity(batches.len());
    let mut all_targets: Vec<Array2<f32>> = Vec::with_capacity(batches.len());

    for (batch, targets) in &batches {
        let preds = model.forward(batch, false)?;
        let loss = quantile_loss(&preds, targets)?;
        let preds = predictions_array(&preds)?;
        let targets = targets_array(targets)?;

        let metrics = point_metrics(preds.view(), &targets);
        loss_sum += loss.to_scalar::<f32>()?;
        mae_sum += metrics.mae;
        rmse_sum += metrics.rmse;
        all_preds.push(preds);
        all_targets.push(targets);
    }

    let n = batches.len().max(1) as f32;
    let mut evaluation = Evaluation {
        loss: loss_sum / n,
        mae: mae_sum / n,
        rmse: rmse_sum / n,
        r2: [0.0; HORIZON_COUNT],
        ordering_rate: [1.0, 1.0],
    };
    if !all_preds.is_empty() {
        let preds = concatenate(Axis(0), &all_preds.iter().map(|a| a.view()).collect::<Vec<_>>())
            .map_err(|e| ForecastError::shape("stacked predictions", "matching batches", e.to_string()))?;
        let targets = concatenate(Axis(0), &all_targets.iter().map(|a| a.view()).collect::<Vec<_>>())
            .map_err(|e| ForecastError::shape("stacked targets", "matching batches", e.to_string()))?;
        evaluation.r2 = r_squared_per_horizon(preds.view(), &targets);
        evaluation.ordering_rate = ordering_rate(preds.view());
    }
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::scalars;
    use crate::history::report::read_report;
    use crate::test_fixtures::{patient_store, store_embeddings};

    #[test]
    fn test_short_training_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = patient_store(10, 5);
        let embeddings = store_embeddings(&store);
        let config = TrainConfig {
            epochs: 2,
            batch_size: 4,
            fit_scalar_stats: true,
            checkpoint_dir: dir.path().join("checkpoints"),
            training_dir: dir.path().join("training"),
            ..Default::default()
        };

        let results = train_on(&config, &store, &embeddings).unwrap();
        assert_eq!((results.n_train, results.n_test), (8, 2));
        assert_eq!(results.epochs_run, 2);
        assert!(results.best_epoch >= 1);
        assert!(results.test.mae.is_finite());
        assert!(results.n_params > 0);

        let checkpoints = &config.checkpoint_dir;
        assert!(checkpoints.join(files::WEIGHTS_FILE).exists());
        assert!(checkpoints.join(files::RESULTS_FILE).exists());
        let meta = load_checkpoint(checkpoints, &Device::Cpu).unwrap().meta;
        assert_eq!(meta.epoch, results.best_epoch);
        let stats = meta.model.fusion.scalar_stats;
        assert_ne!(stats, ScalarStats::default());
        // Every fixture patient shares age and baseline score.
        assert_eq!(stats.std[0], scalars::STD[0]);
        assert_eq!(stats.std[1], scalars::STD[1]);
        let z = stats.normalize([81.0, 90.0, 131.0, 0.066]);
        assert!(z.iter().all(|v| v.is_finite() && v.abs() < 10.0), "{z:?}");

        let loss = read_report(config.training_dir.join("loss.report.bin")).unwrap();
        assert_eq!(loss.kind.epochs(), 2);
    }

    #[test]
    fn test_empty_split_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = patient_store(3, 4);
        let embeddings = store_embeddings(&store);
        let config = TrainConfig {
            epochs: 1,
            checkpoint_dir: dir.path().join("checkpoints"),
            training_dir: dir.path().join("training"),
            ..Default::default()
        };
        assert!(matches!(
            train_on(&config, &store, &embeddings),
            Err(ForecastError::EmptyDataset(_))
        ));
    }
}
