use std::path::Path;

use candle_core::Device;
use serde::Serialize;
use tracing::{info, warn};

use crate::candle::checkpoint::{load_checkpoint, CheckpointMeta, LoadedModel};
use crate::candle::model::CognitiveModel;
use crate::constants::{HORIZONS_MONTHS, HORIZON_COUNT, Z_80};
use crate::data::embeddings::{EmbeddingSource, NpyEmbeddingStore};
use crate::data::PatientStore;
use crate::error::{ForecastError, Result};
use crate::types::{ForecastResult, PatientHistory, QuantilePrediction};

/// Point forecast and 80% interval, per horizon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub median: [f32; HORIZON_COUNT],
    pub lower: [f32; HORIZON_COUNT],
    pub upper: [f32; HORIZON_COUNT],
}

/// Rescales the predicted drop from `last_score` by `decline_factor`.
///
/// A factor of exactly 1.0 returns the raw quantiles untouched. Any other factor moves the
/// median to `last_score - (last_score - q50) * factor` and rebuilds a symmetric interval of
/// half-width `Z_80 * pseudo_std`, where `pseudo_std` comes from the unmodified quantiles.
pub fn apply_counterfactual(
    prediction: &QuantilePrediction,
    last_score: f32,
    decline_factor: f32,
) -> Interval {
    if decline_factor == 1.0 {
        return Interval {
            median: prediction.median(),
            lower: prediction.lower(),
            upper: prediction.upper(),
        };
    }

    let pseudo_std = prediction.pseudo_std();
    let median = prediction
        .median()
        .map(|q50| last_score - (last_score - q50) * decline_factor);
    let mut lower = [0.0; HORIZON_COUNT];
    let mut upper = [0.0; HORIZON_COUNT];
    for h in 0..HORIZON_COUNT {
        let half_width = Z_80 * pseudo_std[h];
        lower[h] = median[h] - half_width;
        upper[h] = median[h] + half_width;
    }
    Interval {
        median,
        lower,
        upper,
    }
}

/// A loaded model plus the data it reads histories from.
pub struct Predictor {
    model: CognitiveModel,
    meta: CheckpointMeta,
    store: PatientStore,
    embeddings: Box<dyn EmbeddingSource>,
}

impl Predictor {
    pub fn new(loaded: LoadedModel, store: PatientStore, embeddings: Box<dyn EmbeddingSource>) -> Self {
        Self {
            model: loaded.model,
            meta: loaded.meta,
            store,
            embeddings,
        }
    }

    /// Loads the checkpoint in `checkpoint_dir` and the dataset in `data_dir`.
    pub fn from_dirs(checkpoint_dir: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Result<Self> {
        let device = Device::cuda_if_available(0)?;
        let loaded = load_checkpoint(checkpoint_dir, &device)?;
        info!(
            run_id = %loaded.meta.run_id,
            epoch = loaded.meta.epoch,
            val_mae = loaded.meta.val_mae,
            "Loaded checkpoint"
        );
        let store = PatientStore::load(&data_dir)?;
        let embeddings = NpyEmbeddingStore::new(&data_dir);
        Ok(Self::new(loaded, store, Box::new(embeddings)))
    }

    pub fn meta(&self) -> &CheckpointMeta {
        &self.meta
    }

    pub fn store(&self) -> &PatientStore {
        &self.store
    }

    pub fn predict(&self, patient_id: &str, decline_factor: f32) -> Result<ForecastResult> {
        let history = self.store.history(patient_id, self.embeddings.as_ref())?;
        let prediction = self
            .model
            .predict_histories(&[&history])?
            .pop()
            .ok_or_else(|| ForecastError::shape("predictions", 1, 0))?;
        Ok(self.build_result(patient_id, &history, &prediction, decline_factor))
    }

    /// Forecasts every id in one batched forward pass. Per-patient failures (unknown id,
    /// short timeline, missing embedding) come back in that patient's slot; the outer
    /// error is only for failures of the model itself.
    pub fn predict_all(
        &self,
        patient_ids: &[String],
        decline_factor: f32,
    ) -> Result<Vec<Result<ForecastResult>>> {
        let histories: Vec<Result<PatientHistory>> = patient_ids
            .iter()
            .map(|id| self.store.history(id, self.embeddings.as_ref()))
            .collect();

        let ready: Vec<&PatientHistory> = histories.iter().filter_map(|h| h.as_ref().ok()).collect();
        let ready_count = ready.len();
        let mut predictions = self.model.predict_histories(&ready)?.into_iter();

        let results = patient_ids
            .iter()
            .zip(histories)
            .map(|(id, history)| {
                let history = history.inspect_err(|e| warn!(patient_id = %id, "{e}"))?;
                let prediction = predictions
                    .next()
                    .ok_or_else(|| ForecastError::shape("batched predictions", ready_count, "fewer"))?;
                Ok(self.build_result(id, &history, &prediction, decline_factor))
            })
            .collect();
        Ok(results)
    }

    fn build_result(
        &self,
        patient_id: &str,
        history: &PatientHistory,
        prediction: &QuantilePrediction,
        decline_factor: f32,
    ) -> ForecastResult {
        let interval = apply_counterfactual(prediction, history.last_score(), decline_factor);
        ForecastResult {
            patient_id: patient_id.to_string(),
            historical_months: history.timestamps(),
            historical_scores: history.scores(),
            horizons_months: HORIZONS_MONTHS,
            median: interval.median,
            ci_lower: interval.lower,
            ci_upper: interval.upper,
            pseudo_std: prediction.pseudo_std(),
            decline_factor,
            counterfactual_applied: decline_factor != 1.0,
            actual_scores: self.store.actual_scores(patient_id),
        }
    }

    /// One CSV row per forecast, with patient covariates and errors where actual scores exist.
    pub fn save_predictions(&self, results: &[ForecastResult], path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for result in results {
            let meta = self.store.patient(&result.patient_id);
            let actual = result.actual_scores;
            let errors = result.absolute_errors();
            writer.serialize(PredictionRow {
                patient_id: &result.patient_id,
                age: meta.map(|m| m.age),
                baseline_score: meta.map(|m| m.baseline_score),
                decline_rate: meta.and_then(|m| m.decline_rate),
                predicted_18m: result.median[0],
                predicted_24m: result.median[1],
                ci_lower_18m: result.ci_lower[0],
                ci_upper_18m: result.ci_upper[0],
                ci_lower_24m: result.ci_lower[1],
                ci_upper_24m: result.ci_upper[1],
                decline_factor: result.decline_factor,
                actual_18m: actual.map(|a| a[0]),
                actual_24m: actual.map(|a| a[1]),
                error_18m: errors.map(|e| e[0]),
                error_24m: errors.map(|e| e[1]),
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct PredictionRow<'a> {
    patient_id: &'a str,
    age: Option<f32>,
    baseline_score: Option<f32>,
    decline_rate: Option<f32>,
    predicted_18m: f32,
    predicted_24m: f32,
    ci_lower_18m: f32,
    ci_upper_18m: f32,
    ci_lower_24m: f32,
    ci_upper_24m: f32,
    decline_factor: f32,
    actual_18m: Option<f32>,
    actual_24m: Option<f32>,
    error_18m: Option<f32>,
    error_24m: Option<f32>,
}
