pub mod attention;
pub mod forecast;
pub mod fusion;
pub mod gru;
pub mod layer_norm;


use candle_core::{DType, Device, IndexOp, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::constants::{AUDIO_DIM, HANDWRITING_DIM, SCALAR_DIM};
use crate::error::{ForecastError, Result};
use crate::types::{PatientHistory, QuantilePrediction};
use forecast::{ForecastConfig, TemporalForecaster};
use fusion::{observation_tensors, FusionConfig, FusionEncoder};

/// Everything needed to rebuild the network shape. Saved next to the weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub fusion: FusionConfig,
    pub forecast: ForecastConfig,
}

/// Model-ready tensors for a batch of patient histories.
pub struct SequenceBatch {
    /// `[B, S, audio_dim]`
    pub audio: Tensor,
    /// `[B, S, handwriting_dim]`
    pub handwriting: Tensor,
    /// `[B, S, 4]` raw covariates
    pub scalars: Tensor,
    /// `[B, S]` months
    pub timestamps: Tensor,
    /// `[B, S]` raw scores
    pub scores: Tensor,
    /// `[B]`
    pub treatment: Tensor,
}

impl SequenceBatch {
    pub fn from_histories(histories: &[&PatientHistory], device: &Device) -> Result<Self> {
        let batch = histories.len();
        let seq_len = histories.first().map_or(0, |h| h.observations().len());

        let (audio, handwriting, scalars) =
            observation_tensors(histories.iter().flat_map(|h| h.observations()), device)?;
        let timestamps: Vec<f32> = histories.iter().flat_map(|h| h.timestamps()).collect();
        let scores: Vec<f32> = histories.iter().flat_map(|h| h.scores()).collect();
        let treatment: Vec<f32> = histories
            .iter()
            .map(|h| if h.treatment() { 1.0 } else { 0.0 })
            .collect();

        Ok(Self {
            audio: audio.reshape((batch, seq_len, AUDIO_DIM))?,
            handwriting: handwriting.reshape((batch, seq_len, HANDWRITING_DIM))?,
            scalars: scalars.reshape((batch, seq_len, SCALAR_DIM))?,
            timestamps: Tensor::from_vec(timestamps, (batch, seq_len), device)?,
            scores: Tensor::from_vec(scores, (batch, seq_len), device)?,
            treatment: Tensor::from_vec(treatment, batch, device)?,
        })
    }

    pub fn len(&self) -> usize {
        self.treatment.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fusion encoder and temporal forecaster trained end-to-end.
pub struct CognitiveModel {
    pub fusion: FusionEncoder,
    pub forecast: TemporalForecaster,
    device: Device,
}

impl CognitiveModel {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        if config.fusion.hidden_dim != config.forecast.input_dim {
            return Err(ForecastError::shape(
                "forecaster input dim",
                config.fusion.hidden_dim,
                config.forecast.input_dim,
            ));
        }
        Ok(Self {
            fusion: FusionEncoder::new(vb.pp("fusion"), config.fusion.clone())?,
            forecast: TemporalForecaster::new(vb.pp("forecast"), config.forecast.clone())?,
            device: vb.device().clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> ModelConfig {
        ModelConfig {
            fusion: self.fusion.config().clone(),
            forecast: self.forecast.config().clone(),
        }
    }

    /// Fuses every timepoint independently, then forecasts. Returns `[B, H, Q]` raw scores.
    pub fn forward(&self, batch: &SequenceBatch, train: bool) -> Result<Tensor> {
        let (b, s, _) = batch.audio.dims3()?;
        let flat = |t: &Tensor| -> Result<Tensor> {
            let width = t.dim(2)?;
            Ok(t.reshape((b * s, width))?)
        };
        let fused = self.fusion.forward(
            &flat(&batch.audio)?,
            &flat(&batch.handwriting)?,
            &flat(&batch.scalars)?,
            train,
        )?;
        let fused = fused.reshape((b, s, self.fusion.config().hidden_dim))?;
        self.forecast.forward(
            &fused,
            &batch.timestamps,
            &batch.scores,
            &batch.treatment,
            train,
        )
    }

    /// Eval-mode quantiles for each history, in input order.
    pub fn predict_histories(&self, histories: &[&PatientHistory]) -> Result<Vec<QuantilePrediction>> {
        if histories.is_empty() {
            return Ok(Vec::new());
        }
        let batch = SequenceBatch::from_histories(histories, &self.device)?;
        let preds = self.forward(&batch, false)?;
        (0..histories.len())
            .map(|i| QuantilePrediction::from_rows(&preds.i(i)?.to_vec2::<f32>()?))
            .collect()
    }
}

/// Rewrites every variable from a seeded generator so the same seed always gives the same
/// network. Matrices get `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, norm scales 1, norm shifts 0,
/// and biases the bound of their sibling weight.
pub fn seed_parameters(varmap: &VarMap, seed: u64) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &vars[name];
        let dims = var.dims().to_vec();
        let is_norm = name.contains("norm");
        let values = match dims.as_slice() {
            [_, fan_in] => uniform(&mut rng, bound(*fan_in), dims.iter().product()),
            [n] if is_norm && name.ends_with("weight") => vec![1.0; *n],
            [n] if is_norm => vec![0.0; *n],
            [n] => {
                let fan_in = sibling_fan_in(&vars, name).unwrap_or(*n);
                uniform(&mut rng, bound(fan_in), *n)
            }
            _ => continue,
        };
        set_var(var, values)?;
    }
    Ok(())
}

fn bound(fan_in: usize) -> f32 {
    1.0 / (fan_in.max(1) as f32).sqrt()
}

fn uniform(rng: &mut StdRng, bound: f32, count: usize) -> Vec<f32> {
    Uniform::new_inclusive(-bound, bound)
        .sample_iter(rng)
        .take(count)
        .collect()
}

fn sibling_fan_in(vars: &std::collections::HashMap<String, Var>, bias_name: &str) -> Option<usize> {
    let weight = vars.get(&bias_name.replacen("bias", "weight", 1))?;
    match weight.dims() {
        [_, fan_in] => Some(*fan_in),
        _ => None,
    }
}

pub(crate) fn set_var(var: &Var, values: Vec<f32>) -> Result<()> {
    let tensor = Tensor::from_vec(values, var.dims(), var.device())?.to_dtype(var.dtype())?;
    var.set(&tensor)?;
    Ok(())
}

/// Builds a fresh model on `device` with seeded weights.
pub fn build_seeded(config: &ModelConfig, seed: u64, device: &Device) -> Result<(VarMap, CognitiveModel)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = CognitiveModel::new(vb, config)?;
    seed_parameters(&varmap, seed)?;
    Ok((varmap, model))
}
