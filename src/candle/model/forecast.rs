use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{self as nn, Dropout, VarBuilder};
use serde::{Deserialize, Serialize};

use super::gru::GruLayer;
use crate::constants::{forecast, FUSED_DIM, HORIZON_COUNT, INTERVAL_SIGMAS, QUANTILE_COUNT, SEQ_LEN};
use crate::error::{ForecastError, Result};
use crate::normalize::Normalizer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub seq_len: usize,
    pub dropout: f32,
    pub timestamp: Normalizer,
    pub score: Normalizer,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            input_dim: FUSED_DIM,
            hidden_dim: 64,
            num_layers: 2,
            seq_len: SEQ_LEN,
            dropout: 0.1,
            timestamp: Normalizer::new(forecast::TIMESTAMP_MEAN, forecast::TIMESTAMP_STD),
            score: Normalizer::new(forecast::SCORE_MEAN, forecast::SCORE_STD),
        }
    }
}

impl ForecastConfig {
    /// fused vector + timestamp + score + treatment
    pub fn step_features(&self) -> usize {
        self.input_dim + 3
    }
}

/// Stacked GRU over the fused history followed by a quantile head.
pub struct TemporalForecaster {
    layers: Vec<GruLayer>,
    head_fc: nn::Linear,
    head_out: nn::Linear,
    dropout: Dropout,
    config: ForecastConfig,
}

impl TemporalForecaster {
    pub fn new(vb: VarBuilder, config: ForecastConfig) -> Result<Self> {
        let gru = vb.pp("gru");
        let mut layers = Vec::with_capacity(config.num_layers);
        for layer in 0..config.num_layers {
            let input_dim = if layer == 0 { config.step_features() } else { config.hidden_dim };
            layers.push(GruLayer::new(&gru, layer, input_dim, config.hidden_dim)?);
        }

        Ok(Self {
            layers,
            head_fc: nn::linear(config.hidden_dim, config.hidden_dim, vb.pp("head_fc"))?,
            head_out: nn::linear(
                config.hidden_dim,
                HORIZON_COUNT * QUANTILE_COUNT,
                vb.pp("head_out"),
            )?,
            dropout: Dropout::new(config.dropout),
            config,
        })
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// # Arguments
    /// `fused`: `[B, S, input_dim]`, `timestamps` and `scores`: `[B, S]` raw, `treatment`: `[B]` in {0, 1}
    ///
    /// # Returns
    /// `[B, HORIZON_COUNT, QUANTILE_COUNT]` in raw score units
    pub fn forward(
        &self,
        fused: &Tensor,
        timestamps: &Tensor,
        scores: &Tensor,
        treatment: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq_len) = match fused.dims() {
            [b, s, d] if *s == self.config.seq_len && *d == self.config.input_dim => (*b, *s),
            other => {
                return Err(ForecastError::shape(
                    "fused history",
                    ("batch", self.config.seq_len, self.config.input_dim),
                    other,
                ))
            }
        };
        for (what, t) in [("timestamps", timestamps), ("scores", scores)] {
            if t.dims() != [batch, seq_len] {
                return Err(ForecastError::shape(what, (batch, seq_len), t.dims()));
            }
        }
        if treatment.dims() != [batch] {
            return Err(ForecastError::shape("treatment", [batch], treatment.dims()));
        }

        let timestamps = self.config.timestamp.normalize_tensor(timestamps)?.unsqueeze(2)?;
        let scores = self.config.score.normalize_tensor(scores)?.unsqueeze(2)?;
        let treatment = treatment
            .reshape((batch, 1, 1))?
            .broadcast_as((batch, seq_len, 1))?
            .contiguous()?;
        let features = Tensor::cat(&[fused, &timestamps, &scores, &treatment], 2)?;

        let mut state = self
            .layers
            .iter()
            .map(|layer| layer.zero_state(batch, &features))
            .collect::<candle_core::Result<Vec<_>>>()?;

        for t in 0..seq_len {
            let mut x = features.i((.., t, ..))?.contiguous()?;
            for (k, layer) in self.layers.iter().enumerate() {
                // Dropout between stacked layers, not on the input
                if k > 0 {
                    x = self.dropout.forward(&x, train)?;
                }
                x = layer.step(&x, &state[k])?;
                state[k] = x.clone();
            }
        }

        // Top layer's hidden state after the last step
        let last = state
            .last()
            .ok_or_else(|| ForecastError::shape("gru layers", "at least 1", 0))?;
        let x = self.head_fc.forward(last)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        let out = self
            .head_out
            .forward(&x)?
            .reshape((batch, HORIZON_COUNT, QUANTILE_COUNT))?;
        Ok(self.config.score.denormalize_tensor(&out)?)
    }

    /// Eval-mode forward reduced to `(median, pseudo_std)`, both `[B, HORIZON_COUNT]`.
    pub fn predict_with_confidence(
        &self,
        fused: &Tensor,
        timestamps: &Tensor,
        scores: &Tensor,
        treatment: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let preds = self.forward(fused, timestamps, scores, treatment, false)?;
        let median = preds.i((.., .., 1))?;
        let spread = (preds.i((.., .., 2))? - preds.i((.., .., 0))?)?;
        let pseudo_std = spread.affine(1.0 / INTERVAL_SIGMAS as f64, 0.0)?;
        Ok((median, pseudo_std))
    }
}
