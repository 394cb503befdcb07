use candle_core::{Device, Module, Tensor};
use candle_nn::{self as nn, Dropout, VarBuilder};
use serde::{Deserialize, Serialize};

use super::attention::EncoderLayer;
use super::layer_norm::LayerNorm;
use crate::constants::{AUDIO_DIM, FUSED_DIM, HANDWRITING_DIM, SCALAR_DIM};
use crate::error::{ForecastError, Result};
use crate::normalize::ScalarStats;
use crate::types::{FusedVector, TimepointObservation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub audio_dim: usize,
    pub handwriting_dim: usize,
    pub hidden_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub ff_dim: usize,
    pub dropout: f32,
    pub scalar_stats: ScalarStats,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            audio_dim: AUDIO_DIM,
            handwriting_dim: HANDWRITING_DIM,
            hidden_dim: FUSED_DIM,
            num_heads: 2,
            num_layers: 2,
            ff_dim: 2 * FUSED_DIM,
            dropout: 0.1,
            scalar_stats: ScalarStats::default(),
        }
    }
}

impl FusionConfig {
    pub fn input_dim(&self) -> usize {
        self.audio_dim + self.handwriting_dim + SCALAR_DIM
    }
}

/// Maps one timepoint's (audio, handwriting, scalars) to a fused vector.
/// Every sample in a batch is encoded on its own; attention never crosses samples.
pub struct FusionEncoder {
    input_proj: nn::Linear,
    input_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    output_fc: nn::Linear,
    output_out: nn::Linear,
    dropout: Dropout,
    config: FusionConfig,
    device: Device,
}

impl FusionEncoder {
    pub fn new(vb: VarBuilder, config: FusionConfig) -> Result<Self> {
        let hidden = config.hidden_dim;
        let layers = (0..config.num_layers)
            .map(|i| {
                EncoderLayer::new(
                    vb.pp(format!("layers.{i}")),
                    hidden,
                    config.num_heads,
                    config.ff_dim,
                    config.dropout,
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            input_proj: nn::linear(config.input_dim(), hidden, vb.pp("input_proj"))?,
            input_norm: LayerNorm::new(vb.pp("input_norm"), hidden, 1e-5)?,
            layers,
            output_fc: nn::linear(hidden, hidden, vb.pp("output_fc"))?,
            output_out: nn::linear(hidden, hidden, vb.pp("output_out"))?,
            dropout: Dropout::new(config.dropout),
            device: vb.device().clone(),
            config,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// `audio`: `[B, audio_dim]`, `handwriting`: `[B, handwriting_dim]`, `scalars`: `[B, 4]` raw.
    /// Returns `[B, hidden_dim]`.
    pub fn forward(
        &self,
        audio: &Tensor,
        handwriting: &Tensor,
        scalars: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let batch = match audio.dims() {
            [batch, dim] if *dim == self.config.audio_dim => *batch,
            other => {
                return Err(ForecastError::shape(
                    "audio input",
                    ("batch", self.config.audio_dim),
                    other,
                ))
            }
        };
        if handwriting.dims() != [batch, self.config.handwriting_dim] {
            return Err(ForecastError::shape(
                "handwriting input",
                (batch, self.config.handwriting_dim),
                handwriting.dims(),
            ));
        }
        if scalars.dims() != [batch, SCALAR_DIM] {
            return Err(ForecastError::shape("scalar input", (batch, SCALAR_DIM), scalars.dims()));
        }

        let scalars = self.config.scalar_stats.normalize_tensor(scalars)?;
        let combined = Tensor::cat(&[audio, handwriting, &scalars], 1)?;

        // Project -> LayerNorm -> ReLU -> Dropout
        let x = self.input_norm.forward(&self.input_proj.forward(&combined)?)?.relu()?;
        let x = self.dropout.forward(&x, train)?;

        // Each sample is a length-1 sequence for the encoder stack
        let mut x = x.unsqueeze(1)?;
        for layer in &self.layers {
            x = layer.forward(&x, train)?;
        }
        let x = x.squeeze(1)?;

        let x = self.output_fc.forward(&x)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        Ok(self.output_out.forward(&x)?)
    }

    /// Eval-mode fusion of a batch of observations. Row `i` of the result only depends on `observations[i]`.
    pub fn fuse_batch(&self, observations: &[TimepointObservation]) -> Result<Vec<FusedVector>> {
        if observations.is_empty() {
            return Ok(Vec::new());
        }
        let (audio, handwriting, scalars) = observation_tensors(observations, &self.device)?;
        let fused = self.forward(&audio, &handwriting, &scalars, false)?;
        Ok(fused.to_vec2::<f32>()?.into_iter().map(FusedVector).collect())
    }

    pub fn fuse_one(&self, observation: &TimepointObservation) -> Result<FusedVector> {
        self.fuse_batch(std::slice::from_ref(observation))?
            .pop()
            .ok_or_else(|| ForecastError::shape("fused batch", 1, 0))
    }
}

/// Stacks observations into `(audio [N, A], handwriting [N, H], scalars [N, 4])`.
pub fn observation_tensors<'a>(
    observations: impl IntoIterator<Item = &'a TimepointObservation>,
    device: &Device,
) -> Result<(Tensor, Tensor, Tensor)> {
    let mut audio = Vec::new();
    let mut handwriting = Vec::new();
    let mut scalars = Vec::new();
    let mut count = 0;
    for obs in observations {
        obs.check_dims()?;
        audio.extend_from_slice(&obs.audio_embedding);
        handwriting.extend_from_slice(&obs.handwriting_embedding);
        scalars.extend_from_slice(&obs.scalars.to_array());
        count += 1;
    }
    Ok((
        Tensor::from_vec(audio, (count, AUDIO_DIM), device)?,
        Tensor::from_vec(handwriting, (count, HANDWRITING_DIM), device)?,
        Tensor::from_vec(scalars, (count, SCALAR_DIM), device)?,
    ))
}
