use serde::{Deserialize, Serialize};

use crate::constants::{
    AUDIO_DIM, HANDWRITING_DIM, HORIZON_COUNT, INTERVAL_SIGMAS, QUANTILE_COUNT,
    SCALAR_DIM, SEQ_LEN,
};
use crate::error::{ForecastError, Result};

/// Raw (not yet normalized) covariates for one timepoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarCovariates {
    pub age: f32,
    pub baseline_score: f32,
    pub typing_flight_time: f32,
    pub gait_variability: f32,
}

impl ScalarCovariates {
    /// Field order matches [`crate::normalize::ScalarStats`].
    pub fn to_array(&self) -> [f32; SCALAR_DIM] {
        [
            self.age,
            self.baseline_score,
            self.typing_flight_time,
            self.gait_variability,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimepointObservation {
    pub timestamp_months: f32,
    pub audio_embedding: Vec<f32>,
    pub handwriting_embedding: Vec<f32>,
    pub scalars: ScalarCovariates,
    pub raw_score: f32,
    pub treatment: bool,
}

impl TimepointObservation {
    pub fn check_dims(&self) -> Result<()> {
        if self.audio_embedding.len() != AUDIO_DIM {
            return Err(ForecastError::shape(
                "audio embedding",
                AUDIO_DIM,
                self.audio_embedding.len(),
            ));
        }
        if self.handwriting_embedding.len() != HANDWRITING_DIM {
            return Err(ForecastError::shape(
                "handwriting embedding",
                HANDWRITING_DIM,
                self.handwriting_embedding.len(),
            ));
        }
        Ok(())
    }
}

/// Output of the fusion encoder for one timepoint.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedVector(pub Vec<f32>);

impl FusedVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn max_abs_diff(&self, other: &FusedVector) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

/// Exactly [`SEQ_LEN`] chronologically ordered observations of one patient.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientHistory {
    observations: Vec<TimepointObservation>,
}

impl PatientHistory {
    pub fn new(observations: Vec<TimepointObservation>) -> Result<Self> {
        if observations.len() != SEQ_LEN {
            return Err(ForecastError::shape(
                "history length",
                SEQ_LEN,
                observations.len(),
            ));
        }
        for obs in &observations {
            obs.check_dims()?;
        }
        let months: Vec<f32> = observations.iter().map(|o| o.timestamp_months).collect();
        if let Some(reason) = timestamp_problem(&months) {
            return Err(ForecastError::shape(
                "history timestamps",
                "finite and strictly increasing",
                reason,
            ));
        }
        let treatment = observations[0].treatment;
        if observations.iter().any(|o| o.treatment != treatment) {
            return Err(ForecastError::shape(
                "treatment flag",
                "constant across history",
                observations.iter().map(|o| o.treatment).collect::<Vec<_>>(),
            ));
        }
        Ok(Self { observations })
    }

    pub fn observations(&self) -> &[TimepointObservation] {
        &self.observations
    }

    pub fn timestamps(&self) -> Vec<f32> {
        self.observations.iter().map(|o| o.timestamp_months).collect()
    }

    pub fn scores(&self) -> Vec<f32> {
        self.observations.iter().map(|o| o.raw_score).collect()
    }

    pub fn treatment(&self) -> bool {
        self.observations[0].treatment
    }

    pub fn last_score(&self) -> f32 {
        self.observations[SEQ_LEN - 1].raw_score
    }
}

/// Describes the first non-finite or non-increasing month, if any.
pub(crate) fn timestamp_problem(months: &[f32]) -> Option<String> {
    if let Some(month) = months.iter().find(|m| !m.is_finite()) {
        return Some(format!("month {month} is not finite"));
    }
    months
        .windows(2)
        .find(|pair| pair[1] <= pair[0])
        .map(|pair| format!("month {} does not follow month {}", pair[1], pair[0]))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizonQuantiles {
    pub q10: f32,
    pub q50: f32,
    pub q90: f32,
}

impl HorizonQuantiles {
    /// The model has no structural guard against quantile crossing.
    pub fn is_ordered(&self) -> bool {
        self.q10 <= self.q50 && self.q50 <= self.q90
    }

    /// Approximate sigma from the 10-90 width, assuming a Gaussian. Not a true standard deviation.
    pub fn pseudo_std(&self) -> f32 {
        (self.q90 - self.q10) / INTERVAL_SIGMAS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantilePrediction {
    pub horizons: [HorizonQuantiles; HORIZON_COUNT],
}

impl QuantilePrediction {
    /// Builds from a `[HORIZON_COUNT][QUANTILE_COUNT]` nested vector as produced by `to_vec2`.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        if rows.len() != HORIZON_COUNT || rows.iter().any(|r| r.len() != QUANTILE_COUNT) {
            return Err(ForecastError::shape(
                "quantile prediction",
                (HORIZON_COUNT, QUANTILE_COUNT),
                rows.iter().map(|r| r.len()).collect::<Vec<_>>(),
            ));
        }
        let horizon = |r: &Vec<f32>| HorizonQuantiles {
            q10: r[0],
            q50: r[1],
            q90: r[2],
        };
        Ok(Self {
            horizons: [horizon(&rows[0]), horizon(&rows[1])],
        })
    }

    pub fn median(&self) -> [f32; HORIZON_COUNT] {
        self.horizons.map(|h| h.q50)
    }

    pub fn lower(&self) -> [f32; HORIZON_COUNT] {
        self.horizons.map(|h| h.q10)
    }

    pub fn upper(&self) -> [f32; HORIZON_COUNT] {
        self.horizons.map(|h| h.q90)
    }

    pub fn pseudo_std(&self) -> [f32; HORIZON_COUNT] {
        self.horizons.map(|h| h.pseudo_std())
    }

    pub fn is_ordered(&self) -> bool {
        self.horizons.iter().all(HorizonQuantiles::is_ordered)
    }
}

/// Final per-patient forecast. Never persisted by the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    pub patient_id: String,
    pub historical_months: Vec<f32>,
    pub historical_scores: Vec<f32>,
    pub horizons_months: [f32; HORIZON_COUNT],
    pub median: [f32; HORIZON_COUNT],
    pub ci_lower: [f32; HORIZON_COUNT],
    pub ci_upper: [f32; HORIZON_COUNT],
    pub pseudo_std: [f32; HORIZON_COUNT],
    pub decline_factor: f32,
    pub counterfactual_applied: bool,
    /// Observed scores at the horizons when the timeline extends that far.
    pub actual_scores: Option<[f32; HORIZON_COUNT]>,
}

impl ForecastResult {
    pub fn absolute_errors(&self) -> Option<[f32; HORIZON_COUNT]> {
        let actual = self.actual_scores?;
        Some([
            (self.median[0] - actual[0]).abs(),
            (self.median[1] - actual[1]).abs(),
        ])
    }
}
