use std::fmt;

use thiserror::Error;

/// Which upstream embedder a vector was expected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Audio,
    Handwriting,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Audio => write!(f, "audio"),
            Modality::Handwriting => write!(f, "handwriting"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("Patient {0} not found")]
    PatientNotFound(String),

    #[error("Patient {patient_id} has {found} timepoints, at least {required} are needed")]
    InsufficientHistory {
        patient_id: String,
        found: usize,
        required: usize,
    },

    /// Upstream data problem in the rows a forecast would be built from.
    #[error("Patient {patient_id} has an unusable timeline: {reason}")]
    InvalidTimeline { patient_id: String, reason: String },

    #[error("No {modality} embedding for patient {patient_id} at month {month}")]
    MissingEmbedding {
        patient_id: String,
        month: u32,
        modality: Modality,
    },

    /// Caller bug: tensor or sequence does not have the shape the model was built for.
    #[error("Shape mismatch for {what}: expected {expected}, got {found}")]
    ShapeMismatch {
        what: String,
        expected: String,
        found: String,
    },

    #[error("No usable samples in the {0} split")]
    EmptyDataset(&'static str),

    #[error("Failed to load checkpoint: {0}")]
    CheckpointLoad(String),

    #[error("Tensor operation failed: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to encode report: {0}")]
    Report(#[from] postcard::Error),
}

impl ForecastError {
    pub(crate) fn shape(
        what: impl Into<String>,
        expected: impl fmt::Debug,
        found: impl fmt::Debug,
    ) -> Self {
        ForecastError::ShapeMismatch {
            what: what.into(),
            expected: format!("{expected:?}"),
            found: format!("{found:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
