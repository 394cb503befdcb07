use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::candle::model::{CognitiveModel, ModelConfig};
use crate::constants::files::{META_FILE, WEIGHTS_FILE};
use crate::error::{ForecastError, Result};
use crate::utils::create_folder_if_not_exists;

/// Sidecar written next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub run_id: Uuid,
    pub saved_at: String,
    pub epoch: usize,
    pub val_mae: f32,
    pub val_rmse: f32,
    pub model: ModelConfig,
}

pub struct LoadedModel {
    pub varmap: VarMap,
    pub model: CognitiveModel,
    pub meta: CheckpointMeta,
}

/// Writes `{dir}/best_model.safetensors` and `{dir}/best_model.json`.
pub fn save_checkpoint(dir: impl AsRef<Path>, varmap: &VarMap, meta: &CheckpointMeta) -> Result<()> {
    let dir = dir.as_ref();
    create_folder_if_not_exists(dir)?;
    varmap.save(dir.join(WEIGHTS_FILE))?;
    let file = File::create(dir.join(META_FILE))?;
    serde_json::to_writer_pretty(BufWriter::new(file), meta)?;
    Ok(())
}

/// Rebuilds the model described by the sidecar and loads its weights.
///
/// # Arguments
/// * `dir` - Checkpoint directory holding the weights and sidecar
/// * `device` - Device to load the model on
///
/// # Returns
/// * The model with its variables, or `CheckpointLoad` when anything is missing or does not fit
pub fn load_checkpoint(dir: impl AsRef<Path>, device: &Device) -> Result<LoadedModel> {
    let dir = dir.as_ref();
    let meta_path = dir.join(META_FILE);
    let file = File::open(&meta_path)
        .map_err(|e| ForecastError::CheckpointLoad(format!("{}: {e}", meta_path.display())))?;
    let meta: CheckpointMeta = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| ForecastError::CheckpointLoad(format!("{}: {e}", meta_path.display())))?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = CognitiveModel::new(vb, &meta.model)
        .map_err(|e| ForecastError::CheckpointLoad(format!("invalid model config: {e}")))?;

    let weights_path = dir.join(WEIGHTS_FILE);
    varmap
        .load(&weights_path)
        .map_err(|e| ForecastError::CheckpointLoad(format!("{}: {e}", weights_path.display())))?;

    Ok(LoadedModel { varmap, model, meta })
}
