use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use hashbrown::HashMap;

use crate::constants::{files, AUDIO_DIM, HANDWRITING_DIM};
use crate::error::{ForecastError, Modality, Result};

/// Where per-timepoint embeddings come from. Both embedders are external; this only looks vectors up.
pub trait EmbeddingSource {
    fn audio(&self, patient_id: &str, month: u32) -> Result<Vec<f32>>;
    fn handwriting(&self, patient_id: &str, month: u32) -> Result<Vec<f32>>;
}

fn missing(patient_id: &str, month: u32, modality: Modality) -> ForecastError {
    ForecastError::MissingEmbedding {
        patient_id: patient_id.to_string(),
        month,
        modality,
    }
}

/// `.npy` vectors laid out as `audio_embeddings/{id}_T{MM}.npy` and
/// `stylus_embeddings/{id}_T{MM}_{trace}.npy`.
#[derive(Debug, Clone)]
pub struct NpyEmbeddingStore {
    audio_dir: PathBuf,
    stylus_dir: PathBuf,
}

impl NpyEmbeddingStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            audio_dir: data_dir.join(files::AUDIO_DIR),
            stylus_dir: data_dir.join(files::STYLUS_DIR),
        }
    }

    pub fn audio_path(&self, patient_id: &str, month: u32) -> PathBuf {
        self.audio_dir.join(format!("{patient_id}_T{month:02}.npy"))
    }

    /// Trace 1 when present, otherwise the lowest-numbered trace for that timepoint.
    pub fn handwriting_path(&self, patient_id: &str, month: u32) -> Option<PathBuf> {
        let preferred = self.stylus_dir.join(format!("{patient_id}_T{month:02}_1.npy"));
        if preferred.exists() {
            return Some(preferred);
        }

        let prefix = format!("{patient_id}_T{month:02}_");
        std::fs::read_dir(&self.stylus_dir)
            .ok()?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().into_string().ok()?;
                let trace = name
                    .strip_prefix(&prefix)?
                    .strip_suffix(".npy")?
                    .parse::<u32>()
                    .ok()?;
                Some((trace, entry.path()))
            })
            .min_by_key(|(trace, _)| *trace)
            .map(|(_, path)| path)
    }
}

fn read_vector(path: &Path) -> Result<Vec<f32>> {
    Ok(Tensor::read_npy(path)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?)
}

impl EmbeddingSource for NpyEmbeddingStore {
    fn audio(&self, patient_id: &str, month: u32) -> Result<Vec<f32>> {
        let path = self.audio_path(patient_id, month);
        if !path.exists() {
            return Err(missing(patient_id, month, Modality::Audio));
        }
        read_vector(&path)
    }

    fn handwriting(&self, patient_id: &str, month: u32) -> Result<Vec<f32>> {
        let path = self
            .handwriting_path(patient_id, month)
            .ok_or_else(|| missing(patient_id, month, Modality::Handwriting))?;
        read_vector(&path)
    }
}

/// Embeddings held in memory, keyed by `(patient_id, month)`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryEmbeddings {
    audio: HashMap<(String, u32), Vec<f32>>,
    handwriting: HashMap<(String, u32), Vec<f32>>,
}

impl InMemoryEmbeddings {
    pub fn insert_audio(&mut self, patient_id: &str, month: u32, embedding: Vec<f32>) {
        self.audio.insert((patient_id.to_string(), month), embedding);
    }

    pub fn insert_handwriting(&mut self, patient_id: &str, month: u32, embedding: Vec<f32>) {
        self.handwriting.insert((patient_id.to_string(), month), embedding);
    }

    /// Inserts a deterministic pattern scaled by `amplitude` for both modalities at each month.
    pub fn fill(&mut self, patient_id: &str, months: &[u32], amplitude: f32) {
        for &month in months {
            let pattern = |dim: usize, phase: f32| -> Vec<f32> {
                (0..dim)
                    .map(|i| amplitude * ((i as f32 * 0.37 + month as f32 * 0.11 + phase).sin()))
                    .collect()
            };
            self.insert_audio(patient_id, month, pattern(AUDIO_DIM, 0.0));
            self.insert_handwriting(patient_id, month, pattern(HANDWRITING_DIM, 1.3));
        }
    }
}

impl EmbeddingSource for InMemoryEmbeddings {
    fn audio(&self, patient_id: &str, month: u32) -> Result<Vec<f32>> {
        self.audio
            .get(&(patient_id.to_string(), month))
            .cloned()
            .ok_or_else(|| missing(patient_id, month, Modality::Audio))
    }

    fn handwriting(&self, patient_id: &str, month: u32) -> Result<Vec<f32>> {
        self.handwriting
            .get(&(patient_id.to_string(), month))
            .cloned()
            .ok_or_else(|| missing(patient_id, month, Modality::Handwriting))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn write_vector(path: PathBuf, value: f32, dim: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        Tensor::full(value, dim, &Device::Cpu)
            .unwrap()
            .write_npy(path)
            .unwrap();
    }

    #[test]
    fn test_npy_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = NpyEmbeddingStore::new(dir.path());
        write_vector(store.audio_path("P001", 6), 0.5, AUDIO_DIM);
        let stylus = dir.path().join(files::STYLUS_DIR);
        write_vector(stylus.join("P001_T06_1.npy"), 1.0, HANDWRITING_DIM);
        write_vector(stylus.join("P001_T06_2.npy"), 2.0, HANDWRITING_DIM);

        let audio = store.audio("P001", 6).unwrap();
        assert_eq!(audio.len(), AUDIO_DIM);
        assert_eq!(audio[0], 0.5);
        assert_eq!(store.handwriting("P001", 6).unwrap()[0], 1.0);

        assert!(matches!(
            store.audio("P001", 12),
            Err(ForecastError::MissingEmbedding {
                modality: Modality::Audio,
                month: 12,
                ..
            })
        ));
        assert!(matches!(
            store.handwriting("P002", 6),
            Err(ForecastError::MissingEmbedding {
                modality: Modality::Handwriting,
                ..
            })
        ));
    }

    #[test]
    fn test_stylus_falls_back_to_lowest_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = NpyEmbeddingStore::new(dir.path());
        let stylus = dir.path().join(files::STYLUS_DIR);
        write_vector(stylus.join("P001_T00_10.npy"), 10.0, HANDWRITING_DIM);
        write_vector(stylus.join("P001_T00_3.npy"), 3.0, HANDWRITING_DIM);
        write_vector(stylus.join("P0011_T00_2.npy"), 2.0, HANDWRITING_DIM);

        let path = store.handwriting_path("P001", 0).unwrap();
        assert!(path.ends_with("P001_T00_3.npy"));
        assert_eq!(store.handwriting("P001", 0).unwrap()[0], 3.0);
    }

    #[test]
    fn test_in_memory_fill() {
        let mut embeddings = InMemoryEmbeddings::default();
        embeddings.fill("P001", &[0, 6], 0.2);
        assert_eq!(embeddings.audio("P001", 0).unwrap().len(), AUDIO_DIM);
        assert_ne!(
            embeddings.audio("P001", 0).unwrap(),
            embeddings.audio("P001", 6).unwrap()
        );
        assert!(embeddings.handwriting("P001", 12).is_err());
    }
}
