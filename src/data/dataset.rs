use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::warn;

use super::embeddings::EmbeddingSource;
use super::PatientStore;
use crate::candle::model::SequenceBatch;
use crate::constants::{HORIZON_COUNT, SCALAR_DIM};
use crate::error::Result;
use crate::types::PatientHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// Seeded permutation of `ids`, cut at `floor(len * train_ratio)`. Returns `(train, test)`.
pub fn split_ids(ids: &[String], train_ratio: f64, seed: u64) -> (Vec<String>, Vec<String>) {
    let mut shuffled = ids.to_vec();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
    let n_train = ((ids.len() as f64) * train_ratio.clamp(0.0, 1.0)).floor() as usize;
    let test = shuffled.split_off(n_train);
    (shuffled, test)
}

/// One training example: the first [`crate::constants::SEQ_LEN`] timepoints and the next [`HORIZON_COUNT`] scores.
#[derive(Debug, Clone)]
pub struct Sample {
    pub patient_id: String,
    pub history: PatientHistory,
    pub targets: [f32; HORIZON_COUNT],
}

pub struct PatientDataset {
    samples: Vec<Sample>,
}

impl PatientDataset {
    /// Builds one split. Patients whose timeline is too short for a target are skipped;
    /// a missing embedding fails the whole load.
    pub fn load(
        store: &PatientStore,
        embeddings: &dyn EmbeddingSource,
        split: Split,
        train_ratio: f64,
        seed: u64,
    ) -> Result<Self> {
        let (train_ids, test_ids) = split_ids(&store.patient_ids(), train_ratio, seed);
        let ids = match split {
            Split::Train => train_ids,
            Split::Test => test_ids,
        };

        let mut samples = Vec::with_capacity(ids.len());
        for patient_id in ids {
            let Some(targets) = store.actual_scores(&patient_id) else {
                warn!(
                    patient_id = %patient_id,
                    rows = store.timeline(&patient_id).len(),
                    "Skipping patient with too few timepoints"
                );
                continue;
            };
            let history = store.history(&patient_id, embeddings)?;
            samples.push(Sample {
                patient_id,
                history,
                targets,
            });
        }
        Ok(Self { samples })
    }

    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Raw covariates of every timepoint, for fitting normalization statistics.
    pub fn scalar_rows(&self) -> Vec<[f32; SCALAR_DIM]> {
        self.samples
            .iter()
            .flat_map(|s| s.history.observations().iter().map(|o| o.scalars.to_array()))
            .collect()
    }

    /// Splits into batches of at most `batch_size`. Order is shuffled with `rng` when given.
    /// Each batch comes with its `[B, HORIZON_COUNT]` targets.
    pub fn batches(
        &self,
        batch_size: usize,
        rng: Option<&mut StdRng>,
        device: &Device,
    ) -> Result<Vec<(SequenceBatch, Tensor)>> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }

        order
            .chunks(batch_size.max(1))
            .map(|chunk| {
                let histories: Vec<&PatientHistory> =
                    chunk.iter().map(|&i| &self.samples[i].history).collect();
                let targets: Vec<f32> = chunk
                    .iter()
                    .flat_map(|&i| self.samples[i].targets)
                    .collect();
                let batch = SequenceBatch::from_histories(&histories, device)?;
                let targets = Tensor::from_vec(targets, (chunk.len(), HORIZON_COUNT), device)?;
                Ok((batch, targets))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{AUDIO_DIM, SEQ_LEN};
    use crate::data::embeddings::InMemoryEmbeddings;
    use crate::test_fixtures::{patient_meta, patient_store, store_embeddings, timeline};

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("P{i:03}")).collect()
    }

    #[test]
    fn test_split_is_seeded_and_disjoint() {
        let all = ids(10);
        let (train, test) = split_ids(&all, 0.8, 42);
        assert_eq!((train.len(), test.len()), (8, 2));
        assert!(test.iter().all(|id| !train.contains(id)));
        assert_eq!(split_ids(&all, 0.8, 42), (train, test));
        assert_eq!(split_ids(&all, 1.0, 42).1.len(), 0);
    }

    #[test]
    fn test_load_skips_short_timelines() {
        let mut patients = Vec::new();
        let mut rows = Vec::new();
        for (id, n_rows) in [("P000", 5), ("P001", 6), ("P002", 4)] {
            patients.push(patient_meta(id));
            rows.extend(timeline(id, n_rows, 95.0, -0.5));
        }
        let store = PatientStore::new(patients, rows);
        let embeddings = store_embeddings(&store);

        let train = PatientDataset::load(&store, &embeddings, Split::Train, 1.0, 42).unwrap();
        assert_eq!(train.len(), 2);
        assert!(train.samples().iter().all(|s| s.patient_id != "P002"));
        assert_eq!(train.scalar_rows().len(), 2 * SEQ_LEN);

        let p000 = train.samples().iter().find(|s| s.patient_id == "P000").unwrap();
        assert_eq!(p000.targets, [86.0, 83.0]);
    }

    #[test]
    fn test_load_fails_on_missing_embedding() {
        let store = patient_store(3, 5);
        let embeddings = InMemoryEmbeddings::default();
        assert!(PatientDataset::load(&store, &embeddings, Split::Train, 1.0, 42).is_err());
    }

    #[test]
    fn test_batches() {
        let store = patient_store(5, 5);
        let embeddings = store_embeddings(&store);
        let dataset = PatientDataset::load(&store, &embeddings, Split::Train, 1.0, 42).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let batches = dataset.batches(2, Some(&mut rng), &Device::Cpu).unwrap();
        let sizes: Vec<usize> = batches.iter().map(|(b, _)| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let (first, targets) = &batches[0];
        assert_eq!(first.audio.dims(), &[2, SEQ_LEN, AUDIO_DIM]);
        assert_eq!(targets.dims(), &[2, HORIZON_COUNT]);
    }
}
