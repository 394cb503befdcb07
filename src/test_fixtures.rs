//! Builders shared by unit tests.

use candle_core::Device;
use candle_nn::VarMap;

use crate::candle::model::{build_seeded, set_var, CognitiveModel, ModelConfig};
use crate::constants::{forecast, HORIZON_COUNT, QUANTILE_COUNT};
use crate::data::embeddings::InMemoryEmbeddings;
use crate::data::{PatientMeta, PatientStore, TimelineRow};
use crate::types::PatientHistory;
use crate::utils::month_key;

pub fn patient_meta(id: &str) -> PatientMeta {
    PatientMeta {
        patient_id: id.to_string(),
        age: 73.0,
        baseline_score: 96.0,
        decline_rate: None,
        audio_file: None,
    }
}

/// `n_rows` visits six months apart, scoring `start_score + slope * month`.
pub fn timeline(id: &str, n_rows: usize, start_score: f32, slope: f32) -> Vec<TimelineRow> {
    (0..n_rows)
        .map(|i| {
            let month = 6.0 * i as f32;
            TimelineRow {
                patient_id: id.to_string(),
                timepoint_months: month,
                cognitive_score: start_score + slope * month,
                treatment: 0.0,
                typing_flight_time: 130.0 + i as f32,
                gait_variability: 0.064 + 0.002 * i as f32,
            }
        })
        .collect()
}

/// `n_patients` patients `P000..` with `n_rows` visits each and slightly different decline.
pub fn patient_store(n_patients: usize, n_rows: usize) -> PatientStore {
    let mut patients = Vec::new();
    let mut rows = Vec::new();
    for i in 0..n_patients {
        let id = format!("P{i:03}");
        patients.push(patient_meta(&id));
        rows.extend(timeline(&id, n_rows, 97.0 - 0.5 * i as f32, -0.2 - 0.05 * i as f32));
    }
    PatientStore::new(patients, rows)
}

/// Embeddings for every visit in `store`.
pub fn store_embeddings(store: &PatientStore) -> InMemoryEmbeddings {
    let mut embeddings = InMemoryEmbeddings::default();
    for (i, id) in store.patient_ids().iter().enumerate() {
        let months: Vec<u32> = store
            .timeline(id)
            .iter()
            .map(|r| month_key(r.timepoint_months))
            .collect();
        embeddings.fill(id, &months, 0.1 + 0.01 * i as f32);
    }
    embeddings
}

pub fn history(start_score: f32, slope: f32) -> PatientHistory {
    let store = PatientStore::new(
        vec![patient_meta("P000")],
        timeline("P000", 3, start_score, slope),
    );
    store
        .history("P000", &store_embeddings(&store))
        .unwrap()
}

pub fn seeded_model() -> (VarMap, CognitiveModel) {
    build_seeded(&ModelConfig::default(), 42, &Device::Cpu).unwrap()
}

/// Shrinks the last head layer so the output is pinned near `quantiles` (raw scores) for
/// every horizon, with a small input-dependent wiggle.
pub fn pin_output_head(varmap: &VarMap, quantiles: [f32; QUANTILE_COUNT]) {
    let vars = varmap.data().lock().unwrap();
    let weight = &vars["forecast.head_out.weight"];
    let count = weight.elem_count();
    let wiggle = (0..count)
        .map(|i| 1e-4 * (((i * 7919) % 200) as f32 / 100.0 - 1.0))
        .collect();
    set_var(weight, wiggle).unwrap();

    let bias = (0..HORIZON_COUNT)
        .flat_map(|_| quantiles)
        .map(|q| (q - forecast::SCORE_MEAN) / forecast::SCORE_STD)
        .collect();
    set_var(&vars["forecast.head_out.bias"], bias).unwrap();
}
