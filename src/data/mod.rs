pub mod dataset;
pub mod embeddings;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::constants::{files, HORIZON_COUNT, SEQ_LEN};
use crate::error::{ForecastError, Result};
use crate::types::{timestamp_problem, PatientHistory, ScalarCovariates, TimepointObservation};
use crate::utils::month_key;
use embeddings::EmbeddingSource;

/// One entry of `patients.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientMeta {
    pub patient_id: String,
    pub age: f32,
    pub baseline_score: f32,
    #[serde(default)]
    pub decline_rate: Option<f32>,
    #[serde(default)]
    pub audio_file: Option<String>,
}

/// One row of `timelines.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineRow {
    pub patient_id: String,
    pub timepoint_months: f32,
    pub cognitive_score: f32,
    pub treatment: f32,
    pub typing_flight_time: f32,
    pub gait_variability: f32,
}

impl TimelineRow {
    pub fn treated(&self) -> bool {
        self.treatment >= 0.5
    }
}

/// Patient metadata and chronologically sorted timelines, indexed by patient id.
#[derive(Debug, Default, Clone)]
pub struct PatientStore {
    patients: Vec<PatientMeta>,
    index: HashMap<String, usize>,
    timelines: HashMap<String, Vec<TimelineRow>>,
}

impl PatientStore {
    pub fn new(patients: Vec<PatientMeta>, rows: Vec<TimelineRow>) -> Self {
        let index = patients
            .iter()
            .enumerate()
            .map(|(i, p)| (p.patient_id.clone(), i))
            .collect();

        let mut timelines: HashMap<String, Vec<TimelineRow>> = HashMap::new();
        for row in rows {
            timelines.entry(row.patient_id.clone()).or_default().push(row);
        }
        for rows in timelines.values_mut() {
            rows.sort_by(|a, b| a.timepoint_months.total_cmp(&b.timepoint_months));
        }

        Self {
            patients,
            index,
            timelines,
        }
    }

    /// Reads `patients.json` and `timelines.csv` from `data_dir`.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let file = File::open(data_dir.join(files::PATIENTS_FILE))?;
        let patients: Vec<PatientMeta> = serde_json::from_reader(BufReader::new(file))?;

        let mut reader = csv::Reader::from_path(data_dir.join(files::TIMELINES_FILE))?;
        let rows = reader
            .deserialize::<TimelineRow>()
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self::new(patients, rows))
    }

    /// Patient ids in file order.
    pub fn patient_ids(&self) -> Vec<String> {
        self.patients.iter().map(|p| p.patient_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    pub fn patient(&self, patient_id: &str) -> Option<&PatientMeta> {
        self.index.get(patient_id).map(|&i| &self.patients[i])
    }

    /// Sorted timeline rows; empty when the patient has none.
    pub fn timeline(&self, patient_id: &str) -> &[TimelineRow] {
        self.timelines
            .get(patient_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Gathers the first [`SEQ_LEN`] timepoints with their embeddings.
    /// The treatment flag of the first row applies to the whole window.
    pub fn history(&self, patient_id: &str, embeddings: &dyn EmbeddingSource) -> Result<PatientHistory> {
        let meta = self
            .patient(patient_id)
            .ok_or_else(|| ForecastError::PatientNotFound(patient_id.to_string()))?;
        let rows = self.timeline(patient_id);
        if rows.len() < SEQ_LEN {
            return Err(ForecastError::InsufficientHistory {
                patient_id: patient_id.to_string(),
                found: rows.len(),
                required: SEQ_LEN,
            });
        }

        let window = &rows[..SEQ_LEN];
        let months: Vec<f32> = window.iter().map(|r| r.timepoint_months).collect();
        if let Some(reason) = timestamp_problem(&months) {
            return Err(ForecastError::InvalidTimeline {
                patient_id: patient_id.to_string(),
                reason,
            });
        }

        let treatment = rows[0].treated();
        let observations = window
            .iter()
            .map(|row| {
                let month = month_key(row.timepoint_months);
                Ok(TimepointObservation {
                    timestamp_months: row.timepoint_months,
                    audio_embedding: embeddings.audio(patient_id, month)?,
                    handwriting_embedding: embeddings.handwriting(patient_id, month)?,
                    scalars: ScalarCovariates {
                        age: meta.age,
                        baseline_score: meta.baseline_score,
                        typing_flight_time: row.typing_flight_time,
                        gait_variability: row.gait_variability,
                    },
                    raw_score: row.cognitive_score,
                    treatment,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        PatientHistory::new(observations)
    }

    /// Observed scores at the forecast horizons, when the timeline reaches them.
    pub fn actual_scores(&self, patient_id: &str) -> Option<[f32; HORIZON_COUNT]> {
        let rows = self.timeline(patient_id);
        if rows.len() < SEQ_LEN + HORIZON_COUNT {
            return None;
        }
        Some([rows[SEQ_LEN].cognitive_score, rows[SEQ_LEN + 1].cognitive_score])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::embeddings::InMemoryEmbeddings;

    fn row(id: &str, month: f32, score: f32) -> TimelineRow {
        TimelineRow {
            patient_id: id.to_string(),
            timepoint_months: month,
            cognitive_score: score,
            treatment: 0.0,
            typing_flight_time: 131.0,
            gait_variability: 0.065,
        }
    }

    fn meta(id: &str) -> PatientMeta {
        PatientMeta {
            patient_id: id.to_string(),
            age: 74.0,
            baseline_score: 96.0,
            decline_rate: Some(0.3),
            audio_file: None,
        }
    }

    #[test]
    fn test_timelines_are_sorted() {
        let store = PatientStore::new(
            vec![meta("P001")],
            vec![row("P001", 12.0, 90.0), row("P001", 0.0, 96.0), row("P001", 6.0, 93.0)],
        );
        let months: Vec<f32> = store.timeline("P001").iter().map(|r| r.timepoint_months).collect();
        assert_eq!(months, vec![0.0, 6.0, 12.0]);
        assert!(store.timeline("P999").is_empty());
    }

    #[test]
    fn test_history_errors() {
        let store = PatientStore::new(
            vec![meta("P001"), meta("P002")],
            vec![row("P001", 0.0, 96.0), row("P001", 6.0, 93.0), row("P001", 12.0, 90.0), row("P002", 0.0, 95.0)],
        );
        let mut embeddings = InMemoryEmbeddings::default();
        embeddings.fill("P001", &[0, 6], 0.1);

        assert!(matches!(
            store.history("P404", &embeddings),
            Err(ForecastError::PatientNotFound(id)) if id == "P404"
        ));
        assert!(matches!(
            store.history("P002", &embeddings),
            Err(ForecastError::InsufficientHistory { found: 1, required: 3, .. })
        ));
        assert!(matches!(
            store.history("P001", &embeddings),
            Err(ForecastError::MissingEmbedding { month: 12, .. })
        ));

        embeddings.fill("P001", &[12], 0.1);
        let history = store.history("P001", &embeddings).unwrap();
        assert_eq!(history.scores(), vec![96.0, 93.0, 90.0]);
        assert_eq!(history.observations()[0].scalars.age, 74.0);
    }

    #[test]
    fn test_history_rejects_bad_months() {
        let store = PatientStore::new(
            vec![meta("P001"), meta("P002")],
            vec![
                row("P001", 0.0, 96.0),
                row("P001", 6.0, 93.0),
                row("P001", 6.0, 92.0),
                row("P002", 0.0, 95.0),
                row("P002", f32::NAN, 93.0),
                row("P002", f32::NAN, 91.0),
            ],
        );
        let mut embeddings = InMemoryEmbeddings::default();
        embeddings.fill("P001", &[0, 6], 0.1);
        embeddings.fill("P002", &[0], 0.1);

        match store.history("P001", &embeddings) {
            Err(ForecastError::InvalidTimeline { patient_id, reason }) => {
                assert_eq!(patient_id, "P001");
                assert!(reason.contains("month 6"), "{reason}");
            }
            other => panic!("expected an invalid timeline, got {other:?}"),
        }
        assert!(matches!(
            store.history("P002", &embeddings),
            Err(ForecastError::InvalidTimeline { .. })
        ));
    }

    #[test]
    fn test_actual_scores() {
        let rows: Vec<TimelineRow> = [0.0, 6.0, 12.0, 18.0, 24.0]
            .iter()
            .zip([96.0, 93.0, 90.0, 87.0, 84.0])
            .map(|(m, s)| row("P001", *m, s))
            .collect();
        let store = PatientStore::new(vec![meta("P001")], rows[..4].to_vec());
        assert_eq!(store.actual_scores("P001"), None);
        let store = PatientStore::new(vec![meta("P001")], rows);
        assert_eq!(store.actual_scores("P001"), Some([87.0, 84.0]));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(files::PATIENTS_FILE),
            r#"[{"patient_id": "P001", "age": 70.5, "baseline_score": 97.0, "decline_rate": 0.2, "audio_file": "P001.wav"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(files::TIMELINES_FILE),
            "patient_id,timepoint_months,cognitive_score,treatment,typing_flight_time,gait_variability\n\
             P001,6,94.5,1,133.2,0.07\n\
             P001,0,97.0,1,130.1,0.06\n",
        )
        .unwrap();

        let store = PatientStore::load(dir.path()).unwrap();
        assert_eq!(store.patient_ids(), vec!["P001".to_string()]);
        assert_eq!(store.patient("P001").unwrap().age, 70.5);
        let timeline = store.timeline("P001");
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].cognitive_score, 97.0);
        assert!(timeline[1].treated());
    }
}
