/// Width of one audio embedding handed over by the speech embedder
pub const AUDIO_DIM: usize = 128;
/// Width of one handwriting embedding handed over by the stylus embedder
pub const HANDWRITING_DIM: usize = 128;
/// age, baseline_score, typing_flight_time, gait_variability
pub const SCALAR_DIM: usize = 4;
pub const FUSION_INPUT_DIM: usize = AUDIO_DIM + HANDWRITING_DIM + SCALAR_DIM;
pub const FUSED_DIM: usize = 128;

/// Number of historical timepoints the forecaster consumes
pub const SEQ_LEN: usize = 3;
/// fused vector + normalized timestamp + normalized score + treatment
pub const STEP_FEATURES: usize = FUSED_DIM + 3;

pub const HORIZONS_MONTHS: [f32; 2] = [18., 24.];
pub const HORIZON_COUNT: usize = HORIZONS_MONTHS.len();
pub const QUANTILES: [f32; 3] = [0.1, 0.5, 0.9];
pub const QUANTILE_COUNT: usize = QUANTILES.len();

pub const NORM_EPS: f32 = 1e-6;
/// z-score of the 90th percentile of a standard normal
pub const Z_80: f32 = 1.2816;
/// Width of the 10-90 interval in standard deviations (2 * 1.28)
pub const INTERVAL_SIGMAS: f32 = 2.56;

pub mod scalars {
    // [age, baseline, typing, gait]
    pub const MEAN: [f32; 4] = [75.0, 95.0, 132.0, 0.066];
    pub const STD: [f32; 4] = [10.0, 5.0, 7.0, 0.009];
    /// A fitted std below this share of the default falls back to the default
    pub const MIN_FIT_STD_RATIO: f32 = 0.01;
}

pub mod forecast {
    pub const TIMESTAMP_MEAN: f32 = 12.0;
    pub const TIMESTAMP_STD: f32 = 8.0;
    pub const SCORE_MEAN: f32 = 90.0;
    pub const SCORE_STD: f32 = 5.0;
}

pub mod train {
    pub const EPOCHS: usize = 20;
    pub const BATCH_SIZE: usize = 4;
    pub const LEARNING_RATE: f64 = 1e-3;
    pub const PATIENCE: usize = 10;
    pub const SEED: u64 = 42;
    pub const TRAIN_RATIO: f64 = 0.8;
}

pub mod files {
    pub const DATA_PATH: &str = "data/synthetic";
    pub const CHECKPOINT_PATH: &str = "checkpoints";
    pub const TRAINING_PATH: &str = "training";
    pub const PATIENTS_FILE: &str = "patients.json";
    pub const TIMELINES_FILE: &str = "timelines.csv";
    pub const AUDIO_DIR: &str = "audio_embeddings";
    pub const STYLUS_DIR: &str = "stylus_embeddings";
    pub const WEIGHTS_FILE: &str = "best_model.safetensors";
    pub const META_FILE: &str = "best_model.json";
    pub const RESULTS_FILE: &str = "results.json";
}
