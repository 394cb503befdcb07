use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::constants::{scalars, NORM_EPS, SCALAR_DIM};

pub fn normalize(x: f32, mean: f32, std: f32) -> f32 {
    (x - mean) / (std + NORM_EPS)
}

/// Inverse of [`normalize`] up to the epsilon floor on `std`.
pub fn denormalize(x_norm: f32, mean: f32, std: f32) -> f32 {
    x_norm * std + mean
}

/// A fixed mean/std pair for one scalar quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    pub mean: f32,
    pub std: f32,
}

impl Normalizer {
    pub const fn new(mean: f32, std: f32) -> Self {
        Self { mean, std }
    }

    pub fn normalize(&self, x: f32) -> f32 {
        normalize(x, self.mean, self.std)
    }

    pub fn denormalize(&self, x_norm: f32) -> f32 {
        denormalize(x_norm, self.mean, self.std)
    }

    pub fn normalize_tensor(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let scale = 1.0 / (self.std as f64 + NORM_EPS as f64);
        x.affine(scale, -(self.mean as f64) * scale)
    }

    pub fn denormalize_tensor(&self, x_norm: &Tensor) -> candle_core::Result<Tensor> {
        x_norm.affine(self.std as f64, self.mean as f64)
    }
}

/// Per-field statistics for the covariates, ordered
/// `[age, baseline_score, typing_flight_time, gait_variability]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarStats {
    pub mean: [f32; SCALAR_DIM],
    pub std: [f32; SCALAR_DIM],
}

impl Default for ScalarStats {
    fn default() -> Self {
        Self {
            mean: scalars::MEAN,
            std: scalars::STD,
        }
    }
}

impl ScalarStats {
    pub fn field(&self, index: usize) -> Normalizer {
        Normalizer::new(self.mean[index], self.std[index])
    }

    pub fn normalize(&self, values: [f32; SCALAR_DIM]) -> [f32; SCALAR_DIM] {
        let mut out = [0.0; SCALAR_DIM];
        for (i, value) in values.iter().enumerate() {
            out[i] = self.field(i).normalize(*value);
        }
        out
    }

    /// Normalizes a `[batch, SCALAR_DIM]` tensor column-wise.
    pub fn normalize_tensor(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mean = Tensor::from_slice(&self.mean, (1, SCALAR_DIM), x.device())?;
        let std = Tensor::from_slice(&self.std, (1, SCALAR_DIM), x.device())?
            .affine(1.0, NORM_EPS as f64)?;
        x.broadcast_sub(&mean)?.broadcast_div(&std)
    }

    /// Population mean and std of each field over `rows`. Returns `None` for an empty set.
    /// A field that is (nearly) constant across `rows` keeps its default std.
    pub fn fit(rows: &[[f32; SCALAR_DIM]]) -> Option<Self> {
        if rows.is_empty() {
            return None;
        }
        let n = rows.len() as f64;
        let mut mean = [0.0f32; SCALAR_DIM];
        let mut std = [0.0f32; SCALAR_DIM];
        for field in 0..SCALAR_DIM {
            let m = rows.iter().map(|r| r[field] as f64).sum::<f64>() / n;
            let var = rows
                .iter()
                .map(|r| (r[field] as f64 - m).powi(2))
                .sum::<f64>()
                / n;
            mean[field] = m as f32;
            let fitted = var.sqrt() as f32;
            let fallback = scalars::STD[field];
            std[field] = if fitted.is_finite() && fitted >= fallback * scalars::MIN_FIT_STD_RATIO {
                fitted
            } else {
                fallback
            };
        }
        Some(Self { mean, std })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_round_trip() {
        let cases = [
            (0.0, 90.0, 5.0),
            (95.0, 90.0, 5.0),
            (-250.0, 12.0, 8.0),
            (1e4, 75.0, 10.0),
            (0.071, 0.066, 0.009),
            (132.5, 132.0, 7.0),
        ];
        for (x, mean, std) in cases {
            let back = denormalize(normalize(x, mean, std), mean, std);
            // The epsilon in `normalize` is not undone by `denormalize`, so the
            // error grows with |x - mean|; 1e-4 holds absolutely only near the mean.
            assert!((back - x).abs() < 1e-4 * x.abs().max(1.0), "{x} -> {back}");
        }
    }

    #[test]
    fn test_zero_std_is_floored() {
        let z = normalize(3.0, 1.0, 0.0);
        assert!(z.is_finite());
        assert!((z - 2.0 / NORM_EPS).abs() / z < 1e-5);
    }

    #[test]
    fn test_tensor_matches_scalar() {
        let n = Normalizer::new(90.0, 5.0);
        let x = Tensor::new(&[95.0f32, 92.0, 90.0], &Device::Cpu).unwrap();
        let got = n.normalize_tensor(&x).unwrap().to_vec1::<f32>().unwrap();
        for (g, raw) in got.iter().zip([95.0f32, 92.0, 90.0]) {
            assert!((g - n.normalize(raw)).abs() < 1e-5);
        }
        let back = n
            .denormalize_tensor(&n.normalize_tensor(&x).unwrap())
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((back[0] - 95.0).abs() < 1e-4);
    }

    #[test]
    fn test_scalar_stats_tensor() {
        let stats = ScalarStats::default();
        let row = [72.0f32, 94.5, 130.0, 0.07];
        let x = Tensor::from_slice(&row, (1, SCALAR_DIM), &Device::Cpu).unwrap();
        let got = stats.normalize_tensor(&x).unwrap().to_vec2::<f32>().unwrap();
        let expected = stats.normalize(row);
        for i in 0..SCALAR_DIM {
            assert!((got[0][i] - expected[i]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_fit() {
        assert!(ScalarStats::fit(&[]).is_none());
        let stats = ScalarStats::fit(&[[70.0, 90.0, 130.0, 0.05], [80.0, 100.0, 134.0, 0.07]])
            .unwrap();
        for (got, want) in stats.mean.iter().zip([75.0f32, 95.0, 132.0, 0.06]) {
            assert!((got - want).abs() < 1e-5);
        }
        assert!((stats.std[0] - 5.0).abs() < 1e-5);
        assert!((stats.std[3] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_fit_constant_field_keeps_default_std() {
        let stats = ScalarStats::fit(&[[73.0, 96.0, 130.0, 0.064], [73.0, 95.0, 131.0, 0.066]])
            .unwrap();
        assert_eq!(stats.mean[0], 73.0);
        assert_eq!(stats.std[0], scalars::STD[0]);
        assert!((stats.std[1] - 0.5).abs() < 1e-5);
        assert!((stats.std[3] - 0.001).abs() < 1e-5);

        let z = stats.normalize([74.0, 95.5, 130.5, 0.065]);
        assert!(z.iter().all(|v| v.is_finite() && v.abs() < 10.0), "{z:?}");
        assert!((z[0] - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_round_trip_absolute_near_mean() {
        let (mean, std) = (90.0, 5.0);
        for x in [80.0f32, 85.0, 90.0, 95.0, 100.0] {
            let back = denormalize(normalize(x, mean, std), mean, std);
            assert!((back - x).abs() < 1e-4, "{x} -> {back}");
        }
    }
}
