use candle_core::Tensor;
use ndarray::{Array2, Array3, ArrayView1, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::constants::HORIZON_COUNT;
use crate::error::{ForecastError, Result};

/// Median-quantile error metrics in raw score units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointMetrics {
    pub mae: f32,
    pub rmse: f32,
}

pub fn predictions_array(preds: &Tensor) -> Result<Array3<f32>> {
    let (b, h, q) = preds.dims3()?;
    let flat = preds.flatten_all()?.to_vec1::<f32>()?;
    Array3::from_shape_vec((b, h, q), flat)
        .map_err(|e| ForecastError::shape("prediction array", (b, h, q), e.to_string()))
}

pub fn targets_array(targets: &Tensor) -> Result<Array2<f32>> {
    let (b, h) = targets.dims2()?;
    let flat = targets.flatten_all()?.to_vec1::<f32>()?;
    Array2::from_shape_vec((b, h), flat)
        .map_err(|e| ForecastError::shape("target array", (b, h), e.to_string()))
}

/// MAE and RMSE of the median quantile against `targets`, over all patients and horizons.
pub fn point_metrics(preds: ArrayView3<f32>, targets: &Array2<f32>) -> PointMetrics {
    let median = preds.index_axis(Axis(2), 1);
    let errors = &median - targets;
    if errors.is_empty() {
        return PointMetrics::default();
    }
    PointMetrics {
        mae: errors.mapv(f32::abs).mean().unwrap_or(0.0),
        rmse: errors.mapv(|e| e * e).mean().unwrap_or(0.0).sqrt(),
    }
}

/// Coefficient of determination. Zero when the targets have no variance.
pub fn r_squared(pred: ArrayView1<f32>, target: ArrayView1<f32>) -> f32 {
    let Some(mean) = target.mean() else {
        return 0.0;
    };
    let ss_res: f32 = pred.iter().zip(target.iter()).map(|(p, t)| (t - p).powi(2)).sum();
    let ss_tot: f32 = target.iter().map(|t| (t - mean).powi(2)).sum();
    if ss_tot <= f32::EPSILON {
        return 0.0;
    }
    1.0 - ss_res / ss_tot
}

/// R² of the median per horizon.
pub fn r_squared_per_horizon(preds: ArrayView3<f32>, targets: &Array2<f32>) -> [f32; HORIZON_COUNT] {
    let median = preds.index_axis(Axis(2), 1);
    let mut out = [0.0; HORIZON_COUNT];
    for (h, slot) in out.iter_mut().enumerate() {
        *slot = r_squared(median.column(h), targets.column(h));
    }
    out
}

/// Fraction of predictions with `q10 <= q50` and with `q50 <= q90`.
pub fn ordering_rate(preds: ArrayView3<f32>) -> [f32; 2] {
    let total = preds.len_of(Axis(0)) * preds.len_of(Axis(1));
    if total == 0 {
        return [1.0, 1.0];
    }
    let (low_mid, mid_high) = preds.lanes(Axis(2)).into_iter().fold((0usize, 0usize), |(a, b), q| {
        (a + usize::from(q[0] <= q[1]), b + usize::from(q[1] <= q[2]))
    });
    [low_mid as f32 / total as f32, mid_high as f32 / total as f32]
}
