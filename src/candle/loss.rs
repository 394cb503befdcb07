//! Pinball (quantile) loss for the forecaster head.

use candle_core::{IndexOp, Tensor};

use crate::constants::{HORIZON_COUNT, QUANTILES, QUANTILE_COUNT};
use crate::error::{ForecastError, Result};

/// Mean over all elements of `max((tau - 1) * e, tau * e)` with `e = target - pred`.
pub fn pinball(pred: &Tensor, target: &Tensor, tau: f64) -> Result<Tensor> {
    if pred.dims() != target.dims() {
        return Err(ForecastError::shape("pinball target", pred.dims(), target.dims()));
    }
    let errors = (target - pred)?;
    let under = errors.affine(tau - 1.0, 0.0)?;
    let over = errors.affine(tau, 0.0)?;
    Ok(under.maximum(&over)?.mean_all()?)
}

/// Sum over [`QUANTILES`] of the pinball loss between `preds[:, :, i]` and `targets`.
///
/// `preds`: `[B, HORIZON_COUNT, QUANTILE_COUNT]`, `targets`: `[B, HORIZON_COUNT]`. Returns a scalar tensor.
pub fn quantile_loss(preds: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let batch = match preds.dims() {
        [b, HORIZON_COUNT, QUANTILE_COUNT] => *b,
        other => {
            return Err(ForecastError::shape(
                "quantile predictions",
                ("batch", HORIZON_COUNT, QUANTILE_COUNT),
                other,
            ))
        }
    };
    if targets.dims() != [batch, HORIZON_COUNT] {
        return Err(ForecastError::shape("targets", (batch, HORIZON_COUNT), targets.dims()));
    }

    let per_quantile = QUANTILES
        .iter()
        .enumerate()
        .map(|(i, tau)| pinball(&preds.i((.., .., i))?, targets, *tau as f64))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&per_quantile, 0)?.sum_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_pinball_asymmetry() {
        let dev = Device::Cpu;
        let pred = Tensor::new(&[[90.0f32]], &dev).unwrap();
        let target = Tensor::new(&[[80.0f32]], &dev).unwrap();
        // Over-prediction by 10 at tau = 0.9 costs 0.1 * 10
        assert!((scalar(pinball(&pred, &target, 0.9).unwrap()) - 1.0).abs() < 1e-5);
        // Under-prediction of the same size costs 0.9 * 10
        assert!((scalar(pinball(&target, &pred, 0.9).unwrap()) - 9.0).abs() < 1e-4);
    }

    #[test]
    fn test_median_pinball_example() {
        let dev = Device::Cpu;
        let pred = Tensor::new(&[88.0f32, 92.0], &dev).unwrap();
        let target = Tensor::new(&[90.0f32, 90.0], &dev).unwrap();
        assert!((scalar(pinball(&pred, &target, 0.5).unwrap()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_median_pinball_is_half_mae() {
        let dev = Device::Cpu;
        let pred = Tensor::new(&[[88.0f32, 84.0], [91.0, 86.5]], &dev).unwrap();
        let target = Tensor::new(&[[90.0f32, 83.0], [87.0, 86.5]], &dev).unwrap();
        let mae = (2.0 + 1.0 + 4.0 + 0.0) / 4.0;
        assert!((scalar(pinball(&pred, &target, 0.5).unwrap()) - 0.5 * mae).abs() < 1e-5);
    }

    #[test]
    fn test_pinball_zero_on_exact_prediction() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[85.0f32, 82.0]], &dev).unwrap();
        for tau in [0.1, 0.5, 0.9] {
            assert_eq!(scalar(pinball(&x, &x, tau).unwrap()), 0.0);
        }
    }

    #[test]
    fn test_quantile_loss_sums_quantiles() {
        let dev = Device::Cpu;
        // One patient, both horizons predicted [80, 85, 90], truth 86
        let preds = Tensor::new(&[[[80.0f32, 85.0, 90.0], [80.0, 85.0, 90.0]]], &dev).unwrap();
        let targets = Tensor::new(&[[86.0f32, 86.0]], &dev).unwrap();
        // 0.1 * 6 + 0.5 * 1 + 0.1 * 4
        let expected = 0.6 + 0.5 + 0.4;
        assert!((scalar(quantile_loss(&preds, &targets).unwrap()) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_quantile_loss_rejects_bad_shapes() {
        let dev = Device::Cpu;
        let preds = Tensor::zeros((2, HORIZON_COUNT, QUANTILE_COUNT), candle_core::DType::F32, &dev).unwrap();
        let targets = Tensor::zeros((3, HORIZON_COUNT), candle_core::DType::F32, &dev).unwrap();
        assert!(matches!(
            quantile_loss(&preds, &targets),
            Err(ForecastError::ShapeMismatch { .. })
        ));
        let flat = Tensor::zeros((2, 6), candle_core::DType::F32, &dev).unwrap();
        assert!(quantile_loss(&flat, &targets).is_err());
    }
}
