use std::path::Path;

use crate::error::Result;
use crate::history::report::{report_path, write_report, Report, ReportKind, ReportSeries};
use crate::utils::create_folder_if_not_exists;

/// Per-epoch curves of one training run.
#[derive(Debug, Default, Clone)]
pub struct TrainingHistory {
    pub train_loss: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub train_mae: Vec<f32>,
    pub val_mae: Vec<f32>,
    pub train_rmse: Vec<f32>,
    pub val_rmse: Vec<f32>,
    /// Share of validation predictions with non-crossing quantiles
    pub val_ordering: Vec<f32>,
}

pub struct EpochRecord {
    pub train_loss: f32,
    pub val_loss: f32,
    pub train_mae: f32,
    pub val_mae: f32,
    pub train_rmse: f32,
    pub val_rmse: f32,
    pub val_ordering: f32,
}

impl TrainingHistory {
    pub fn record(&mut self, epoch: EpochRecord) {
        self.train_loss.push(epoch.train_loss);
        self.val_loss.push(epoch.val_loss);
        self.train_mae.push(epoch.train_mae);
        self.val_mae.push(epoch.val_mae);
        self.train_rmse.push(epoch.train_rmse);
        self.val_rmse.push(epoch.val_rmse);
        self.val_ordering.push(epoch.val_ordering);
    }

    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }

    /// Writes `{dir}/{name}.report.bin` for loss, MAE, RMSE and quantile ordering.
    pub fn write_reports(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        create_folder_if_not_exists(dir)?;

        let pairs = [
            ("loss", "Pinball loss", &self.train_loss, &self.val_loss),
            ("mae", "MAE", &self.train_mae, &self.val_mae),
            ("rmse", "RMSE", &self.train_rmse, &self.val_rmse),
        ];
        for (name, y_label, train, val) in pairs {
            let report = Report {
                title: name.to_string(),
                x_label: Some("Epoch".to_string()),
                y_label: Some(y_label.to_string()),
                kind: ReportKind::MultiLine {
                    series: vec![
                        ReportSeries {
                            label: "train".to_string(),
                            values: train.clone(),
                        },
                        ReportSeries {
                            label: "val".to_string(),
                            values: val.clone(),
                        },
                    ],
                },
            };
            write_report(report_path(dir, name), &report)?;
        }

        let ordering = Report {
            title: "val_ordering".to_string(),
            x_label: Some("Epoch".to_string()),
            y_label: Some("Ordered fraction".to_string()),
            kind: ReportKind::Simple {
                values: self.val_ordering.clone(),
            },
        };
        write_report(report_path(dir, "val_ordering"), &ordering)
    }
}
