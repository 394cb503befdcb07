use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const REPORT_EXTENSION: &str = ".report.bin";

/// A per-epoch curve dump, postcard-encoded to `{name}.report.bin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub title: String,
    pub x_label: Option<String>,
    pub y_label: Option<String>,
    pub kind: ReportKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSeries {
    pub label: String,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReportKind {
    Simple { values: Vec<f32> },
    MultiLine { series: Vec<ReportSeries> },
}

impl ReportKind {
    pub fn epochs(&self) -> usize {
        match self {
            ReportKind::Simple { values } => values.len(),
            ReportKind::MultiLine { series } => {
                series.iter().map(|s| s.values.len()).max().unwrap_or(0)
            }
        }
    }
}

impl Report {
    /// `(label, values)` per curve. A simple report is labelled by its title.
    pub fn curves(&self) -> Vec<(&str, &[f32])> {
        match &self.kind {
            ReportKind::Simple { values } => vec![(self.title.as_str(), values.as_slice())],
            ReportKind::MultiLine { series } => series
                .iter()
                .map(|s| (s.label.as_str(), s.values.as_slice()))
                .collect(),
        }
    }

    /// Header row plus one row per epoch; missing values are left blank.
    pub fn table(&self) -> Vec<String> {
        let curves = self.curves();
        let x_label = self.x_label.as_deref().unwrap_or("epoch");
        let mut header = format!("{x_label:>6}");
        for (label, _) in &curves {
            header.push_str(&format!(" {label:>12}"));
        }

        let mut rows = vec![header];
        for epoch in 0..self.kind.epochs() {
            let mut row = format!("{:>6}", epoch + 1);
            for (_, values) in &curves {
                match values.get(epoch) {
                    Some(v) => row.push_str(&format!(" {v:>12.4}")),
                    None => row.push_str(&format!(" {:>12}", "")),
                }
            }
            rows.push(row);
        }
        rows
    }

    /// 1-based epoch and value of each curve's minimum, skipping NaNs.
    pub fn minima(&self) -> Vec<(&str, Option<(usize, f32)>)> {
        self.curves()
            .into_iter()
            .map(|(label, values)| {
                let best = values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| !v.is_nan())
                    .min_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, v)| (i + 1, *v));
                (label, best)
            })
            .collect()
    }
}

/// Accepts `mae`, `MAE`, `mae.report` or `mae.report.bin`.
pub fn report_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    let name = name.trim();
    let stem = name
        .strip_suffix(REPORT_EXTENSION)
        .or_else(|| name.strip_suffix(".report"))
        .unwrap_or(name);
    dir.as_ref()
        .join(format!("{}{REPORT_EXTENSION}", stem.to_ascii_lowercase().replace(' ', "_")))
}

pub fn write_report(path: impl AsRef<Path>, report: &Report) -> Result<()> {
    let encoded = postcard::to_stdvec(report)?;
    std::fs::write(path, encoded)?;
    Ok(())
}

pub fn read_report(path: impl AsRef<Path>) -> Result<Report> {
    let bytes = std::fs::read(path)?;
    Ok(postcard::from_bytes(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mae_report() -> Report {
        Report {
            title: "mae".to_string(),
            x_label: Some("Epoch".to_string()),
            y_label: Some("MAE".to_string()),
            kind: ReportKind::MultiLine {
                series: vec![
                    ReportSeries {
                        label: "train".to_string(),
                        values: vec![4.0, 3.0, 2.5],
                    },
                    ReportSeries {
                        label: "val".to_string(),
                        values: vec![4.5, f32::NAN, 3.75],
                    },
                ],
            },
        }
    }

    #[test]
    fn test_report_path_normalizes_name() {
        let dir = Path::new("training");
        let expected = dir.join("val_ordering.report.bin");
        assert_eq!(report_path(dir, "val_ordering"), expected);
        assert_eq!(report_path(dir, "Val Ordering.report"), expected);
        assert_eq!(report_path(dir, " val_ordering.report.bin "), expected);
    }

    #[test]
    fn test_table() {
        let table = mae_report().table();
        assert_eq!(table.len(), 4);
        assert_eq!(table[0].split_whitespace().collect::<Vec<_>>(), ["Epoch", "train", "val"]);
        assert_eq!(table[1].split_whitespace().collect::<Vec<_>>(), ["1", "4.0000", "4.5000"]);
        assert_eq!(table[3].split_whitespace().collect::<Vec<_>>(), ["3", "2.5000", "3.7500"]);
    }

    #[test]
    fn test_minima_skip_nan() {
        let report = mae_report();
        let minima = report.minima();
        assert_eq!(minima[0], ("train", Some((3, 2.5))));
        assert_eq!(minima[1], ("val", Some((3, 3.75))));

        let empty = Report {
            title: "val_ordering".to_string(),
            x_label: None,
            y_label: None,
            kind: ReportKind::Simple { values: vec![] },
        };
        assert_eq!(empty.minima(), vec![("val_ordering", None)]);
        assert_eq!(empty.table().len(), 1);
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = report_path(dir.path(), "mae");
        write_report(&path, &mae_report()).unwrap();
        let back = read_report(&path).unwrap();
        assert_eq!(back.title, "mae");
        assert_eq!(back.kind.epochs(), 3);
    }
}
