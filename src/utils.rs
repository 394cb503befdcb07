use std::path::Path;

pub fn create_folder_if_not_exists(dir: impl AsRef<Path>) -> std::io::Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Integer month used in embedding file names (`T06`, `T12`, ...).
pub fn month_key(timepoint_months: f32) -> u32 {
    timepoint_months.max(0.0).round() as u32
}

pub fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_key() {
        assert_eq!(month_key(0.0), 0);
        assert_eq!(month_key(6.0), 6);
        assert_eq!(month_key(11.9999), 12);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
    }
}
