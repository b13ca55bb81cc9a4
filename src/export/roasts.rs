//! JSON exports: the roast-flagged subset and the batch summary.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::scoring::DefectKind;

/// One roast-flagged artifact ready for publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoastRecord {
    pub artifact_id: String,
    pub locator: String,
    pub fingerprint: String,
    pub caption: String,
    pub defect_kind: DefectKind,
    pub overall_score: f64,
    pub warp_score: f64,
    pub melt_rate: f64,
}

/// Write roast records as a pretty-printed JSON array.
pub fn write_roasts(records: &[RoastRecord], path: &Path) -> Result<(), ExportError> {
    write_json(records, path)?;
    tracing::info!(path = %path.display(), roasts = records.len(), "Roast file written");
    Ok(())
}

/// Read a roast file written by [`write_roasts`].
pub fn read_roasts(path: &Path) -> Result<Vec<RoastRecord>, ExportError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write any serializable value as pretty JSON, creating parent directories.
pub fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> RoastRecord {
        RoastRecord {
            artifact_id: id.to_string(),
            locator: format!("https://cdn.example/{}.mp4", id),
            fingerprint: "ab".repeat(32),
            caption: "Warp score 150.0".to_string(),
            defect_kind: DefectKind::Warp,
            overall_score: 62.5,
            warp_score: 150.0,
            melt_rate: 0.0,
        }
    }

    #[test]
    fn test_roast_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("roasts.json");
        let records = vec![record("a"), record("b")];

        write_roasts(&records, &path).unwrap();
        assert_eq!(read_roasts(&path).unwrap(), records);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"defect_kind\": \"warp\""));
    }

    #[test]
    fn test_missing_roast_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_roasts(&dir.path().join("absent.json")),
            Err(ExportError::Io(_))
        ));
    }
}
