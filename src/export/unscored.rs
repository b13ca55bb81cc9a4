//! JSON export of generated artifacts that never received a score.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ExportError;

use super::write_json;

/// Why a generated artifact has no analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnscoredReason {
    /// The detector failed or returned malformed signals.
    AnalysisFailed,
    /// The run was cancelled before analysis finished.
    Cancelled,
}

/// A generated artifact kept for a later scoring pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnscoredRecord {
    pub request_id: String,
    pub locator: String,
    pub reason: UnscoredReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl UnscoredRecord {
    pub fn new(
        request_id: impl Into<String>,
        locator: impl Into<String>,
        reason: UnscoredReason,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            locator: locator.into(),
            reason,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Write unscored records as a JSON array.
pub fn write_unscored(records: &[UnscoredRecord], path: &Path) -> Result<(), ExportError> {
    write_json(records, path)?;
    tracing::info!(path = %path.display(), unscored = records.len(), "Unscored file written");
    Ok(())
}

pub fn read_unscored(path: &Path) -> Result<Vec<UnscoredRecord>, ExportError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscored_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unscored.json");
        let records = vec![
            UnscoredRecord::new("a", "mem://a.mp4", UnscoredReason::Cancelled),
            UnscoredRecord::new("b", "mem://b.mp4", UnscoredReason::AnalysisFailed)
                .with_detail("unsupported codec"),
        ];

        write_unscored(&records, &path).unwrap();
        assert_eq!(read_unscored(&path).unwrap(), records);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["reason"], "cancelled");
        assert!(raw[0].get("detail").is_none());
        assert_eq!(raw[1]["reason"], "analysis_failed");
        assert_eq!(raw[1]["detail"], "unsupported codec");
    }
}
