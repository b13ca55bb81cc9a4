use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::CallError;
use crate::scheduler::Artifact;
use crate::scoring::{Detector, RawSignals};

/// Detector backed by signal files written by the external vision process.
///
/// Signals for an artifact are read from `{dir}/{request_id}.json`. A file
/// that does not exist yet is a transient failure (the analysis may still be
/// running); a file that cannot be decoded is permanent.
#[derive(Debug, Clone)]
pub struct SignalFileDetector {
    dir: PathBuf,
}

impl SignalFileDetector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, artifact: &Artifact) -> PathBuf {
        self.dir.join(format!("{}.json", artifact.request_id))
    }
}

#[async_trait]
impl Detector for SignalFileDetector {
    async fn analyze(&self, artifact: &Artifact) -> Result<RawSignals, CallError> {
        let path = self.path_for(artifact);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CallError::Transient(format!(
                    "signals not available yet: {}",
                    path.display()
                )))
            }
            Err(e) => {
                return Err(CallError::Transient(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            CallError::Permanent(format!("undecodable signals in {}: {}", path.display(), e))
        })
    }
}
