//! Stable fingerprints of publication targets.

use sha2::{Digest, Sha256};

use crate::scoring::AnalysisResult;

/// Hex SHA-256 over the artifact locator and the stable analysis fields.
///
/// Scores are rendered with six decimals so identical analyses always hash
/// the same; nothing time-dependent goes into the digest.
pub fn fingerprint(locator: &str, analysis: &AnalysisResult) -> String {
    let canonical = format!(
        "{}\n{}\n{:.6}\n{:.6}\n{:.6}\n{:.6}\n{:.6}\n{:.6}",
        locator,
        analysis.artifact_id(),
        analysis.warp_score(),
        analysis.warp_rate(),
        analysis.melt_rate(),
        analysis.coherence_score(),
        analysis.trajectory_score(),
        analysis.overall_score(),
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{RawSignals, ScoringEngine};

    fn analysis(id: &str, flow: f64) -> AnalysisResult {
        ScoringEngine::default()
            .score(id, &RawSignals::new().with_flow(vec![flow; 3]))
            .unwrap()
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint("https://cdn.example/a.mp4", &analysis("a", 120.0));
        let b = fingerprint("https://cdn.example/a.mp4", &analysis("a", 120.0));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_distinguishes_targets() {
        let base = fingerprint("https://cdn.example/a.mp4", &analysis("a", 120.0));
        assert_ne!(base, fingerprint("https://cdn.example/b.mp4", &analysis("a", 120.0)));
        assert_ne!(base, fingerprint("https://cdn.example/a.mp4", &analysis("b", 120.0)));
        assert_ne!(base, fingerprint("https://cdn.example/a.mp4", &analysis("a", 130.0)));
    }
}
