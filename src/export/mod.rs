//! Export of analysis results.
//!
//! Provides the Parquet table of all scored artifacts and the JSON files for
//! the roast subset, the unscored artifacts, feedback results and the batch
//! summary.

pub mod parquet_writer;
pub mod roasts;
pub mod unscored;

pub use parquet_writer::{read_parquet, write_parquet, AnalysisRow};
pub use roasts::{read_roasts, write_json, write_roasts, RoastRecord};
pub use unscored::{read_unscored, write_unscored, UnscoredReason, UnscoredRecord};

/// File name of the analysis table inside the output directory.
pub const ANALYSIS_FILE: &str = "analysis.parquet";

/// File name of the roast subset inside the output directory.
pub const ROASTS_FILE: &str = "roasts.json";

/// File name of the run summary inside the output directory.
pub const SUMMARY_FILE: &str = "summary.json";

/// File name of the generated-but-unscored artifacts.
pub const UNSCORED_FILE: &str = "unscored.json";

/// File name of the feedback submission results.
pub const FEEDBACK_FILE: &str = "feedback.json";
