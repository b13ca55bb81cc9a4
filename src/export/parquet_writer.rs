//! Parquet table of every scored artifact.
//!
//! One row per analysed artifact, roasted or not, so reporting can compare
//! the flagged subset against the whole batch.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, StringArray,
    StringBuilder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::scheduler::Artifact;
use crate::scoring::AnalysisResult;

/// Flattened analysis of one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub artifact_id: String,
    pub locator: String,
    pub frame_count: u64,
    pub warp_score: f64,
    pub warp_rate: f64,
    pub melt_rate: f64,
    pub coherence_score: f64,
    pub trajectory_score: f64,
    pub overall_score: f64,
    pub is_warped: bool,
    pub is_melted: bool,
    pub should_roast: bool,
    pub defect_kind: Option<String>,
}

impl AnalysisRow {
    pub fn new(artifact: &Artifact, analysis: &AnalysisResult) -> Self {
        Self {
            artifact_id: analysis.artifact_id().to_string(),
            locator: artifact.locator.clone(),
            frame_count: analysis.frame_count() as u64,
            warp_score: analysis.warp_score(),
            warp_rate: analysis.warp_rate(),
            melt_rate: analysis.melt_rate(),
            coherence_score: analysis.coherence_score(),
            trajectory_score: analysis.trajectory_score(),
            overall_score: analysis.overall_score(),
            is_warped: analysis.is_warped(),
            is_melted: analysis.is_melted(),
            should_roast: analysis.should_roast(),
            defect_kind: analysis.defect_kind().map(|k| k.as_str().to_string()),
        }
    }
}

/// Arrow schema of the analysis table.
pub fn analysis_schema() -> Schema {
    Schema::new(vec![
        Field::new("artifact_id", DataType::Utf8, false),
        Field::new("locator", DataType::Utf8, false),
        Field::new("frame_count", DataType::UInt64, false),
        Field::new("warp_score", DataType::Float64, false),
        Field::new("warp_rate", DataType::Float64, false),
        Field::new("melt_rate", DataType::Float64, false),
        Field::new("coherence_score", DataType::Float64, false),
        Field::new("trajectory_score", DataType::Float64, false),
        Field::new("overall_score", DataType::Float64, false),
        Field::new("is_warped", DataType::Boolean, false),
        Field::new("is_melted", DataType::Boolean, false),
        Field::new("should_roast", DataType::Boolean, false),
        Field::new("defect_kind", DataType::Utf8, true),
    ])
}

/// Convert analysis rows into an Arrow RecordBatch.
pub fn rows_to_record_batch(rows: &[AnalysisRow]) -> Result<RecordBatch, ExportError> {
    let schema = Arc::new(analysis_schema());

    let mut artifact_id = StringBuilder::new();
    let mut locator = StringBuilder::new();
    let mut frame_count = UInt64Builder::new();
    let mut warp_score = Float64Builder::new();
    let mut warp_rate = Float64Builder::new();
    let mut melt_rate = Float64Builder::new();
    let mut coherence_score = Float64Builder::new();
    let mut trajectory_score = Float64Builder::new();
    let mut overall_score = Float64Builder::new();
    let mut is_warped = BooleanBuilder::new();
    let mut is_melted = BooleanBuilder::new();
    let mut should_roast = BooleanBuilder::new();
    let mut defect_kind = StringBuilder::new();

    for row in rows {
        artifact_id.append_value(&row.artifact_id);
        locator.append_value(&row.locator);
        frame_count.append_value(row.frame_count);
        warp_score.append_value(row.warp_score);
        warp_rate.append_value(row.warp_rate);
        melt_rate.append_value(row.melt_rate);
        coherence_score.append_value(row.coherence_score);
        trajectory_score.append_value(row.trajectory_score);
        overall_score.append_value(row.overall_score);
        is_warped.append_value(row.is_warped);
        is_melted.append_value(row.is_melted);
        should_roast.append_value(row.should_roast);
        defect_kind.append_option(row.defect_kind.as_deref());
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(artifact_id.finish()),
        Arc::new(locator.finish()),
        Arc::new(frame_count.finish()),
        Arc::new(warp_score.finish()),
        Arc::new(warp_rate.finish()),
        Arc::new(melt_rate.finish()),
        Arc::new(coherence_score.finish()),
        Arc::new(trajectory_score.finish()),
        Arc::new(overall_score.finish()),
        Arc::new(is_warped.finish()),
        Arc::new(is_melted.finish()),
        Arc::new(should_roast.finish()),
        Arc::new(defect_kind.finish()),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Write analysis rows to a Parquet file on disk.
pub fn write_parquet(rows: &[AnalysisRow], output_path: &Path) -> Result<(), ExportError> {
    if rows.is_empty() {
        return Err(ExportError::NoRows);
    }

    let batch = rows_to_record_batch(rows)?;

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::File::create(output_path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    tracing::info!(
        path = %output_path.display(),
        rows = rows.len(),
        "Parquet file written"
    );

    Ok(())
}

/// Read analysis rows back from a Parquet file.
pub fn read_parquet(input_path: &Path) -> Result<Vec<AnalysisRow>, ExportError> {
    let file = std::fs::File::open(input_path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut rows = Vec::new();

    for batch_result in reader {
        let batch = batch_result?;
        let num_rows = batch.num_rows();

        let strings = |name: &str| -> Vec<Option<String>> {
            batch
                .column_by_name(name)
                .and_then(|col| col.as_any().downcast_ref::<StringArray>())
                .map(|arr| {
                    (0..num_rows)
                        .map(|i| (!arr.is_null(i)).then(|| arr.value(i).to_string()))
                        .collect()
                })
                .unwrap_or_else(|| vec![None; num_rows])
        };
        let floats = |name: &str| -> Vec<f64> {
            batch
                .column_by_name(name)
                .and_then(|col| col.as_any().downcast_ref::<Float64Array>())
                .map(|arr| (0..num_rows).map(|i| arr.value(i)).collect())
                .unwrap_or_else(|| vec![0.0; num_rows])
        };
        let flags = |name: &str| -> Vec<bool> {
            batch
                .column_by_name(name)
                .and_then(|col| col.as_any().downcast_ref::<BooleanArray>())
                .map(|arr| (0..num_rows).map(|i| arr.value(i)).collect())
                .unwrap_or_else(|| vec![false; num_rows])
        };

        let artifact_ids = strings("artifact_id");
        let locators = strings("locator");
        let defect_kinds = strings("defect_kind");
        let frame_counts: Vec<u64> = batch
            .column_by_name("frame_count")
            .and_then(|col| col.as_any().downcast_ref::<UInt64Array>())
            .map(|arr| (0..num_rows).map(|i| arr.value(i)).collect())
            .unwrap_or_else(|| vec![0; num_rows]);
        let warp_scores = floats("warp_score");
        let warp_rates = floats("warp_rate");
        let melt_rates = floats("melt_rate");
        let coherence_scores = floats("coherence_score");
        let trajectory_scores = floats("trajectory_score");
        let overall_scores = floats("overall_score");
        let warped = flags("is_warped");
        let melted = flags("is_melted");
        let roasted = flags("should_roast");

        for i in 0..num_rows {
            rows.push(AnalysisRow {
                artifact_id: artifact_ids[i].clone().unwrap_or_default(),
                locator: locators[i].clone().unwrap_or_default(),
                frame_count: frame_counts[i],
                warp_score: warp_scores[i],
                warp_rate: warp_rates[i],
                melt_rate: melt_rates[i],
                coherence_score: coherence_scores[i],
                trajectory_score: trajectory_scores[i],
                overall_score: overall_scores[i],
                is_warped: warped[i],
                is_melted: melted[i],
                should_roast: roasted[i],
                defect_kind: defect_kinds[i].clone(),
            });
        }
    }

    tracing::info!(
        path = %input_path.display(),
        rows = rows.len(),
        "Parquet file loaded"
    );

    Ok(rows)
}
