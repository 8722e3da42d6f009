//! File-backed spill for oversized exchange payloads.
//!
//! When a client streams more rows than the configured threshold, accumulated
//! batches are written to per-batch columnar spill files under a fresh owned
//! temp directory and dropped from memory. At stream end the spill files are
//! concatenated into one merged file the events load from lazily. The temp
//! directory lives as long as the writer, so the merged file stays readable
//! until the request completes.

use std::fs::File;
use std::path::PathBuf;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use log::debug;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tempfile::TempDir;

use crate::error::{LrsError, Result};

const MERGE_BATCH_SIZE: usize = 10_000;

/// Spill writer owning a temp directory of per-batch columnar files.
#[derive(Debug)]
pub struct SpillWriter {
    temp_dir: TempDir,
    files: Vec<PathBuf>,
    schema: Option<SchemaRef>,
}

impl SpillWriter {
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("lrs-exchange-")
            .tempdir()
            .map_err(|e| LrsError::io(format!("failed to create spill directory: {}", e)))?;
        Ok(SpillWriter {
            temp_dir,
            files: Vec::new(),
            schema: None,
        })
    }

    /// Whether any batches have spilled to disk yet.
    pub fn has_spilled(&self) -> bool {
        !self.files.is_empty()
    }

    /// Spill a set of accumulated batches, one file per batch.
    pub fn write_batches(&mut self, batches: &[RecordBatch]) -> Result<()> {
        for batch in batches {
            self.write_batch(batch)?;
        }
        Ok(())
    }

    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        if self.schema.is_none() {
            self.schema = Some(batch.schema());
        }

        let path = self
            .temp_dir
            .path()
            .join(format!("batch_{}.parquet", self.files.len() + 1));
        let file = File::create(&path)
            .map_err(|e| LrsError::io(format!("failed to create {}: {}", path.display(), e)))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;

        debug!(
            "[Spill] wrote {} rows to {}",
            batch.num_rows(),
            path.display()
        );
        self.files.push(path);
        Ok(())
    }

    /// Concatenate every spill file into one merged columnar file and return
    /// its path. The file lives inside the writer's temp directory.
    pub fn merge(&self) -> Result<PathBuf> {
        if self.files.is_empty() {
            return Err(LrsError::invariant("no spill files to merge"));
        }
        let schema = self
            .schema
            .clone()
            .ok_or_else(|| LrsError::invariant("spill writer has no schema"))?;

        let merged_path = self.temp_dir.path().join("merged.parquet");
        let merged = File::create(&merged_path).map_err(|e| {
            LrsError::io(format!("failed to create {}: {}", merged_path.display(), e))
        })?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(merged, schema, Some(props))?;

        for path in &self.files {
            let file = File::open(path)
                .map_err(|e| LrsError::io(format!("failed to open {}: {}", path.display(), e)))?;
            let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
                .with_batch_size(MERGE_BATCH_SIZE)
                .build()?;
            for batch in reader {
                writer.write(&batch?)?;
            }
        }
        writer.close()?;

        debug!(
            "[Spill] merged {} files into {}",
            self.files.len(),
            merged_path.display()
        );
        Ok(merged_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::event_batch;

    #[test]
    fn test_spill_and_merge_preserves_rows() {
        let mut spill = SpillWriter::new().unwrap();
        assert!(!spill.has_spilled());

        let first = event_batch(&[("01001", 1.0, 2.0), ("01001", 3.0, 4.0)]);
        let second = event_batch(&[("01002", 5.0, 6.0)]);
        spill.write_batches(&[first.clone()]).unwrap();
        spill.write_batches(&[second.clone()]).unwrap();
        assert!(spill.has_spilled());

        let merged = spill.merge().unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&merged).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 3);

        // Values survive the spill round trip bit-for-bit.
        let all = arrow::compute::concat_batches(&first.schema(), &batches).unwrap();
        let lats = all
            .column(1)
            .as_any()
            .downcast_ref::<arrow::array::Float64Array>()
            .unwrap();
        assert_eq!(lats.values().to_vec(), vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_merge_without_spill_fails() {
        let spill = SpillWriter::new().unwrap();
        assert!(matches!(spill.merge(), Err(LrsError::Invariant { .. })));
    }
}
