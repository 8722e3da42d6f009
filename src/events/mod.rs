//! Point-event collections.
//!
//! [`Events`] holds arbitrary point observations as columnar batches: a route
//! id, coordinates, and any passthrough attributes. Like routes, events are
//! either in-memory or materialized to a columnar file; [`Events::sink`] and
//! [`Events::load_to_buffer`] move between the forms. Column names are
//! configurable per instance and auto-detected when reading from a file.

pub mod geojson;

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::array::{Array, BinaryArray, LargeBinaryArray, LargeStringArray, StringArray};
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tempfile::TempDir;

use crate::error::{LrsError, Result};
use crate::geom::{Geometry, GeometryKind};

const READ_BATCH_SIZE: usize = 10_000;

/// Column names an [`Events`] instance reads and writes.
#[derive(Debug, Clone)]
pub struct EventColumns {
    pub route_id: String,
    pub lat: String,
    pub lon: String,
    pub m_value: String,
    pub dist_to_line: String,
}

impl Default for EventColumns {
    fn default() -> Self {
        EventColumns {
            route_id: "route_id".to_string(),
            lat: "lat".to_string(),
            lon: "lon".to_string(),
            m_value: "m_value".to_string(),
            dist_to_line: "dist_to_line".to_string(),
        }
    }
}

/// A typed collection of point events.
#[derive(Debug)]
pub struct Events {
    columns: EventColumns,
    records: Vec<RecordBatch>,
    crs: String,
    temp_dir: Option<TempDir>,
    source_file: Option<PathBuf>,
    materialized: bool,
}

impl Events {
    /// Create events from in-memory batches, validating the required columns.
    pub fn from_batches(records: Vec<RecordBatch>, crs: impl Into<String>) -> Result<Events> {
        Events::from_batches_with(records, crs, EventColumns::default())
    }

    /// Create events with explicit column names.
    pub fn from_batches_with(
        records: Vec<RecordBatch>,
        crs: impl Into<String>,
        columns: EventColumns,
    ) -> Result<Events> {
        let events = Events {
            columns,
            records,
            crs: crs.into(),
            temp_dir: None,
            source_file: None,
            materialized: false,
        };
        events.validate()?;
        Ok(events)
    }

    /// Reference a previously persisted columnar file without loading it.
    ///
    /// Column names are detected from the file schema; the batches stay on
    /// disk until [`Events::load_to_buffer`] is called.
    pub fn from_file(path: impl Into<PathBuf>, crs: impl Into<String>) -> Result<Events> {
        let path = path.into();
        let file = File::open(&path)
            .map_err(|e| LrsError::io(format!("failed to open {}: {}", path.display(), e)))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = reader.schema().clone();

        let columns = EventColumns {
            route_id: detect_column(&schema, &["ROUTEID", "LINKID", "route_id", "id"]),
            lat: detect_column(&schema, &["LAT", "TO_STA_LAT", "latitude", "lat"]),
            lon: detect_column(&schema, &["LON", "TO_STA_LONG", "longitude", "lon"]),
            m_value: detect_column(&schema, &["m_value", "MVAL", "m"]),
            dist_to_line: detect_column(&schema, &["dist_to_line", "DIST_TO_LRS", "distance"]),
        };

        Ok(Events {
            columns,
            records: Vec::new(),
            crs: crs.into(),
            temp_dir: None,
            source_file: Some(path),
            materialized: true,
        })
    }

    fn validate(&self) -> Result<()> {
        let Some(first) = self.records.first() else {
            return Ok(());
        };
        let schema = first.schema();
        for required in [
            &self.columns.route_id,
            &self.columns.lat,
            &self.columns.lon,
        ] {
            if schema.column_with_name(required).is_none() {
                return Err(LrsError::validation(format!(
                    "required column {} not found in event records",
                    required
                )));
            }
        }
        Ok(())
    }

    pub fn columns(&self) -> &EventColumns {
        &self.columns
    }

    pub fn set_columns(&mut self, columns: EventColumns) {
        self.columns = columns;
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    /// Unique route ids across all batches, sorted for determinism.
    pub fn route_ids(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        for batch in &self.records {
            let schema = batch.schema();
            let Some((idx, _)) = schema.column_with_name(&self.columns.route_id) else {
                continue;
            };
            let column = batch.column(idx);
            let any = column.as_any();
            if let Some(arr) = any.downcast_ref::<StringArray>() {
                for i in 0..arr.len() {
                    if !arr.is_null(i) {
                        ids.insert(arr.value(i).to_string());
                    }
                }
            } else if let Some(arr) = any.downcast_ref::<LargeStringArray>() {
                for i in 0..arr.len() {
                    if !arr.is_null(i) {
                        ids.insert(arr.value(i).to_string());
                    }
                }
            } else if let Some(arr) = any.downcast_ref::<BinaryArray>() {
                for i in 0..arr.len() {
                    if !arr.is_null(i) {
                        ids.insert(String::from_utf8_lossy(arr.value(i)).into_owned());
                    }
                }
            } else if let Some(arr) = any.downcast_ref::<LargeBinaryArray>() {
                for i in 0..arr.len() {
                    if !arr.is_null(i) {
                        ids.insert(String::from_utf8_lossy(arr.value(i)).into_owned());
                    }
                }
            }
        }
        ids.into_iter().collect()
    }

    /// Persist the in-memory batches to a compressed columnar file under a
    /// fresh owned temp directory, then release the buffers.
    pub fn sink(&mut self) -> Result<()> {
        if self.records.is_empty() {
            return Err(LrsError::validation("no event batches to sink"));
        }

        let temp_dir = tempfile::Builder::new()
            .prefix("lrs-events-")
            .tempdir()
            .map_err(|e| LrsError::io(format!("failed to create temp directory: {}", e)))?;
        let file_path = temp_dir.path().join("events.parquet");

        let file = File::create(&file_path)
            .map_err(|e| LrsError::io(format!("failed to create {}: {}", file_path.display(), e)))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, self.records[0].schema(), Some(props))?;
        for batch in &self.records {
            writer.write(batch)?;
        }
        writer.close()?;

        self.records.clear();
        self.temp_dir = Some(temp_dir);
        self.source_file = Some(file_path);
        self.materialized = true;
        Ok(())
    }

    /// Read a previously sinked file back into memory.
    pub fn load_to_buffer(&mut self) -> Result<()> {
        let path = self
            .source_file
            .clone()
            .ok_or_else(|| LrsError::validation("events have no source file to load"))?;

        let file = File::open(&path)
            .map_err(|e| LrsError::io(format!("failed to open {}: {}", path.display(), e)))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
            .with_batch_size(READ_BATCH_SIZE)
            .build()?;

        let mut records = Vec::new();
        for batch in reader {
            records.push(batch?);
        }

        self.records = records;
        self.validate()
    }
}

impl Geometry for Events {
    fn crs(&self) -> &str {
        &self.crs
    }

    fn records(&self) -> &[RecordBatch] {
        &self.records
    }

    fn kind(&self) -> GeometryKind {
        GeometryKind::Events
    }

    fn attributes(&self) -> HashMap<String, String> {
        HashMap::from([
            ("route_id_column".to_string(), self.columns.route_id.clone()),
            ("lat_column".to_string(), self.columns.lat.clone()),
            ("lon_column".to_string(), self.columns.lon.clone()),
            ("m_value_column".to_string(), self.columns.m_value.clone()),
            (
                "dist_to_line_column".to_string(),
                self.columns.dist_to_line.clone(),
            ),
        ])
    }
}

fn detect_column(schema: &Schema, candidates: &[&str]) -> String {
    for candidate in candidates {
        if schema.column_with_name(candidate).is_some() {
            return candidate.to_string();
        }
    }
    candidates[0].to_string()
}


#[cfg(test)]
mod tests {
    use super::test_support::event_batch;
    use super::*;
    use crate::geom::WGS84;

    #[test]
    fn test_required_columns() {
        let batch = event_batch(&[("01001", 5.0, 100.0)]);
        assert!(Events::from_batches(vec![batch.clone()], WGS84).is_ok());

        let mut columns = EventColumns::default();
        columns.route_id = "ROUTEID".to_string();
        let err = Events::from_batches_with(vec![batch], WGS84, columns).unwrap_err();
        assert!(err.to_string().contains("ROUTEID"));
    }

    #[test]
    fn test_route_ids_unique_sorted() {
        let batch = event_batch(&[
            ("01002", 0.0, 0.0),
            ("01001", 1.0, 1.0),
            ("01002", 2.0, 2.0),
        ]);
        let events = Events::from_batches(vec![batch], WGS84).unwrap();
        assert_eq!(events.route_ids(), vec!["01001", "01002"]);
    }

    #[test]
    fn test_sink_and_load_round_trip() {
        let batch = event_batch(&[("01001", 5.0, 100.0), ("01002", 6.0, 101.0)]);
        let mut events = Events::from_batches(vec![batch], WGS84).unwrap();

        events.sink().expect("sink");
        assert!(events.is_materialized());
        assert!(events.records().is_empty());
        assert!(events.source_file().is_some());

        events.load_to_buffer().expect("load");
        assert_eq!(events.records().len(), 1);
        assert_eq!(events.records()[0].num_rows(), 2);
        assert_eq!(events.route_ids(), vec!["01001", "01002"]);
    }

    #[test]
    fn test_column_detection_from_file() {
        let batch = event_batch(&[("01001", 5.0, 100.0)]);
        let mut events = Events::from_batches(vec![batch], WGS84).unwrap();
        events.sink().expect("sink");

        let path = events.source_file().unwrap().to_path_buf();
        let detected = Events::from_file(&path, WGS84).expect("from_file");
        assert_eq!(detected.columns().route_id, "route_id");
        assert_eq!(detected.columns().lat, "lat");
        assert!(detected.is_materialized());
        assert!(detected.records().is_empty());
    }

    #[test]
    fn test_load_without_source_file() {
        let batch = event_batch(&[("01001", 5.0, 100.0)]);
        let mut events = Events::from_batches(vec![batch], WGS84).unwrap();
        assert!(events.load_to_buffer().is_err());
    }
}
