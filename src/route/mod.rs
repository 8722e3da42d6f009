//! LRS route geometry.
//!
//! A [`Route`] is a measured polyline: ordered vertices carrying coordinates,
//! an M-value (distance along the route from its origin) and a dense sequence
//! index. A route exists in one of two forms:
//!
//! - *in-memory*: owns columnar vertex batches decoded from the upstream
//!   feature service;
//! - *materialized*: owns (or references) persisted columnar files and keeps
//!   no buffers in memory.
//!
//! [`Route::sink`] moves a route from the first form to the second. Routes
//! loaded from the catalog reference the shared per-version files and carry a
//! push-down predicate so scans stay narrowed to one route.

pub mod batch;
pub mod esri;

pub use batch::RouteBatch;

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use log::debug;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tempfile::TempDir;

use crate::db::quote_literal;
use crate::error::{LrsError, Result};
use crate::geom::{Geometry, GeometryKind};

/// Column names of the persisted vertex layout.
pub const ROUTE_ID_COL: &str = "route_id";
pub const LAT_COL: &str = "lat";
pub const LON_COL: &str = "lon";
pub const M_COL: &str = "m";
pub const SEQ_COL: &str = "seq";

/// Temp-table name an in-memory route registers under in an engine session.
pub const VERTEX_VIEW: &str = "route_vertices";

/// Schema of the per-route vertex table and the persisted point file.
pub fn vertex_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(ROUTE_ID_COL, DataType::Utf8, false),
        Field::new(LAT_COL, DataType::Float64, false),
        Field::new(LON_COL, DataType::Float64, false),
        Field::new(M_COL, DataType::Float64, false),
        Field::new(SEQ_COL, DataType::Int32, false),
    ]))
}

/// Persisted columnar files backing a materialized route.
#[derive(Debug, Clone, Default)]
pub struct SourceFiles {
    pub point: Option<PathBuf>,
    pub segment: Option<PathBuf>,
    pub linestring: Option<PathBuf>,
}

/// A measured route polyline.
#[derive(Debug)]
pub struct Route {
    route_id: String,
    records: Vec<RecordBatch>,
    crs: String,
    push_down: bool,
    source_files: Option<SourceFiles>,
    temp_dir: Option<TempDir>,
}

impl Route {
    /// Create an in-memory route from vertex batches.
    pub fn new(route_id: impl Into<String>, records: Vec<RecordBatch>, crs: impl Into<String>) -> Self {
        Route {
            route_id: route_id.into(),
            records,
            crs: crs.into(),
            push_down: false,
            source_files: None,
            temp_dir: None,
        }
    }

    /// Create a materialized route referencing already-persisted files.
    /// Used by the repository when resolving a route from the catalog.
    pub(crate) fn materialized(
        route_id: impl Into<String>,
        files: SourceFiles,
        crs: impl Into<String>,
        push_down: bool,
    ) -> Self {
        Route {
            route_id: route_id.into(),
            records: Vec::new(),
            crs: crs.into(),
            push_down,
            source_files: Some(files),
            temp_dir: None,
        }
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn push_down(&self) -> bool {
        self.push_down
    }

    pub fn set_push_down(&mut self, push_down: bool) {
        self.push_down = push_down;
    }

    pub fn point_file(&self) -> Option<&PathBuf> {
        self.source_files.as_ref().and_then(|f| f.point.as_ref())
    }

    pub fn segment_file(&self) -> Option<&PathBuf> {
        self.source_files.as_ref().and_then(|f| f.segment.as_ref())
    }

    pub fn linestring_file(&self) -> Option<&PathBuf> {
        self.source_files
            .as_ref()
            .and_then(|f| f.linestring.as_ref())
    }

    /// Whether the vertex data lives in a persisted file rather than memory.
    pub fn is_materialized(&self) -> bool {
        self.point_file().is_some()
    }

    /// SQL fragment scanning this route's vertices, usable after `FROM`.
    ///
    /// Materialized with push-down: a filtered scan of the point file.
    /// Materialized without: a full scan. In-memory: the registered temp
    /// table name.
    pub fn view_name(&self) -> String {
        match self.point_file() {
            Some(path) => {
                if self.push_down {
                    format!(
                        "(SELECT * FROM '{}' WHERE {} = {})",
                        path.display(),
                        ROUTE_ID_COL,
                        quote_literal(&self.route_id)
                    )
                } else {
                    format!("(SELECT * FROM '{}')", path.display())
                }
            }
            None => VERTEX_VIEW.to_string(),
        }
    }

    /// Derivation query for the per-segment view: each vertex paired with its
    /// successor via `LEAD`, the trailing vertex dropped, plus the line
    /// gradient and intercept used for bounding-box candidate filtering.
    pub fn segment_query(&self) -> String {
        format!(
            "SELECT *, \
             ({lat}1 - {lat}) / ({lon} - {lon}1) AS mvgradient, \
             {lat} - (mvgradient * {lon}) AS c \
             FROM ( \
                 SELECT * EXCLUDE ({lat}, {lon}, {m}, {seq}), \
                     {lat}, {lon}, {m}, {seq}, \
                     LEAD({lon}, 1, NULL) OVER (ORDER BY {seq}) AS {lon}1, \
                     LEAD({lat}, 1, NULL) OVER (ORDER BY {seq}) AS {lat}1, \
                     LEAD({m}, 1, NULL) OVER (ORDER BY {seq}) AS {m}1 \
                 FROM {view} \
             ) WHERE {lon}1 IS NOT NULL",
            lat = LAT_COL,
            lon = LON_COL,
            m = M_COL,
            seq = SEQ_COL,
            view = self.view_name(),
        )
    }

    /// Derivation query building one linestring per route from the ordered
    /// vertices.
    pub fn linestring_query(&self) -> String {
        format!(
            "SELECT {rid}, ST_MakeLine(list(ST_Point({lat}, {lon}) ORDER BY {seq} ASC)) AS line \
             FROM {view} GROUP BY {rid}",
            rid = ROUTE_ID_COL,
            lat = LAT_COL,
            lon = LON_COL,
            seq = SEQ_COL,
            view = self.view_name(),
        )
    }

    /// Persist the in-memory vertex batches to a compressed columnar file
    /// under a fresh owned temp directory, then release the buffers.
    pub fn sink(&mut self) -> Result<()> {
        if self.records.is_empty() {
            return Err(LrsError::validation("route has no vertex batches to sink"));
        }

        let temp_dir = tempfile::Builder::new()
            .prefix("lrs-route-")
            .tempdir()
            .map_err(|e| LrsError::io(format!("failed to create temp directory: {}", e)))?;
        let file_path = temp_dir.path().join(format!("route_{}.parquet", self.route_id));

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

        debug!(
            "[Route] sinked {} to {}",
            self.route_id,
            file_path.display()
        );

        self.records.clear();
        self.temp_dir = Some(temp_dir);
        self.source_files
            .get_or_insert_with(SourceFiles::default)
            .point = Some(file_path);
        Ok(())
    }
}

impl Geometry for Route {
    fn crs(&self) -> &str {
        &self.crs
    }

    fn records(&self) -> &[RecordBatch] {
        &self.records
    }

    fn kind(&self) -> GeometryKind {
        GeometryKind::Route
    }

    fn attributes(&self) -> HashMap<String, String> {
        HashMap::from([("route_id".to_string(), self.route_id.clone())])
    }
}

/// Source of route geometry for the interpolation engine: a single [`Route`]
/// or a [`RouteBatch`] spanning several.
pub trait RouteSource {
    /// Query producing the per-segment view for every covered route.
    fn segment_query(&self) -> String;

    /// Query producing one linestring row per covered route.
    fn linestring_query(&self) -> String;

    /// In-memory vertex batches that must be registered before the queries
    /// can run. `None` when every source scans persisted files.
    fn vertex_records(&self) -> Option<&[RecordBatch]>;
}

impl RouteSource for Route {
    fn segment_query(&self) -> String {
        Route::segment_query(self)
    }

    fn linestring_query(&self) -> String {
        Route::linestring_query(self)
    }

    fn vertex_records(&self) -> Option<&[RecordBatch]> {
        if self.is_materialized() {
            None
        } else {
            Some(&self.records)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use arrow::array::{ArrayRef, Float64Array, Int32Array, StringArray};

    /// Build a single-batch route from `(lat, lon, m)` vertices.
    pub(crate) fn route_from_vertices(route_id: &str, vertices: &[(f64, f64, f64)]) -> Route {
        let ids: Vec<&str> = vertices.iter().map(|_| route_id).collect();
        let lats: Vec<f64> = vertices.iter().map(|v| v.0).collect();
        let lons: Vec<f64> = vertices.iter().map(|v| v.1).collect();
        let ms: Vec<f64> = vertices.iter().map(|v| v.2).collect();
        let seqs: Vec<i32> = (0..vertices.len() as i32).collect();

        let batch = RecordBatch::try_new(
            vertex_schema(),
            vec![
                Arc::new(StringArray::from(ids)) as ArrayRef,
                Arc::new(Float64Array::from(lats)) as ArrayRef,
                Arc::new(Float64Array::from(lons)) as ArrayRef,
                Arc::new(Float64Array::from(ms)) as ArrayRef,
                Arc::new(Int32Array::from(seqs)) as ArrayRef,
            ],
        )
        .expect("vertex batch");

        Route::new(route_id, vec![batch], crate::geom::LAMBERT_WKT)
    }
}
