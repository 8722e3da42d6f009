//! Multi-route query assembly.
//!
//! A [`RouteBatch`] groups routes for a single engine query. It preserves the
//! (file, route-id-set) structure: one persisted file scanned by several
//! routes appears once in the generated query, with a push-down predicate
//! covering every referenced id. Sources without push-down contribute through
//! a combined bulk scan, and routes without a persisted derivation contribute
//! their derivation query verbatim.

use std::path::PathBuf;

use arrow::record_batch::RecordBatch;

use super::{Route, RouteSource, ROUTE_ID_COL};
use crate::db::quote_literal;
use crate::error::Result;

/// One contributor to a per-kind scan.
#[derive(Debug)]
enum BatchSource {
    /// Persisted file; an empty id list means an unfiltered bulk scan.
    File {
        path: PathBuf,
        route_ids: Vec<String>,
    },
    /// Derivation query for a route with no persisted file of this kind.
    Query(String),
}

/// A set of routes queried together.
#[derive(Default)]
pub struct RouteBatch {
    routes: Vec<Route>,
    point: Vec<BatchSource>,
    segment: Vec<BatchSource>,
    linestring: Vec<BatchSource>,
}

impl RouteBatch {
    pub fn new() -> Self {
        RouteBatch::default()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Add a route, sinking it first if it only exists in memory. The batch
    /// takes ownership so temp directories outlive query execution.
    pub fn add_route(&mut self, mut route: Route) -> Result<()> {
        if !route.is_materialized() {
            route.sink()?;
        }

        if let Some(path) = route.point_file().cloned() {
            Self::add_file(&mut self.point, path, &route);
        }

        match route.segment_file().cloned() {
            Some(path) => Self::add_file(&mut self.segment, path, &route),
            None => self.segment.push(BatchSource::Query(route.segment_query())),
        }

        match route.linestring_file().cloned() {
            Some(path) => Self::add_file(&mut self.linestring, path, &route),
            None => self
                .linestring
                .push(BatchSource::Query(route.linestring_query())),
        }

        self.routes.push(route);
        Ok(())
    }

    fn add_file(sources: &mut Vec<BatchSource>, path: PathBuf, route: &Route) {
        for source in sources.iter_mut() {
            if let BatchSource::File {
                path: existing,
                route_ids,
            } = source
            {
                if *existing == path {
                    // A bulk scan already covers every route in the file.
                    if route.push_down() && !route_ids.is_empty() {
                        route_ids.push(route.route_id().to_string());
                    }
                    return;
                }
            }
        }

        let route_ids = if route.push_down() {
            vec![route.route_id().to_string()]
        } else {
            Vec::new()
        };
        sources.push(BatchSource::File { path, route_ids });
    }

    fn assemble(sources: &[BatchSource]) -> String {
        let mut queries = Vec::new();
        let mut bulk_files = Vec::new();

        for source in sources {
            match source {
                BatchSource::File { path, route_ids } if route_ids.is_empty() => {
                    bulk_files.push(format!("'{}'", path.display()));
                }
                BatchSource::File { path, route_ids } => {
                    let ids = route_ids
                        .iter()
                        .map(|id| quote_literal(id))
                        .collect::<Vec<_>>()
                        .join(", ");
                    queries.push(format!(
                        "SELECT * FROM '{}' WHERE {} IN ({})",
                        path.display(),
                        ROUTE_ID_COL,
                        ids
                    ));
                }
                BatchSource::Query(query) => queries.push(query.clone()),
            }
        }

        if !bulk_files.is_empty() {
            queries.push(format!(
                "SELECT * FROM read_parquet([{}])",
                bulk_files.join(", ")
            ));
        }

        queries.join(" UNION ALL ")
    }

    /// Combined vertex scan, usable after `FROM`.
    pub fn view_name(&self) -> String {
        if self.point.is_empty() {
            return String::new();
        }
        format!("({})", Self::assemble(&self.point))
    }

    /// Combined per-segment view for every route in the batch.
    pub fn segment_query(&self) -> String {
        Self::assemble(&self.segment)
    }

    /// Combined linestring view for every route in the batch.
    pub fn linestring_query(&self) -> String {
        Self::assemble(&self.linestring)
    }
}

impl RouteSource for RouteBatch {
    fn segment_query(&self) -> String {
        RouteBatch::segment_query(self)
    }

    fn linestring_query(&self) -> String {
        RouteBatch::linestring_query(self)
    }

    fn vertex_records(&self) -> Option<&[RecordBatch]> {
        None
    }
}
