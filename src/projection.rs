//! CRS projection layer.
//!
//! Transforms geometry between coordinate reference systems ahead of metric
//! calculations. The transform replaces the coordinate columns and preserves
//! everything else, then rebuilds the same geometry variant.

use log::debug;

use crate::db;
use crate::error::{LrsError, Result};
use crate::events::{EventColumns, Events};
use crate::geom::{Geometry, GeometryKind};
use crate::route::Route;

/// A transformed geometry, same variant as the input.
pub enum Transformed {
    Route(Route),
    Events(Events),
}

impl Transformed {
    pub fn into_events(self) -> Result<Events> {
        match self {
            Transformed::Events(events) => Ok(events),
            Transformed::Route(_) => Err(LrsError::invariant(
                "expected transformed events, got a route",
            )),
        }
    }

    pub fn into_route(self) -> Result<Route> {
        match self {
            Transformed::Route(route) => Ok(route),
            Transformed::Events(_) => Err(LrsError::invariant(
                "expected a transformed route, got events",
            )),
        }
    }
}

/// Transform a geometry object to a target CRS.
///
/// `inverted_axis_order` swaps the coordinate arguments to `ST_Point`, needed
/// for references whose axis convention is lon-first. Returns the input
/// unchanged (rebuilt from the same buffers) when source and target CRS are
/// equal.
pub fn transform(obj: &dyn Geometry, target_crs: &str, inverted_axis_order: bool) -> Result<Transformed> {
    let attributes = obj.attributes();
    let lat_col = attributes
        .get("lat_column")
        .cloned()
        .unwrap_or_else(|| "lat".to_string());
    let lon_col = attributes
        .get("lon_column")
        .cloned()
        .unwrap_or_else(|| "lon".to_string());

    if obj.crs() == target_crs {
        debug!("[Projection] source and target CRS equal, skipping transform");
        return rebuild(obj, obj.records().to_vec(), target_crs);
    }

    if obj.records().is_empty() {
        return Err(LrsError::validation("no records to transform"));
    }

    let conn = db::open_spatial()?;
    db::register_batches(&conn, "records", obj.records())?;

    let point_args = if inverted_axis_order {
        format!("\"{}\", \"{}\"", lon_col, lat_col)
    } else {
        format!("\"{}\", \"{}\"", lat_col, lon_col)
    };

    let query = format!(
        "WITH transformed AS ( \
             SELECT * EXCLUDE (\"{lat}\", \"{lon}\"), \
                 ST_Transform(ST_Point({point_args}), {src}, {dst}) AS shape \
             FROM records \
         ) \
         SELECT * EXCLUDE (shape), ST_X(shape) AS \"{lon}\", ST_Y(shape) AS \"{lat}\" \
         FROM transformed",
        lat = lat_col,
        lon = lon_col,
        point_args = point_args,
        src = db::quote_literal(obj.crs()),
        dst = db::quote_literal(target_crs),
    );

    let records = db::query_batches(&conn, &query)?;
    rebuild(obj, records, target_crs)
}

fn rebuild(
    obj: &dyn Geometry,
    records: Vec<arrow::record_batch::RecordBatch>,
    crs: &str,
) -> Result<Transformed> {
    let attributes = obj.attributes();
    match obj.kind() {
        GeometryKind::Route => {
            let route_id = attributes.get("route_id").cloned().ok_or_else(|| {
                LrsError::invariant("route geometry is missing its route_id attribute")
            })?;
            Ok(Transformed::Route(Route::new(route_id, records, crs)))
        }
        GeometryKind::Events => {
            let defaults = EventColumns::default();
            let columns = EventColumns {
                route_id: attributes
                    .get("route_id_column")
                    .cloned()
                    .unwrap_or(defaults.route_id),
                lat: attributes.get("lat_column").cloned().unwrap_or(defaults.lat),
                lon: attributes.get("lon_column").cloned().unwrap_or(defaults.lon),
                m_value: attributes
                    .get("m_value_column")
                    .cloned()
                    .unwrap_or(defaults.m_value),
                dist_to_line: attributes
                    .get("dist_to_line_column")
                    .cloned()
                    .unwrap_or(defaults.dist_to_line),
            };
            Ok(Transformed::Events(Events::from_batches_with(
                records, crs, columns,
            )?))
        }
    }
}
