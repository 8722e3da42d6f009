//! M-value interpolation engine.
//!
//! Projects point events onto route geometry and interpolates measures. The
//! computation runs as one SQL pipeline over an in-memory engine session with
//! the spatial extension loaded:
//!
//! 1. events get a dense `point_id` preserving arrival order;
//! 2. per-route linestrings and per-segment views come from the route source;
//! 3. `ST_ShortestLine` projects each event onto its route; the projected
//!    vertex and orthogonal distance fall out of the shortest line;
//! 4. candidate segments are those whose bounding box contains the projected
//!    vertex; the measure interpolates linearly along the winning segment
//!    (smallest distance, then lowest segment sequence);
//! 5. a left join back onto the events preserves every input row in order,
//!    with `0` substituted for events that matched no segment.
//!
//! Coordinates feed `ST_Point(lat, lon)` throughout, matching the linestring
//! construction, so axis pairing stays consistent across the pipeline.

use log::debug;

use crate::db;
use crate::error::{LrsError, Result};
use crate::events::Events;
use crate::geom::Geometry;
use crate::route::{RouteSource, VERTEX_VIEW};

/// Calculate M-values and route distances for every event.
///
/// Returns a new [`Events`] with the input columns plus the configured
/// m-value and distance columns, one row per input event, in input order.
pub fn calculate_m_values(source: &dyn RouteSource, events: &Events) -> Result<Events> {
    if events.records().is_empty() {
        return Err(LrsError::validation("no events to calculate"));
    }

    let linestring_query = source.linestring_query();
    let segment_query = source.segment_query();
    if linestring_query.is_empty() || segment_query.is_empty() {
        return Err(LrsError::validation("route source has no geometry"));
    }

    let conn = db::open_spatial()?;

    db::register_batches(&conn, "points_raw", events.records())?;
    if let Some(vertices) = source.vertex_records() {
        db::register_batches(&conn, VERTEX_VIEW, vertices)?;
    }

    db::exec(
        &conn,
        "CREATE TEMP TABLE points_table AS \
         SELECT *, row_number() OVER () AS point_id FROM points_raw",
    )?;
    db::exec(
        &conn,
        &format!("CREATE TEMP TABLE lrs_line_table AS ({})", linestring_query),
    )?;
    db::exec(
        &conn,
        &format!("CREATE TEMP TABLE lrs_segment_table AS ({})", segment_query),
    )?;

    let columns = events.columns();
    let schema = events.records()[0].schema();

    // Previously calculated result columns are replaced, not duplicated.
    let mut exclude = vec!["point_id".to_string()];
    for col in [&columns.m_value, &columns.dist_to_line] {
        if schema.column_with_name(col).is_some() {
            exclude.push(format!("\"{}\"", col));
        }
    }

    let query = format!(
        r#"WITH shortest_to_lrs AS (
    SELECT a."{rid}" AS route_id, a.point_id,
        ST_ShortestLine(ST_Point(a."{lat}", a."{lon}"), b.line) AS shortest_line
    FROM points_table a
    JOIN lrs_line_table b ON a."{rid}" = b.route_id
),
point_on_line AS (
    SELECT route_id, point_id,
        ST_EndPoint(shortest_line) AS projected,
        ST_Length(shortest_line) AS dist_to_line
    FROM shortest_to_lrs
),
candidate_segments AS (
    SELECT a.point_id, a.dist_to_line, a.projected,
        b.m AS m0, b.m1, b.lat AS lat0, b.lon AS lon0, b.lat1, b.lon1, b.seq
    FROM point_on_line a
    INNER JOIN lrs_segment_table b ON a.route_id = b.route_id
        AND ST_X(a.projected) BETWEEN LEAST(b.lat, b.lat1) AND GREATEST(b.lat, b.lat1)
        AND ST_Y(a.projected) BETWEEN LEAST(b.lon, b.lon1) AND GREATEST(b.lon, b.lon1)
),
interpolated AS (
    SELECT point_id, dist_to_line, seq,
        m0 + ((m1 - m0) / NULLIF(ST_Distance(ST_Point(lat0, lon0), ST_Point(lat1, lon1)), 0)
            * ST_Distance(ST_Point(lat0, lon0), projected)) AS m_val
    FROM candidate_segments
),
best_match AS (
    SELECT DISTINCT ON (point_id) *
    FROM interpolated
    ORDER BY point_id, dist_to_line ASC, seq ASC
)
SELECT p.* EXCLUDE ({exclude}),
    COALESCE(i.m_val, 0) AS "{mcol}",
    i.dist_to_line AS "{dcol}"
FROM points_table p
LEFT JOIN best_match i ON p.point_id = i.point_id
ORDER BY p.point_id"#,
        rid = columns.route_id,
        lat = columns.lat,
        lon = columns.lon,
        exclude = exclude.join(", "),
        mcol = columns.m_value,
        dcol = columns.dist_to_line,
    );

    let out = db::query_batches(&conn, &query)?;
    if out.is_empty() {
        return Err(LrsError::engine(
            "interpolation produced no result batches",
            Some(query),
        ));
    }

    debug!(
        "[MValue] interpolated {} batches for {} input batches",
        out.len(),
        events.records().len()
    );

    Events::from_batches_with(out, events.crs(), columns.clone())
}
