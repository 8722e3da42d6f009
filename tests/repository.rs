//! Repository integration tests.
//!
//! Runs the sync/merge/commit lifecycle against a throwaway catalog database
//! file and a temp data directory, then verifies catalog supersession and
//! merged file contents straight from the engine.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::record_batch::RecordBatch;
use duckdb::Connection;
use lrs_server::{pipeline, Config, Events, Geometry, Repository, SyncOptions, LAMBERT_WKT};
use serde_json::json;
use tempfile::TempDir;

/// Route "01001": 11.2 m long, measures 0 to 0.0111.
const ROUTE_1: &[(f64, f64, f64)] = &[
    (-2191377.9268000014, 602211.73600000143, 0.0),
    (-2191367.4395999983, 602215.71829999983, 0.0111),
];

/// Route "01002".
const ROUTE_2: &[(f64, f64, f64)] = &[
    (-2190936.8995999992, 593568.98829999566, 0.0),
    (-2190911.0421999991, 593544.87000000477, 0.03536),
];

fn test_config(dir: &TempDir) -> Config {
    Config {
        catalog_dsn: dir.path().join("catalog.db").display().to_string(),
        data_dir: dir.path().join("data"),
        arcgis_user: String::new(),
        arcgis_password: String::new(),
        token_url: String::new(),
        feature_url: String::new(),
        referer: String::new(),
        rest_port: 0,
        flight_port: 0,
        spill_threshold: 1_000_000,
    }
}

fn sync_options(msg: &str) -> SyncOptions {
    SyncOptions {
        author: "tester".to_string(),
        commit_msg: msg.to_string(),
    }
}

/// Build an upstream feature-set document of `(route_id, vertices)` pairs,
/// vertices as `[lon, lat, m]`.
fn feature_json(routes: &[(&str, &[(f64, f64, f64)])]) -> Vec<u8> {
    let features: Vec<_> = routes
        .iter()
        .map(|(route_id, vertices)| {
            let path: Vec<_> = vertices.iter().map(|v| vec![v.0, v.1, v.2]).collect();
            json!({
                "geometry": {"hasM": true, "paths": [path]},
                "attributes": {"LINKID": route_id, "LINK_NAME": format!("Jalan {}", route_id)}
            })
        })
        .collect();

    json!({
        "spatialReference": {"wkt": LAMBERT_WKT},
        "features": features
    })
    .to_string()
    .into_bytes()
}

fn catalog_conn(dir: &TempDir) -> Connection {
    let conn = Connection::open_in_memory().expect("open");
    conn.execute_batch(&format!(
        "ATTACH '{}' AS catalog_db",
        dir.path().join("catalog.db").display()
    ))
    .expect("attach");
    conn
}

fn distinct_route_ids(conn: &Connection, parquet: &str) -> Vec<String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT DISTINCT route_id FROM '{}' ORDER BY route_id",
            parquet
        ))
        .expect("prepare");
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .expect("query");
    ids.map(|id| id.expect("row")).collect()
}

fn point_rows(conn: &Connection, parquet: &str) -> Vec<(String, i32, f64)> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT route_id, seq, m FROM '{}' ORDER BY route_id, seq",
            parquet
        ))
        .expect("prepare");
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })
        .expect("query");
    rows.map(|r| r.expect("row")).collect()
}

fn active_point_file(conn: &Connection) -> String {
    conn.query_row(
        "SELECT point_file FROM catalog_db.lrs_catalogs WHERE end_date IS NULL",
        [],
        |row| row.get(0),
    )
    .expect("active entry")
}

#[tokio::test]
async fn test_sync_and_supersede() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::new(&test_config(&dir)).unwrap();

    let v1 = repo
        .sync_from_feature_json(&feature_json(&[("01001", ROUTE_1)]), sync_options("first"))
        .await
        .expect("first sync");
    assert_eq!(v1, 1);

    let route = repo.get_latest("01001").await.expect("get_latest");
    assert!(route.is_materialized());
    assert!(route.push_down());
    assert!(route.view_name().contains("WHERE route_id = '01001'"));

    let v2 = repo
        .sync_from_feature_json(&feature_json(&[("01002", ROUTE_2)]), sync_options("second"))
        .await
        .expect("second sync");
    assert_eq!(v2, 2);

    // Exactly one active row; the superseded row gains an end date.
    let conn = catalog_conn(&dir);
    let (active, closed): (i64, i64) = conn
        .query_row(
            "SELECT count(*) FILTER (WHERE end_date IS NULL), \
             count(*) FILTER (WHERE end_date IS NOT NULL) \
             FROM catalog_db.lrs_catalogs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(active, 1);
    assert_eq!(closed, 1);

    // The new active point file carries both routes.
    let point_file = active_point_file(&conn);
    assert_eq!(distinct_route_ids(&conn, &point_file), vec!["01001", "01002"]);
    assert_eq!(point_rows(&conn, &point_file).len(), 4);
}

#[tokio::test]
async fn test_sync_replaces_route() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::new(&test_config(&dir)).unwrap();

    repo.sync_from_feature_json(
        &feature_json(&[("01001", ROUTE_1), ("01002", ROUTE_2)]),
        sync_options("seed"),
    )
    .await
    .expect("seed sync");

    // Re-sync route 01001 with shifted measures.
    let updated: Vec<(f64, f64, f64)> = ROUTE_1.iter().map(|v| (v.0, v.1, v.2 + 1.0)).collect();
    repo.sync_from_feature_json(
        &feature_json(&[("01001", &updated)]),
        sync_options("update"),
    )
    .await
    .expect("update sync");

    let conn = catalog_conn(&dir);
    let rows = point_rows(&conn, &active_point_file(&conn));

    // One row per (route_id, seq): the incoming 01001 plus the untouched 01002.
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0], ("01001".to_string(), 0, updated[0].2));
    assert_eq!(rows[1], ("01001".to_string(), 1, updated[1].2));
    assert_eq!(rows[2].0, "01002");
    assert_eq!(rows[3].2, 0.03536);
}

#[tokio::test]
async fn test_idempotent_sync() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::new(&test_config(&dir)).unwrap();

    let body = feature_json(&[("01001", ROUTE_1)]);
    repo.sync_from_feature_json(&body, sync_options("first"))
        .await
        .expect("first sync");
    repo.sync_from_feature_json(&body, sync_options("again"))
        .await
        .expect("second sync");

    let conn = catalog_conn(&dir);
    let versions: i64 = conn
        .query_row("SELECT count(*) FROM catalog_db.lrs_catalogs", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(versions, 2);

    // Two catalog entries, identical point contents modulo file path.
    let files: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT point_file FROM catalog_db.lrs_catalogs ORDER BY version")
            .unwrap();
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    };
    assert_ne!(files[0], files[1]);
    assert_eq!(point_rows(&conn, &files[0]), point_rows(&conn, &files[1]));
}

#[tokio::test]
async fn test_get_latest_without_catalog() {
    let dir = TempDir::new().unwrap();
    let repo = Repository::new(&test_config(&dir)).unwrap();

    let err = repo.get_latest("01001").await.unwrap_err();
    assert!(err.to_string().contains("no active catalog entry"));
}

fn lambert_events(rows: &[(&str, f64, f64)]) -> Events {
    let schema = Arc::new(arrow::datatypes::Schema::new(vec![
        arrow::datatypes::Field::new("route_id", arrow::datatypes::DataType::Utf8, false),
        arrow::datatypes::Field::new("lat", arrow::datatypes::DataType::Float64, false),
        arrow::datatypes::Field::new("lon", arrow::datatypes::DataType::Float64, false),
    ]));
    let ids: Vec<&str> = rows.iter().map(|r| r.0).collect();
    let lats: Vec<f64> = rows.iter().map(|r| r.1).collect();
    let lons: Vec<f64> = rows.iter().map(|r| r.2).collect();
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(ids)) as ArrayRef,
            Arc::new(Float64Array::from(lats)) as ArrayRef,
            Arc::new(Float64Array::from(lons)) as ArrayRef,
        ],
    )
    .expect("event batch");
    Events::from_batches(vec![batch], LAMBERT_WKT).expect("events")
}

#[tokio::test]
async fn test_pipeline_against_catalog() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(Repository::new(&test_config(&dir)).unwrap());

    repo.sync_from_feature_json(&feature_json(&[("01001", ROUTE_1)]), sync_options("seed"))
        .await
        .expect("seed sync");

    // Events already in the target CRS: vertex-exact point plus an unknown id.
    let events = lambert_events(&[
        ("01001", ROUTE_1[0].1, ROUTE_1[0].0),
        ("ZZZZ", 0.0, 0.0),
    ]);

    let result = pipeline::process_events(&repo, events, LAMBERT_WKT)
        .await
        .expect("pipeline");

    let batch = &result.records()[0];
    assert_eq!(batch.num_rows(), 2);
    let m_idx = batch.schema().index_of("m_value").expect("m_value column");
    let m_values = batch
        .column(m_idx)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("float column");
    assert!((m_values.value(0) - 0.0).abs() < 1e-3);
    // The unknown route matched no geometry.
    assert!((m_values.value(1) - 0.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_pipeline_without_catalog() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(Repository::new(&test_config(&dir)).unwrap());

    let events = lambert_events(&[("01001", 0.0, 0.0)]);
    let err = pipeline::process_events(&repo, events, LAMBERT_WKT)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no catalog routes"));
}

#[tokio::test]
async fn test_pipeline_rejects_empty_route_ids() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(Repository::new(&test_config(&dir)).unwrap());

    // Events with zero batches reach the pipeline without a route id to use.
    let events = Events::from_batches(Vec::new(), LAMBERT_WKT).expect("events");
    let err = pipeline::process_events(&repo, events, LAMBERT_WKT)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no route ids"));
}
