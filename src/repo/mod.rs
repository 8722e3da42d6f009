//! LRS repository.
//!
//! Version-controlled storage for route geometry. Each sync fetches raw
//! polylines from the upstream feature service, decodes them into routes,
//! merges them with the active catalog version and commits a new catalog
//! entry. Merging is last-writer-wins per route id: the new point file holds
//! the incoming routes plus every previously active route the sync did not
//! touch.
//!
//! Syncs serialize on a repository-scoped lock so two concurrent commits can
//! never interleave the supersession update and the new insert.

pub mod arcgis;
pub mod catalog;

pub use arcgis::FeatureServiceClient;
pub use catalog::{Catalog, CatalogEntry};

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db;
use crate::error::{LrsError, Result};
use crate::geom::LAMBERT_WKT;
use crate::route::esri::FeatureSet;
use crate::route::{Route, RouteBatch, SourceFiles, ROUTE_ID_COL};

/// Audit metadata recorded with each catalog commit.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub author: String,
    pub commit_msg: String,
}

/// Version-controlled catalog of route geometry.
pub struct Repository {
    catalog: Catalog,
    data_dir: PathBuf,
    client: FeatureServiceClient,
    sync_lock: Mutex<()>,
}

impl Repository {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Repository {
            catalog: Catalog::new(config.catalog_dsn.clone()),
            data_dir: config.data_dir.clone(),
            client: FeatureServiceClient::new(config)?,
            sync_lock: Mutex::new(()),
        })
    }

    /// Fetch the given routes from the upstream service, merge them with the
    /// active version and commit a new catalog entry.
    pub async fn sync(&self, route_ids: &[String], opts: SyncOptions) -> Result<i64> {
        let token = self.client.generate_token().await?;
        let body = self.client.fetch_features(&token, route_ids).await?;
        self.sync_from_feature_json(&body, opts).await
    }

    /// Merge routes decoded from a raw feature-set document. Seam used by
    /// [`Repository::sync`] and by tests that bypass the network.
    pub async fn sync_from_feature_json(&self, body: &[u8], opts: SyncOptions) -> Result<i64> {
        let set = FeatureSet::parse(body)?;
        let routes = decode_feature_sets(&[set])?;
        self.merge_commit(routes, opts).await
    }

    /// Fetch every feature behind the service in parallel pages, then perform
    /// a single merge commit over all of them.
    pub async fn sync_all(&self, opts: SyncOptions) -> Result<i64> {
        let token = self.client.generate_token().await?;
        let pages = self.client.fetch_all(&token).await?;

        let mut sets = Vec::with_capacity(pages.len());
        for page in &pages {
            sets.push(FeatureSet::parse(page)?);
        }

        let routes = decode_feature_sets(&sets)?;
        if routes.is_empty() {
            return Err(LrsError::validation(
                "feature service returned zero features",
            ));
        }

        info!("[Repository] sync_all decoded {} routes", routes.len());
        self.merge_commit(routes, opts).await
    }

    /// Resolve the active version of a route as a lazy materialized [`Route`]
    /// with a push-down predicate on its id.
    pub async fn get_latest(&self, route_id: &str) -> Result<Route> {
        let catalog = self.catalog.clone();
        let route_id = route_id.to_string();

        spawn_blocking(move || {
            let conn = db::open_plain()?;
            catalog.attach(&conn)?;
            let entry = catalog
                .active_entry(&conn)?
                .ok_or_else(|| LrsError::not_found("no active catalog entry"))?;

            let files = SourceFiles {
                point: Some(PathBuf::from(entry.point_file)),
                segment: Some(PathBuf::from(entry.segment_file)),
                linestring: Some(PathBuf::from(entry.linestring_file)),
            };
            Ok(Route::materialized(route_id, files, LAMBERT_WKT, true))
        })
        .await
    }

    async fn merge_commit(&self, routes: Vec<Route>, opts: SyncOptions) -> Result<i64> {
        // Serializes the read-merge-commit sequence across concurrent syncs.
        let _guard = self.sync_lock.lock().await;

        let catalog = self.catalog.clone();
        let data_dir = self.data_dir.clone();
        spawn_blocking(move || merge_with_active(&catalog, &data_dir, routes, &opts)).await
    }
}

/// Decode every feature of every document into a route.
fn decode_feature_sets(sets: &[FeatureSet]) -> Result<Vec<Route>> {
    let mut routes = Vec::new();
    for set in sets {
        for idx in 0..set.feature_count() {
            routes.push(Route::from_feature_set(set, idx)?);
        }
    }
    Ok(routes)
}

/// The merge algorithm: build the three merged columnar files, then commit
/// the catalog transaction. Runs on a blocking thread.
fn merge_with_active(
    catalog: &Catalog,
    data_dir: &Path,
    routes: Vec<Route>,
    opts: &SyncOptions,
) -> Result<i64> {
    let mut batch = RouteBatch::new();
    for route in routes {
        batch.add_route(route)?;
    }
    if batch.is_empty() {
        return Err(LrsError::validation("no routes to merge"));
    }

    std::fs::create_dir_all(data_dir)
        .map_err(|e| LrsError::io(format!("failed to create data dir: {}", e)))?;

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| LrsError::invariant(format!("system clock before epoch: {}", e)))?
        .as_nanos();
    let point_path = data_dir.join(format!("lrs_point_merged_{}.parquet", stamp));
    let segment_path = data_dir.join(format!("lrs_segment_merged_{}.parquet", stamp));
    let linestring_path = data_dir.join(format!("lrs_linestring_merged_{}.parquet", stamp));

    let mut conn = db::open_spatial()?;
    catalog.attach(&conn)?;
    let active = catalog.active_entry(&conn)?;

    merge_kind(
        &conn,
        active.as_ref().map(|e| e.point_file.as_str()),
        &batch.view_name(),
        &point_path,
    )?;
    merge_kind(
        &conn,
        active.as_ref().map(|e| e.segment_file.as_str()),
        &format!("(SELECT * FROM ({}))", batch.segment_query()),
        &segment_path,
    )?;
    merge_kind(
        &conn,
        active.as_ref().map(|e| e.linestring_file.as_str()),
        &format!("(SELECT * FROM ({}))", batch.linestring_query()),
        &linestring_path,
    )?;

    let output = SourceFiles {
        point: Some(point_path),
        segment: Some(segment_path),
        linestring: Some(linestring_path),
    };

    let version = catalog.commit_version(&mut conn, &output, &opts.author, &opts.commit_msg)?;
    info!(
        "[Repository] merged {} routes into version {}",
        batch.len(),
        version
    );
    Ok(version)
}

/// Write one merged file: previously active rows for untouched routes plus
/// all incoming rows. `incoming` must be usable after `FROM`.
fn merge_kind(
    conn: &duckdb::Connection,
    active_file: Option<&str>,
    incoming: &str,
    output: &Path,
) -> Result<()> {
    let select = match active_file {
        Some(active) => format!(
            "SELECT * FROM '{}' WHERE {} NOT IN (SELECT DISTINCT {} FROM {}) \
             UNION ALL SELECT * FROM {}",
            active, ROUTE_ID_COL, ROUTE_ID_COL, incoming, incoming
        ),
        None => format!("SELECT * FROM {}", incoming),
    };

    db::exec(
        conn,
        &format!("COPY ({}) TO '{}' (FORMAT PARQUET)", select, output.display()),
    )
}

async fn spawn_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Err(LrsError::Cancelled),
        Err(err) => {
            warn!("[Repository] blocking task failed: {}", err);
            Err(LrsError::invariant(format!("blocking task failed: {}", err)))
        }
    }
}
