//! Versioned catalog over an attached relational database.
//!
//! The catalog table records, per version, the three columnar files holding
//! the union of all routes at that version plus audit metadata. At most one
//! row is *active* (`end_date IS NULL`); supersession sets the previous
//! active row's `end_date` and inserts the new row inside one transaction.

use duckdb::{params, Connection};
use log::info;

use crate::db::{self, quote_literal};
use crate::error::{LrsError, Result};
use crate::route::SourceFiles;

/// Alias the catalog database attaches under.
const CATALOG_ALIAS: &str = "catalog_db";

/// The active entry of the catalog.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub version: i64,
    pub point_file: String,
    pub segment_file: String,
    pub linestring_file: String,
}

/// Handle to the catalog database, addressed by connection string.
///
/// A Postgres-style connection string attaches through the engine's postgres
/// extension; anything else is treated as a database file path, which is what
/// the tests use.
#[derive(Debug, Clone)]
pub struct Catalog {
    dsn: String,
}

impl Catalog {
    pub fn new(dsn: impl Into<String>) -> Self {
        Catalog { dsn: dsn.into() }
    }

    fn is_postgres_dsn(dsn: &str) -> bool {
        dsn.starts_with("postgres://")
            || dsn.starts_with("postgresql://")
            || dsn.contains("host=")
            || dsn.contains("dbname=")
    }

    /// Attach the catalog database to a session and ensure the table exists.
    pub fn attach(&self, conn: &Connection) -> Result<()> {
        if Self::is_postgres_dsn(&self.dsn) {
            conn.execute_batch("INSTALL postgres; LOAD postgres;")
                .map_err(|e| {
                    LrsError::engine(format!("failed to load postgres extension: {}", e), None)
                })?;
            db::exec(
                conn,
                &format!(
                    "ATTACH IF NOT EXISTS {} AS {} (TYPE POSTGRES)",
                    quote_literal(&self.dsn),
                    CATALOG_ALIAS
                ),
            )?;
        } else {
            db::exec(
                conn,
                &format!(
                    "ATTACH IF NOT EXISTS {} AS {}",
                    quote_literal(&self.dsn),
                    CATALOG_ALIAS
                ),
            )?;
        }

        db::exec(
            conn,
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.lrs_catalogs ( \
                     version INTEGER, \
                     start_date DATE, \
                     end_date DATE, \
                     point_file TEXT, \
                     segment_file TEXT, \
                     linestring_file TEXT, \
                     author TEXT, \
                     commit_msg TEXT \
                 )",
                CATALOG_ALIAS
            ),
        )
    }

    /// The active catalog entry, or `None` when no sync has committed yet.
    ///
    /// More than one active row is an impossible state and fails loudly.
    pub fn active_entry(&self, conn: &Connection) -> Result<Option<CatalogEntry>> {
        let active: i64 = conn.query_row(
            &format!(
                "SELECT count(*) FROM {}.lrs_catalogs WHERE end_date IS NULL",
                CATALOG_ALIAS
            ),
            [],
            |row| row.get(0),
        )?;
        if active > 1 {
            return Err(LrsError::invariant(format!(
                "{} active catalog entries, expected at most one",
                active
            )));
        }

        let entry = conn.query_row(
            &format!(
                "SELECT version, point_file, segment_file, linestring_file \
                 FROM {}.lrs_catalogs WHERE end_date IS NULL \
                 ORDER BY version DESC LIMIT 1",
                CATALOG_ALIAS
            ),
            [],
            |row| {
                Ok(CatalogEntry {
                    version: row.get(0)?,
                    point_file: row.get(1)?,
                    segment_file: row.get(2)?,
                    linestring_file: row.get(3)?,
                })
            },
        );

        match entry {
            Ok(entry) => Ok(Some(entry)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Supersede the active entry and insert the new one in one transaction.
    ///
    /// Returns the committed version number.
    pub fn commit_version(
        &self,
        conn: &mut Connection,
        files: &SourceFiles,
        author: &str,
        commit_msg: &str,
    ) -> Result<i64> {
        let point = file_path(files.point.as_ref())?;
        let segment = file_path(files.segment.as_ref())?;
        let linestring = file_path(files.linestring.as_ref())?;

        let tx = conn.transaction()?;

        tx.execute(
            &format!(
                "UPDATE {}.lrs_catalogs SET end_date = CURRENT_DATE WHERE end_date IS NULL",
                CATALOG_ALIAS
            ),
            [],
        )?;

        let next_version: i64 = tx.query_row(
            &format!(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM {}.lrs_catalogs",
                CATALOG_ALIAS
            ),
            [],
            |row| row.get(0),
        )?;

        tx.execute(
            &format!(
                "INSERT INTO {}.lrs_catalogs \
                 (version, start_date, end_date, point_file, segment_file, linestring_file, author, commit_msg) \
                 VALUES (?, CURRENT_DATE, NULL, ?, ?, ?, ?, ?)",
                CATALOG_ALIAS
            ),
            params![next_version, point, segment, linestring, author, commit_msg],
        )?;

        tx.commit()?;
        info!("[Catalog] committed version {}", next_version);
        Ok(next_version)
    }
}

fn file_path(path: Option<&std::path::PathBuf>) -> Result<String> {
    path.map(|p| p.display().to_string())
        .ok_or_else(|| LrsError::invariant("merge output file path missing at commit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn output_files(tag: &str) -> SourceFiles {
        SourceFiles {
            point: Some(PathBuf::from(format!("/data/point_{}.parquet", tag))),
            segment: Some(PathBuf::from(format!("/data/segment_{}.parquet", tag))),
            linestring: Some(PathBuf::from(format!("/data/line_{}.parquet", tag))),
        }
    }

    #[test]
    fn test_is_postgres_dsn() {
        assert!(Catalog::is_postgres_dsn("dbname=lrs user=postgres host=db"));
        assert!(Catalog::is_postgres_dsn("postgres://localhost/lrs"));
        assert!(!Catalog::is_postgres_dsn("/tmp/catalog.db"));
    }

    #[test]
    fn test_commit_and_supersede() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("catalog.db").display().to_string());

        let mut conn = crate::db::open_plain().unwrap();
        catalog.attach(&conn).unwrap();

        assert!(catalog.active_entry(&conn).unwrap().is_none());

        let v1 = catalog
            .commit_version(&mut conn, &output_files("a"), "tester", "first")
            .unwrap();
        assert_eq!(v1, 1);

        let v2 = catalog
            .commit_version(&mut conn, &output_files("b"), "tester", "second")
            .unwrap();
        assert_eq!(v2, 2);

        // Exactly one row stays active and it is the newest version.
        let active: i64 = conn
            .query_row(
                "SELECT count(*) FROM catalog_db.lrs_catalogs WHERE end_date IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(active, 1);

        let entry = catalog.active_entry(&conn).unwrap().unwrap();
        assert_eq!(entry.version, 2);
        assert!(entry.point_file.contains("point_b"));

        // The superseded row keeps its files and gains an end date.
        let closed: i64 = conn
            .query_row(
                "SELECT count(*) FROM catalog_db.lrs_catalogs WHERE end_date IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(closed, 1);
    }
}
