//! Environment-driven configuration.
//!
//! All knobs come from the process environment, read once at startup. The
//! catalog connection string is either `LRS_CATALOG_DSN` verbatim or, when
//! unset, a Postgres keyword string assembled from the `DB_*` variables.

use std::env;
use std::path::PathBuf;

/// Default row threshold above which incoming exchange batches spill to disk.
pub const DEFAULT_SPILL_THRESHOLD: usize = 1_000_000;

const DEFAULT_TOKEN_URL: &str =
    "https://gisportal.binamarga.pu.go.id/portal/sharing/rest/generateToken";
const DEFAULT_FEATURE_URL: &str =
    "https://gisportal.binamarga.pu.go.id/arcgis/rest/services/Jalan/BinaMargaLRS/MapServer/0/query";
const DEFAULT_REFERER: &str = "https://sipdjn.binamarga.pu.go.id/";

/// Runtime configuration for the LRS server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Catalog database connection string (Postgres keywords or a file path).
    pub catalog_dsn: String,
    /// Directory receiving merged columnar files.
    pub data_dir: PathBuf,
    /// Upstream portal credentials.
    pub arcgis_user: String,
    pub arcgis_password: String,
    /// Upstream endpoints.
    pub token_url: String,
    pub feature_url: String,
    pub referer: String,
    /// Bind ports.
    pub rest_port: u16,
    pub flight_port: u16,
    /// Exchange spill threshold in rows.
    pub spill_threshold: usize,
}

impl Config {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let catalog_dsn = env::var("LRS_CATALOG_DSN").unwrap_or_else(|_| {
            format!(
                "dbname={} user={} password={} host={}",
                env::var("DB_NAME").unwrap_or_default(),
                env::var("DB_USER").unwrap_or_default(),
                env::var("DB_PASSWORD").unwrap_or_default(),
                env::var("DB_HOST").unwrap_or_default(),
            )
        });

        Config {
            catalog_dsn,
            data_dir: env::var("LRS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            arcgis_user: env::var("ARCGIS_USER").unwrap_or_default(),
            arcgis_password: env::var("ARCGIS_PASSWORD").unwrap_or_default(),
            token_url: env::var("LRS_TOKEN_URL").unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string()),
            feature_url: env::var("LRS_FEATURE_URL")
                .unwrap_or_else(|_| DEFAULT_FEATURE_URL.to_string()),
            referer: env::var("LRS_REFERER").unwrap_or_else(|_| DEFAULT_REFERER.to_string()),
            rest_port: parse_env("LRS_REST_PORT", 8080),
            flight_port: parse_env("LRS_FLIGHT_PORT", 50051),
            spill_threshold: parse_env("LRS_SPILL_THRESHOLD", DEFAULT_SPILL_THRESHOLD),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
