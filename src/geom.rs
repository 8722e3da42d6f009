//! Shared geometry capabilities.
//!
//! [`Route`](crate::route::Route) and [`Events`](crate::events::Events) both
//! expose the small capability set the projection layer needs. Resource
//! release is handled through ownership: dropping a value frees its columnar
//! buffers and removes any temp directory it owns.

use std::collections::HashMap;

use arrow::record_batch::RecordBatch;

/// Geographic WGS-84 reference, the default event CRS on the wire.
pub const WGS84: &str = "EPSG:4326";

/// Projected CRS all metric calculations run in. The upstream feature service
/// publishes route geometry in this reference, so routes are stored untransformed.
pub const LAMBERT_WKT: &str = r#"PROJCS["Indonesia Lambert Conformal Conic",GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]],PROJECTION["Lambert_Conformal_Conic"],PARAMETER["False_Easting",0.0],PARAMETER["False_Northing",0.0],PARAMETER["Central_Meridian",115.0],PARAMETER["Standard_Parallel_1",2.0],PARAMETER["Standard_Parallel_2",-7.0],PARAMETER["Latitude_Of_Origin",0.0],UNIT["Meter",1.0]]"#;

/// Tag distinguishing the two geometry-bearing variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Route,
    Events,
}

/// Capability set shared by route geometry and point events.
pub trait Geometry {
    /// Well-known text (or authority code) of the coordinate reference system.
    fn crs(&self) -> &str;

    /// The in-memory columnar batches backing this geometry.
    fn records(&self) -> &[RecordBatch];

    fn kind(&self) -> GeometryKind;

    /// Variant-specific attributes: the route id for a route, the configured
    /// column names for events.
    fn attributes(&self) -> HashMap<String, String>;
}
