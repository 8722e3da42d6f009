//! # LRS Server
//!
//! A linear referencing system (LRS) service for road-network geometry. An
//! LRS route is a polyline whose vertices carry, besides coordinates, a
//! monotonically increasing measure (the M-value) giving distance along the
//! route from its origin. Given point events referencing a route, the service
//! projects each point onto the route geometry and returns the interpolated
//! M-value plus the orthogonal distance to the route.
//!
//! The crate is organised around four subsystems:
//!
//! - **Repository** ([`repo`]) - a version-controlled catalog over columnar
//!   on-disk datasets: ingestion from the upstream feature service,
//!   de-duplicating merge, and retrieval of the active route geometry.
//! - **M-value engine** ([`mvalue`]) - projects events onto routes and
//!   interpolates measures through a SQL pipeline over the embedded
//!   analytical engine with its spatial extension.
//! - **Projection** ([`projection`]) - transforms geometry between
//!   coordinate reference systems ahead of metric calculations.
//! - **Streaming exchange** ([`flight`]) - a bidirectional columnar RPC
//!   surface accepting large event batches and streaming results back, with
//!   file-backed spill for oversized payloads.
//!
//! A thin GeoJSON HTTP endpoint ([`api`]) fronts the same pipeline for small
//! request/response payloads.

// Unified error handling
pub mod error;
pub use error::{LrsError, Result};

// Environment-driven configuration
pub mod config;
pub use config::Config;

// Shared geometry capabilities and CRS constants
pub mod geom;
pub use geom::{Geometry, GeometryKind, LAMBERT_WKT, WGS84};

// Analytical engine sessions
mod db;

// Route data model: vertices, derived views, multi-route batches
pub mod route;
pub use route::{Route, RouteBatch, RouteSource};

// Point-event collections and the GeoJSON codec
pub mod events;
pub use events::{EventColumns, Events};

// Versioned repository: sync, merge, catalog
pub mod repo;
pub use repo::{Repository, SyncOptions};

// M-value interpolation engine
pub mod mvalue;
pub use mvalue::calculate_m_values;

// CRS projection layer
pub mod projection;
pub use projection::{transform, Transformed};

// Shared per-request pipeline
pub mod pipeline;

// Streaming exchange server
pub mod flight;

// GeoJSON HTTP endpoint
pub mod api;
