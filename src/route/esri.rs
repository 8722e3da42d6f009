//! Upstream feature JSON decoding.
//!
//! The feature service answers queries with a feature-set document: a spatial
//! reference (well-known text) and a `features` array whose geometries carry
//! measured paths of `[lon, lat, m, ...]` vertices. One feature decodes into
//! one [`Route`].

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Builder, Int32Builder, StringBuilder};
use arrow::record_batch::RecordBatch;
use serde::Deserialize;
use serde_json::Value;

use super::{vertex_schema, Route};
use crate::error::{LrsError, Result};

/// Attribute naming the route identifier in upstream features.
const ROUTE_ID_ATTRIBUTE: &str = "LINKID";

/// A decoded upstream feature-set document.
#[derive(Debug, Deserialize)]
pub struct FeatureSet {
    #[serde(rename = "spatialReference", default)]
    pub spatial_reference: SpatialReference,
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SpatialReference {
    #[serde(default)]
    pub wkt: String,
    #[serde(default)]
    pub wkt2: String,
}

#[derive(Debug, Deserialize)]
pub struct Feature {
    pub geometry: FeatureGeometry,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct FeatureGeometry {
    #[serde(rename = "hasM", default)]
    pub has_m: bool,
    #[serde(default)]
    pub paths: Vec<Vec<Vec<f64>>>,
}

impl FeatureSet {
    pub fn parse(data: &[u8]) -> Result<FeatureSet> {
        serde_json::from_slice(data)
            .map_err(|e| LrsError::validation(format!("failed to decode feature set: {}", e)))
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// The declared spatial reference, preferring `wkt` with `wkt2` fallback.
    pub fn resolved_wkt(&self) -> Result<&str> {
        if !self.spatial_reference.wkt.is_empty() {
            Ok(&self.spatial_reference.wkt)
        } else if !self.spatial_reference.wkt2.is_empty() {
            Ok(&self.spatial_reference.wkt2)
        } else {
            Err(LrsError::validation(
                "feature set carries no spatial reference wkt",
            ))
        }
    }
}

impl Route {
    /// Decode one feature of a feature-set document into a route.
    ///
    /// The route id comes from the `LINKID` attribute, the CRS from the
    /// document's spatial reference, and the vertices from all paths in
    /// order, with a running sequence index and the measure at vertex
    /// position 2.
    pub fn from_feature_set(set: &FeatureSet, feature_idx: usize) -> Result<Route> {
        let wkt = set.resolved_wkt()?;
        let feature = set.features.get(feature_idx).ok_or_else(|| {
            LrsError::validation(format!("feature index {} out of range", feature_idx))
        })?;

        if feature.geometry.paths.is_empty() {
            return Err(LrsError::validation("feature has no geometry paths"));
        }

        let route_id = feature
            .attributes
            .get(ROUTE_ID_ATTRIBUTE)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LrsError::validation(format!("missing or invalid {} attribute", ROUTE_ID_ATTRIBUTE))
            })?
            .to_string();

        let mut route_id_builder = StringBuilder::new();
        let mut lat_builder = Float64Builder::new();
        let mut lon_builder = Float64Builder::new();
        let mut m_builder = Float64Builder::new();
        let mut seq_builder = Int32Builder::new();

        let mut seq: i32 = 0;
        for path in &feature.geometry.paths {
            for vertex in path {
                if vertex.len() < 3 {
                    return Err(LrsError::validation(format!(
                        "route {}: vertex {} has {} coordinates, need lon/lat/m",
                        route_id,
                        seq,
                        vertex.len()
                    )));
                }
                lon_builder.append_value(vertex[0]);
                lat_builder.append_value(vertex[1]);
                m_builder.append_value(vertex[2]);
                seq_builder.append_value(seq);
                route_id_builder.append_value(&route_id);
                seq += 1;
            }
        }

        if seq < 2 {
            return Err(LrsError::validation(format!(
                "route {} has {} vertices, need at least 2",
                route_id, seq
            )));
        }

        let batch = RecordBatch::try_new(
            vertex_schema(),
            vec![
                Arc::new(route_id_builder.finish()) as ArrayRef,
                Arc::new(lat_builder.finish()) as ArrayRef,
                Arc::new(lon_builder.finish()) as ArrayRef,
                Arc::new(m_builder.finish()) as ArrayRef,
                Arc::new(seq_builder.finish()) as ArrayRef,
            ],
        )?;

        Ok(Route::new(route_id, vec![batch], wkt))
    }

    /// Convenience wrapper decoding the document and one feature in one step.
    pub fn from_feature_json(data: &[u8], feature_idx: usize) -> Result<Route> {
        let set = FeatureSet::parse(data)?;
        Route::from_feature_set(&set, feature_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Geometry;

    fn feature_doc(wkt_field: &str) -> String {
        format!(
            r#"{{
                "spatialReference": {{"{}": "PROJCS[\"Test\"]"}},
                "features": [
                    {{
                        "geometry": {{
                            "hasM": true,
                            "paths": [[[100.0, 5.0, 0.0, 0.0], [100.1, 5.1, 0.5, 0.0]],
                                      [[100.2, 5.2, 1.0, 0.0]]]
                        }},
                        "attributes": {{"LINKID": "01001", "LINK_NAME": "Jalan Test"}}
                    }}
                ]
            }}"#,
            wkt_field
        )
    }

    #[test]
    fn test_decode_feature() {
        let route = Route::from_feature_json(feature_doc("wkt").as_bytes(), 0).expect("decode");
        assert_eq!(route.route_id(), "01001");
        assert_eq!(route.crs(), "PROJCS[\"Test\"]");

        // Vertices span both paths with a continuous sequence.
        let batch = &route.records()[0];
        assert_eq!(batch.num_rows(), 3);
        let seqs = batch
            .column(4)
            .as_any()
            .downcast_ref::<arrow::array::Int32Array>()
            .unwrap();
        assert_eq!(seqs.values().to_vec(), vec![0, 1, 2]);

        // Vertex order in the document is [lon, lat, m, ...].
        let lats = batch
            .column(1)
            .as_any()
            .downcast_ref::<arrow::array::Float64Array>()
            .unwrap();
        assert_eq!(lats.value(0), 5.0);
    }

    #[test]
    fn test_wkt2_fallback() {
        let route = Route::from_feature_json(feature_doc("wkt2").as_bytes(), 0).expect("decode");
        assert_eq!(route.crs(), "PROJCS[\"Test\"]");
    }

    #[test]
    fn test_missing_wkt() {
        let doc = r#"{"spatialReference": {}, "features": []}"#;
        let set = FeatureSet::parse(doc.as_bytes()).expect("parse");
        assert!(set.resolved_wkt().is_err());
    }

    #[test]
    fn test_missing_route_id() {
        let doc = r#"{
            "spatialReference": {"wkt": "PROJCS[\"Test\"]"},
            "features": [{"geometry": {"paths": [[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]]}, "attributes": {}}]
        }"#;
        let err = Route::from_feature_json(doc.as_bytes(), 0).unwrap_err();
        assert!(err.to_string().contains("LINKID"));
    }

    #[test]
    fn test_too_few_vertices() {
        let doc = r#"{
            "spatialReference": {"wkt": "PROJCS[\"Test\"]"},
            "features": [{"geometry": {"paths": [[[0.0, 0.0, 0.0]]]}, "attributes": {"LINKID": "X"}}]
        }"#;
        let err = Route::from_feature_json(doc.as_bytes(), 0).unwrap_err();
        assert!(err.to_string().contains("at least 2"));
    }

    #[test]
    fn test_feature_index_out_of_range() {
        let err = Route::from_feature_json(feature_doc("wkt").as_bytes(), 5).unwrap_err();
        assert!(matches!(err, LrsError::Validation { .. }));
    }
}
