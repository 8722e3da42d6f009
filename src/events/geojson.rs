//! GeoJSON FeatureCollection codec for point events.
//!
//! Decoding validates the collection shape (point geometries, a route id
//! property on every feature) and infers property column types from the first
//! non-null value per key: float, integer, boolean, else string. Encoding
//! emits `Point` geometries in `[lon, lat]` order with every non-coordinate
//! column as a property.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, BooleanBuilder, Float32Array, Float64Array,
    Float64Builder, Int32Array, Int64Array, Int64Builder, LargeBinaryArray, LargeStringArray,
    StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Events;
use crate::error::{LrsError, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub collection_type: String,
    pub features: Vec<GeoFeature>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeoFeature {
    #[serde(rename = "type")]
    pub feature_type: String,
    pub geometry: GeoGeometry,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GeoGeometry {
    #[serde(rename = "type")]
    pub geometry_type: String,
    pub coordinates: Vec<f64>,
}

impl Events {
    /// Decode a GeoJSON FeatureCollection into events.
    pub fn from_feature_collection(data: &[u8], crs: impl Into<String>) -> Result<Events> {
        let fc: FeatureCollection = serde_json::from_slice(data)
            .map_err(|e| LrsError::validation(format!("failed to parse feature collection: {}", e)))?;

        if fc.collection_type != "FeatureCollection" {
            return Err(LrsError::validation(format!(
                "expected FeatureCollection, got {}",
                fc.collection_type
            )));
        }
        if fc.features.is_empty() {
            return Err(LrsError::validation("no features in FeatureCollection"));
        }

        let columns = super::EventColumns::default();
        for (i, feature) in fc.features.iter().enumerate() {
            if feature.feature_type != "Feature" {
                return Err(LrsError::validation(format!(
                    "feature {}: expected Feature type, got {}",
                    i, feature.feature_type
                )));
            }
            if feature.geometry.geometry_type != "Point" {
                return Err(LrsError::validation(format!(
                    "feature {}: only Point geometry is supported, got {}",
                    i, feature.geometry.geometry_type
                )));
            }
            if feature.geometry.coordinates.len() < 2 {
                return Err(LrsError::validation(format!(
                    "feature {}: Point must have at least 2 coordinates",
                    i
                )));
            }
            if !feature.properties.contains_key(&columns.route_id) {
                return Err(LrsError::validation(format!(
                    "feature {}: missing required {} property",
                    i, columns.route_id
                )));
            }
        }

        // Sorted union of property keys fixes a deterministic schema.
        let mut prop_keys: Vec<String> = fc
            .features
            .iter()
            .flat_map(|f| f.properties.keys().cloned())
            .collect();
        prop_keys.sort();
        prop_keys.dedup();
        prop_keys.retain(|k| *k != columns.lat && *k != columns.lon);

        let mut fields = vec![
            Field::new(columns.lat.as_str(), DataType::Float64, false),
            Field::new(columns.lon.as_str(), DataType::Float64, false),
        ];
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(prop_keys.len() + 2);

        // Coordinates are serialized [lon, lat].
        let mut lat_builder = Float64Builder::new();
        let mut lon_builder = Float64Builder::new();
        for feature in &fc.features {
            lon_builder.append_value(feature.geometry.coordinates[0]);
            lat_builder.append_value(feature.geometry.coordinates[1]);
        }
        arrays.push(Arc::new(lat_builder.finish()) as ArrayRef);
        arrays.push(Arc::new(lon_builder.finish()) as ArrayRef);

        for key in &prop_keys {
            let data_type = infer_property_type(&fc, key);
            arrays.push(build_property_array(&fc, key, &data_type));
            fields.push(Field::new(key.as_str(), data_type, true));
        }

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
        Events::from_batches_with(vec![batch], crs, columns)
    }

    /// Serialize the events back into a GeoJSON FeatureCollection.
    pub fn to_feature_collection(&self) -> Result<Vec<u8>> {
        if self.records.is_empty() {
            return Err(LrsError::validation("no records to serialize"));
        }

        let mut features = Vec::new();
        for batch in &self.records {
            let schema = batch.schema();
            let lat_idx = schema
                .column_with_name(&self.columns.lat)
                .ok_or_else(|| {
                    LrsError::validation(format!("{} column not found in records", self.columns.lat))
                })?
                .0;
            let lon_idx = schema
                .column_with_name(&self.columns.lon)
                .ok_or_else(|| {
                    LrsError::validation(format!("{} column not found in records", self.columns.lon))
                })?
                .0;

            for row in 0..batch.num_rows() {
                let lat = column_f64(batch.column(lat_idx), row).ok_or_else(|| {
                    LrsError::validation(format!("null or non-numeric {} at row {}", self.columns.lat, row))
                })?;
                let lon = column_f64(batch.column(lon_idx), row).ok_or_else(|| {
                    LrsError::validation(format!("null or non-numeric {} at row {}", self.columns.lon, row))
                })?;

                let mut properties = serde_json::Map::new();
                for col in 0..batch.num_columns() {
                    if col == lat_idx || col == lon_idx {
                        continue;
                    }
                    if let Some(value) = column_value(batch.column(col), row) {
                        properties.insert(schema.field(col).name().clone(), value);
                    }
                }

                features.push(GeoFeature {
                    feature_type: "Feature".to_string(),
                    geometry: GeoGeometry {
                        geometry_type: "Point".to_string(),
                        coordinates: vec![lon, lat],
                    },
                    properties,
                });
            }
        }

        let fc = FeatureCollection {
            collection_type: "FeatureCollection".to_string(),
            features,
        };
        Ok(serde_json::to_vec_pretty(&fc)?)
    }
}

/// Infer a property's column type from its first non-null value.
fn infer_property_type(fc: &FeatureCollection, key: &str) -> DataType {
    for feature in &fc.features {
        match feature.properties.get(key) {
            Some(Value::Number(n)) => {
                return if n.is_i64() {
                    DataType::Int64
                } else {
                    DataType::Float64
                };
            }
            Some(Value::Bool(_)) => return DataType::Boolean,
            Some(Value::String(_)) => return DataType::Utf8,
            Some(Value::Null) | None => continue,
            Some(_) => return DataType::Utf8,
        }
    }
    DataType::Utf8
}

fn build_property_array(fc: &FeatureCollection, key: &str, data_type: &DataType) -> ArrayRef {
    match data_type {
        DataType::Float64 => {
            let mut builder = Float64Builder::new();
            for feature in &fc.features {
                match feature.properties.get(key).and_then(Value::as_f64) {
                    Some(v) => builder.append_value(v),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Int64 => {
            let mut builder = Int64Builder::new();
            for feature in &fc.features {
                let value = feature
                    .properties
                    .get(key)
                    .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)));
                match value {
                    Some(v) => builder.append_value(v),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::new();
            for feature in &fc.features {
                match feature.properties.get(key).and_then(Value::as_bool) {
                    Some(v) => builder.append_value(v),
                    None => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        _ => {
            let mut builder = StringBuilder::new();
            for feature in &fc.features {
                match feature.properties.get(key) {
                    Some(Value::Null) | None => builder.append_null(),
                    Some(Value::String(s)) => builder.append_value(s),
                    Some(other) => builder.append_value(other.to_string()),
                }
            }
            Arc::new(builder.finish())
        }
    }
}

/// Read a numeric cell as f64.
fn column_f64(column: &ArrayRef, row: usize) -> Option<f64> {
    if column.is_null(row) {
        return None;
    }
    let any = column.as_any();
    if let Some(arr) = any.downcast_ref::<Float64Array>() {
        Some(arr.value(row))
    } else if let Some(arr) = any.downcast_ref::<Float32Array>() {
        Some(arr.value(row) as f64)
    } else if let Some(arr) = any.downcast_ref::<Int64Array>() {
        Some(arr.value(row) as f64)
    } else if let Some(arr) = any.downcast_ref::<Int32Array>() {
        Some(arr.value(row) as f64)
    } else {
        None
    }
}

/// Read a cell as a JSON value; `None` for nulls and unsupported types.
fn column_value(column: &ArrayRef, row: usize) -> Option<Value> {
    if column.is_null(row) {
        return None;
    }
    let any = column.as_any();
    if let Some(arr) = any.downcast_ref::<Float64Array>() {
        serde_json::Number::from_f64(arr.value(row)).map(Value::Number)
    } else if let Some(arr) = any.downcast_ref::<Float32Array>() {
        serde_json::Number::from_f64(arr.value(row) as f64).map(Value::Number)
    } else if let Some(arr) = any.downcast_ref::<Int64Array>() {
        Some(Value::Number(arr.value(row).into()))
    } else if let Some(arr) = any.downcast_ref::<Int32Array>() {
        Some(Value::Number(arr.value(row).into()))
    } else if let Some(arr) = any.downcast_ref::<StringArray>() {
        Some(Value::String(arr.value(row).to_string()))
    } else if let Some(arr) = any.downcast_ref::<LargeStringArray>() {
        Some(Value::String(arr.value(row).to_string()))
    } else if let Some(arr) = any.downcast_ref::<BooleanArray>() {
        Some(Value::Bool(arr.value(row)))
    } else if let Some(arr) = any.downcast_ref::<BinaryArray>() {
        Some(Value::String(
            String::from_utf8_lossy(arr.value(row)).into_owned(),
        ))
    } else if let Some(arr) = any.downcast_ref::<LargeBinaryArray>() {
        Some(Value::String(
            String::from_utf8_lossy(arr.value(row)).into_owned(),
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{Geometry, WGS84};

    const SAMPLE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [95.421, 5.6478]},
                "properties": {"route_id": "01001", "speed": 42.5, "lane": 2, "paved": true, "name": "sta-1"}
            },
            {
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [95.430, 5.6490]},
                "properties": {"route_id": "01002", "speed": null, "lane": 3, "paved": false, "name": "sta-2"}
            }
        ]
    }"#;

    #[test]
    fn test_decode_feature_collection() {
        let events = Events::from_feature_collection(SAMPLE.as_bytes(), WGS84).expect("decode");
        let batch = &events.records()[0];
        assert_eq!(batch.num_rows(), 2);

        let schema = batch.schema();
        // Coordinates are [lon, lat] on the wire.
        let lat_idx = schema.column_with_name("lat").unwrap().0;
        let lats = batch
            .column(lat_idx)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(lats.value(0), 5.6478);

        // Type inference per property: float, integer, boolean, string.
        let field = |name: &str| schema.field(schema.column_with_name(name).unwrap().0).clone();
        assert_eq!(field("speed").data_type(), &DataType::Float64);
        assert_eq!(field("lane").data_type(), &DataType::Int64);
        assert_eq!(field("paved").data_type(), &DataType::Boolean);
        assert_eq!(field("name").data_type(), &DataType::Utf8);

        assert_eq!(events.route_ids(), vec!["01001", "01002"]);
    }

    #[test]
    fn test_round_trip_preserves_properties() {
        let events = Events::from_feature_collection(SAMPLE.as_bytes(), WGS84).expect("decode");
        let encoded = events.to_feature_collection().expect("encode");
        let fc: FeatureCollection = serde_json::from_slice(&encoded).expect("reparse");

        assert_eq!(fc.collection_type, "FeatureCollection");
        assert_eq!(fc.features.len(), 2);

        let first = &fc.features[0];
        assert_eq!(first.geometry.coordinates, vec![95.421, 5.6478]);
        assert_eq!(first.properties["route_id"], Value::String("01001".into()));
        assert_eq!(first.properties["lane"], Value::Number(2.into()));
        assert_eq!(first.properties["paved"], Value::Bool(true));

        // Null properties are omitted rather than serialized as null.
        assert!(!fc.features[1].properties.contains_key("speed"));
    }

    #[test]
    fn test_reject_non_collection() {
        let doc = r#"{"type": "Feature", "features": []}"#;
        let err = Events::from_feature_collection(doc.as_bytes(), WGS84).unwrap_err();
        assert!(err.to_string().contains("FeatureCollection"));
    }

    #[test]
    fn test_reject_empty_features() {
        let doc = r#"{"type": "FeatureCollection", "features": []}"#;
        assert!(Events::from_feature_collection(doc.as_bytes(), WGS84).is_err());
    }

    #[test]
    fn test_reject_non_point_geometry() {
        let doc = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {"type": "LineString", "coordinates": [1.0, 2.0]},
                "properties": {"route_id": "01001"}
            }]
        }"#;
        let err = Events::from_feature_collection(doc.as_bytes(), WGS84).unwrap_err();
        assert!(err.to_string().contains("Point"));
    }

    #[test]
    fn test_reject_missing_route_id() {
        let doc = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
                "properties": {"speed": 10}
            }]
        }"#;
        let err = Events::from_feature_collection(doc.as_bytes(), WGS84).unwrap_err();
        assert!(err.to_string().contains("route_id"));
    }

    #[test]
    fn test_reject_short_coordinates() {
        let doc = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [1.0]},
                "properties": {"route_id": "01001"}
            }]
        }"#;
        let err = Events::from_feature_collection(doc.as_bytes(), WGS84).unwrap_err();
        assert!(err.to_string().contains("at least 2"));
    }
}
