//! GeoJSON codec for [`Dataset`].
//!
//! Datasets are exchanged as a `FeatureCollection` with two foreign
//! members: a named `crs` carrying the wkid, and `fields` carrying the
//! declared schema so that aliases and text lengths survive a round trip.
//! Files without `fields` get a schema inferred from their properties.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value as Json};

use crate::error::{io_err, GeoJsonError};
use crate::geometry::{Coord, Geometry, Ring};
use crate::types::{Dataset, Feature, FieldDef, FieldKind, SpatialRef, Value};

/// Encode `dataset` as a GeoJSON `FeatureCollection`.
pub fn to_geojson(dataset: &Dataset) -> Json {
    let features: Vec<Json> = dataset
        .features
        .iter()
        .map(|f| {
            json!({
                "type": "Feature",
                "geometry": f.geometry.as_ref().map(geometry_to_json),
                "properties": properties_to_json(&f.attributes),
            })
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "name": dataset.name,
        "crs": {
            "type": "name",
            "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", dataset.spatial_ref.wkid) },
        },
        "fields": dataset.fields,
        "features": features,
    })
}

/// Decode a `FeatureCollection`.
///
/// `default_srs` applies when the document carries no `crs` member.
pub fn from_geojson(
    doc: &Json,
    name: &str,
    default_srs: &SpatialRef,
) -> Result<Dataset, GeoJsonError> {
    if doc.get("type").and_then(Json::as_str) != Some("FeatureCollection") {
        return Err(GeoJsonError::Invalid("expected a FeatureCollection".into()));
    }

    let spatial_ref = match crs_wkid(doc) {
        Some(wkid) => SpatialRef::from_wkid(wkid),
        None => default_srs.clone(),
    };

    let raw_features = doc
        .get("features")
        .and_then(Json::as_array)
        .ok_or_else(|| GeoJsonError::Invalid("missing 'features' array".into()))?;

    let mut features = Vec::with_capacity(raw_features.len());
    for (i, raw) in raw_features.iter().enumerate() {
        let geometry = match raw.get("geometry") {
            None | Some(Json::Null) => None,
            Some(g) => Some(
                geometry_from_json(g)
                    .map_err(|e| GeoJsonError::Invalid(format!("feature {i}: {e}")))?,
            ),
        };
        let attributes = match raw.get("properties") {
            Some(Json::Object(props)) => props
                .iter()
                .map(|(k, v)| (k.clone(), value_from_json(v)))
                .collect(),
            _ => BTreeMap::new(),
        };
        features.push(Feature {
            geometry,
            attributes,
        });
    }

    let fields = match doc.get("fields") {
        Some(f @ Json::Array(_)) => serde_json::from_value(f.clone())?,
        _ => infer_fields(&features),
    };

    Ok(Dataset {
        name: name.to_owned(),
        spatial_ref,
        fields,
        features,
    })
}

/// Read a GeoJSON file. The dataset is named after the file stem.
pub fn read_path(path: &Path, default_srs: &SpatialRef) -> Result<Dataset, GeoJsonError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let doc: Json = serde_json::from_str(&contents)?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    from_geojson(&doc, &name, default_srs)
}

/// Write `dataset` to `path` atomically (`<path>.tmp` then rename).
pub fn write_path(path: &Path, dataset: &Dataset) -> Result<(), GeoJsonError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let json = serde_json::to_string(&to_geojson(dataset))?;
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn crs_wkid(doc: &Json) -> Option<u32> {
    let name = doc.pointer("/crs/properties/name")?.as_str()?;
    let digits = name.rsplit(':').next()?;
    digits.parse().ok()
}

fn coord_json(c: &Coord) -> Json {
    json!([c.x, c.y])
}

fn ring_json(r: &[Coord]) -> Json {
    Json::Array(r.iter().map(coord_json).collect())
}

fn rings_json(rings: &[Ring]) -> Json {
    Json::Array(rings.iter().map(|r| ring_json(r)).collect())
}

fn geometry_to_json(g: &Geometry) -> Json {
    let coordinates = match g {
        Geometry::Point(c) => coord_json(c),
        Geometry::LineString(line) => ring_json(line),
        Geometry::Polygon(rings) => rings_json(rings),
        Geometry::MultiPolygon(polys) => Json::Array(polys.iter().map(|p| rings_json(p)).collect()),
    };
    json!({ "type": g.kind(), "coordinates": coordinates })
}

fn coord_from(v: &Json) -> Result<Coord, String> {
    let arr = v.as_array().ok_or("position is not an array")?;
    match (arr.first().and_then(Json::as_f64), arr.get(1).and_then(Json::as_f64)) {
        (Some(x), Some(y)) => Ok(Coord::new(x, y)),
        _ => Err("position needs two numbers".into()),
    }
}

fn ring_from(v: &Json) -> Result<Ring, String> {
    v.as_array()
        .ok_or("expected an array of positions")?
        .iter()
        .map(coord_from)
        .collect()
}

fn rings_from(v: &Json) -> Result<Vec<Ring>, String> {
    v.as_array()
        .ok_or("expected an array of rings")?
        .iter()
        .map(ring_from)
        .collect()
}

fn geometry_from_json(g: &Json) -> Result<Geometry, String> {
    let kind = g.get("type").and_then(Json::as_str).ok_or("geometry without type")?;
    let coords = g.get("coordinates").ok_or("geometry without coordinates")?;
    match kind {
        "Point" => coord_from(coords).map(Geometry::Point),
        "LineString" => ring_from(coords).map(Geometry::LineString),
        "Polygon" => rings_from(coords).map(Geometry::Polygon),
        "MultiPolygon" => coords
            .as_array()
            .ok_or("expected an array of polygons")?
            .iter()
            .map(rings_from)
            .collect::<Result<Vec<_>, _>>()
            .map(Geometry::MultiPolygon),
        other => Err(format!("unsupported geometry type '{other}'")),
    }
}

fn properties_to_json(attrs: &BTreeMap<String, Value>) -> Json {
    let mut map = Map::new();
    for (k, v) in attrs {
        let j = match v {
            Value::Null => Json::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(x) => json!(x),
            Value::Text(s) => json!(s),
        };
        map.insert(k.clone(), j);
    }
    Json::Object(map)
}

fn value_from_json(v: &Json) -> Value {
    match v {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn infer_fields(features: &[Feature]) -> Vec<FieldDef> {
    let mut fields: Vec<FieldDef> = Vec::new();
    for feature in features {
        for (name, value) in &feature.attributes {
            let kind = match value {
                Value::Null => continue,
                Value::Bool(_) => FieldKind::Boolean,
                Value::Int(_) => FieldKind::Integer,
                Value::Float(_) => FieldKind::Double,
                Value::Text(_) => FieldKind::Text { length: 254 },
            };
            match fields.iter_mut().find(|f| &f.name == name) {
                Some(existing) => {
                    if existing.kind == FieldKind::Integer && kind == FieldKind::Double {
                        existing.kind = FieldKind::Double;
                    }
                }
                None => fields.push(FieldDef {
                    name: name.clone(),
                    kind,
                    alias: None,
                }),
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Dataset {
        let mut ds = Dataset::new("parks", SpatialRef::from_wkid(3857));
        ds.ensure_field(FieldDef::text("gfwid", 64).with_alias("GFW ID"));
        ds.features.push(
            Feature::new(Geometry::Polygon(vec![vec![
                Coord::new(0.0, 0.0),
                Coord::new(1.0, 0.0),
                Coord::new(1.0, 1.0),
                Coord::new(0.0, 0.0),
            ]]))
            .with("gfwid", "abc")
            .with("area", 0.5),
        );
        ds.features.push(Feature::default().with("gfwid", Value::Null));
        ds
    }

    #[test]
    fn file_roundtrip_preserves_schema_and_crs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("parks.geojson");
        let ds = sample();
        write_path(&path, &ds).unwrap();
        let back = read_path(&path, &SpatialRef::wgs84()).unwrap();
        assert_eq!(back, ds);
        assert!(!tmp.path().join("parks.geojson.tmp").exists());
    }

    #[test]
    fn missing_crs_uses_default_and_infers_fields() {
        let doc = json!({
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "geometry": { "type": "Point", "coordinates": [1, 2] },
                  "properties": { "n": 1, "s": "x" } },
                { "type": "Feature", "geometry": null, "properties": { "n": 2.5 } }
            ]
        });
        let ds = from_geojson(&doc, "pts", &SpatialRef::from_wkid(31983)).unwrap();
        assert_eq!(ds.spatial_ref.wkid, 31983);
        assert_eq!(ds.len(), 2);
        assert!(ds.features[1].geometry.is_none());
        assert_eq!(ds.field("n").unwrap().kind, FieldKind::Double);
        assert_eq!(ds.field("s").unwrap().kind, FieldKind::Text { length: 254 });
    }

    #[test]
    fn rejects_non_collections() {
        let doc = json!({ "type": "Feature" });
        assert!(matches!(
            from_geojson(&doc, "x", &SpatialRef::wgs84()),
            Err(GeoJsonError::Invalid(_))
        ));
    }

    #[test]
    fn unsupported_geometry_names_the_feature() {
        let doc = json!({
            "type": "FeatureCollection",
            "features": [{ "type": "Feature", "geometry": { "type": "Circle", "coordinates": [] } }]
        });
        let err = from_geojson(&doc, "x", &SpatialRef::wgs84()).unwrap_err();
        assert!(err.to_string().contains("feature 0"));
    }
}
