//! Domain types for layersync.
//!
//! Features, datasets and the identifiers that tie a layer to its store
//! destination and edit versions. All types are serializable via serde.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::Geometry;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed layer name (the key of a layer definition).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerName(pub String);

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for LayerName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for LayerName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a destination dataset inside the versioned store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationId(pub String);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DestinationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DestinationId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Name of a version in the versioned store.
///
/// Private edit versions are named `<layer>_<unixtime>`; the trunk is
/// always [`VersionName::TRUNK`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionName(pub String);

impl VersionName {
    pub const TRUNK: &'static str = "DEFAULT";

    pub fn trunk() -> Self {
        Self(Self::TRUNK.to_owned())
    }

    /// `<layer>_<unixtime>` for an update attempt started at `at`.
    pub fn for_layer(layer: &LayerName, at: DateTime<Utc>) -> Self {
        Self(format!("{}_{}", layer.0, at.timestamp()))
    }

    pub fn is_trunk(&self) -> bool {
        self.0 == Self::TRUNK
    }
}

impl fmt::Display for VersionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for VersionName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Spatial reference
// ---------------------------------------------------------------------------

/// A coordinate reference system, identified by its well-known id.
///
/// Two references are equal when their wkids are equal; the name is
/// descriptive only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialRef {
    pub wkid: u32,
    pub name: String,
}

impl SpatialRef {
    pub const WGS84: u32 = 4326;
    pub const WEB_MERCATOR: u32 = 3857;

    pub fn from_wkid(wkid: u32) -> Self {
        let name = match wkid {
            Self::WGS84 => "GCS_WGS_1984".to_owned(),
            Self::WEB_MERCATOR => "WGS_1984_Web_Mercator_Auxiliary_Sphere".to_owned(),
            other => format!("EPSG:{other}"),
        };
        Self { wkid, name }
    }

    pub fn wgs84() -> Self {
        Self::from_wkid(Self::WGS84)
    }

    /// Whether this is the common public reference (WGS 84).
    pub fn is_wgs84(&self) -> bool {
        self.wkid == Self::WGS84
    }
}

impl PartialEq for SpatialRef {
    fn eq(&self, other: &Self) -> bool {
        self.wkid == other.wkid
    }
}

impl Eq for SpatialRef {}

impl fmt::Display for SpatialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.wkid)
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// An attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Storage type of an attribute column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum FieldKind {
    Text { length: u32 },
    Integer,
    Double,
    Boolean,
}

/// Schema entry for an attribute column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl FieldDef {
    pub fn text(name: impl Into<String>, length: u32) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Text { length },
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Features and datasets
// ---------------------------------------------------------------------------

/// A geometry plus attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Feature {
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Feature {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry: Some(geometry),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }

    /// Attribute value, `Null` when the attribute is absent.
    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.attributes.get(field).unwrap_or(&NULL)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(field.into(), value.into());
    }
}

/// A named collection of features sharing a schema and spatial reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub spatial_ref: SpatialRef,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, spatial_ref: SpatialRef) -> Self {
        Self {
            name: name.into(),
            spatial_ref,
            fields: Vec::new(),
            features: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Add `field` to the schema unless a column with that name exists.
    ///
    /// Returns `true` when the column was added. Existing rows are left
    /// untouched; populating the column is a separate step.
    pub fn ensure_field(&mut self, field: FieldDef) -> bool {
        if self.field(&field.name).is_some() {
            return false;
        }
        self.fields.push(field);
        true
    }

    /// Set `field` to `value` on every feature.
    pub fn fill(&mut self, field: &str, value: &Value) {
        for feature in &mut self.features {
            feature.attributes.insert(field.to_owned(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Coord;
    use chrono::TimeZone;

    #[test]
    fn version_name_uses_unix_seconds() {
        let at = Utc.with_ymd_and_hms(2016, 3, 1, 0, 0, 0).unwrap();
        let name = VersionName::for_layer(&LayerName::from("imazon_sad"), at);
        assert_eq!(name.0, "imazon_sad_1456790400");
        assert!(!name.is_trunk());
        assert!(VersionName::trunk().is_trunk());
    }

    #[test]
    fn spatial_ref_equality_ignores_name() {
        let a = SpatialRef::wgs84();
        let b = SpatialRef {
            wkid: 4326,
            name: "WGS 84".into(),
        };
        assert_eq!(a, b);
        assert_ne!(a, SpatialRef::from_wkid(3857));
    }

    #[test]
    fn ensure_field_is_idempotent() {
        let mut ds = Dataset::new("roads", SpatialRef::wgs84());
        assert!(ds.ensure_field(FieldDef::text("country", 3)));
        assert!(!ds.ensure_field(FieldDef::text("country", 3)));
        assert_eq!(ds.fields.len(), 1);
    }

    #[test]
    fn missing_attribute_reads_as_null() {
        let f = Feature::new(Geometry::Point(Coord::new(1.0, 2.0)));
        assert!(f.get("nope").is_null());
    }

    #[test]
    fn value_untagged_json_shape() {
        let f = Feature::default().with("n", 3i64).with("s", "x");
        let json = serde_json::to_string(&f.attributes).unwrap();
        assert_eq!(json, r#"{"n":3,"s":"x"}"#);
    }
}
