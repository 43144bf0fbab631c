//! Update where clause: the delete scope of a delete-then-append update.
//!
//! Built from the merge-key field: the distinct key values present in the
//! source select the destination rows that this update replaces. A layer
//! without a merge key has no clause (`None`), which callers treat as
//! "replace everything".

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WhereClauseError;
use crate::types::{Dataset, Feature, Value};

/// Largest magnitude below which every integer is an exact `f64`.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

/// Quote an SQL identifier, doubling embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `x` as an `i64` when it is integral and exactly representable.
fn exact_int(x: f64) -> Option<i64> {
    (x.is_finite() && x.fract() == 0.0 && x.abs() <= MAX_EXACT_FLOAT).then_some(x as i64)
}

/// A merge-key value. Floats are only accepted when integral and exact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl KeyValue {
    fn from_value(field: &str, value: &Value) -> Result<Option<Self>, WhereClauseError> {
        Ok(match value {
            Value::Null => None,
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Int(i) => Some(KeyValue::Int(*i)),
            Value::Text(s) => Some(KeyValue::Text(s.clone())),
            Value::Float(x) => match exact_int(*x) {
                Some(i) => Some(KeyValue::Int(i)),
                None => {
                    return Err(WhereClauseError::UnsupportedKey {
                        field: field.to_owned(),
                        value: *x,
                    })
                }
            },
        })
    }

    fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (KeyValue::Bool(a), Value::Bool(b)) => a == b,
            (KeyValue::Int(a), Value::Int(b)) => a == b,
            (KeyValue::Int(a), Value::Float(b)) => exact_int(*b) == Some(*a),
            (KeyValue::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }

    fn to_sql(&self) -> String {
        match self {
            KeyValue::Bool(true) => "TRUE".to_owned(),
            KeyValue::Bool(false) => "FALSE".to_owned(),
            KeyValue::Int(i) => i.to_string(),
            KeyValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

/// "Delete every destination row whose `field` is one of `values`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateWhereClause {
    field: String,
    values: BTreeSet<KeyValue>,
}

impl UpdateWhereClause {
    /// Build the clause for `merge_key`, or `None` when no key is configured.
    pub fn build(
        source: &Dataset,
        merge_key: Option<&str>,
    ) -> Result<Option<Self>, WhereClauseError> {
        merge_key.map(|field| Self::from_source(source, field)).transpose()
    }

    /// Collect the distinct, non-null values of `field` in `source`.
    pub fn from_source(source: &Dataset, field: &str) -> Result<Self, WhereClauseError> {
        let declared = source.field(field).is_some();
        let present = source
            .features
            .iter()
            .any(|f| f.attributes.contains_key(field));
        if !declared && !present {
            return Err(WhereClauseError::MissingField {
                field: field.to_owned(),
                dataset: source.name.clone(),
            });
        }

        let mut values = BTreeSet::new();
        for feature in &source.features {
            if let Some(key) = KeyValue::from_value(field, feature.get(field))? {
                values.insert(key);
            }
        }
        Ok(Self {
            field: field.to_owned(),
            values,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn values(&self) -> &BTreeSet<KeyValue> {
        &self.values
    }

    /// A clause with no key values selects nothing.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn matches(&self, feature: &Feature) -> bool {
        let value = feature.get(&self.field);
        self.values.iter().any(|k| k.matches(value))
    }

    /// SQL rendering, e.g. `"state" IN ('AM', 'PA')`.
    pub fn to_sql(&self) -> String {
        if self.values.is_empty() {
            return "1 = 0".to_owned();
        }
        let list: Vec<String> = self.values.iter().map(KeyValue::to_sql).collect();
        format!("{} IN ({})", quote_ident(&self.field), list.join(", "))
    }
}

impl fmt::Display for UpdateWhereClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Coord, Geometry};
    use crate::types::{FieldDef, SpatialRef};

    fn source(states: &[Value]) -> Dataset {
        let mut ds = Dataset::new("imazon_sad", SpatialRef::wgs84());
        ds.ensure_field(FieldDef::text("state", 2));
        for (i, s) in states.iter().enumerate() {
            let mut f = Feature::new(Geometry::Point(Coord::new(i as f64, 0.0)));
            f.set("state", s.clone());
            ds.features.push(f);
        }
        ds
    }

    #[test]
    fn no_merge_key_means_no_clause() {
        let ds = source(&["PA".into()]);
        assert_eq!(UpdateWhereClause::build(&ds, None).unwrap(), None);
    }

    #[test]
    fn distinct_values_are_collected_and_sorted() {
        let ds = source(&["PA".into(), "AM".into(), "PA".into(), Value::Null]);
        let clause = UpdateWhereClause::build(&ds, Some("state")).unwrap().unwrap();
        assert_eq!(clause.values().len(), 2);
        assert_eq!(clause.to_sql(), "\"state\" IN ('AM', 'PA')");
    }

    #[test]
    fn quotes_are_escaped() {
        let ds = source(&["D'Oeste".into()]);
        let clause = UpdateWhereClause::from_source(&ds, "state").unwrap();
        assert_eq!(clause.to_sql(), "\"state\" IN ('D''Oeste')");
    }

    #[test]
    fn empty_source_selects_nothing() {
        let ds = source(&[]);
        let clause = UpdateWhereClause::from_source(&ds, "state").unwrap();
        assert!(clause.is_empty());
        assert_eq!(clause.to_sql(), "1 = 0");
        assert!(!clause.matches(&Feature::default().with("state", "PA")));
    }

    #[test]
    fn missing_field_is_an_error() {
        let ds = source(&["PA".into()]);
        let err = UpdateWhereClause::from_source(&ds, "year").unwrap_err();
        assert!(matches!(err, WhereClauseError::MissingField { .. }));
    }

    #[test]
    fn integral_floats_match_integers() {
        let ds = source(&[Value::Float(2015.0)]);
        let clause = UpdateWhereClause::from_source(&ds, "state").unwrap();
        assert_eq!(clause.to_sql(), "\"state\" IN (2015)");
        assert!(clause.matches(&Feature::default().with("state", 2015i64)));
    }

    #[test]
    fn fractional_float_keys_are_rejected() {
        let ds = source(&[Value::Float(1.5)]);
        assert!(matches!(
            UpdateWhereClause::from_source(&ds, "state"),
            Err(WhereClauseError::UnsupportedKey { .. })
        ));
    }

    #[test]
    fn floats_beyond_exact_integers_are_rejected() {
        for x in [1e20, -1e20, 9_007_199_254_740_994.0] {
            let ds = source(&[Value::Float(x)]);
            assert!(
                matches!(
                    UpdateWhereClause::from_source(&ds, "state"),
                    Err(WhereClauseError::UnsupportedKey { .. })
                ),
                "{x} accepted"
            );
        }

        let ds = source(&[Value::Int(9_007_199_254_740_993)]);
        let clause = UpdateWhereClause::from_source(&ds, "state").unwrap();
        assert!(!clause.matches(&Feature::default().with("state", 9_007_199_254_740_992.0)));
    }

    #[test]
    fn field_names_are_quoted_as_identifiers() {
        let mut ds = Dataset::new("odd", SpatialRef::wgs84());
        ds.features.push(Feature::default().with("say \"hi\"", "PA"));
        let clause = UpdateWhereClause::from_source(&ds, "say \"hi\"").unwrap();
        assert_eq!(clause.to_sql(), "\"say \"\"hi\"\"\" IN ('PA')");
    }
}
