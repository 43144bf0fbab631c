//! Remote tabular mirror of a committed layer.
//!
//! [`SqlApiMirror`] talks to a SQL-over-HTTP endpoint: every statement is a
//! `POST` of `{"q": <sql>, "api_key": <key>}`. A sync deletes the rows the
//! update replaced (or truncates the table) and inserts the committed rows
//! the same clause selects, in batches.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value as Json};
use tracing::debug;

use layersync_core::{quote_ident, Dataset, MirrorSettings, UpdateWhereClause, Value};

use crate::error::MirrorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorReceipt {
    /// Rows the endpoint reported deleted, when it reports a count.
    pub deleted: Option<u64>,
    pub inserted: u64,
}

pub trait RemoteMirror {
    /// Replace the rows of `table` selected by `delete` (all rows when
    /// `None`) with the rows of `dataset` selected by the same clause.
    fn sync(
        &self,
        dataset: &Dataset,
        table: &str,
        delete: Option<&UpdateWhereClause>,
    ) -> Result<MirrorReceipt, MirrorError>;
}

/// Rows of `dataset` selected by `clause`; every row when `None`.
pub fn selected_rows<'d>(dataset: &'d Dataset, clause: Option<&UpdateWhereClause>) -> Cow<'d, Dataset> {
    match clause {
        None => Cow::Borrowed(dataset),
        Some(clause) => {
            let mut selected = dataset.clone();
            selected.features.retain(|f| clause.matches(f));
            Cow::Owned(selected)
        }
    }
}

// ---------------------------------------------------------------------------
// SQL rendering
// ---------------------------------------------------------------------------

pub const DEFAULT_BATCH_SIZE: usize = 500;
const GEOMETRY_COLUMN: &str = "the_geom";

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Bool(true) => "TRUE".to_owned(),
        Value::Bool(false) => "FALSE".to_owned(),
        Value::Int(i) => i.to_string(),
        Value::Float(x) if x.is_finite() => x.to_string(),
        Value::Float(_) => "NULL".to_owned(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

/// `DELETE ... WHERE <clause>`, or `TRUNCATE` when there is no clause.
pub fn delete_statement(table: &str, clause: Option<&UpdateWhereClause>) -> String {
    match clause {
        Some(c) => format!("DELETE FROM {} WHERE {}", quote_ident(table), c.to_sql()),
        None => format!("TRUNCATE TABLE {}", quote_ident(table)),
    }
}

/// Multi-row `INSERT` statements of at most `batch_size` rows each.
pub fn insert_statements(table: &str, dataset: &Dataset, batch_size: usize) -> Vec<String> {
    let mut columns: Vec<&str> = dataset.fields.iter().map(|f| f.name.as_str()).collect();
    let extra: BTreeSet<&str> = dataset
        .features
        .iter()
        .flat_map(|f| f.attributes.keys().map(String::as_str))
        .filter(|k| !columns.contains(k))
        .collect();
    columns.extend(extra);
    columns.retain(|c| *c != GEOMETRY_COLUMN);

    let header: Vec<String> = std::iter::once(GEOMETRY_COLUMN)
        .chain(columns.iter().copied())
        .map(quote_ident)
        .collect();
    let wkid = dataset.spatial_ref.wkid;

    dataset
        .features
        .chunks(batch_size.max(1))
        .map(|batch| {
            let rows: Vec<String> = batch
                .iter()
                .map(|f| {
                    let geom = f.geometry.as_ref().map_or_else(
                        || "NULL".to_owned(),
                        |g| format!("ST_SetSRID(ST_GeomFromText('{}'), {wkid})", g.to_wkt()),
                    );
                    let values = std::iter::once(geom)
                        .chain(columns.iter().map(|c| sql_literal(f.get(c))));
                    format!("({})", values.collect::<Vec<_>>().join(", "))
                })
                .collect();
            format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(table),
                header.join(", "),
                rows.join(", ")
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP mirror
// ---------------------------------------------------------------------------

pub struct SqlApiMirror {
    endpoint: String,
    api_key: String,
    batch_size: usize,
    agent: ureq::Agent,
}

impl SqlApiMirror {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(120))
                .build(),
        }
    }

    /// Build from settings, reading the API key from the configured
    /// environment variable.
    pub fn from_settings(settings: &MirrorSettings) -> Result<Self, MirrorError> {
        let key = std::env::var(&settings.api_key_env)
            .map_err(|_| MirrorError::MissingApiKey(settings.api_key_env.clone()))?;
        Ok(Self::new(&settings.endpoint, key))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn execute(&self, sql: &str) -> Result<Json, MirrorError> {
        debug!(endpoint = %self.endpoint, bytes = sql.len(), "mirror statement");
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(json!({ "q": sql, "api_key": self.api_key }))
            .map_err(|e| match e {
                ureq::Error::Status(status, resp) => MirrorError::Http {
                    status,
                    body: resp.into_string().unwrap_or_default(),
                },
                ureq::Error::Transport(t) => MirrorError::Transport(t.to_string()),
            })?;
        response
            .into_json::<Json>()
            .map_err(|e| MirrorError::Response(e.to_string()))
    }
}

impl RemoteMirror for SqlApiMirror {
    fn sync(
        &self,
        dataset: &Dataset,
        table: &str,
        delete: Option<&UpdateWhereClause>,
    ) -> Result<MirrorReceipt, MirrorError> {
        let rows = selected_rows(dataset, delete);
        let reply = self.execute(&delete_statement(table, delete))?;
        let deleted = reply.get("total_rows").and_then(Json::as_u64);

        for statement in insert_statements(table, &rows, self.batch_size) {
            self.execute(&statement)?;
        }
        Ok(MirrorReceipt {
            deleted,
            inserted: rows.len() as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Recording mirror
// ---------------------------------------------------------------------------

/// A sync as seen by [`RecordingMirror`].
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorCall {
    pub table: String,
    pub delete: Option<UpdateWhereClause>,
    pub rows: usize,
}

/// In-memory mirror that records each sync, for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingMirror {
    calls: Mutex<Vec<MirrorCall>>,
    fail_with: Option<String>,
}

impl RecordingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mirror whose every sync fails as unreachable.
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            calls: Mutex::default(),
            fail_with: Some(reason.into()),
        }
    }

    pub fn calls(&self) -> Vec<MirrorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl RemoteMirror for RecordingMirror {
    fn sync(
        &self,
        dataset: &Dataset,
        table: &str,
        delete: Option<&UpdateWhereClause>,
    ) -> Result<MirrorReceipt, MirrorError> {
        if let Some(reason) = &self.fail_with {
            return Err(MirrorError::Transport(reason.clone()));
        }
        let mut calls = self
            .calls
            .lock()
            .map_err(|_| MirrorError::Transport("recording lock poisoned".into()))?;
        let rows = selected_rows(dataset, delete).len();
        calls.push(MirrorCall {
            table: table.to_owned(),
            delete: delete.cloned(),
            rows,
        });
        Ok(MirrorReceipt {
            deleted: None,
            inserted: rows as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layersync_core::{Coord, Feature, FieldDef, Geometry, SpatialRef};

    fn dataset(n: usize) -> Dataset {
        let mut ds = Dataset::new("sad", SpatialRef::wgs84());
        ds.ensure_field(FieldDef::text("state", 2));
        for i in 0..n {
            ds.features.push(
                Feature::new(Geometry::Point(Coord::new(i as f64, 0.5)))
                    .with("state", "PA")
                    .with("area_ha", 1.5),
            );
        }
        ds
    }

    #[test]
    fn delete_statement_uses_clause_or_truncates() {
        let ds = dataset(1);
        let clause = UpdateWhereClause::from_source(&ds, "state").unwrap();
        assert_eq!(
            delete_statement("imazon_sad", Some(&clause)),
            "DELETE FROM \"imazon_sad\" WHERE \"state\" IN ('PA')"
        );
        assert_eq!(delete_statement("imazon_sad", None), "TRUNCATE TABLE \"imazon_sad\"");
    }

    #[test]
    fn inserts_are_batched_with_geometry_first() {
        let statements = insert_statements("sad", &dataset(5), 2);
        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[2],
            "INSERT INTO \"sad\" (\"the_geom\", \"state\", \"area_ha\") VALUES \
             (ST_SetSRID(ST_GeomFromText('POINT (4 0.5)'), 4326), 'PA', 1.5)"
        );
    }

    #[test]
    fn only_rows_in_the_clause_are_sent() {
        let mut ds = dataset(2);
        ds.features
            .push(Feature::new(Geometry::Point(Coord::new(9.0, 9.0))).with("state", "AM"));
        let mut scope = dataset(1);
        scope.features[0].set("state", "AM");
        let clause = UpdateWhereClause::from_source(&scope, "state").unwrap();

        let mirror = RecordingMirror::new();
        let receipt = mirror.sync(&ds, "sad", Some(&clause)).unwrap();
        assert_eq!(receipt.inserted, 1);
        assert_eq!(mirror.calls()[0].delete.as_ref(), Some(&clause));
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(sql_literal(&Value::from("D'Oeste")), "'D''Oeste'");
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&Value::Float(f64::NAN)), "NULL");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn recording_mirror_records_and_fails_on_demand() {
        let ok = RecordingMirror::new();
        ok.sync(&dataset(3), "sad", None).unwrap();
        assert_eq!(ok.calls()[0].rows, 3);

        let down = RecordingMirror::unreachable("connection refused");
        assert!(matches!(
            down.sync(&dataset(1), "sad", None),
            Err(MirrorError::Transport(_))
        ));
        assert!(down.calls().is_empty());
    }

    #[test]
    fn missing_api_key_env_is_reported() {
        let settings = MirrorSettings {
            endpoint: "https://example.invalid/api/v2/sql".into(),
            api_key_env: "LAYERSYNC_TEST_KEY_THAT_IS_NOT_SET".into(),
        };
        assert!(matches!(
            SqlApiMirror::from_settings(&settings),
            Err(MirrorError::MissingApiKey(_))
        ));
    }
}
