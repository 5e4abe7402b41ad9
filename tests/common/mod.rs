#![allow(dead_code)]

use screenwatch::adapters::sqlite_adapter::SqliteAdapter;
use screenwatch::domain::condition::Scalar;
use screenwatch::domain::condition_parser::parse_condition;
use screenwatch::domain::error::ScreenwatchError;
use screenwatch::domain::field_registry::{FieldRegistry, FieldSpec, SchemaLayout};
pub use screenwatch::domain::instrument::Instrument;
use screenwatch::domain::sql_compiler::{build_screen_query, Dialect, SqlCompiler};
use screenwatch::domain::validator::{validate, ValidatedCondition};
use screenwatch::ports::metric_port::MetricPort;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory metric source. Values are per (instrument, field name), most
/// recent first; snapshot fields hold a single value.
pub struct MockMetricPort {
    pub instruments: Vec<Instrument>,
    pub values: Mutex<HashMap<(i64, String), Vec<Option<Scalar>>>>,
    pub errors: HashMap<i64, String>,
}

impl MockMetricPort {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        Self {
            instruments,
            values: Mutex::new(HashMap::new()),
            errors: HashMap::new(),
        }
    }

    pub fn with_value(self, id: i64, field: &str, value: impl Into<Scalar>) -> Self {
        self.set(id, field, value);
        self
    }

    pub fn with_series(self, id: i64, field: &str, values: &[f64]) -> Self {
        self.values.lock().unwrap().insert(
            (id, field.to_string()),
            values.iter().map(|v| Some(Scalar::Number(*v))).collect(),
        );
        self
    }

    pub fn with_error(mut self, id: i64, reason: &str) -> Self {
        self.errors.insert(id, reason.to_string());
        self
    }

    pub fn set(&self, id: i64, field: &str, value: impl Into<Scalar>) {
        self.values
            .lock()
            .unwrap()
            .insert((id, field.to_string()), vec![Some(value.into())]);
    }

    fn fail(&self, id: i64) -> Result<(), ScreenwatchError> {
        match self.errors.get(&id) {
            Some(reason) => Err(ScreenwatchError::DatabaseQuery {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl MetricPort for MockMetricPort {
    fn list_instruments(&self) -> Result<Vec<Instrument>, ScreenwatchError> {
        Ok(self.instruments.clone())
    }

    fn latest_value(
        &self,
        id: i64,
        field: &FieldSpec,
        _layout: &SchemaLayout,
    ) -> Result<Option<Scalar>, ScreenwatchError> {
        self.fail(id)?;
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(&(id, field.name.clone()))
            .and_then(|v| v.first().cloned().flatten()))
    }

    fn recent_values(
        &self,
        id: i64,
        field: &FieldSpec,
        _layout: &SchemaLayout,
        periods: usize,
    ) -> Result<Vec<Option<Scalar>>, ScreenwatchError> {
        self.fail(id)?;
        let mut values = self
            .values
            .lock()
            .unwrap()
            .get(&(id, field.name.clone()))
            .cloned()
            .unwrap_or_default();
        values.truncate(periods);
        Ok(values)
    }
}

pub fn instruments(n: i64) -> Vec<Instrument> {
    (1..=n)
        .map(|id| Instrument::new(id, &format!("SYM{id:02}"), &format!("Company {id}")))
        .collect()
}

pub fn validated(json: Value) -> ValidatedCondition {
    let condition = parse_condition(&json).unwrap();
    validate(condition, FieldRegistry::global()).unwrap()
}

pub fn seeded_sqlite() -> SqliteAdapter {
    let adapter = SqliteAdapter::in_memory().unwrap();
    adapter.initialize_schema().unwrap();
    adapter
}

/// Seeds one instrument with snapshot values.
pub fn seed_instrument(adapter: &SqliteAdapter, id: i64, symbol: &str, snapshot: &[(&str, Scalar)]) {
    let registry = FieldRegistry::global();
    adapter
        .insert_instrument(&Instrument::new(id, symbol, &format!("{symbol} Ltd")))
        .unwrap();
    for (field, value) in snapshot {
        adapter.set_snapshot_value(registry, id, field, value).unwrap();
    }
}

/// Seeds quarterly values oldest first, starting at 2023 Q1.
pub fn seed_quarters(adapter: &SqliteAdapter, id: i64, field: &str, values: &[f64]) {
    let registry = FieldRegistry::global();
    for (i, value) in values.iter().enumerate() {
        let year = 2023 + (i / 4) as i64;
        let quarter = (i % 4) as i64 + 1;
        adapter
            .insert_period_value(registry, id, field, &[year, quarter], Some(*value))
            .unwrap();
    }
}

/// Compiles for SQLite and returns the matching symbols.
pub fn screen_symbols(adapter: &SqliteAdapter, json: Value) -> Vec<String> {
    let registry = FieldRegistry::global();
    let compiled = SqlCompiler::new(registry, Dialect::Sqlite)
        .compile(&validated(json))
        .unwrap();
    let query = build_screen_query(&compiled, registry, None).unwrap();
    adapter
        .run_screen(&query)
        .unwrap()
        .into_iter()
        .map(|i| i.symbol)
        .collect()
}
