//! SQLite adapter: metric source, screen execution and alert store.

use crate::domain::alert::{Alert, AlertEvent, AlertSummary, NewAlert, TriggerOutcome};
use crate::domain::condition::{Operator, Scalar};
use crate::domain::config_validation::validate_sqlite_config;
use crate::domain::error::ScreenwatchError;
use crate::domain::field_registry::{FieldRegistry, FieldSpec, SchemaLayout, ValueType};
use crate::domain::instrument::Instrument;
use crate::domain::sql_compiler::{ScreenQuery, SqlParam};
use crate::ports::alert_store_port::AlertStorePort;
use crate::ports::config_port::ConfigPort;
use crate::ports::metric_port::MetricPort;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, TransactionBehavior};
use std::time::Duration;
use tracing::debug;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
    layout: SchemaLayout,
}

fn pool_err(e: r2d2::Error) -> ScreenwatchError {
    ScreenwatchError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> ScreenwatchError {
    ScreenwatchError::DatabaseQuery {
        reason: e.to_string(),
    }
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, ScreenwatchError> {
        validate_sqlite_config(config)?;
        let db_path = config
            .get_string("sqlite", "path")
            .ok_or_else(|| ScreenwatchError::ConfigMissing {
                section: "sqlite".into(),
                key: "path".into(),
            })?;
        let pool_size = config.get_int("sqlite", "pool_size", 4) as u32;
        let busy_timeout = Duration::from_millis(config.get_int("sqlite", "busy_timeout_ms", 5000) as u64);

        let manager = SqliteConnectionManager::file(&db_path).with_init(move |c| c.busy_timeout(busy_timeout));
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(manager)
            .map_err(pool_err)?;

        debug!(path = %db_path, pool_size, "opened sqlite pool");
        Ok(Self {
            pool,
            layout: SchemaLayout::default(),
        })
    }

    /// Single-connection pool, so every checkout sees the same database.
    pub fn in_memory() -> Result<Self, ScreenwatchError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(manager)
            .map_err(pool_err)?;

        Ok(Self {
            pool,
            layout: SchemaLayout::default(),
        })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, ScreenwatchError> {
        self.pool.get().map_err(pool_err)
    }

    /// Instrument and metric tables of the built-in registry, plus the
    /// alert tables.
    pub fn initialize_schema(&self) -> Result<(), ScreenwatchError> {
        self.conn()?
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS stocks_master (
                    id INTEGER PRIMARY KEY,
                    symbol TEXT NOT NULL UNIQUE,
                    company_name TEXT NOT NULL,
                    sector TEXT,
                    exchange TEXT
                );
                CREATE TABLE IF NOT EXISTS fundamentals (
                    stock_id INTEGER PRIMARY KEY REFERENCES stocks_master(id),
                    pe_ratio REAL,
                    peg_ratio REAL,
                    debt REAL,
                    free_cash_flow REAL
                );
                CREATE TABLE IF NOT EXISTS analyst_targets (
                    stock_id INTEGER PRIMARY KEY REFERENCES stocks_master(id),
                    target_price_low REAL,
                    target_price_high REAL,
                    current_market_price REAL
                );
                CREATE TABLE IF NOT EXISTS quarterly_financials (
                    stock_id INTEGER NOT NULL REFERENCES stocks_master(id),
                    year INTEGER NOT NULL,
                    quarter INTEGER NOT NULL,
                    revenue REAL,
                    ebitda REAL,
                    net_profit REAL,
                    PRIMARY KEY (stock_id, year, quarter)
                );
                CREATE TABLE IF NOT EXISTS alerts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    field TEXT NOT NULL,
                    operator TEXT NOT NULL,
                    threshold REAL NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS alert_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    alert_id INTEGER NOT NULL,
                    instrument_id INTEGER NOT NULL,
                    triggered_value REAL NOT NULL,
                    triggered_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_alert_events_alert ON alert_events(alert_id);
                CREATE TABLE IF NOT EXISTS alert_trigger_state (
                    alert_id INTEGER NOT NULL,
                    instrument_id INTEGER NOT NULL,
                    triggered_at TEXT NOT NULL,
                    PRIMARY KEY (alert_id, instrument_id)
                );",
            )
            .map_err(query_err)
    }

    pub fn insert_instrument(&self, instrument: &Instrument) -> Result<(), ScreenwatchError> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}, symbol, company_name) VALUES (?1, ?2, ?3)",
            self.layout.instrument_table, self.layout.instrument_key
        );
        self.conn()?
            .execute(&sql, params![instrument.id, instrument.symbol, instrument.company_name])
            .map_err(query_err)?;
        Ok(())
    }

    /// Upserts one snapshot value. `field` is looked up in `registry`.
    pub fn set_snapshot_value(
        &self,
        registry: &FieldRegistry,
        instrument_id: i64,
        field: &str,
        value: &Scalar,
    ) -> Result<(), ScreenwatchError> {
        let spec = seed_field(registry, field)?;
        let value = to_sql_value(&SqlParam::from(value));
        let sql = if spec.table == self.layout.instrument_table {
            format!(
                "UPDATE {} SET {} = ?2 WHERE {} = ?1",
                spec.table, spec.column, self.layout.instrument_key
            )
        } else {
            format!(
                "INSERT INTO {table} ({fk}, {col}) VALUES (?1, ?2) \
                 ON CONFLICT ({fk}) DO UPDATE SET {col} = excluded.{col}",
                table = spec.table,
                fk = self.layout.foreign_key,
                col = spec.column
            )
        };
        self.conn()?
            .execute(&sql, params![instrument_id, value])
            .map_err(query_err)?;
        Ok(())
    }

    /// Upserts one period of a time-series field. `period` lists the period
    /// column values in layout order (year, quarter); `None` stores NULL.
    pub fn insert_period_value(
        &self,
        registry: &FieldRegistry,
        instrument_id: i64,
        field: &str,
        period: &[i64],
        value: Option<f64>,
    ) -> Result<(), ScreenwatchError> {
        let spec = seed_field(registry, field)?;
        let columns = &self.layout.period_columns;
        if !spec.is_time_series() || period.len() != columns.len() {
            return Err(ScreenwatchError::DatabaseQuery {
                reason: format!(
                    "'{field}' needs a time-series field and {} period values",
                    columns.len()
                ),
            });
        }

        let fk = &self.layout.foreign_key;
        let key_columns = std::iter::once(fk.as_str())
            .chain(columns.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len() + 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {table} ({key_columns}, {col}) VALUES ({placeholders}) \
             ON CONFLICT ({key_columns}) DO UPDATE SET {col} = excluded.{col}",
            table = spec.table,
            col = spec.column
        );

        let mut values = vec![Value::Integer(instrument_id)];
        values.extend(period.iter().map(|p| Value::Integer(*p)));
        values.push(value.map(Value::Real).unwrap_or(Value::Null));

        self.conn()?
            .execute(&sql, params_from_iter(values))
            .map_err(query_err)?;
        Ok(())
    }

    /// Executes a statement from `build_screen_query`.
    pub fn run_screen(&self, query: &ScreenQuery) -> Result<Vec<Instrument>, ScreenwatchError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query.sql).map_err(query_err)?;
        let rows = stmt
            .query_map(params_from_iter(query.params.iter().map(to_sql_value)), |row| {
                Ok(Instrument {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    company_name: row.get(2)?,
                })
            })
            .map_err(query_err)?;

        let mut instruments = Vec::new();
        for row in rows {
            instruments.push(row.map_err(query_err)?);
        }
        debug!(rows = instruments.len(), "screen executed");
        Ok(instruments)
    }

    fn key_column<'s>(&'s self, spec: &FieldSpec, layout: &'s SchemaLayout) -> &'s str {
        if spec.table == layout.instrument_table {
            &layout.instrument_key
        } else {
            &layout.foreign_key
        }
    }
}

fn seed_field<'r>(registry: &'r FieldRegistry, field: &str) -> Result<&'r FieldSpec, ScreenwatchError> {
    registry.get(field).ok_or_else(|| ScreenwatchError::DatabaseQuery {
        reason: format!("unknown field '{field}'"),
    })
}

fn to_sql_value(param: &SqlParam) -> Value {
    match param {
        SqlParam::Integer(i) => Value::Integer(*i),
        SqlParam::Number(n) => Value::Real(*n),
        SqlParam::Text(t) => Value::Text(t.clone()),
        SqlParam::Bool(b) => Value::Integer(i64::from(*b)),
    }
}

fn to_scalar(value: Value, value_type: ValueType) -> Option<Scalar> {
    match (value, value_type) {
        (Value::Null, _) => None,
        (Value::Integer(i), ValueType::Boolean) => Some(Scalar::Bool(i != 0)),
        (Value::Integer(i), ValueType::Number) => Some(Scalar::Number(i as f64)),
        (Value::Real(r), ValueType::Number) => Some(Scalar::Number(r)),
        (Value::Text(t), ValueType::String) => Some(Scalar::Text(t)),
        (Value::Text(t), ValueType::Number) => t.trim().parse().ok().map(Scalar::Number),
        _ => None,
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, text: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn alert_from_row(row: &rusqlite::Row<'_>) -> Result<Alert, rusqlite::Error> {
    let token: String = row.get(2)?;
    let operator = Operator::from_token(&token).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown operator '{token}'").into(),
        )
    })?;
    Ok(Alert {
        id: row.get(0)?,
        field: row.get(1)?,
        operator,
        threshold: row.get(3)?,
        active: row.get(4)?,
    })
}

const ALERT_COLUMNS: &str = "id, field, operator, threshold, active";

impl MetricPort for SqliteAdapter {
    fn list_instruments(&self) -> Result<Vec<Instrument>, ScreenwatchError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {key}, symbol, company_name FROM {table} ORDER BY {key}",
            key = self.layout.instrument_key,
            table = self.layout.instrument_table
        );
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Instrument {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    company_name: row.get(2)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn latest_value(
        &self,
        instrument_id: i64,
        field: &FieldSpec,
        layout: &SchemaLayout,
    ) -> Result<Option<Scalar>, ScreenwatchError> {
        if field.is_time_series() {
            let mut recent = self.recent_values(instrument_id, field, layout, 1)?;
            return Ok(recent.pop().flatten());
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            field.column,
            field.table,
            self.key_column(field, layout)
        );
        let value: Option<Value> = self
            .conn()?
            .query_row(&sql, params![instrument_id], |row| row.get(0))
            .optional()
            .map_err(query_err)?;
        Ok(value.and_then(|v| to_scalar(v, field.value_type)))
    }

    fn recent_values(
        &self,
        instrument_id: i64,
        field: &FieldSpec,
        layout: &SchemaLayout,
        periods: usize,
    ) -> Result<Vec<Option<Scalar>>, ScreenwatchError> {
        let order = layout
            .period_columns
            .iter()
            .map(|c| format!("{c} DESC"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY {order} LIMIT ?2",
            field.column, field.table, layout.foreign_key
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(params![instrument_id, periods as i64], |row| row.get::<_, Value>(0))
            .map_err(query_err)?;

        let mut values = Vec::new();
        for row in rows {
            values.push(to_scalar(row.map_err(query_err)?, field.value_type));
        }
        Ok(values)
    }
}

impl AlertStorePort for SqliteAdapter {
    fn create_alert(&self, alert: &NewAlert) -> Result<Alert, ScreenwatchError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alerts (field, operator, threshold, active, created_at) VALUES (?1, ?2, ?3, 1, ?4)",
            params![
                alert.field,
                alert.operator.token(),
                alert.threshold,
                format_timestamp(Utc::now())
            ],
        )
        .map_err(query_err)?;
        Ok(Alert {
            id: conn.last_insert_rowid(),
            field: alert.field.clone(),
            operator: alert.operator,
            threshold: alert.threshold,
            active: true,
        })
    }

    fn get_alert(&self, alert_id: i64) -> Result<Option<Alert>, ScreenwatchError> {
        self.conn()?
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                params![alert_id],
                alert_from_row,
            )
            .optional()
            .map_err(query_err)
    }

    fn list_alerts(&self) -> Result<Vec<AlertSummary>, ScreenwatchError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT a.id, a.field, a.operator, a.threshold, a.active,
                        COUNT(e.id), MAX(e.triggered_at)
                 FROM alerts a LEFT JOIN alert_events e ON e.alert_id = a.id
                 GROUP BY a.id ORDER BY a.id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                let last: Option<String> = row.get(6)?;
                Ok(AlertSummary {
                    alert: alert_from_row(row)?,
                    trigger_count: row.get::<_, i64>(5)? as u64,
                    last_triggered: last.as_deref().map(|t| parse_timestamp(6, t)).transpose()?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn active_alerts(&self) -> Result<Vec<Alert>, ScreenwatchError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE active = 1 ORDER BY id"))
            .map_err(query_err)?;
        let rows = stmt.query_map([], alert_from_row).map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn deactivate_alert(&self, alert_id: i64) -> Result<(), ScreenwatchError> {
        let changed = self
            .conn()?
            .execute("UPDATE alerts SET active = 0 WHERE id = ?1", params![alert_id])
            .map_err(query_err)?;
        if changed == 0 {
            return Err(ScreenwatchError::AlertNotFound { alert_id });
        }
        Ok(())
    }

    fn delete_alert(&self, alert_id: i64) -> Result<(), ScreenwatchError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        tx.execute("DELETE FROM alert_events WHERE alert_id = ?1", params![alert_id])
            .map_err(query_err)?;
        tx.execute("DELETE FROM alert_trigger_state WHERE alert_id = ?1", params![alert_id])
            .map_err(query_err)?;
        let deleted = tx
            .execute("DELETE FROM alerts WHERE id = ?1", params![alert_id])
            .map_err(query_err)?;
        if deleted == 0 {
            return Err(ScreenwatchError::AlertNotFound { alert_id });
        }
        tx.commit().map_err(query_err)
    }

    fn record_trigger(
        &self,
        alert_id: i64,
        instrument_id: i64,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<TriggerOutcome, ScreenwatchError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;
        let at_text = format_timestamp(at);

        let claimed = tx
            .execute(
                "INSERT INTO alert_trigger_state (alert_id, instrument_id, triggered_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (alert_id, instrument_id) DO NOTHING",
                params![alert_id, instrument_id, at_text],
            )
            .map_err(query_err)?;
        if claimed == 0 {
            return Ok(TriggerOutcome::AlreadyTriggered);
        }

        tx.execute(
            "INSERT INTO alert_events (alert_id, instrument_id, triggered_value, triggered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![alert_id, instrument_id, value, at_text],
        )
        .map_err(query_err)?;
        tx.commit().map_err(query_err)?;

        Ok(TriggerOutcome::Triggered(AlertEvent {
            alert_id,
            instrument_id,
            triggered_value: value,
            triggered_at: at,
        }))
    }

    fn rearm(&self, alert_id: i64, instrument_id: i64) -> Result<bool, ScreenwatchError> {
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM alert_trigger_state WHERE alert_id = ?1 AND instrument_id = ?2",
                params![alert_id, instrument_id],
            )
            .map_err(query_err)?;
        Ok(removed > 0)
    }

    fn events_for_alert(&self, alert_id: i64) -> Result<Vec<AlertEvent>, ScreenwatchError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT alert_id, instrument_id, triggered_value, triggered_at
                 FROM alert_events WHERE alert_id = ?1 ORDER BY triggered_at, id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![alert_id], |row| {
                let at: String = row.get(3)?;
                Ok(AlertEvent {
                    alert_id: row.get(0)?,
                    instrument_id: row.get(1)?,
                    triggered_value: row.get(2)?,
                    triggered_at: parse_timestamp(3, &at)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }
}
