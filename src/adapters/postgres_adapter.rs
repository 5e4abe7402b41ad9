//! PostgreSQL adapter: metric source, screen execution and alert store.

use crate::domain::alert::{Alert, AlertEvent, AlertSummary, NewAlert, TriggerOutcome};
use crate::domain::condition::{Operator, Scalar};
use crate::domain::config_validation::{postgres_connection_string, validate_postgres_config};
use crate::domain::error::ScreenwatchError;
use crate::domain::field_registry::{FieldSpec, SchemaLayout, ValueType};
use crate::domain::instrument::Instrument;
use crate::domain::sql_compiler::{ScreenQuery, SqlParam};
use crate::ports::alert_store_port::AlertStorePort;
use crate::ports::config_port::ConfigPort;
use crate::ports::metric_port::MetricPort;
use chrono::{DateTime, Utc};
use postgres::types::ToSql;
use postgres::{NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use std::time::Duration;
use tracing::debug;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

type Manager = PostgresConnectionManager<NoTls>;

pub struct PostgresAdapter {
    pool: Pool<Manager>,
    layout: SchemaLayout,
}

fn pool_err(e: r2d2::Error) -> ScreenwatchError {
    ScreenwatchError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: postgres::Error) -> ScreenwatchError {
    ScreenwatchError::DatabaseQuery {
        reason: e.to_string(),
    }
}

impl PostgresAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, ScreenwatchError> {
        validate_postgres_config(config)?;
        let connection_string =
            postgres_connection_string(config).ok_or_else(|| ScreenwatchError::ConfigMissing {
                section: "database".into(),
                key: "conninfo".into(),
            })?;
        let pg_config: postgres::Config =
            connection_string
                .parse()
                .map_err(|e: postgres::Error| ScreenwatchError::ConfigInvalid {
                    section: "postgres".into(),
                    key: "connection_string".into(),
                    reason: e.to_string(),
                })?;
        let mut pg_config = pg_config;
        if pg_config.get_connect_timeout().is_none() {
            pg_config.connect_timeout(CONNECTION_TIMEOUT);
        }

        let pool = Pool::builder()
            .max_size(config.get_int("postgres", "pool_size", 4) as u32)
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(PostgresConnectionManager::new(pg_config, NoTls))
            .map_err(pool_err)?;

        Ok(Self {
            pool,
            layout: SchemaLayout::default(),
        })
    }

    fn conn(&self) -> Result<PooledConnection<Manager>, ScreenwatchError> {
        self.pool.get().map_err(pool_err)
    }

    pub fn initialize_schema(&self) -> Result<(), ScreenwatchError> {
        self.conn()?
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS stocks_master (
                    id BIGINT PRIMARY KEY,
                    symbol TEXT NOT NULL UNIQUE,
                    company_name TEXT NOT NULL,
                    sector TEXT,
                    exchange TEXT
                );
                CREATE TABLE IF NOT EXISTS fundamentals (
                    stock_id BIGINT PRIMARY KEY REFERENCES stocks_master(id),
                    pe_ratio DOUBLE PRECISION,
                    peg_ratio DOUBLE PRECISION,
                    debt DOUBLE PRECISION,
                    free_cash_flow DOUBLE PRECISION
                );
                CREATE TABLE IF NOT EXISTS analyst_targets (
                    stock_id BIGINT PRIMARY KEY REFERENCES stocks_master(id),
                    target_price_low DOUBLE PRECISION,
                    target_price_high DOUBLE PRECISION,
                    current_market_price DOUBLE PRECISION
                );
                CREATE TABLE IF NOT EXISTS quarterly_financials (
                    stock_id BIGINT NOT NULL REFERENCES stocks_master(id),
                    year INTEGER NOT NULL,
                    quarter INTEGER NOT NULL,
                    revenue DOUBLE PRECISION,
                    ebitda DOUBLE PRECISION,
                    net_profit DOUBLE PRECISION,
                    PRIMARY KEY (stock_id, year, quarter)
                );
                CREATE TABLE IF NOT EXISTS alerts (
                    id BIGSERIAL PRIMARY KEY,
                    field TEXT NOT NULL,
                    operator TEXT NOT NULL,
                    threshold DOUBLE PRECISION NOT NULL,
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE TABLE IF NOT EXISTS alert_events (
                    id BIGSERIAL PRIMARY KEY,
                    alert_id BIGINT NOT NULL,
                    instrument_id BIGINT NOT NULL,
                    triggered_value DOUBLE PRECISION NOT NULL,
                    triggered_at TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_alert_events_alert ON alert_events(alert_id);
                CREATE TABLE IF NOT EXISTS alert_trigger_state (
                    alert_id BIGINT NOT NULL,
                    instrument_id BIGINT NOT NULL,
                    triggered_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (alert_id, instrument_id)
                );",
            )
            .map_err(query_err)
    }

    pub fn run_screen(&self, query: &ScreenQuery) -> Result<Vec<Instrument>, ScreenwatchError> {
        let boxed: Vec<Box<dyn ToSql + Sync>> = query.params.iter().map(to_sql_param).collect();
        let params: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|p| p.as_ref()).collect();
        let rows = self.conn()?.query(query.sql.as_str(), &params).map_err(query_err)?;
        debug!(rows = rows.len(), "screen executed");
        Ok(rows
            .into_iter()
            .map(|row| Instrument {
                id: row.get(0),
                symbol: row.get(1),
                company_name: row.get(2),
            })
            .collect())
    }

    fn key_column<'s>(&self, spec: &FieldSpec, layout: &'s SchemaLayout) -> &'s str {
        if spec.table == layout.instrument_table {
            &layout.instrument_key
        } else {
            &layout.foreign_key
        }
    }
}

fn to_sql_param(param: &SqlParam) -> Box<dyn ToSql + Sync> {
    match param {
        SqlParam::Integer(i) => Box::new(*i),
        SqlParam::Number(n) => Box::new(*n),
        SqlParam::Text(t) => Box::new(t.clone()),
        SqlParam::Bool(b) => Box::new(*b),
    }
}

fn scalar_at(row: &Row, idx: usize, value_type: ValueType) -> Option<Scalar> {
    match value_type {
        ValueType::Number => row.get::<_, Option<f64>>(idx).map(Scalar::Number),
        ValueType::String => row.get::<_, Option<String>>(idx).map(Scalar::Text),
        ValueType::Boolean => row.get::<_, Option<bool>>(idx).map(Scalar::Bool),
    }
}

fn alert_from_row(row: &Row) -> Result<Alert, ScreenwatchError> {
    let token: String = row.get(2);
    let operator = Operator::from_token(&token).ok_or_else(|| ScreenwatchError::DatabaseQuery {
        reason: format!("unknown operator '{token}' stored for alert"),
    })?;
    Ok(Alert {
        id: row.get(0),
        field: row.get(1),
        operator,
        threshold: row.get(3),
        active: row.get(4),
    })
}

impl MetricPort for PostgresAdapter {
    fn list_instruments(&self) -> Result<Vec<Instrument>, ScreenwatchError> {
        let sql = format!(
            "SELECT {key}, symbol, company_name FROM {table} ORDER BY {key}",
            key = self.layout.instrument_key,
            table = self.layout.instrument_table
        );
        let rows = self.conn()?.query(sql.as_str(), &[]).map_err(query_err)?;
        Ok(rows
            .into_iter()
            .map(|row| Instrument {
                id: row.get(0),
                symbol: row.get(1),
                company_name: row.get(2),
            })
            .collect())
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
            "SELECT {} FROM {} WHERE {} = $1",
            field.column,
            field.table,
            self.key_column(field, layout)
        );
        let row = self
            .conn()?
            .query_opt(sql.as_str(), &[&instrument_id])
            .map_err(query_err)?;
        Ok(row.and_then(|r| scalar_at(&r, 0, field.value_type)))
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
            "SELECT {} FROM {} WHERE {} = $1 ORDER BY {order} LIMIT $2",
            field.column, field.table, layout.foreign_key
        );
        let limit = periods as i64;
        let rows = self
            .conn()?
            .query(sql.as_str(), &[&instrument_id, &limit])
            .map_err(query_err)?;
        Ok(rows.iter().map(|r| scalar_at(r, 0, field.value_type)).collect())
    }
}

impl AlertStorePort for PostgresAdapter {
    fn create_alert(&self, alert: &NewAlert) -> Result<Alert, ScreenwatchError> {
        let row = self
            .conn()?
            .query_one(
                "INSERT INTO alerts (field, operator, threshold, active) VALUES ($1, $2, $3, TRUE) RETURNING id",
                &[&alert.field, &alert.operator.token(), &alert.threshold],
            )
            .map_err(query_err)?;
        Ok(Alert {
            id: row.get(0),
            field: alert.field.clone(),
            operator: alert.operator,
            threshold: alert.threshold,
            active: true,
        })
    }

    fn get_alert(&self, alert_id: i64) -> Result<Option<Alert>, ScreenwatchError> {
        let row = self
            .conn()?
            .query_opt(
                "SELECT id, field, operator, threshold, active FROM alerts WHERE id = $1",
                &[&alert_id],
            )
            .map_err(query_err)?;
        row.as_ref().map(alert_from_row).transpose()
    }

    fn list_alerts(&self) -> Result<Vec<AlertSummary>, ScreenwatchError> {
        let rows = self
            .conn()?
            .query(
                "SELECT a.id, a.field, a.operator, a.threshold, a.active,
                        COUNT(e.id), MAX(e.triggered_at)
                 FROM alerts a LEFT JOIN alert_events e ON e.alert_id = a.id
                 GROUP BY a.id ORDER BY a.id",
                &[],
            )
            .map_err(query_err)?;
        rows.iter()
            .map(|row| {
                Ok(AlertSummary {
                    alert: alert_from_row(row)?,
                    trigger_count: row.get::<_, i64>(5) as u64,
                    last_triggered: row.get::<_, Option<DateTime<Utc>>>(6),
                })
            })
            .collect()
    }

    fn active_alerts(&self) -> Result<Vec<Alert>, ScreenwatchError> {
        let rows = self
            .conn()?
            .query(
                "SELECT id, field, operator, threshold, active FROM alerts WHERE active ORDER BY id",
                &[],
            )
            .map_err(query_err)?;
        rows.iter().map(alert_from_row).collect()
    }

    fn deactivate_alert(&self, alert_id: i64) -> Result<(), ScreenwatchError> {
        let changed = self
            .conn()?
            .execute("UPDATE alerts SET active = FALSE WHERE id = $1", &[&alert_id])
            .map_err(query_err)?;
        if changed == 0 {
            return Err(ScreenwatchError::AlertNotFound { alert_id });
        }
        Ok(())
    }

    fn delete_alert(&self, alert_id: i64) -> Result<(), ScreenwatchError> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction().map_err(query_err)?;
        tx.execute("DELETE FROM alert_events WHERE alert_id = $1", &[&alert_id])
            .map_err(query_err)?;
        tx.execute("DELETE FROM alert_trigger_state WHERE alert_id = $1", &[&alert_id])
            .map_err(query_err)?;
        let deleted = tx
            .execute("DELETE FROM alerts WHERE id = $1", &[&alert_id])
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
        let mut tx = conn.transaction().map_err(query_err)?;
        let claimed = tx
            .execute(
                "INSERT INTO alert_trigger_state (alert_id, instrument_id, triggered_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (alert_id, instrument_id) DO NOTHING",
                &[&alert_id, &instrument_id, &at],
            )
            .map_err(query_err)?;
        if claimed == 0 {
            return Ok(TriggerOutcome::AlreadyTriggered);
        }
        tx.execute(
            "INSERT INTO alert_events (alert_id, instrument_id, triggered_value, triggered_at)
             VALUES ($1, $2, $3, $4)",
            &[&alert_id, &instrument_id, &value, &at],
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
                "DELETE FROM alert_trigger_state WHERE alert_id = $1 AND instrument_id = $2",
                &[&alert_id, &instrument_id],
            )
            .map_err(query_err)?;
        Ok(removed > 0)
    }

    fn events_for_alert(&self, alert_id: i64) -> Result<Vec<AlertEvent>, ScreenwatchError> {
        let rows = self
            .conn()?
            .query(
                "SELECT alert_id, instrument_id, triggered_value, triggered_at
                 FROM alert_events WHERE alert_id = $1 ORDER BY triggered_at, id",
                &[&alert_id],
            )
            .map_err(query_err)?;
        Ok(rows
            .iter()
            .map(|row| AlertEvent {
                alert_id: row.get(0),
                instrument_id: row.get(1),
                triggered_value: row.get(2),
                triggered_at: row.get(3),
            })
            .collect())
    }
}
