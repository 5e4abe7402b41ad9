//! Configuration validation.
//!
//! Each section is validated before the component that reads it is built.
//! Numeric keys that are present but unparseable are rejected rather than
//! silently replaced by their default.

use crate::domain::alert_evaluator::{EvaluatorConfig, MAX_RETRY_ATTEMPTS};
use crate::domain::condition_eval::DEFAULT_EPSILON;
use crate::domain::error::ScreenwatchError;
use crate::domain::sql_compiler::Dialect;
use crate::domain::validator::{DEFAULT_MAX_DEPTH, MAX_DEPTH_LIMIT};
use crate::ports::config_port::ConfigPort;
use std::time::Duration;

/// `[compiler]` settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerSettings {
    pub dialect: Dialect,
    pub max_depth: usize,
    pub limit: Option<u64>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            dialect: Dialect::Sqlite,
            max_depth: DEFAULT_MAX_DEPTH,
            limit: None,
        }
    }
}

pub fn compiler_settings(config: &dyn ConfigPort) -> Result<CompilerSettings, ScreenwatchError> {
    let dialect = match config.get_string("compiler", "dialect") {
        None => Dialect::Sqlite,
        Some(name) => Dialect::from_name(&name).ok_or_else(|| {
            invalid("compiler", "dialect", format!("unknown dialect '{name}', expected sqlite or postgres"))
        })?,
    };

    let max_depth = int_setting(config, "compiler", "max_depth", DEFAULT_MAX_DEPTH as i64)?;
    if max_depth < 1 || max_depth > MAX_DEPTH_LIMIT as i64 {
        return Err(invalid(
            "compiler",
            "max_depth",
            format!("max_depth must be between 1 and {MAX_DEPTH_LIMIT}"),
        ));
    }

    let limit = match config.get_string("compiler", "limit") {
        None => None,
        Some(_) => {
            let value = int_setting(config, "compiler", "limit", 0)?;
            if value < 1 {
                return Err(invalid("compiler", "limit", "limit must be positive"));
            }
            Some(value as u64)
        }
    };

    Ok(CompilerSettings {
        dialect,
        max_depth: max_depth as usize,
        limit,
    })
}

pub fn evaluator_config(config: &dyn ConfigPort) -> Result<EvaluatorConfig, ScreenwatchError> {
    let workers = int_setting(config, "evaluator", "workers", 4)?;
    if workers < 1 {
        return Err(invalid("evaluator", "workers", "workers must be at least 1"));
    }

    let deadline_secs = int_setting(config, "evaluator", "deadline_secs", 300)?;
    if deadline_secs <= 0 {
        return Err(invalid("evaluator", "deadline_secs", "deadline_secs must be positive"));
    }

    let retry_attempts = int_setting(config, "evaluator", "retry_attempts", 3)?;
    if !(1..=MAX_RETRY_ATTEMPTS as i64).contains(&retry_attempts) {
        return Err(invalid(
            "evaluator",
            "retry_attempts",
            format!("retry_attempts must be between 1 and {MAX_RETRY_ATTEMPTS}"),
        ));
    }

    let retry_base_ms = int_setting(config, "evaluator", "retry_base_ms", 100)?;
    if retry_base_ms < 0 {
        return Err(invalid("evaluator", "retry_base_ms", "retry_base_ms must be non-negative"));
    }

    let epsilon = double_setting(config, "evaluator", "epsilon", DEFAULT_EPSILON)?;
    if !epsilon.is_finite() || epsilon <= 0.0 {
        return Err(invalid("evaluator", "epsilon", "epsilon must be a positive number"));
    }

    Ok(EvaluatorConfig {
        workers: workers as usize,
        deadline: Duration::from_secs(deadline_secs as u64),
        retry_attempts: retry_attempts as u32,
        retry_base: Duration::from_millis(retry_base_ms as u64),
        epsilon,
    })
}

pub fn validate_sqlite_config(config: &dyn ConfigPort) -> Result<(), ScreenwatchError> {
    if config.get_string("sqlite", "path").is_none() {
        return Err(ScreenwatchError::ConfigMissing {
            section: "sqlite".to_string(),
            key: "path".to_string(),
        });
    }
    validate_pool_size(config, "sqlite")?;
    let busy = int_setting(config, "sqlite", "busy_timeout_ms", 5000)?;
    if busy < 0 {
        return Err(invalid("sqlite", "busy_timeout_ms", "busy_timeout_ms must be non-negative"));
    }
    Ok(())
}

pub fn validate_postgres_config(config: &dyn ConfigPort) -> Result<(), ScreenwatchError> {
    if postgres_connection_string(config).is_none() {
        return Err(ScreenwatchError::ConfigMissing {
            section: "database".to_string(),
            key: "conninfo".to_string(),
        });
    }
    validate_pool_size(config, "postgres")
}

/// `[postgres] connection_string`, falling back to `[database] conninfo`.
pub fn postgres_connection_string(config: &dyn ConfigPort) -> Option<String> {
    config
        .get_string("postgres", "connection_string")
        .or_else(|| config.get_string("database", "conninfo"))
}

fn validate_pool_size(config: &dyn ConfigPort, section: &str) -> Result<(), ScreenwatchError> {
    let size = int_setting(config, section, "pool_size", 4)?;
    if !(1..=u32::MAX as i64).contains(&size) {
        return Err(invalid(section, "pool_size", "pool_size must be at least 1"));
    }
    Ok(())
}

fn int_setting(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<i64, ScreenwatchError> {
    match config.get_string(section, key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(section, key, format!("'{raw}' is not an integer"))),
    }
}

fn double_setting(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: f64,
) -> Result<f64, ScreenwatchError> {
    match config.get_string(section, key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid(section, key, format!("'{raw}' is not a number"))),
    }
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> ScreenwatchError {
    ScreenwatchError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    #[test]
    fn compiler_defaults() {
        let settings = compiler_settings(&make_config("")).unwrap();
        assert_eq!(settings, CompilerSettings::default());
    }

    #[test]
    fn compiler_reads_all_keys() {
        let config = make_config("[compiler]\ndialect = PostgreSQL\nmax_depth = 8\nlimit = 50\n");
        let settings = compiler_settings(&config).unwrap();
        assert_eq!(settings.dialect, Dialect::Postgres);
        assert_eq!(settings.max_depth, 8);
        assert_eq!(settings.limit, Some(50));
    }

    #[test]
    fn unknown_dialect_fails() {
        let err = compiler_settings(&make_config("[compiler]\ndialect = oracle\n")).unwrap_err();
        assert!(matches!(err, ScreenwatchError::ConfigInvalid { key, .. } if key == "dialect"));
    }

    #[test]
    fn max_depth_out_of_range_fails() {
        for value in ["0", "9", "deep"] {
            let config = make_config(&format!("[compiler]\nmax_depth = {value}\n"));
            let err = compiler_settings(&config).unwrap_err();
            assert!(matches!(err, ScreenwatchError::ConfigInvalid { key, .. } if key == "max_depth"));
        }
    }

    #[test]
    fn limit_must_be_positive() {
        let err = compiler_settings(&make_config("[compiler]\nlimit = 0\n")).unwrap_err();
        assert!(matches!(err, ScreenwatchError::ConfigInvalid { key, .. } if key == "limit"));
    }

    #[test]
    fn evaluator_defaults() {
        let config = evaluator_config(&make_config("")).unwrap();
        assert_eq!(config, EvaluatorConfig::default());
    }

    #[test]
    fn evaluator_reads_all_keys() {
        let config = make_config(
            r#"
[evaluator]
workers = 2
deadline_secs = 60
retry_attempts = 5
retry_base_ms = 0
epsilon = 0.001
"#,
        );
        let c = evaluator_config(&config).unwrap();
        assert_eq!(c.workers, 2);
        assert_eq!(c.deadline, Duration::from_secs(60));
        assert_eq!(c.retry_attempts, 5);
        assert_eq!(c.retry_base, Duration::ZERO);
        assert_eq!(c.epsilon, 0.001);
    }

    #[test]
    fn evaluator_rejects_bad_values() {
        let cases = [
            ("workers = 0", "workers"),
            ("deadline_secs = 0", "deadline_secs"),
            ("retry_attempts = 0", "retry_attempts"),
            ("retry_attempts = 11", "retry_attempts"),
            ("retry_attempts = 4294967295", "retry_attempts"),
            ("retry_base_ms = -1", "retry_base_ms"),
            ("epsilon = 0", "epsilon"),
            ("epsilon = small", "epsilon"),
        ];
        for (line, expected) in cases {
            let config = make_config(&format!("[evaluator]\n{line}\n"));
            let err = evaluator_config(&config).unwrap_err();
            assert!(
                matches!(&err, ScreenwatchError::ConfigInvalid { key, .. } if key == expected),
                "{line}: {err}"
            );
        }
    }

    #[test]
    fn sqlite_requires_path() {
        let err = validate_sqlite_config(&make_config("[sqlite]\npool_size = 2\n")).unwrap_err();
        assert!(matches!(err, ScreenwatchError::ConfigMissing { key, .. } if key == "path"));
        assert!(validate_sqlite_config(&make_config("[sqlite]\npath = db.sqlite\n")).is_ok());
    }

    #[test]
    fn sqlite_pool_size_positive() {
        let config = make_config("[sqlite]\npath = db.sqlite\npool_size = 0\n");
        let err = validate_sqlite_config(&config).unwrap_err();
        assert!(matches!(err, ScreenwatchError::ConfigInvalid { key, .. } if key == "pool_size"));
    }

    #[test]
    fn postgres_connection_fallback() {
        let config = make_config("[database]\nconninfo = host=localhost\n");
        assert_eq!(postgres_connection_string(&config).as_deref(), Some("host=localhost"));
        assert!(validate_postgres_config(&config).is_ok());

        let err = validate_postgres_config(&make_config("")).unwrap_err();
        assert!(matches!(err, ScreenwatchError::ConfigMissing { key, .. } if key == "conninfo"));
    }
}
