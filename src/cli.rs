//! CLI definition and dispatch.
//!
//! Thin driver over the library: every command loads its inputs, calls one
//! domain operation and prints JSON on stdout. Diagnostics go to stderr and
//! errors map to exit codes through `ScreenwatchError`.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::alert::NewAlert;
use crate::domain::alert_evaluator::AlertEvaluator;
use crate::domain::condition::Operator;
use crate::domain::condition_parser::parse_condition_str;
use crate::domain::config_validation::{compiler_settings, evaluator_config, CompilerSettings};
use crate::domain::error::ScreenwatchError;
use crate::domain::field_registry::FieldRegistry;
use crate::domain::instrument::Instrument;
use crate::domain::sql_compiler::{build_screen_query, CompiledCondition, Dialect, ScreenQuery, SqlCompiler};
use crate::domain::validator::{ValidatedCondition, Validator};
use crate::ports::alert_store_port::AlertStorePort;
use crate::ports::config_port::ConfigPort;
use crate::ports::metric_port::MetricPort;

#[derive(Parser, Debug)]
#[command(name = "screenwatch", about = "Instrument screening conditions and database-wide alerts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse and validate a condition document
    Validate {
        #[arg(long)]
        condition: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Compile a condition to SQL and print it with its parameters
    Compile {
        #[arg(long)]
        condition: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a condition against the database and list matching instruments
    Screen {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        condition: PathBuf,
    },
    /// Run the alert evaluator once
    Evaluate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Create the instrument, metric and alert tables
    InitDb {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Manage alert definitions
    Alert {
        #[arg(short, long)]
        config: PathBuf,
        #[command(subcommand)]
        action: AlertCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum AlertCommand {
    /// Create an active alert on a numeric snapshot field
    Create {
        #[arg(long)]
        field: String,
        #[arg(long)]
        operator: String,
        #[arg(long, allow_negative_numbers = true)]
        threshold: f64,
    },
    /// List alerts with trigger counts
    List,
    /// Stop evaluating an alert
    Deactivate {
        #[arg(long)]
        id: i64,
    },
    /// Delete an alert with its events
    Delete {
        #[arg(long)]
        id: i64,
    },
    /// Show the events recorded for an alert
    Events {
        #[arg(long)]
        id: i64,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Validate { condition, config } => run_validate(&condition, config.as_deref()),
        Command::Compile { condition, config } => run_compile(&condition, config.as_deref()),
        Command::Screen { config, condition } => run_screen(&config, &condition),
        Command::Evaluate { config } => run_evaluate(&config),
        Command::InitDb { config } => run_init_db(&config),
        Command::Alert { config, action } => run_alert(&config, action),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ScreenwatchError> {
    FileConfigAdapter::from_file(path)
}

fn optional_settings(config_path: Option<&Path>) -> Result<CompilerSettings, ScreenwatchError> {
    match config_path {
        Some(path) => compiler_settings(&load_config(path)?),
        None => Ok(CompilerSettings::default()),
    }
}

/// Read, parse and validate a condition file.
pub fn load_condition(
    path: &Path,
    registry: &FieldRegistry,
    max_depth: usize,
) -> Result<ValidatedCondition, ScreenwatchError> {
    let text = fs::read_to_string(path)?;
    let condition = parse_condition_str(&text)?;
    Ok(Validator::new(registry).with_max_depth(max_depth).validate(condition)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ScreenwatchError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| ScreenwatchError::Io(e.into()))?;
    println!("{text}");
    Ok(())
}

fn run_validate(condition_path: &Path, config_path: Option<&Path>) -> Result<(), ScreenwatchError> {
    let settings = optional_settings(config_path)?;
    let registry = FieldRegistry::global();
    let validated = load_condition(condition_path, registry, settings.max_depth)?;
    eprintln!(
        "{}: valid ({} condition(s), depth {})",
        condition_path.display(),
        validated.root().leaves().len(),
        validated.root().depth()
    );
    print_json(&validated.root().to_json())
}

#[derive(Serialize)]
struct CompileOutput<'a> {
    dialect: &'static str,
    predicate: &'a str,
    params: &'a [crate::domain::sql_compiler::SqlParam],
    screen: &'a ScreenQuery,
}

fn compile_condition(
    condition_path: &Path,
    settings: &CompilerSettings,
) -> Result<(CompiledCondition, ScreenQuery), ScreenwatchError> {
    let registry = FieldRegistry::global();
    let validated = load_condition(condition_path, registry, settings.max_depth)?;
    let compiled = SqlCompiler::new(registry, settings.dialect).compile(&validated)?;
    let screen = build_screen_query(&compiled, registry, settings.limit)?;
    Ok((compiled, screen))
}

fn run_compile(condition_path: &Path, config_path: Option<&Path>) -> Result<(), ScreenwatchError> {
    let settings = optional_settings(config_path)?;
    let (compiled, screen) = compile_condition(condition_path, &settings)?;
    print_json(&CompileOutput {
        dialect: match compiled.dialect {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        },
        predicate: &compiled.predicate,
        params: &compiled.params,
        screen: &screen,
    })
}

fn run_screen(config_path: &Path, condition_path: &Path) -> Result<(), ScreenwatchError> {
    let config = load_config(config_path)?;
    let settings = compiler_settings(&config)?;
    let (_, screen) = compile_condition(condition_path, &settings)?;
    let backend = Backend::open(&config, settings.dialect)?;
    let rows = backend.run_screen(&screen)?;
    eprintln!("{} instrument(s) matched", rows.len());
    print_json(&rows)
}

fn run_evaluate(config_path: &Path) -> Result<(), ScreenwatchError> {
    let config = load_config(config_path)?;
    let settings = compiler_settings(&config)?;
    let evaluator_config = evaluator_config(&config)?;
    let backend = Backend::open(&config, settings.dialect)?;
    let evaluator = AlertEvaluator::new(
        backend.store(),
        backend.metrics(),
        FieldRegistry::global(),
        evaluator_config,
    );
    let report = evaluator.run()?;
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    print_json(&report)
}

fn run_init_db(config_path: &Path) -> Result<(), ScreenwatchError> {
    let config = load_config(config_path)?;
    let settings = compiler_settings(&config)?;
    Backend::open(&config, settings.dialect)?.initialize_schema()?;
    eprintln!("schema initialised");
    Ok(())
}

fn run_alert(config_path: &Path, action: AlertCommand) -> Result<(), ScreenwatchError> {
    let config = load_config(config_path)?;
    let settings = compiler_settings(&config)?;
    let backend = Backend::open(&config, settings.dialect)?;
    let store = backend.store();

    match action {
        AlertCommand::Create {
            field,
            operator,
            threshold,
        } => {
            let operator = Operator::from_token(&operator).ok_or_else(|| ScreenwatchError::AlertInvalid {
                alert_id: 0,
                reason: format!("unknown operator '{operator}'"),
            })?;
            let alert = NewAlert::new(&field, operator, threshold);
            alert.validate(FieldRegistry::global())?;
            print_json(&store.create_alert(&alert)?)
        }
        AlertCommand::List => print_json(&store.list_alerts()?),
        AlertCommand::Deactivate { id } => {
            store.deactivate_alert(id)?;
            eprintln!("alert {id} deactivated");
            Ok(())
        }
        AlertCommand::Delete { id } => {
            store.delete_alert(id)?;
            eprintln!("alert {id} deleted");
            Ok(())
        }
        AlertCommand::Events { id } => {
            if store.get_alert(id)?.is_none() {
                return Err(ScreenwatchError::AlertNotFound { alert_id: id });
            }
            print_json(&store.events_for_alert(id)?)
        }
    }
}

/// Storage backend selected by `[compiler] dialect`.
enum Backend {
    #[cfg(feature = "sqlite")]
    Sqlite(crate::adapters::sqlite_adapter::SqliteAdapter),
    #[cfg(feature = "postgres")]
    Postgres(crate::adapters::postgres_adapter::PostgresAdapter),
}

impl Backend {
    fn open(config: &dyn ConfigPort, dialect: Dialect) -> Result<Self, ScreenwatchError> {
        match dialect {
            #[cfg(feature = "sqlite")]
            Dialect::Sqlite => Ok(Backend::Sqlite(
                crate::adapters::sqlite_adapter::SqliteAdapter::from_config(config)?,
            )),
            #[cfg(feature = "postgres")]
            Dialect::Postgres => Ok(Backend::Postgres(
                crate::adapters::postgres_adapter::PostgresAdapter::from_config(config)?,
            )),
            #[allow(unreachable_patterns)]
            other => Err(ScreenwatchError::ConfigInvalid {
                section: "compiler".into(),
                key: "dialect".into(),
                reason: format!("screenwatch was built without {other:?} support"),
            }),
        }
    }

    fn store(&self) -> &dyn AlertStorePort {
        match self {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(a) => a,
            #[cfg(feature = "postgres")]
            Backend::Postgres(a) => a,
        }
    }

    fn metrics(&self) -> &dyn MetricPort {
        match self {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(a) => a,
            #[cfg(feature = "postgres")]
            Backend::Postgres(a) => a,
        }
    }

    fn run_screen(&self, query: &ScreenQuery) -> Result<Vec<Instrument>, ScreenwatchError> {
        match self {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(a) => a.run_screen(query),
            #[cfg(feature = "postgres")]
            Backend::Postgres(a) => a.run_screen(query),
        }
    }

    fn initialize_schema(&self) -> Result<(), ScreenwatchError> {
        match self {
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(a) => a.initialize_schema(),
            #[cfg(feature = "postgres")]
            Backend::Postgres(a) => a.initialize_schema(),
        }
    }
}
