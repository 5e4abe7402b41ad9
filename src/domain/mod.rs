//! Core domain types and logic.

pub mod field_registry;
pub mod condition;
pub mod condition_parser;
pub mod validator;
pub mod sql_compiler;
pub mod time_window;
pub mod condition_eval;
pub mod instrument;
pub mod metric_resolver;
pub mod alert;
pub mod alert_evaluator;
pub mod config_validation;
pub mod error;
