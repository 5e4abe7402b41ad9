//! Domain error types.

use std::fmt;

/// Location of a node inside a condition tree, rendered as a JSON pointer
/// (`/children/1/children/0`). The root is the empty path `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePath(Vec<PathSegment>);

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn key(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.to_string()));
        Self(segments)
    }

    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }

    pub fn depth(&self) -> usize {
        self.0
            .iter()
            .filter(|s| matches!(s, PathSegment::Index(_)))
            .count()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            match segment {
                PathSegment::Key(k) => write!(f, "/{k}")?,
                PathSegment::Index(i) => write!(f, "/{i}")?,
            }
        }
        Ok(())
    }
}

/// A wire-format decoding error, located by node path.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed condition at {path}: {message}")]
pub struct ConditionParseError {
    pub path: NodePath,
    pub message: String,
}

/// A condition tree that decoded fine but is not allowed against the registry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid condition at {path}: {message}")]
pub struct ValidationError {
    pub path: NodePath,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: &NodePath, message: impl Into<String>) -> Self {
        Self {
            path: path.clone(),
            message: message.into(),
        }
    }
}

/// Top-level error type for screenwatch.
#[derive(Debug, thiserror::Error)]
pub enum ScreenwatchError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    ConditionParse(#[from] ConditionParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Internal invariant broken while compiling an already validated tree.
    #[error("compilation defect: {reason}")]
    Compilation { reason: String },

    #[error("metric {field} unavailable for instrument {instrument_id}")]
    MetricUnavailable { instrument_id: i64, field: String },

    #[error("storage error after {attempts} attempt(s): {reason}")]
    Storage { reason: String, attempts: u32 },

    #[error("invalid alert {alert_id}: {reason}")]
    AlertInvalid { alert_id: i64, reason: String },

    #[error("alert {alert_id} not found")]
    AlertNotFound { alert_id: i64 },

    /// A retry was abandoned because its next backoff would outlive the run.
    #[error("{operation}: run deadline reached after {attempts} attempt(s)")]
    DeadlineExceeded { operation: String, attempts: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScreenwatchError {
    /// Whether retrying the same storage call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScreenwatchError::Database { .. }
                | ScreenwatchError::DatabaseQuery { .. }
                | ScreenwatchError::Storage { .. }
        )
    }
}

impl From<&ScreenwatchError> for std::process::ExitCode {
    fn from(err: &ScreenwatchError) -> Self {
        let code: u8 = match err {
            ScreenwatchError::Io(_) => 1,
            ScreenwatchError::ConfigParse { .. }
            | ScreenwatchError::ConfigMissing { .. }
            | ScreenwatchError::ConfigInvalid { .. } => 2,
            ScreenwatchError::Database { .. }
            | ScreenwatchError::DatabaseQuery { .. }
            | ScreenwatchError::Storage { .. }
            | ScreenwatchError::DeadlineExceeded { .. } => 3,
            ScreenwatchError::ConditionParse(_)
            | ScreenwatchError::Validation(_)
            | ScreenwatchError::Compilation { .. }
            | ScreenwatchError::AlertInvalid { .. }
            | ScreenwatchError::AlertNotFound { .. } => 4,
            ScreenwatchError::MetricUnavailable { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
