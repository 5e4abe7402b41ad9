//! Condition-to-SQL compiler.
//!
//! Compiles a [`ValidatedCondition`] into a `WHERE` predicate plus an ordered
//! list of bound parameters.
//!
//! # Compilation Semantics
//!
//! - Leaf on a snapshot field: `alias.column <op> <placeholder>`
//! - Leaf on a time-series field: a correlated window predicate (see
//!   [`crate::domain::time_window`]); without an explicit window it means the
//!   most recent period only
//! - `AND` group: tautological children are skipped
//! - `OR` group: a tautological child makes the whole group tautological
//! - Two or more surviving children are always parenthesised
//! - An empty tree compiles to `TRUE` (no filtering)
//!
//! Column names come from the registry and operator tokens from the closed
//! [`Operator`] set; values are never written into the query text.

use crate::domain::condition::{Condition, Group, LeafCondition, Logic, Scalar};
use crate::domain::error::ScreenwatchError;
use crate::domain::field_registry::{FieldRegistry, SchemaLayout};
use crate::domain::time_window::{self, WindowLeaf};
use crate::domain::validator::{ValidatedCondition, MAX_DEPTH_LIMIT};
use serde::Serialize;
use std::collections::BTreeMap;

pub const TAUTOLOGY: &str = "TRUE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Numbered `?N` placeholders, `MIN(CASE ...)` as the all-true aggregate.
    #[default]
    Sqlite,
    /// `$N` placeholders, `BOOL_AND` as the all-true aggregate.
    Postgres,
}

impl Dialect {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(Dialect::Sqlite),
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            _ => None,
        }
    }

    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Postgres => format!("${index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Integer(i64),
    Number(f64),
    Text(String),
    Bool(bool),
}

impl From<&Scalar> for SqlParam {
    fn from(s: &Scalar) -> Self {
        match s {
            Scalar::Number(n) => SqlParam::Number(*n),
            Scalar::Text(t) => SqlParam::Text(t.clone()),
            Scalar::Bool(b) => SqlParam::Bool(*b),
        }
    }
}

/// Collects parameters in placeholder order.
#[derive(Debug)]
pub struct ParamBinder {
    dialect: Dialect,
    params: Vec<SqlParam>,
}

impl ParamBinder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    /// Continue numbering after already bound parameters.
    pub fn resume(dialect: Dialect, params: Vec<SqlParam>) -> Self {
        Self { dialect, params }
    }

    pub fn bind(&mut self, value: &Scalar) -> String {
        self.bind_param(SqlParam::from(value))
    }

    pub fn bind_param(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn truncate(&mut self, len: usize) {
        self.params.truncate(len);
    }

    pub fn into_params(self) -> Vec<SqlParam> {
        self.params
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCondition {
    pub predicate: String,
    pub params: Vec<SqlParam>,
    pub dialect: Dialect,
    /// Snapshot tables the predicate references, alias -> table.
    pub joins: BTreeMap<String, String>,
}

impl CompiledCondition {
    pub fn is_tautology(&self) -> bool {
        self.predicate == TAUTOLOGY
    }
}

enum Fragment {
    Tautology,
    Sql(String),
}

pub struct SqlCompiler<'r> {
    registry: &'r FieldRegistry,
    dialect: Dialect,
}

struct CompileState {
    binder: ParamBinder,
    joins: BTreeMap<String, String>,
}

impl<'r> SqlCompiler<'r> {
    pub fn new(registry: &'r FieldRegistry, dialect: Dialect) -> Self {
        Self { registry, dialect }
    }

    pub fn compile(&self, condition: &ValidatedCondition) -> Result<CompiledCondition, ScreenwatchError> {
        let mut state = CompileState {
            binder: ParamBinder::new(self.dialect),
            joins: BTreeMap::new(),
        };
        let predicate = match self.compile_node(condition.root(), 1, &mut state)? {
            Fragment::Tautology => TAUTOLOGY.to_string(),
            Fragment::Sql(sql) => sql,
        };
        Ok(CompiledCondition {
            predicate,
            params: state.binder.into_params(),
            dialect: self.dialect,
            joins: state.joins,
        })
    }

    fn compile_node(
        &self,
        node: &Condition,
        depth: usize,
        state: &mut CompileState,
    ) -> Result<Fragment, ScreenwatchError> {
        if depth > MAX_DEPTH_LIMIT {
            return Err(ScreenwatchError::Compilation {
                reason: format!("tree deeper than {MAX_DEPTH_LIMIT} levels reached the compiler"),
            });
        }
        match node {
            Condition::Leaf(leaf) => self.compile_leaf(leaf, state).map(Fragment::Sql),
            Condition::Group(group) => self.compile_group(group, depth, state),
        }
    }

    fn compile_group(
        &self,
        group: &Group,
        depth: usize,
        state: &mut CompileState,
    ) -> Result<Fragment, ScreenwatchError> {
        let bound_before = state.binder.len();
        let joins_before = state.joins.clone();
        let mut parts = Vec::with_capacity(group.children.len());

        for child in &group.children {
            match self.compile_node(child, depth + 1, state)? {
                Fragment::Sql(sql) => parts.push(sql),
                Fragment::Tautology => match group.logic {
                    Logic::And => {}
                    Logic::Or => {
                        // Placeholders are numbered, so sibling parameters must go too.
                        state.binder.truncate(bound_before);
                        state.joins = joins_before;
                        return Ok(Fragment::Tautology);
                    }
                },
            }
        }

        Ok(match parts.len() {
            0 => Fragment::Tautology,
            1 => Fragment::Sql(parts.remove(0)),
            _ => {
                let joined = parts.join(&format!(" {} ", group.logic.keyword()));
                Fragment::Sql(format!("({joined})"))
            }
        })
    }

    fn compile_leaf(
        &self,
        leaf: &LeafCondition,
        state: &mut CompileState,
    ) -> Result<String, ScreenwatchError> {
        let spec = self
            .registry
            .get(&leaf.field)
            .ok_or_else(|| ScreenwatchError::Compilation {
                reason: format!("field '{}' is not registered", leaf.field),
            })?;
        let layout: &SchemaLayout = self.registry.layout();

        if spec.is_time_series() {
            let periods = leaf.window.map(|w| w.length).unwrap_or(1);
            if periods == 0 {
                return Err(ScreenwatchError::Compilation {
                    reason: format!("zero-length window on '{}'", spec.name),
                });
            }
            return Ok(time_window::build_window_predicate(
                layout,
                &WindowLeaf {
                    field: spec,
                    operator: leaf.operator,
                    value: &leaf.value,
                    periods,
                },
                self.dialect,
                &mut state.binder,
            ));
        }

        if leaf.window.is_some() {
            return Err(ScreenwatchError::Compilation {
                reason: format!("window on snapshot field '{}'", spec.name),
            });
        }
        if spec.table != layout.instrument_table {
            state.joins.insert(spec.alias.clone(), spec.table.clone());
        }
        Ok(time_window::comparison_sql(
            &spec.qualified_column(),
            leaf.operator,
            &leaf.value,
            &mut state.binder,
        ))
    }
}

/// A complete screen statement ready to execute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Wrap a compiled predicate into the instrument listing query:
/// instrument id, symbol and company name, ordered by symbol.
pub fn build_screen_query(
    compiled: &CompiledCondition,
    registry: &FieldRegistry,
    limit: Option<u64>,
) -> Result<ScreenQuery, ScreenwatchError> {
    let layout = registry.layout();
    let display_column = |name: &str| -> Result<String, ScreenwatchError> {
        registry
            .get(name)
            .filter(|spec| spec.table == layout.instrument_table)
            .map(|spec| spec.qualified_column())
            .ok_or_else(|| ScreenwatchError::Compilation {
                reason: format!("registry has no instrument field '{name}'"),
            })
    };
    let key = format!("{}.{}", layout.instrument_alias, layout.instrument_key);
    let symbol = display_column("symbol")?;
    let company = display_column("company_name")?;

    let mut sql = format!(
        "SELECT DISTINCT {key}, {symbol}, {company} FROM {} {}",
        layout.instrument_table, layout.instrument_alias
    );
    for (alias, table) in &compiled.joins {
        sql.push_str(&format!(
            " LEFT JOIN {table} {alias} ON {alias}.{} = {key}",
            layout.foreign_key
        ));
    }
    sql.push_str(&format!(" WHERE {} ORDER BY {symbol}", compiled.predicate));

    let mut binder = ParamBinder::resume(compiled.dialect, compiled.params.clone());
    if let Some(limit) = limit {
        let n = i64::try_from(limit).map_err(|_| ScreenwatchError::Compilation {
            reason: format!("limit {limit} out of range"),
        })?;
        let p = binder.bind_param(SqlParam::Integer(n));
        sql.push_str(&format!(" LIMIT {p}"));
    }

    Ok(ScreenQuery {
        sql,
        params: binder.into_params(),
    })
}
