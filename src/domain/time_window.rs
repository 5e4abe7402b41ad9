//! Time-window subquery builder.
//!
//! Builds the correlated predicate for "comparison holds in each of the N most
//! recent periods". The shape is the same for every time-series field:
//!
//! 1. rank each instrument's rows by period, most recent first, and correlate
//!    the ranked rows to the outer instrument
//! 2. keep rank <= N
//! 3. require exactly N surviving rows and that every one satisfies the
//!    comparison (count + boolean-AND aggregate)
//!
//! Fewer than N periods of history is false, never a partial match.
//! The comparison value is bound; N and the correlation key are structural.

use crate::domain::condition::{ConditionValue, Operator};
use crate::domain::field_registry::{FieldSpec, SchemaLayout};
use crate::domain::sql_compiler::{Dialect, ParamBinder};

const SOURCE_ALIAS: &str = "tw_src";
const RANKED_ALIAS: &str = "tw_ranked";

pub struct WindowLeaf<'a> {
    pub field: &'a FieldSpec,
    pub operator: Operator,
    pub value: &'a ConditionValue,
    pub periods: usize,
}

pub fn build_window_predicate(
    layout: &SchemaLayout,
    leaf: &WindowLeaf<'_>,
    dialect: Dialect,
    binder: &mut ParamBinder,
) -> String {
    let source_column = format!("{SOURCE_ALIAS}.{}", leaf.field.column);
    let comparison = comparison_sql(&source_column, leaf.operator, leaf.value, binder);
    let satisfied = match dialect {
        Dialect::Sqlite => format!("CASE WHEN {comparison} THEN 1 ELSE 0 END"),
        Dialect::Postgres => format!("COALESCE({comparison}, FALSE)"),
    };
    let all_satisfied = match dialect {
        Dialect::Sqlite => format!("MIN({RANKED_ALIAS}.satisfied) = 1"),
        Dialect::Postgres => format!("BOOL_AND({RANKED_ALIAS}.satisfied)"),
    };

    let foreign_key = format!("{SOURCE_ALIAS}.{}", layout.foreign_key);
    let period_order = layout
        .period_columns
        .iter()
        .map(|c| format!("{SOURCE_ALIAS}.{c} DESC"))
        .collect::<Vec<_>>()
        .join(", ");
    let correlation = format!("{}.{}", layout.instrument_alias, layout.instrument_key);
    let n = leaf.periods;

    format!(
        "EXISTS (SELECT 1 FROM (\
SELECT {foreign_key} AS instrument_key, \
ROW_NUMBER() OVER (PARTITION BY {foreign_key} ORDER BY {period_order}) AS period_rank, \
{satisfied} AS satisfied \
FROM {table} {SOURCE_ALIAS}\
) {RANKED_ALIAS} \
WHERE {RANKED_ALIAS}.instrument_key = {correlation} \
AND {RANKED_ALIAS}.period_rank <= {n} \
GROUP BY {RANKED_ALIAS}.instrument_key \
HAVING COUNT(*) = {n} AND {all_satisfied})",
        table = leaf.field.table,
    )
}

/// `column <op> placeholder`, or `column BETWEEN p1 AND p2`.
pub(crate) fn comparison_sql(
    column: &str,
    operator: Operator,
    value: &ConditionValue,
    binder: &mut ParamBinder,
) -> String {
    match value {
        ConditionValue::Range { low, high } => {
            let low = binder.bind(low);
            let high = binder.bind(high);
            format!("{column} BETWEEN {low} AND {high}")
        }
        ConditionValue::Scalar(v) => {
            let p = binder.bind(v);
            format!("{column} {} {p}", operator.token())
        }
    }
}
