//! In-memory condition evaluation.
//!
//! Row-oriented counterpart of the SQL compiler: decides a validated tree for
//! one instrument using values fetched through the [`MetricResolver`].
//!
//! # Evaluation Semantics
//!
//! - Missing metric: the leaf is false (as a SQL comparison against NULL)
//! - `=` on numbers: equal within `epsilon`. `<`, `>`, `<=`, `>=` and
//!   `BETWEEN` are plain IEEE comparisons, matching the compiled SQL
//! - Windowed leaf: exactly N periods must exist and all N must satisfy
//! - Time-series leaf without window: most recent period
//! - Empty group: true. `AND` short-circuits on the first false child, `OR`
//!   on the first true one

use crate::domain::condition::{Condition, ConditionValue, LeafCondition, Logic, Operator, Scalar};
use crate::domain::error::ScreenwatchError;
use crate::domain::metric_resolver::MetricResolver;
use crate::domain::validator::ValidatedCondition;
use crate::ports::metric_port::MetricPort;

pub const DEFAULT_EPSILON: f64 = 1e-9;

pub fn evaluate<M: MetricPort + ?Sized>(
    condition: &ValidatedCondition,
    resolver: &MetricResolver<'_, M>,
    instrument_id: i64,
    epsilon: f64,
) -> Result<bool, ScreenwatchError> {
    eval_node(condition.root(), resolver, instrument_id, epsilon)
}

fn eval_node<M: MetricPort + ?Sized>(
    node: &Condition,
    resolver: &MetricResolver<'_, M>,
    instrument_id: i64,
    epsilon: f64,
) -> Result<bool, ScreenwatchError> {
    match node {
        Condition::Leaf(leaf) => eval_leaf(leaf, resolver, instrument_id, epsilon),
        Condition::Group(group) if group.children.is_empty() => Ok(true),
        Condition::Group(group) => match group.logic {
            Logic::And => {
                for child in &group.children {
                    if !eval_node(child, resolver, instrument_id, epsilon)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Logic::Or => {
                for child in &group.children {
                    if eval_node(child, resolver, instrument_id, epsilon)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        },
    }
}

fn eval_leaf<M: MetricPort + ?Sized>(
    leaf: &LeafCondition,
    resolver: &MetricResolver<'_, M>,
    instrument_id: i64,
    epsilon: f64,
) -> Result<bool, ScreenwatchError> {
    let time_series = resolver
        .registry()
        .get(&leaf.field)
        .is_some_and(|spec| spec.is_time_series());

    if !time_series {
        return match resolver.resolve(instrument_id, &leaf.field) {
            Ok(value) => Ok(satisfies(&value, leaf.operator, &leaf.value, epsilon)),
            Err(ScreenwatchError::MetricUnavailable { .. }) => Ok(false),
            Err(e) => Err(e),
        };
    }

    let periods = leaf.window.map(|w| w.length).unwrap_or(1);
    let history = resolver.history(instrument_id, &leaf.field, periods)?;
    Ok(all_of_last(&history, periods, |v| {
        satisfies(v, leaf.operator, &leaf.value, epsilon)
    }))
}

/// Universal quantifier over the most recent `periods` values: false when
/// fewer than `periods` values exist or any of them is missing.
pub fn all_of_last(
    history: &[Option<Scalar>],
    periods: usize,
    mut predicate: impl FnMut(&Scalar) -> bool,
) -> bool {
    if periods == 0 || history.len() < periods {
        return false;
    }
    history[..periods]
        .iter()
        .all(|v| v.as_ref().is_some_and(&mut predicate))
}

pub fn satisfies(value: &Scalar, operator: Operator, target: &ConditionValue, epsilon: f64) -> bool {
    match (value, target) {
        (Scalar::Number(v), ConditionValue::Scalar(Scalar::Number(t))) => {
            compare_numbers(*v, operator, *t, epsilon)
        }
        (
            Scalar::Number(v),
            ConditionValue::Range {
                low: Scalar::Number(lo),
                high: Scalar::Number(hi),
            },
        ) if operator == Operator::Between => compare_numbers(*v, Operator::Ge, *lo, epsilon)
            && compare_numbers(*v, Operator::Le, *hi, epsilon),
        (Scalar::Text(v), ConditionValue::Scalar(Scalar::Text(t))) => {
            operator == Operator::Eq && v == t
        }
        (Scalar::Bool(v), ConditionValue::Scalar(Scalar::Bool(t))) => {
            operator == Operator::Eq && v == t
        }
        _ => false,
    }
}

/// Single-value numeric comparison shared with the alert evaluator. Only
/// `=` is tolerant; ordering operators agree with SQL on every input.
pub fn compare_numbers(value: f64, operator: Operator, threshold: f64, epsilon: f64) -> bool {
    if !value.is_finite() || !threshold.is_finite() {
        return false;
    }
    match operator {
        Operator::Lt => value < threshold,
        Operator::Gt => value > threshold,
        Operator::Le => value <= threshold,
        Operator::Ge => value >= threshold,
        Operator::Eq => (value - threshold).abs() < epsilon,
        Operator::Between => false,
    }
}
