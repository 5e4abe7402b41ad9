//! Condition model.
//!
//! A condition tree is either a single comparison ([`LeafCondition`]) or a
//! boolean combination of subtrees ([`Group`]):
//! - `Operator`: the closed comparison vocabulary shared by the SQL compiler
//!   and the in-memory evaluators
//! - `Scalar` / `ConditionValue`: what a leaf compares against
//! - `Window`: "true for the last N periods" quantifier on time-series fields

use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Between,
}

impl Operator {
    pub const ALL: [Operator; 6] = [
        Operator::Lt,
        Operator::Gt,
        Operator::Le,
        Operator::Ge,
        Operator::Eq,
        Operator::Between,
    ];

    /// The query-language token. Emitted literally, so it only ever comes
    /// from this closed set.
    pub fn token(self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Eq => "=",
            Operator::Between => "BETWEEN",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        let trimmed = token.trim();
        Self::ALL
            .into_iter()
            .find(|op| op.token().eq_ignore_ascii_case(trimmed))
    }

    /// Single-value comparisons, the only ones an alert may use.
    pub fn is_comparison(self) -> bool {
        !matches!(self, Operator::Between)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    pub fn keyword(self) -> &'static str {
        match self {
            Logic::And => "AND",
            Logic::Or => "OR",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.trim().to_ascii_uppercase().as_str() {
            "AND" => Some(Logic::And),
            "OR" => Some(Logic::Or),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl Scalar {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Number(n) => json!(n),
            Scalar::Text(s) => json!(s),
            Scalar::Bool(b) => json!(b),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => write!(f, "{s:?}"),
            Scalar::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Number(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    Scalar(Scalar),
    Range { low: Scalar, high: Scalar },
}

impl ConditionValue {
    /// Values in the order they bind to placeholders.
    pub fn scalars(&self) -> Vec<&Scalar> {
        match self {
            ConditionValue::Scalar(s) => vec![s],
            ConditionValue::Range { low, high } => vec![low, high],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAggregation {
    /// Every one of the N most recent periods must satisfy the comparison.
    AllOfLastN,
}

impl WindowAggregation {
    pub const WIRE_NAME: &'static str = "all-of-last-N";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub length: usize,
    pub aggregation: WindowAggregation,
}

impl Window {
    pub fn all_of_last(length: usize) -> Self {
        Self {
            length,
            aggregation: WindowAggregation::AllOfLastN,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafCondition {
    pub field: String,
    pub operator: Operator,
    pub value: ConditionValue,
    pub window: Option<Window>,
}

impl LeafCondition {
    pub fn new(field: &str, operator: Operator, value: impl Into<Scalar>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value: ConditionValue::Scalar(value.into()),
            window: None,
        }
    }

    pub fn between(field: &str, low: impl Into<Scalar>, high: impl Into<Scalar>) -> Self {
        Self {
            field: field.to_string(),
            operator: Operator::Between,
            value: ConditionValue::Range {
                low: low.into(),
                high: high.into(),
            },
            window: None,
        }
    }

    pub fn over_last(mut self, periods: usize) -> Self {
        self.window = Some(Window::all_of_last(periods));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub logic: Logic,
    pub children: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Leaf(LeafCondition),
    Group(Group),
}

impl Condition {
    pub fn and(children: Vec<Condition>) -> Self {
        Condition::Group(Group {
            logic: Logic::And,
            children,
        })
    }

    pub fn or(children: Vec<Condition>) -> Self {
        Condition::Group(Group {
            logic: Logic::Or,
            children,
        })
    }

    /// Nesting depth: a leaf is 1, a group is one more than its deepest child.
    pub fn depth(&self) -> usize {
        match self {
            Condition::Leaf(_) => 1,
            Condition::Group(g) => 1 + g.children.iter().map(Condition::depth).max().unwrap_or(0),
        }
    }

    /// Leaves in pre-order.
    pub fn leaves(&self) -> Vec<&LeafCondition> {
        let mut out = Vec::new();
        collect_leaves(self, &mut out);
        out
    }

    /// Canonical wire shape.
    pub fn to_json(&self) -> Value {
        match self {
            Condition::Leaf(leaf) => {
                let value = match &leaf.value {
                    ConditionValue::Scalar(s) => s.to_json(),
                    ConditionValue::Range { low, high } => json!([low.to_json(), high.to_json()]),
                };
                let mut obj = json!({
                    "field": leaf.field,
                    "operator": leaf.operator.token(),
                    "value": value,
                });
                if let Some(w) = leaf.window {
                    obj["window"] = json!({
                        "length": w.length,
                        "aggregation": WindowAggregation::WIRE_NAME,
                    });
                }
                obj
            }
            Condition::Group(g) => json!({
                "logic": g.logic.keyword(),
                "children": g.children.iter().map(Condition::to_json).collect::<Vec<_>>(),
            }),
        }
    }
}

impl From<LeafCondition> for Condition {
    fn from(leaf: LeafCondition) -> Self {
        Condition::Leaf(leaf)
    }
}

fn collect_leaves<'a>(node: &'a Condition, out: &mut Vec<&'a LeafCondition>) {
    match node {
        Condition::Leaf(leaf) => out.push(leaf),
        Condition::Group(g) => {
            for child in &g.children {
                collect_leaves(child, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_tokens_round_trip() {
        for op in Operator::ALL {
            assert_eq!(Operator::from_token(op.token()), Some(op));
        }
        assert_eq!(Operator::from_token("between"), Some(Operator::Between));
        assert_eq!(Operator::from_token("!="), None);
        assert_eq!(Operator::from_token("; DROP TABLE"), None);
    }

    #[test]
    fn between_is_not_a_comparison() {
        assert!(Operator::Lt.is_comparison());
        assert!(!Operator::Between.is_comparison());
    }

    #[test]
    fn logic_keywords() {
        assert_eq!(Logic::from_keyword("and"), Some(Logic::And));
        assert_eq!(Logic::from_keyword(" Or "), Some(Logic::Or));
        assert_eq!(Logic::from_keyword("XOR"), None);
    }

    #[test]
    fn depth_of_nested_groups() {
        let leaf = Condition::from(LeafCondition::new("pe_ratio", Operator::Lt, 25.0));
        assert_eq!(leaf.depth(), 1);
        assert_eq!(Condition::and(vec![]).depth(), 1);
        let nested = Condition::and(vec![
            leaf.clone(),
            Condition::or(vec![leaf.clone(), Condition::and(vec![leaf])]),
        ]);
        assert_eq!(nested.depth(), 4);
    }

    #[test]
    fn leaves_in_preorder() {
        let tree = Condition::and(vec![
            LeafCondition::new("sector", Operator::Eq, "Technology").into(),
            Condition::or(vec![
                LeafCondition::new("pe_ratio", Operator::Lt, 25.0).into(),
                LeafCondition::new("peg_ratio", Operator::Lt, 1.5).into(),
            ]),
        ]);
        let fields: Vec<&str> = tree.leaves().iter().map(|l| l.field.as_str()).collect();
        assert_eq!(fields, vec!["sector", "pe_ratio", "peg_ratio"]);
    }

    #[test]
    fn to_json_canonical_shape() {
        let tree = Condition::and(vec![
            LeafCondition::new("net_profit", Operator::Gt, 0.0).over_last(4).into(),
            LeafCondition::between("pe_ratio", 10.0, 20.0).into(),
        ]);
        let v = tree.to_json();
        assert_eq!(v["logic"], "AND");
        assert_eq!(v["children"][0]["window"]["length"], 4);
        assert_eq!(v["children"][0]["window"]["aggregation"], "all-of-last-N");
        assert_eq!(v["children"][1]["operator"], "BETWEEN");
        assert_eq!(v["children"][1]["value"][1], 20.0);
    }
}
