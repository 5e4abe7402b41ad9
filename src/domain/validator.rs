//! Condition validation against the field registry.
//!
//! Validation is all-or-nothing: the first offending node is reported and no
//! [`ValidatedCondition`] is produced. Only a `ValidatedCondition` can be
//! compiled or evaluated.
//!
//! Operator/type matrix:
//! - number: `<`, `>`, `<=`, `>=`, `=`, `BETWEEN`
//! - string, boolean: `=` only

use crate::domain::condition::{Condition, ConditionValue, Group, LeafCondition, Operator, Scalar};
use crate::domain::error::{NodePath, ValidationError};
use crate::domain::field_registry::{FieldRegistry, FieldSpec, ValueType};

pub const DEFAULT_MAX_DEPTH: usize = 5;
pub const MAX_DEPTH_LIMIT: usize = 8;

/// A condition tree that passed [`Validator::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCondition {
    root: Condition,
}

impl ValidatedCondition {
    pub fn root(&self) -> &Condition {
        &self.root
    }
}

pub struct Validator<'r> {
    registry: &'r FieldRegistry,
    max_depth: usize,
}

impl<'r> Validator<'r> {
    pub fn new(registry: &'r FieldRegistry) -> Self {
        Self {
            registry,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Clamped to `1..=MAX_DEPTH_LIMIT`.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.clamp(1, MAX_DEPTH_LIMIT);
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn validate(&self, condition: Condition) -> Result<ValidatedCondition, ValidationError> {
        self.check_node(&condition, &NodePath::root(), 1)?;
        Ok(ValidatedCondition { root: condition })
    }

    fn check_node(&self, node: &Condition, path: &NodePath, depth: usize) -> Result<(), ValidationError> {
        if depth > self.max_depth {
            return Err(ValidationError::new(
                path,
                format!("nesting exceeds maximum depth of {}", self.max_depth),
            ));
        }
        match node {
            Condition::Leaf(leaf) => self.check_leaf(leaf, path),
            Condition::Group(group) => self.check_group(group, path, depth),
        }
    }

    fn check_group(&self, group: &Group, path: &NodePath, depth: usize) -> Result<(), ValidationError> {
        let children = path.key("children");
        for (i, child) in group.children.iter().enumerate() {
            self.check_node(child, &children.index(i), depth + 1)?;
        }
        Ok(())
    }

    fn check_leaf(&self, leaf: &LeafCondition, path: &NodePath) -> Result<(), ValidationError> {
        let spec = self.registry.get(&leaf.field).ok_or_else(|| {
            ValidationError::new(path, format!("unsupported field '{}'", leaf.field))
        })?;

        check_operator(spec, leaf.operator, path)?;
        check_value(spec, leaf.operator, &leaf.value, path)?;

        if let Some(window) = leaf.window {
            if !spec.is_time_series() {
                return Err(ValidationError::new(
                    path,
                    format!("field '{}' is not a time series and cannot take a window", spec.name),
                ));
            }
            if window.length == 0 {
                return Err(ValidationError::new(
                    &path.key("window"),
                    "window length must be a positive integer",
                ));
            }
        }
        Ok(())
    }
}

/// Validate with the default maximum depth.
pub fn validate(
    condition: Condition,
    registry: &FieldRegistry,
) -> Result<ValidatedCondition, ValidationError> {
    Validator::new(registry).validate(condition)
}

pub fn operator_allowed(value_type: ValueType, operator: Operator) -> bool {
    match value_type {
        ValueType::Number => true,
        ValueType::String | ValueType::Boolean => operator == Operator::Eq,
    }
}

fn check_operator(spec: &FieldSpec, operator: Operator, path: &NodePath) -> Result<(), ValidationError> {
    if operator_allowed(spec.value_type, operator) {
        Ok(())
    } else {
        Err(ValidationError::new(
            path,
            format!(
                "operator '{}' is not allowed on {} field '{}'",
                operator,
                spec.value_type.name(),
                spec.name
            ),
        ))
    }
}

fn check_value(
    spec: &FieldSpec,
    operator: Operator,
    value: &ConditionValue,
    path: &NodePath,
) -> Result<(), ValidationError> {
    let value_path = path.key("value");
    match (operator, value) {
        (Operator::Between, ConditionValue::Range { low, high }) => {
            check_scalar(spec, low, &value_path.index(0))?;
            check_scalar(spec, high, &value_path.index(1))?;
            match (low, high) {
                (Scalar::Number(l), Scalar::Number(h)) if l > h => Err(ValidationError::new(
                    &value_path,
                    format!("BETWEEN bounds out of order: {l} > {h}"),
                )),
                _ => Ok(()),
            }
        }
        (Operator::Between, ConditionValue::Scalar(_)) => Err(ValidationError::new(
            &value_path,
            "BETWEEN requires exactly two values",
        )),
        (_, ConditionValue::Range { .. }) => Err(ValidationError::new(
            &value_path,
            format!("operator '{operator}' takes a single value"),
        )),
        (_, ConditionValue::Scalar(s)) => check_scalar(spec, s, &value_path),
    }
}

fn check_scalar(spec: &FieldSpec, scalar: &Scalar, path: &NodePath) -> Result<(), ValidationError> {
    match (spec.value_type, scalar) {
        (ValueType::Number, Scalar::Number(n)) if n.is_finite() => Ok(()),
        (ValueType::Number, Scalar::Number(n)) => Err(ValidationError::new(
            path,
            format!("value {n} for '{}' is not finite", spec.name),
        )),
        (ValueType::String, Scalar::Text(_)) | (ValueType::Boolean, Scalar::Bool(_)) => Ok(()),
        (expected, found) => Err(ValidationError::new(
            path,
            format!(
                "field '{}' expects a {} value, found {}",
                spec.name,
                expected.name(),
                found
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::condition::Window;

    fn reg() -> FieldRegistry {
        FieldRegistry::builtin()
    }

    fn leaf(field: &str, op: Operator, v: impl Into<Scalar>) -> Condition {
        LeafCondition::new(field, op, v).into()
    }

    #[test]
    fn valid_nested_tree() {
        let tree = Condition::and(vec![
            leaf("sector", Operator::Eq, "Technology"),
            Condition::or(vec![
                leaf("pe_ratio", Operator::Lt, 25.0),
                leaf("peg_ratio", Operator::Lt, 1.5),
            ]),
        ]);
        let validated = validate(tree.clone(), &reg()).unwrap();
        assert_eq!(validated.root(), &tree);
    }

    #[test]
    fn unknown_field_rejected_with_path() {
        let tree = Condition::and(vec![
            leaf("pe_ratio", Operator::Lt, 25.0),
            leaf("dividend_yield", Operator::Gt, 2.0),
        ]);
        let e = validate(tree, &reg()).unwrap_err();
        assert_eq!(e.path.to_string(), "/children/1");
        assert!(e.message.contains("dividend_yield"));
    }

    #[test]
    fn string_field_rejects_ordering_operator() {
        let e = validate(leaf("sector", Operator::Lt, "M"), &reg()).unwrap_err();
        assert!(e.message.contains("not allowed"));
    }

    #[test]
    fn type_mismatch_rejected() {
        let e = validate(leaf("pe_ratio", Operator::Lt, "cheap"), &reg()).unwrap_err();
        assert!(e.message.contains("expects a number"));
        assert_eq!(e.path.to_string(), "/value");
    }

    #[test]
    fn non_finite_rejected() {
        assert!(validate(leaf("pe_ratio", Operator::Lt, f64::NAN), &reg()).is_err());
        assert!(validate(leaf("pe_ratio", Operator::Lt, f64::INFINITY), &reg()).is_err());
    }

    #[test]
    fn between_bounds_ordered() {
        let ok = Condition::from(LeafCondition::between("pe_ratio", 10.0, 20.0));
        assert!(validate(ok, &reg()).is_ok());
        let equal = Condition::from(LeafCondition::between("pe_ratio", 10.0, 10.0));
        assert!(validate(equal, &reg()).is_ok());
        let bad = Condition::from(LeafCondition::between("pe_ratio", 20.0, 10.0));
        assert!(validate(bad, &reg()).unwrap_err().message.contains("out of order"));
    }

    #[test]
    fn between_with_scalar_rejected() {
        let c = Condition::Leaf(LeafCondition {
            field: "pe_ratio".into(),
            operator: Operator::Between,
            value: ConditionValue::Scalar(Scalar::Number(1.0)),
            window: None,
        });
        assert!(validate(c, &reg()).is_err());
    }

    #[test]
    fn window_only_on_time_series() {
        let ok = Condition::from(LeafCondition::new("net_profit", Operator::Gt, 0.0).over_last(4));
        assert!(validate(ok, &reg()).is_ok());
        let bad = Condition::from(LeafCondition::new("pe_ratio", Operator::Lt, 20.0).over_last(4));
        assert!(validate(bad, &reg()).unwrap_err().message.contains("not a time series"));
    }

    #[test]
    fn zero_window_rejected() {
        let mut l = LeafCondition::new("net_profit", Operator::Gt, 0.0);
        l.window = Some(Window::all_of_last(0));
        let e = validate(l.into(), &reg()).unwrap_err();
        assert_eq!(e.path.to_string(), "/window");
    }

    #[test]
    fn empty_group_is_valid() {
        assert!(validate(Condition::and(vec![]), &reg()).is_ok());
        assert!(validate(Condition::or(vec![Condition::and(vec![])]), &reg()).is_ok());
    }

    #[test]
    fn depth_limit_enforced() {
        let mut tree = leaf("pe_ratio", Operator::Lt, 20.0);
        for _ in 0..4 {
            tree = Condition::and(vec![tree]);
        }
        assert_eq!(tree.depth(), 5);
        assert!(validate(tree.clone(), &reg()).is_ok());

        let deeper = Condition::and(vec![tree]);
        let e = validate(deeper.clone(), &reg()).unwrap_err();
        assert!(e.message.contains("maximum depth of 5"));

        let registry = reg();
        let relaxed = Validator::new(&registry).with_max_depth(6);
        assert!(relaxed.validate(deeper).is_ok());
    }

    #[test]
    fn max_depth_is_clamped() {
        let r = reg();
        assert_eq!(Validator::new(&r).with_max_depth(100).max_depth(), MAX_DEPTH_LIMIT);
        assert_eq!(Validator::new(&r).with_max_depth(0).max_depth(), 1);
    }

    #[test]
    fn dotted_field_accepted() {
        assert!(validate(leaf("fundamentals.pe_ratio", Operator::Lt, 20.0), &reg()).is_ok());
    }
}
