//! Condition wire-format decoder.
//!
//! Turns a JSON document into a [`Condition`] tree. Node kind is decided from
//! the keys present (or an explicit `"type"` discriminator); a node that looks
//! like both a group and a leaf, or like neither, is an error rather than a
//! silent default. Errors carry the path of the offending node.
//!
//! Accepted shapes:
//! - group: `{"logic": "AND"|"OR", "children": [...]}`
//!   (also `{"type": "logical", "operator": "AND", "conditions": [...]}`)
//! - leaf: `{"field": f, "operator": op, "value": v, "window": {"length": N}}`
//!   (also `{"type": "condition", ..., "last_n": N}`)

use crate::domain::condition::{
    Condition, ConditionValue, Group, LeafCondition, Logic, Operator, Scalar, Window,
    WindowAggregation,
};
use crate::domain::error::{ConditionParseError, NodePath};
use serde_json::{Map, Value};

const GROUP_KEYS: &[&str] = &["type", "logic", "operator", "children", "conditions"];
const LEAF_KEYS: &[&str] = &["type", "field", "operator", "value", "window", "last_n"];

pub fn parse_condition_str(input: &str) -> Result<Condition, ConditionParseError> {
    let value: Value = serde_json::from_str(input).map_err(|e| ConditionParseError {
        path: NodePath::root(),
        message: format!("invalid JSON: {e}"),
    })?;
    parse_condition(&value)
}

pub fn parse_condition(value: &Value) -> Result<Condition, ConditionParseError> {
    parse_node(value, &NodePath::root())
}

fn err(path: &NodePath, message: impl Into<String>) -> ConditionParseError {
    ConditionParseError {
        path: path.clone(),
        message: message.into(),
    }
}

enum NodeKind {
    Group,
    Leaf,
}

fn parse_node(value: &Value, path: &NodePath) -> Result<Condition, ConditionParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| err(path, format!("expected an object, found {}", kind_name(value))))?;

    match classify(obj, path)? {
        NodeKind::Group => parse_group(obj, path).map(Condition::Group),
        NodeKind::Leaf => parse_leaf(obj, path).map(Condition::Leaf),
    }
}

fn classify(obj: &Map<String, Value>, path: &NodePath) -> Result<NodeKind, ConditionParseError> {
    let looks_group = obj.contains_key("logic")
        || obj.contains_key("children")
        || obj.contains_key("conditions");
    let looks_leaf = obj.contains_key("field")
        || obj.contains_key("value")
        || obj.contains_key("window")
        || obj.contains_key("last_n");

    let declared = match obj.get("type") {
        None => None,
        Some(Value::String(t)) => match t.as_str() {
            "logical" => Some(NodeKind::Group),
            "condition" => Some(NodeKind::Leaf),
            other => return Err(err(path, format!("unknown node type '{other}'"))),
        },
        Some(other) => {
            return Err(err(
                path,
                format!("'type' must be a string, found {}", kind_name(other)),
            ));
        }
    };

    match (declared, looks_group, looks_leaf) {
        (_, true, true) => Err(err(path, "node mixes group keys and condition keys")),
        (Some(NodeKind::Group), _, true) => Err(err(path, "logical node carries condition keys")),
        (Some(NodeKind::Leaf), true, _) => Err(err(path, "condition node carries group keys")),
        (Some(kind), _, _) => Ok(kind),
        (None, true, false) => Ok(NodeKind::Group),
        (None, false, true) => Ok(NodeKind::Leaf),
        (None, false, false) => Err(err(
            path,
            "node is neither a group (logic/children) nor a condition (field/operator/value)",
        )),
    }
}

fn reject_unknown_keys(
    obj: &Map<String, Value>,
    allowed: &[&str],
    path: &NodePath,
) -> Result<(), ConditionParseError> {
    match obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(k) => Err(err(path, format!("unexpected key '{k}'"))),
        None => Ok(()),
    }
}

fn parse_group(obj: &Map<String, Value>, path: &NodePath) -> Result<Group, ConditionParseError> {
    reject_unknown_keys(obj, GROUP_KEYS, path)?;

    let logic_value = match (obj.get("logic"), obj.get("operator")) {
        (Some(_), Some(_)) => return Err(err(path, "both 'logic' and 'operator' given")),
        (Some(v), None) | (None, Some(v)) => v,
        (None, None) => return Err(err(path, "group requires 'logic'")),
    };
    let logic = logic_value
        .as_str()
        .and_then(Logic::from_keyword)
        .ok_or_else(|| err(path, format!("unknown logic {logic_value}, expected AND or OR")))?;

    let (key, children_value) = match (obj.get("children"), obj.get("conditions")) {
        (Some(_), Some(_)) => return Err(err(path, "both 'children' and 'conditions' given")),
        (Some(v), None) => ("children", v),
        (None, Some(v)) => ("conditions", v),
        (None, None) => return Err(err(path, "group requires 'children'")),
    };
    let items = children_value.as_array().ok_or_else(|| {
        err(
            path,
            format!("'{key}' must be an array, found {}", kind_name(children_value)),
        )
    })?;

    let children_path = path.key(key);
    let children = items
        .iter()
        .enumerate()
        .map(|(i, child)| parse_node(child, &children_path.index(i)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Group { logic, children })
}

fn parse_leaf(
    obj: &Map<String, Value>,
    path: &NodePath,
) -> Result<LeafCondition, ConditionParseError> {
    reject_unknown_keys(obj, LEAF_KEYS, path)?;

    let field = match obj.get("field") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::String(_)) => return Err(err(path, "'field' is empty")),
        Some(other) => {
            return Err(err(
                path,
                format!("'field' must be a string, found {}", kind_name(other)),
            ));
        }
        None => return Err(err(path, "condition requires 'field'")),
    };

    let operator = match obj.get("operator") {
        Some(Value::String(s)) => Operator::from_token(s)
            .ok_or_else(|| err(path, format!("unsupported operator '{s}'")))?,
        Some(other) => {
            return Err(err(
                path,
                format!("'operator' must be a string, found {}", kind_name(other)),
            ));
        }
        None => return Err(err(path, "condition requires 'operator'")),
    };

    let value_path = path.key("value");
    let value = match obj.get("value") {
        None | Some(Value::Null) => return Err(err(path, format!("missing value for field '{field}'"))),
        Some(Value::Array(items)) => {
            if operator != Operator::Between {
                return Err(err(
                    &value_path,
                    format!("a list value is only allowed with BETWEEN, not '{operator}'"),
                ));
            }
            match items.as_slice() {
                [low, high] => ConditionValue::Range {
                    low: parse_scalar(low, &value_path.index(0))?,
                    high: parse_scalar(high, &value_path.index(1))?,
                },
                _ => {
                    return Err(err(
                        &value_path,
                        format!("BETWEEN requires exactly two values, found {}", items.len()),
                    ));
                }
            }
        }
        Some(v) => {
            if operator == Operator::Between {
                return Err(err(&value_path, "BETWEEN requires a [low, high] pair"));
            }
            ConditionValue::Scalar(parse_scalar(v, &value_path)?)
        }
    };

    let window = match (obj.get("window"), obj.get("last_n")) {
        (Some(_), Some(_)) => return Err(err(path, "both 'window' and 'last_n' given")),
        (Some(w), None) => Some(parse_window(w, &path.key("window"))?),
        (None, Some(n)) => Some(Window::all_of_last(parse_length(n, &path.key("last_n"))?)),
        (None, None) => None,
    };

    Ok(LeafCondition {
        field,
        operator,
        value,
        window,
    })
}

fn parse_window(value: &Value, path: &NodePath) -> Result<Window, ConditionParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| err(path, format!("expected an object, found {}", kind_name(value))))?;
    reject_unknown_keys(obj, &["length", "aggregation"], path)?;

    let length = match obj.get("length") {
        Some(v) => parse_length(v, &path.key("length"))?,
        None => return Err(err(path, "window requires 'length'")),
    };

    match obj.get("aggregation") {
        None => {}
        Some(Value::String(s)) if s.eq_ignore_ascii_case(WindowAggregation::WIRE_NAME) => {}
        Some(other) => {
            return Err(err(
                &path.key("aggregation"),
                format!(
                    "unsupported aggregation {other}, expected \"{}\"",
                    WindowAggregation::WIRE_NAME
                ),
            ));
        }
    }

    Ok(Window::all_of_last(length))
}

fn parse_length(value: &Value, path: &NodePath) -> Result<usize, ConditionParseError> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| err(path, format!("expected a non-negative integer, found {value}")))
}

fn parse_scalar(value: &Value, path: &NodePath) -> Result<Scalar, ConditionParseError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(Scalar::Number)
            .ok_or_else(|| err(path, format!("number {n} is not representable"))),
        Value::String(s) => Ok(Scalar::Text(s.clone())),
        Value::Bool(b) => Ok(Scalar::Bool(*b)),
        other => Err(err(
            path,
            format!("expected a number, string or boolean, found {}", kind_name(other)),
        )),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
