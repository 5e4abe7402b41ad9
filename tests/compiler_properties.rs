//! Property tests for the SQL compiler over generated condition trees.

mod common;

use common::validated;
use proptest::prelude::*;
use screenwatch::domain::condition::Scalar;
use screenwatch::domain::field_registry::FieldRegistry;
use screenwatch::domain::sql_compiler::{Dialect, SqlCompiler, SqlParam};
use serde_json::{json, Value};

fn odd_number() -> impl Strategy<Value = f64> {
    (1000u32..9999, 1000u32..9999).prop_map(|(whole, frac)| whole as f64 + frac as f64 / 10_000.0)
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        (
            prop::sample::select(vec!["pe_ratio", "peg_ratio", "debt", "target_price_low"]),
            prop::sample::select(vec!["<", ">", "<=", ">=", "="]),
            odd_number(),
        )
            .prop_map(|(field, op, value)| json!({"field": field, "operator": op, "value": value})),
        "zz[a-z]{6}".prop_map(|s| json!({"field": "sector", "operator": "=", "value": s})),
        (1usize..6, odd_number()).prop_map(|(n, value)| {
            json!({"field": "net_profit", "operator": ">", "value": value, "last_n": n})
        }),
        (odd_number(), odd_number()).prop_map(|(a, b)| {
            json!({"field": "pe_ratio", "operator": "BETWEEN", "value": [a.min(b), a.max(b)]})
        }),
    ]
}

fn tree() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        (any::<bool>(), prop::collection::vec(inner, 0..4)).prop_map(|(and, children)| {
            json!({"logic": if and { "AND" } else { "OR" }, "children": children})
        })
    })
}

fn dialect() -> impl Strategy<Value = Dialect> {
    prop_oneof![Just(Dialect::Sqlite), Just(Dialect::Postgres)]
}

proptest! {
    #[test]
    fn values_only_travel_as_parameters(json in tree(), dialect in dialect()) {
        let condition = validated(json);
        let compiled = SqlCompiler::new(FieldRegistry::global(), dialect)
            .compile(&condition)
            .unwrap();

        for leaf in condition.root().leaves() {
            for scalar in leaf.value.scalars() {
                match scalar {
                    Scalar::Number(n) => {
                        prop_assert!(!compiled.predicate.contains(&n.to_string()));
                        prop_assert!(compiled.params.contains(&SqlParam::Number(*n)));
                    }
                    Scalar::Text(s) => {
                        prop_assert!(!compiled.predicate.contains(s.as_str()));
                        prop_assert!(compiled.params.contains(&SqlParam::Text(s.clone())));
                    }
                    Scalar::Bool(_) => {}
                }
            }
        }
    }

    #[test]
    fn compilation_is_deterministic(json in tree(), dialect in dialect()) {
        let condition = validated(json);
        let compiler = SqlCompiler::new(FieldRegistry::global(), dialect);
        prop_assert_eq!(compiler.compile(&condition).unwrap(), compiler.compile(&condition).unwrap());
    }

    #[test]
    fn placeholders_are_numbered_in_order(json in tree()) {
        let compiled = SqlCompiler::new(FieldRegistry::global(), Dialect::Postgres)
            .compile(&validated(json))
            .unwrap();
        for i in 1..=compiled.params.len() {
            let here = format!("${i}");
            prop_assert!(compiled.predicate.contains(&here));
        }
        let past_end = format!("${}", compiled.params.len() + 1);
        prop_assert!(!compiled.predicate.contains(&past_end));
    }

    #[test]
    fn multi_child_groups_are_parenthesised(
        children in prop::collection::vec(leaf(), 2..5),
        and in any::<bool>(),
    ) {
        let json = json!({"logic": if and { "AND" } else { "OR" }, "children": children});
        let compiled = SqlCompiler::new(FieldRegistry::global(), Dialect::Sqlite)
            .compile(&validated(json))
            .unwrap();
        let keyword = if and { " AND " } else { " OR " };
        prop_assert!(compiled.predicate.starts_with('('));
        prop_assert!(compiled.predicate.ends_with(')'));
        prop_assert!(compiled.predicate.contains(keyword));
    }
}
