//! Integration tests.
//!
//! Tests cover:
//! - Wire format -> validation -> SQL for the canonical nested example
//! - Screen queries executed against a seeded in-memory SQLite database
//! - All-of-last-N window semantics in SQL and in the tree evaluator
//! - Parity between the SQL compiler and the in-memory evaluator
//! - Alert evaluator trigger-once / re-trigger semantics on the SQLite store
//! - Per-instrument failure isolation and concurrent evaluator runs

mod common;

use approx::assert_relative_eq;
use common::*;
use screenwatch::adapters::file_config_adapter::FileConfigAdapter;
use screenwatch::adapters::sqlite_adapter::SqliteAdapter;
use screenwatch::domain::alert::NewAlert;
use screenwatch::domain::alert_evaluator::{AlertEvaluator, EvaluatorConfig, EventStatus};
use screenwatch::domain::condition::{Operator, Scalar};
use screenwatch::domain::condition_eval::{evaluate, DEFAULT_EPSILON};
use screenwatch::domain::condition_parser::parse_condition;
use screenwatch::domain::error::ScreenwatchError;
use screenwatch::domain::field_registry::FieldRegistry;
use screenwatch::domain::metric_resolver::MetricResolver;
use screenwatch::domain::sql_compiler::{build_screen_query, Dialect, SqlCompiler, SqlParam};
use screenwatch::domain::validator::validate;
use screenwatch::ports::alert_store_port::AlertStorePort;
use screenwatch::ports::metric_port::MetricPort;
use serde_json::json;
use std::time::Duration;

fn fast_config() -> EvaluatorConfig {
    EvaluatorConfig {
        retry_base: Duration::from_millis(1),
        ..Default::default()
    }
}

fn tech_example() -> serde_json::Value {
    json!({
        "logic": "AND",
        "children": [
            {"field": "sector", "operator": "=", "value": "Technology"},
            {"logic": "OR", "children": [
                {"field": "pe_ratio", "operator": "<", "value": 25},
                {"field": "peg_ratio", "operator": "<", "value": 1.5}
            ]}
        ]
    })
}

mod compilation {
    use super::*;

    #[test]
    fn nested_example_compiles_to_parenthesised_fragment() {
        let registry = FieldRegistry::global();
        let compiled = SqlCompiler::new(registry, Dialect::Sqlite)
            .compile(&validated(tech_example()))
            .unwrap();
        assert_eq!(
            compiled.predicate,
            "(s.sector = ?1 AND (f.pe_ratio < ?2 OR f.peg_ratio < ?3))"
        );
        assert_eq!(
            compiled.params,
            vec![
                SqlParam::Text("Technology".into()),
                SqlParam::Number(25.0),
                SqlParam::Number(1.5)
            ]
        );
    }

    #[test]
    fn postgres_placeholders() {
        let registry = FieldRegistry::global();
        let compiled = SqlCompiler::new(registry, Dialect::Postgres)
            .compile(&validated(tech_example()))
            .unwrap();
        assert_eq!(
            compiled.predicate,
            "(s.sector = $1 AND (f.pe_ratio < $2 OR f.peg_ratio < $3))"
        );
    }

    #[test]
    fn authoring_surface_variant_compiles_identically() {
        let variant = json!({
            "type": "logical",
            "operator": "and",
            "conditions": [
                {"type": "condition", "field": "sector", "operator": "=", "value": "Technology"},
                {"type": "logical", "operator": "or", "conditions": [
                    {"type": "condition", "field": "pe_ratio", "operator": "<", "value": 25},
                    {"type": "condition", "field": "peg_ratio", "operator": "<", "value": 1.5}
                ]}
            ]
        });
        let registry = FieldRegistry::global();
        let compiler = SqlCompiler::new(registry, Dialect::Sqlite);
        assert_eq!(
            compiler.compile(&validated(variant)).unwrap(),
            compiler.compile(&validated(tech_example())).unwrap()
        );
    }

    #[test]
    fn invalid_tree_never_compiles() {
        let json = json!({"logic": "AND", "children": [
            {"field": "pe_ratio", "operator": "<", "value": 25},
            {"field": "pe_ratio; DROP TABLE alerts", "operator": "<", "value": 1}
        ]});
        let condition = parse_condition(&json).unwrap();
        let err = validate(condition, FieldRegistry::global()).unwrap_err();
        assert_eq!(err.path.to_string(), "/children/1");
    }

    #[test]
    fn empty_group_is_a_no_op_filter() {
        let registry = FieldRegistry::global();
        let compiled = SqlCompiler::new(registry, Dialect::Sqlite)
            .compile(&validated(json!({"logic": "AND", "children": []})))
            .unwrap();
        assert!(compiled.is_tautology());
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn window_leaf_uses_ranked_subquery() {
        let registry = FieldRegistry::global();
        let compiled = SqlCompiler::new(registry, Dialect::Sqlite)
            .compile(&validated(
                json!({"field": "net_profit", "operator": ">", "value": 0, "last_n": 4}),
            ))
            .unwrap();
        assert!(compiled.predicate.contains("ROW_NUMBER() OVER"));
        assert!(compiled.predicate.contains("HAVING COUNT(*) = 4"));
        assert_eq!(compiled.params, vec![SqlParam::Number(0.0)]);
    }
}

mod screening {
    use super::*;

    fn seed_tech(adapter: &SqliteAdapter) {
        seed_instrument(adapter, 1, "AAA", &[
            ("sector", Scalar::from("Technology")),
            ("pe_ratio", Scalar::from(20.0)),
            ("peg_ratio", Scalar::from(2.0)),
        ]);
        seed_instrument(adapter, 2, "BBB", &[
            ("sector", Scalar::from("Technology")),
            ("pe_ratio", Scalar::from(30.0)),
            ("peg_ratio", Scalar::from(1.2)),
        ]);
        seed_instrument(adapter, 3, "CCC", &[
            ("sector", Scalar::from("Technology")),
            ("pe_ratio", Scalar::from(30.0)),
            ("peg_ratio", Scalar::from(2.0)),
        ]);
        seed_instrument(adapter, 4, "DDD", &[
            ("sector", Scalar::from("Energy")),
            ("pe_ratio", Scalar::from(10.0)),
        ]);
        seed_instrument(adapter, 5, "EEE", &[("sector", Scalar::from("Technology"))]);
    }

    #[test]
    fn nested_example_selects_expected_instruments() {
        let adapter = seeded_sqlite();
        seed_tech(&adapter);
        assert_eq!(screen_symbols(&adapter, tech_example()), vec!["AAA", "BBB"]);
    }

    #[test]
    fn empty_group_matches_everything() {
        let adapter = seeded_sqlite();
        seed_tech(&adapter);
        assert_eq!(
            screen_symbols(&adapter, json!({"logic": "AND", "children": []})),
            vec!["AAA", "BBB", "CCC", "DDD", "EEE"]
        );
    }

    #[test]
    fn or_with_empty_group_matches_everything() {
        let adapter = seeded_sqlite();
        seed_tech(&adapter);
        let json = json!({"logic": "OR", "children": [
            {"field": "pe_ratio", "operator": "<", "value": 1},
            {"logic": "AND", "children": []}
        ]});
        assert_eq!(screen_symbols(&adapter, json).len(), 5);
    }

    #[test]
    fn between_is_inclusive() {
        let adapter = seeded_sqlite();
        seed_tech(&adapter);
        let json = json!({"field": "pe_ratio", "operator": "BETWEEN", "value": [10, 20]});
        assert_eq!(screen_symbols(&adapter, json), vec!["AAA", "DDD"]);
    }

    #[test]
    fn limit_is_bound() {
        let adapter = seeded_sqlite();
        seed_tech(&adapter);
        let registry = FieldRegistry::global();
        let compiled = SqlCompiler::new(registry, Dialect::Sqlite)
            .compile(&validated(json!({"field": "sector", "operator": "=", "value": "Technology"})))
            .unwrap();
        let query = build_screen_query(&compiled, registry, Some(2)).unwrap();
        assert_eq!(query.params.last(), Some(&SqlParam::Integer(2)));
        let rows = adapter.run_screen(&query).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].symbol, "AAA");
    }

    #[test]
    fn all_of_last_four_quarters() {
        let adapter = seeded_sqlite();
        seed_instrument(&adapter, 1, "MIXED", &[]);
        seed_quarters(&adapter, 1, "net_profit", &[5.0, 3.0, -1.0, 2.0]);
        seed_instrument(&adapter, 2, "STEADY", &[]);
        seed_quarters(&adapter, 2, "net_profit", &[1.0, 2.0, 3.0, 4.0]);
        seed_instrument(&adapter, 3, "YOUNG", &[]);
        seed_quarters(&adapter, 3, "net_profit", &[1.0, 2.0, 3.0]);
        seed_instrument(&adapter, 4, "RECOVERED", &[]);
        seed_quarters(&adapter, 4, "net_profit", &[-5.0, 1.0, 2.0, 3.0, 4.0]);

        let json = json!({"field": "net_profit", "operator": ">", "value": 0, "last_n": 4});
        assert_eq!(screen_symbols(&adapter, json), vec!["RECOVERED", "STEADY"]);
    }

    #[test]
    fn windowless_time_series_leaf_uses_latest_quarter() {
        let adapter = seeded_sqlite();
        seed_instrument(&adapter, 1, "UP", &[]);
        seed_quarters(&adapter, 1, "revenue", &[-1.0, 10.0]);
        seed_instrument(&adapter, 2, "DOWN", &[]);
        seed_quarters(&adapter, 2, "revenue", &[10.0, -1.0]);

        let json = json!({"field": "revenue", "operator": ">", "value": 0});
        assert_eq!(screen_symbols(&adapter, json), vec!["UP"]);
    }

    #[test]
    fn sql_and_tree_evaluator_agree() {
        let adapter = seeded_sqlite();
        seed_tech(&adapter);
        for (id, values) in [
            (1, vec![1.0, 2.0, 3.0]),
            (2, vec![1.0, -2.0, 3.0]),
            (4, vec![4.0, 5.0, 6.0]),
        ] {
            seed_quarters(&adapter, id, "net_profit", &values);
        }

        let trees = [
            tech_example(),
            json!({"logic": "OR", "children": [
                {"field": "net_profit", "operator": ">", "value": 0, "window": {"length": 3}},
                {"field": "pe_ratio", "operator": ">=", "value": 30}
            ]}),
            json!({"logic": "AND", "children": [
                {"field": "net_profit", "operator": ">", "value": 0, "last_n": 2},
                {"logic": "OR", "children": [
                    {"field": "sector", "operator": "=", "value": "Energy"},
                    {"field": "peg_ratio", "operator": "<=", "value": 2}
                ]}
            ]}),
        ];

        for tree in trees {
            assert_eq!(screen_symbols(&adapter, tree.clone()), eval_symbols(&adapter, tree));
        }
    }

    #[test]
    fn sql_and_tree_evaluator_agree_at_threshold_edges() {
        let adapter = seeded_sqlite();
        seed_instrument(&adapter, 1, "NEAR", &[("pe_ratio", Scalar::from(20.0 - 5e-10))]);
        seed_instrument(&adapter, 2, "EXACT", &[("pe_ratio", Scalar::from(20.0))]);
        seed_instrument(&adapter, 3, "OVER", &[("pe_ratio", Scalar::from(20.0 + 5e-10))]);

        let lt = json!({"field": "pe_ratio", "operator": "<", "value": 20});
        assert_eq!(screen_symbols(&adapter, lt.clone()), vec!["NEAR"]);
        assert_eq!(eval_symbols(&adapter, lt), vec!["NEAR"]);

        for tree in [
            json!({"field": "pe_ratio", "operator": ">", "value": 20}),
            json!({"field": "pe_ratio", "operator": "<=", "value": 20}),
            json!({"field": "pe_ratio", "operator": ">=", "value": 20}),
            json!({"field": "pe_ratio", "operator": "BETWEEN", "value": [10, 20]}),
            json!({"field": "pe_ratio", "operator": "BETWEEN", "value": [20, 30]}),
        ] {
            assert_eq!(screen_symbols(&adapter, tree.clone()), eval_symbols(&adapter, tree));
        }
    }

    /// Symbols the in-memory evaluator accepts, sorted like a screen.
    fn eval_symbols(adapter: &SqliteAdapter, tree: serde_json::Value) -> Vec<String> {
        let condition = validated(tree);
        let resolver = MetricResolver::new(FieldRegistry::global(), adapter);
        let mut symbols = Vec::new();
        for instrument in MetricPort::list_instruments(adapter).unwrap() {
            if evaluate(&condition, &resolver, instrument.id, DEFAULT_EPSILON).unwrap() {
                symbols.push(instrument.symbol);
            }
        }
        symbols.sort();
        symbols
    }
}

mod alerts {
    use super::*;

    fn setup(values: &[(i64, f64)]) -> SqliteAdapter {
        let adapter = seeded_sqlite();
        let registry = FieldRegistry::global();
        for id in 1..=5 {
            seed_instrument(&adapter, id, &format!("SYM{id}"), &[]);
        }
        for (id, v) in values {
            adapter
                .set_snapshot_value(registry, *id, "pe_ratio", &Scalar::from(*v))
                .unwrap();
        }
        adapter
    }

    fn run(adapter: &SqliteAdapter) -> screenwatch::domain::alert_evaluator::EvaluationReport {
        AlertEvaluator::new(adapter, adapter, FieldRegistry::global(), fast_config())
            .run()
            .unwrap()
    }

    #[test]
    fn trigger_once_across_runs() {
        let adapter = setup(&[(1, 12.0), (2, 40.0), (3, 15.0)]);
        let alert = adapter
            .create_alert(&NewAlert::new("pe_ratio", Operator::Lt, 20.0))
            .unwrap();

        let first = run(&adapter);
        assert_eq!(first.new_events.len(), 2);
        assert_eq!(first.unavailable, 2);

        let second = run(&adapter);
        assert!(second.new_events.is_empty());
        assert_eq!(second.already_triggered, 2);
        assert!(second
            .events
            .iter()
            .all(|e| e.status == EventStatus::AlreadyTriggered));

        assert_eq!(adapter.events_for_alert(alert.id).unwrap().len(), 2);
    }

    #[test]
    fn retrigger_after_transition() {
        let adapter = setup(&[(1, 12.0)]);
        let registry = FieldRegistry::global();
        let alert = adapter
            .create_alert(&NewAlert::new("pe_ratio", Operator::Lt, 20.0))
            .unwrap();

        assert_eq!(run(&adapter).new_events.len(), 1);
        adapter.set_snapshot_value(registry, 1, "pe_ratio", &Scalar::from(25.0)).unwrap();
        assert!(run(&adapter).new_events.is_empty());
        adapter.set_snapshot_value(registry, 1, "pe_ratio", &Scalar::from(18.0)).unwrap();
        let third = run(&adapter);
        assert_eq!(third.new_events.len(), 1);

        let events = adapter.events_for_alert(alert.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_relative_eq!(events[0].triggered_value, 12.0);
        assert_relative_eq!(events[1].triggered_value, 18.0);

        let summaries = adapter.list_alerts().unwrap();
        assert_eq!(summaries[0].trigger_count, 2);
    }

    #[test]
    fn inactive_alerts_are_not_evaluated() {
        let adapter = setup(&[(1, 12.0)]);
        let alert = adapter
            .create_alert(&NewAlert::new("pe_ratio", Operator::Lt, 20.0))
            .unwrap();
        adapter.deactivate_alert(alert.id).unwrap();
        let report = run(&adapter);
        assert_eq!(report.alerts_evaluated, 0);
        assert!(adapter.events_for_alert(alert.id).unwrap().is_empty());
    }

    #[test]
    fn resolver_failure_skips_only_that_instrument() {
        let store = seeded_sqlite();
        store
            .create_alert(&NewAlert::new("pe_ratio", Operator::Gt, 0.0))
            .unwrap();
        let metrics = MockMetricPort::new(instruments(3))
            .with_value(1, "pe_ratio", 5.0)
            .with_value(2, "pe_ratio", 6.0)
            .with_value(3, "pe_ratio", 7.0)
            .with_error(2, "connection reset");

        let report = AlertEvaluator::new(&store, &metrics, FieldRegistry::global(), fast_config())
            .run()
            .unwrap();
        let triggered: Vec<i64> = report.new_events.iter().map(|e| e.instrument_id).collect();
        assert_eq!(triggered, vec![1, 3]);
        assert_eq!(report.unavailable, 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn overlapping_runs_record_each_pair_once() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("screen.db");
        let config = FileConfigAdapter::from_string(&format!(
            "[sqlite]\npath = {}\npool_size = 4\nbusy_timeout_ms = 10000\n",
            db_path.display()
        ))
        .unwrap();
        let adapter = SqliteAdapter::from_config(&config).unwrap();
        adapter.initialize_schema().unwrap();

        let registry = FieldRegistry::global();
        for id in 1..=20 {
            seed_instrument_on(&adapter, id);
            adapter
                .set_snapshot_value(registry, id, "pe_ratio", &Scalar::from(id as f64))
                .unwrap();
        }
        let alert = adapter
            .create_alert(&NewAlert::new("pe_ratio", Operator::Le, 10.0))
            .unwrap();

        let reports: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        AlertEvaluator::new(&adapter, &adapter, registry, fast_config())
                            .run()
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let total_new: usize = reports.iter().map(|r| r.new_events.len()).sum();
        assert_eq!(total_new, 10);
        assert_eq!(adapter.events_for_alert(alert.id).unwrap().len(), 10);
    }

    fn seed_instrument_on(adapter: &SqliteAdapter, id: i64) {
        adapter
            .insert_instrument(&Instrument::new(id, &format!("SYM{id:02}"), "Co"))
            .unwrap();
    }

    #[test]
    fn unknown_alert_operations_fail() {
        let adapter = seeded_sqlite();
        assert!(matches!(
            adapter.deactivate_alert(42),
            Err(ScreenwatchError::AlertNotFound { alert_id: 42 })
        ));
        assert_eq!(adapter.get_alert(42).unwrap(), None);
    }
}
