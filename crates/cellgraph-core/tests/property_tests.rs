//! # Property-Based Tests
//!
//! Ordering, determinism and versioning invariants checked with proptest.

use cellgraph_core::{
    Address, Cell, Context, Dag, Document, EdgeLabel, Filter, Function, LoadMode, ManualClock,
    MemoryStore, Registry, Timestamp, Value, Versioned,
};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

fn addr(n: u8) -> Address {
    Address::new(None, [("n".to_string(), Value::Int(i64::from(n)))])
}

/// Random DAG: edges only go from a lower to a higher node number.
fn dag_from(edges: &[(u8, u8)]) -> Dag {
    let mut dag = Dag::new();
    for &(x, y) in edges {
        let (parent, child) = if x < y { (x, y) } else { (y, x) };
        if parent != child {
            dag.add_edge(&addr(parent), &addr(child), "in");
        }
    }
    dag
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Every parent sits in a strictly earlier generation than its child.
    #[test]
    fn generations_respect_edges(edges in vec((0u8..20, 0u8..20), 0..60)) {
        let dag = dag_from(&edges);
        let generations = dag.topological_generations(&[addr(0)]).expect("acyclic");

        for (child, generation) in &generations.by_address {
            for parent in dag.parents(child).keys() {
                if let Some(parent_generation) = generations.generation_of(parent) {
                    prop_assert!(parent_generation < *generation);
                }
            }
        }
    }

    /// The same edges in any insertion order give the same generations.
    #[test]
    fn generations_are_deterministic(edges in vec((0u8..15, 0u8..15), 0..40)) {
        let forward = dag_from(&edges);
        let mut reversed_edges = edges.clone();
        reversed_edges.reverse();
        let backward = dag_from(&reversed_edges);

        let roots = [addr(0), addr(1)];
        prop_assert_eq!(
            forward.topological_generations(&roots).expect("acyclic"),
            backward.topological_generations(&roots).expect("acyclic")
        );
    }

    /// Replacing parents leaves exactly the requested edge set.
    #[test]
    fn replace_parents_is_exact(
        before in vec(0u8..10, 0..8),
        after in vec(0u8..10, 0..8),
    ) {
        let child = addr(100);
        let mut dag = Dag::new();
        let as_parents = |ns: &[u8]| -> BTreeMap<Address, EdgeLabel> {
            ns.iter()
                .map(|&n| (addr(n), EdgeLabel::from(["in".to_string()])))
                .collect()
        };

        dag.replace_parents(&child, as_parents(&before));
        dag.replace_parents(&child, as_parents(&after));

        let expected: Vec<Address> = as_parents(&after).into_keys().collect();
        let actual: Vec<Address> = dag.parents(&child).into_keys().collect();
        prop_assert_eq!(actual, expected);
        prop_assert_eq!(dag.edge_count(), as_parents(&after).len());
    }

    /// Filters and their negation partition any document set.
    #[test]
    fn negation_partitions(values in vec(-50i64..50, 1..30), pivot in -50i64..50) {
        let filter = Filter::field("x").gte(pivot);
        let negated = !filter.clone();
        for v in values {
            let doc: Document = [("x".to_string(), Value::Int(v))].into();
            prop_assert_ne!(filter.matches(&doc), negated.matches(&doc));
        }
    }

    /// A point-in-time read returns the last value saved at or before it.
    #[test]
    fn point_in_time_returns_last_write(
        gaps in vec(1i64..100, 1..12),
        pick in 0usize..12,
    ) {
        let clock = ManualClock::new(Timestamp(0));
        let mut versioned = Versioned::new(MemoryStore::new()).with_clock(Arc::new(clock.clone()));
        let key = vec![("k".to_string(), Value::from("x"))];

        let mut at = 0i64;
        let mut written = Vec::new();
        for (i, gap) in gaps.iter().enumerate() {
            at += gap;
            clock.set(Timestamp(at));
            let cell = Cell::literal(i as i64)
                .with_extra("k", "x")
                .with_primary_key(["k"])
                .stored_in("c");
            versioned.save(&cell).expect("save");
            written.push((at, i as i64));
        }

        let index = pick.min(written.len() - 1);
        let (instant, expected) = written[index];
        let doc = versioned.load("c", &key, Some(Timestamp(instant))).expect("as of");
        let cell = versioned
            .policy()
            .to_cell("c", &doc, &Registry::new())
            .expect("decode");
        prop_assert_eq!(cell.value().expect("value"), Value::Int(expected));
        prop_assert_eq!(versioned.history("c", &key).expect("history").len(), written.len());
    }

    /// Pushing a new leaf value recomputes a sum chain to the same result a
    /// fresh evaluation gives.
    #[test]
    fn push_matches_fresh_evaluation(start in -1000i64..1000, bumped in -1000i64..1000, len in 1usize..8) {
        let add = Function::new("add", ["a", "b"], |args| {
            Ok(Value::Int(args.int("a")?.saturating_add(args.int("b")?)))
        });
        let chain = |ctx: &mut Context, leaf: i64| -> Vec<Cell> {
            let mut cells = Vec::new();
            let first = Cell::new(Arc::clone(&add))
                .with_extra("i", 0)
                .with_primary_key(["i"])
                .with_input("a", leaf)
                .with_input("b", 1);
            cells.push(ctx.go(first, 0).expect("leaf"));
            for i in 1..len {
                let previous = cells[i - 1].clone();
                let cell = Cell::new(Arc::clone(&add))
                    .with_extra("i", i as i64)
                    .with_primary_key(["i"])
                    .with_input("a", previous)
                    .with_input("b", 1);
                cells.push(ctx.go(cell, 0).expect("link"));
            }
            cells
        };

        let clock = ManualClock::new(Timestamp(1));
        let mut ctx = Context::new().with_clock(Arc::new(clock.clone()));
        let mut cells = chain(&mut ctx, start);
        let last = cells.last().cloned().expect("non-empty chain");
        clock.advance(1);
        let mut leaf = cells.remove(0);
        leaf.set_input("a", bumped);
        ctx.push(leaf).expect("push");

        let mut fresh = Context::new();
        let expected = chain(&mut fresh, bumped).pop().expect("last").value().expect("value");
        let last = ctx.load(last, LoadMode::Required).expect("last");
        prop_assert_eq!(last.value().expect("value"), expected);
    }
}
