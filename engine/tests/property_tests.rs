// Property-based tests for engine invariants.
//
// Three categories:
// 1. Mode equivalence: INCREMENTAL evaluation matches FULL bit-for-bit on
//    randomly generated stateless DAGs under random input mutations
// 2. Structural obligations: every compiled graph passes its GraphCert and
//    keeps CSR cardinalities consistent
// 3. Idempotence: with no input changes, FULL is bit-stable and INCREMENTAL
//    recomputes nothing
//
// Uses proptest with explicit configuration to prevent CI flakiness. Graphs
// are generated layered (each compute node only references earlier nodes),
// so they are acyclic by construction.

use proptest::prelude::*;

use fluxion::compile::{compile, verify_graph};
use fluxion::def::NodeDefinition;
use fluxion::eval::{EvaluationMode, Evaluator};
use fluxion::graph::NodeId;
use fluxion::registry::OperationRegistry;

// ── Generators ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum OpPick {
    Add,
    Mul,
    Neg,
    Sum,
    Max,
}

fn arb_op() -> impl Strategy<Value = OpPick> {
    prop_oneof![
        Just(OpPick::Add),
        Just(OpPick::Mul),
        Just(OpPick::Neg),
        Just(OpPick::Sum),
        Just(OpPick::Max),
    ]
}

/// A random layered DAG: a few inputs followed by compute nodes that only
/// reference earlier nodes.
fn arb_definitions() -> impl Strategy<Value = Vec<NodeDefinition>> {
    (
        1usize..=3,
        prop::collection::vec(
            (arb_op(), prop::collection::vec(any::<prop::sample::Index>(), 3)),
            1..=24,
        ),
    )
        .prop_map(|(n_inputs, computes)| {
            let mut defs: Vec<NodeDefinition> = (0..n_inputs)
                .map(|i| NodeDefinition::input_with(format!("in{i}"), i as f64 + 0.5))
                .collect();
            let mut names: Vec<String> = defs.iter().map(|d| d.name.clone()).collect();

            for (j, (op, picks)) in computes.into_iter().enumerate() {
                let avail = names.len();
                let pick = |ix: &prop::sample::Index| names[ix.index(avail)].clone();
                let (op_name, parents): (&str, Vec<String>) = match op {
                    OpPick::Add => ("ADD", vec![pick(&picks[0]), pick(&picks[1])]),
                    OpPick::Mul => ("MUL", vec![pick(&picks[0]), pick(&picks[1])]),
                    OpPick::Neg => ("NEG", vec![pick(&picks[0])]),
                    OpPick::Sum => ("SUM", picks.iter().map(pick).collect()),
                    OpPick::Max => ("MAX", picks.iter().map(pick).collect()),
                };
                let name = format!("c{j}");
                defs.push(NodeDefinition::compute(name.clone(), op_name, parents));
                names.push(name);
            }
            defs
        })
}

fn arb_mutations() -> impl Strategy<Value = Vec<(prop::sample::Index, f64)>> {
    prop::collection::vec((any::<prop::sample::Index>(), -1.0e3f64..1.0e3), 1..=24)
}

fn input_ids(graph: &fluxion::graph::CompiledGraph) -> Vec<NodeId> {
    (0..graph.node_count())
        .map(|i| NodeId(i as u32))
        .filter(|&id| graph.is_input_id(id))
        .collect()
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        ..ProptestConfig::default()
    })]

    /// After priming, INCREMENTAL evaluation tracks FULL bit-for-bit across
    /// an arbitrary mutation sequence.
    #[test]
    fn incremental_matches_full(
        defs in arb_definitions(),
        mutations in arb_mutations(),
    ) {
        let registry = OperationRegistry::standard();
        let graph_full = compile(&defs, &registry).unwrap();
        let graph_incr = compile(&defs, &registry).unwrap();
        let node_count = graph_full.node_count();
        let inputs = input_ids(&graph_full);

        let mut full = Evaluator::new(graph_full, EvaluationMode::Full);
        let mut incr = Evaluator::new(graph_incr, EvaluationMode::Incremental);

        // Prime: force one complete pass on both sides.
        full.evaluate();
        for &id in &inputs {
            incr.mark_dirty_id(id).unwrap();
        }
        incr.evaluate();

        for step in 0..=mutations.len() {
            for i in 0..node_count {
                let id = NodeId(i as u32);
                prop_assert_eq!(
                    full.value_id(id).to_bits(),
                    incr.value_id(id).to_bits(),
                    "divergence at node {} after {} mutations",
                    id,
                    step
                );
            }
            if step == mutations.len() {
                break;
            }
            let (ref ix, value) = mutations[step];
            let target = inputs[ix.index(inputs.len())];
            full.set_input_id(target, value).unwrap();
            incr.set_input_id(target, value).unwrap();
            full.evaluate();
            incr.evaluate();
        }
    }

    /// Every compiled graph passes its structural obligations, and the CSR
    /// pair accounts for every edge exactly once in each direction.
    #[test]
    fn compiled_graphs_satisfy_structural_obligations(defs in arb_definitions()) {
        let registry = OperationRegistry::standard();
        let graph = compile(&defs, &registry).unwrap();

        let cert = verify_graph(&graph, &defs, &registry);
        prop_assert!(cert.all_pass(), "failed obligations: {:?}", cert.obligations());

        let total_parents: usize = (0..graph.node_count())
            .map(|i| graph.parents(NodeId(i as u32)).len())
            .sum();
        let total_children: usize = (0..graph.node_count())
            .map(|i| graph.children(NodeId(i as u32)).len())
            .sum();
        prop_assert_eq!(total_parents, graph.edge_count());
        prop_assert_eq!(total_children, graph.edge_count());

        // The compute order covers exactly the compute nodes.
        prop_assert_eq!(graph.compute_order().len(), graph.compute_count());
        prop_assert_eq!(graph.full_topo_order().len(), graph.node_count());
    }

    /// Without input changes, FULL re-evaluation is bit-stable and
    /// INCREMENTAL re-evaluation does nothing (stateless graphs only).
    #[test]
    fn idempotent_without_input_changes(defs in arb_definitions()) {
        let registry = OperationRegistry::standard();

        let mut full = Evaluator::new(
            compile(&defs, &registry).unwrap(),
            EvaluationMode::Full,
        );
        let computed_first = full.evaluate();
        let snapshot: Vec<u64> = (0..full.graph().node_count())
            .map(|i| full.value_id(NodeId(i as u32)).to_bits())
            .collect();
        let computed_second = full.evaluate();
        let after: Vec<u64> = (0..full.graph().node_count())
            .map(|i| full.value_id(NodeId(i as u32)).to_bits())
            .collect();

        prop_assert_eq!(computed_first, full.graph().compute_count() as u32);
        prop_assert_eq!(computed_first, computed_second);
        prop_assert_eq!(snapshot, after);

        let mut incr = Evaluator::new(
            compile(&defs, &registry).unwrap(),
            EvaluationMode::Incremental,
        );
        prop_assert_eq!(incr.evaluate(), 0);
        prop_assert_eq!(incr.evaluate(), 0);
    }
}
