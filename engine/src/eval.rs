// eval.rs — Graph evaluation
//
// Owns a compiled graph and drives it: input writes with bit-pattern dirty
// detection, FULL sweeps over the compute order, and INCREMENTAL Mark &
// Sweep over the descendants of dirty inputs. Scratch structures (two
// bitsets, one stack) are allocated once and reused, so evaluation itself
// never allocates, never blocks, and performs no I/O.
//
// Preconditions: the graph was produced by `compile::compile`.
// Postconditions: after `evaluate`, every recomputed node's value equals its
//                 kernel applied to the current parent values.
// Failure modes: unknown or non-input targets → `EvalError::UnknownInput`;
//                mismatched batch slices → `EvalError::BatchLengthMismatch`.
// Side effects: mutates the owned graph's value plane and kernel state.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bitset::DenseBitSet;
use crate::error::EvalError;
use crate::graph::{CompiledGraph, KernelCtx, NodeId};

// ── Modes and stats ─────────────────────────────────────────────────────────

/// How `evaluate` selects the nodes to recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationMode {
    /// Recompute every compute node, every call. Deterministic latency.
    Full,
    /// Recompute only descendants of inputs whose value changed since the
    /// last evaluation (plus stateful nodes, which are always re-run).
    Incremental,
}

impl fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationMode::Full => write!(f, "FULL"),
            EvaluationMode::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

/// Evaluation counters, cumulative since construction or `reset_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalStats {
    pub evaluation_count: u64,
    pub total_nodes_computed: u64,
    pub total_elapsed_nanos: u64,
    pub mode: EvaluationMode,
}

impl EvalStats {
    /// Mean number of nodes recomputed per evaluation.
    pub fn avg_nodes_per_evaluation(&self) -> f64 {
        if self.evaluation_count == 0 {
            0.0
        } else {
            self.total_nodes_computed as f64 / self.evaluation_count as f64
        }
    }

    /// Mean wall-clock nanoseconds per evaluation.
    pub fn avg_nanos_per_evaluation(&self) -> f64 {
        if self.evaluation_count == 0 {
            0.0
        } else {
            self.total_elapsed_nanos as f64 / self.evaluation_count as f64
        }
    }
}

// ── Evaluator ───────────────────────────────────────────────────────────────

/// Single-writer evaluator for one compiled graph.
///
/// The evaluator takes ownership of the graph; together they form one
/// single-threaded unit. To evaluate the same topology from several threads,
/// compile one graph per thread.
///
/// # Stateful kernels and INCREMENTAL mode
///
/// A stateful kernel advances its state every time it computes. In
/// INCREMENTAL mode the evaluator therefore seeds every stateful node into
/// the mark phase on every `evaluate` call, as if one of its inputs had
/// changed: stateful kernels tick exactly as they would in FULL mode, at the
/// cost of recomputing each stateful node and its descendants every call.
/// Purely stateless graphs are unaffected — with no dirty inputs,
/// `evaluate` recomputes nothing.
pub struct Evaluator {
    graph: CompiledGraph,
    mode: EvaluationMode,

    // Reusable scratch, sized at construction.
    dirty_inputs: DenseBitSet,
    needs_recompute: DenseBitSet,
    dfs_stack: Vec<NodeId>,

    evaluation_count: u64,
    total_nodes_computed: u64,
    total_elapsed_nanos: u64,
}

impl Evaluator {
    /// Wrap `graph` in an evaluator running in `mode`.
    pub fn new(graph: CompiledGraph, mode: EvaluationMode) -> Self {
        let n = graph.node_count();
        debug!(
            %mode,
            nodes = n,
            stateful = graph.stateful_nodes().len(),
            "evaluator created"
        );
        Evaluator {
            graph,
            mode,
            dirty_inputs: DenseBitSet::new(n),
            needs_recompute: DenseBitSet::new(n),
            dfs_stack: Vec::with_capacity(n),
            evaluation_count: 0,
            total_nodes_computed: 0,
            total_elapsed_nanos: 0,
        }
    }

    pub fn mode(&self) -> EvaluationMode {
        self.mode
    }

    /// Shared view of the owned graph.
    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    /// Give the graph back, consuming the evaluator.
    pub fn into_graph(self) -> CompiledGraph {
        self.graph
    }

    // ── Input mutation ──────────────────────────────────────────────────

    /// Write an input by name. In INCREMENTAL mode the input is marked dirty
    /// only when the new value's bit pattern differs from the current one,
    /// so overwriting NaN with NaN is a no-op and `0.0`/`-0.0` are distinct.
    pub fn set_input(&mut self, name: &str, value: f64) -> Result<(), EvalError> {
        let id = self
            .graph
            .input_id(name)
            .ok_or_else(|| EvalError::UnknownInput { node: name.into() })?;
        self.write_input(id, value);
        Ok(())
    }

    /// Write an input by id. Same dirty semantics as [`Self::set_input`].
    pub fn set_input_id(&mut self, id: NodeId, value: f64) -> Result<(), EvalError> {
        if !self.graph.is_input_id(id) {
            return Err(EvalError::UnknownInput {
                node: self.graph.display_name(id),
            });
        }
        self.write_input(id, value);
        Ok(())
    }

    #[inline]
    fn write_input(&mut self, id: NodeId, value: f64) {
        let slot = &mut self.graph.values[id.index()];
        match self.mode {
            EvaluationMode::Full => *slot = value,
            EvaluationMode::Incremental => {
                if slot.to_bits() != value.to_bits() {
                    *slot = value;
                    self.dirty_inputs.set(id.index());
                }
            }
        }
    }

    /// Batch input write. `ids` and `values` must be the same length.
    pub fn set_inputs(&mut self, ids: &[NodeId], values: &[f64]) -> Result<(), EvalError> {
        if ids.len() != values.len() {
            return Err(EvalError::BatchLengthMismatch {
                ids: ids.len(),
                values: values.len(),
            });
        }
        for (&id, &value) in ids.iter().zip(values) {
            self.set_input_id(id, value)?;
        }
        Ok(())
    }

    /// Explicitly mark an input dirty by name, forcing its descendants to
    /// recompute on the next INCREMENTAL evaluation. No-op in FULL mode.
    pub fn mark_dirty(&mut self, name: &str) -> Result<(), EvalError> {
        let id = self
            .graph
            .input_id(name)
            .ok_or_else(|| EvalError::UnknownInput { node: name.into() })?;
        self.mark_dirty_id(id)
    }

    /// Explicitly mark an input dirty by id. No-op in FULL mode.
    pub fn mark_dirty_id(&mut self, id: NodeId) -> Result<(), EvalError> {
        if !self.graph.is_input_id(id) {
            return Err(EvalError::UnknownInput {
                node: self.graph.display_name(id),
            });
        }
        if self.mode == EvaluationMode::Incremental {
            self.dirty_inputs.set(id.index());
        }
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Current value of a node by name.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.graph.value(name)
    }

    /// Current value of a node by id.
    pub fn value_id(&self, id: NodeId) -> f64 {
        self.graph.value_id(id)
    }

    /// The value of the last node in compute order; NaN with no compute nodes.
    pub fn result(&self) -> f64 {
        self.graph.result()
    }

    /// Cumulative counters.
    pub fn stats(&self) -> EvalStats {
        EvalStats {
            evaluation_count: self.evaluation_count,
            total_nodes_computed: self.total_nodes_computed,
            total_elapsed_nanos: self.total_elapsed_nanos,
            mode: self.mode,
        }
    }

    /// Zero all counters.
    pub fn reset_stats(&mut self) {
        self.evaluation_count = 0;
        self.total_nodes_computed = 0;
        self.total_elapsed_nanos = 0;
    }

    /// Reset every stateful kernel to its freshly constructed state.
    pub fn reset_kernels(&mut self) {
        for kernel in self.graph.kernels.iter_mut().flatten() {
            kernel.reset();
        }
    }

    // ── Evaluation ──────────────────────────────────────────────────────

    /// Run one evaluation pass and return the number of nodes recomputed.
    pub fn evaluate(&mut self) -> u32 {
        let started = Instant::now();
        let computed = match self.mode {
            EvaluationMode::Full => self.evaluate_full(),
            EvaluationMode::Incremental => self.evaluate_incremental(),
        };
        self.evaluation_count += 1;
        self.total_nodes_computed += u64::from(computed);
        self.total_elapsed_nanos += started.elapsed().as_nanos() as u64;
        computed
    }

    /// Recompute every compute node in topological order.
    fn evaluate_full(&mut self) -> u32 {
        let graph = &mut self.graph;
        let values = &mut graph.values;
        let kernels = &mut graph.kernels;
        let parent_ids = &graph.parent_ids;
        let parent_offsets = &graph.parent_offsets;

        for &node in &graph.compute_order {
            if let Some(kernel) = kernels[node.index()].as_mut() {
                let ctx = KernelCtx::new(values, parent_ids, parent_offsets);
                let out = kernel.compute(node, &ctx);
                values[node.index()] = out;
            }
        }
        graph.compute_order.len() as u32
    }

    /// Mark & Sweep: mark all descendants of dirty inputs (and all stateful
    /// nodes), then recompute the marked subset in topological order.
    fn evaluate_incremental(&mut self) -> u32 {
        let graph = &mut self.graph;
        let dirty = &mut self.dirty_inputs;
        let marked = &mut self.needs_recompute;
        let stack = &mut self.dfs_stack;

        if dirty.is_clear() && graph.stateful_nodes.is_empty() {
            return 0;
        }

        // Mark phase: descendants of every dirty input.
        for bit in dirty.ones() {
            let input = NodeId(bit as u32);
            for &child in graph.children(input) {
                mark_descendants(child, marked, stack, &graph.child_offsets, &graph.child_ids);
            }
        }
        dirty.clear_all();

        // Stateful nodes tick every evaluation; seed them as if dirty.
        for &node in &graph.stateful_nodes {
            mark_descendants(node, marked, stack, &graph.child_offsets, &graph.child_ids);
        }

        // Sweep phase: recompute marked nodes in topological order.
        let values = &mut graph.values;
        let kernels = &mut graph.kernels;
        let parent_ids = &graph.parent_ids;
        let parent_offsets = &graph.parent_offsets;
        let mut computed = 0u32;

        for &node in &graph.compute_order {
            if !marked.contains(node.index()) {
                continue;
            }
            if let Some(kernel) = kernels[node.index()].as_mut() {
                let ctx = KernelCtx::new(values, parent_ids, parent_offsets);
                let out = kernel.compute(node, &ctx);
                values[node.index()] = out;
                computed += 1;
            }
        }
        marked.clear_all();
        computed
    }
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("mode", &self.mode)
            .field("graph", &self.graph)
            .field("evaluation_count", &self.evaluation_count)
            .finish_non_exhaustive()
    }
}

/// Iterative DFS from `start` over the child CSR, marking every reachable
/// node (including `start`). Children are pushed in reverse index order so
/// they pop in forward order.
fn mark_descendants(
    start: NodeId,
    marked: &mut DenseBitSet,
    stack: &mut Vec<NodeId>,
    child_offsets: &[u32],
    child_ids: &[NodeId],
) {
    if marked.contains(start.index()) {
        return;
    }
    stack.push(start);
    while let Some(node) = stack.pop() {
        if marked.contains(node.index()) {
            continue;
        }
        marked.set(node.index());

        let begin = child_offsets[node.index()] as usize;
        let end = child_offsets[node.index() + 1] as usize;
        for i in (begin..end).rev() {
            let child = child_ids[i];
            if !marked.contains(child.index()) {
                stack.push(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::GraphBuilder;
    use crate::registry::OperationRegistry;

    fn sum_graph() -> CompiledGraph {
        GraphBuilder::new()
            .input_with("a", 10.0)
            .input_with("b", 20.0)
            .compute("sum", "ADD", &["a", "b"])
            .compile(&OperationRegistry::standard())
            .unwrap()
    }

    #[test]
    fn full_mode_recomputes_everything() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Full);
        assert_eq!(eval.evaluate(), 1);
        assert_eq!(eval.value("sum"), Some(30.0));

        eval.set_input("a", 5.0).unwrap();
        assert_eq!(eval.evaluate(), 1);
        assert_eq!(eval.value("sum"), Some(25.0));
        assert_eq!(eval.result(), 25.0);
    }

    #[test]
    fn incremental_skips_when_nothing_changed() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Incremental);
        eval.set_input("a", 1.0).unwrap();
        assert_eq!(eval.evaluate(), 1);
        assert_eq!(eval.value("sum"), Some(21.0));

        // No intervening change: nothing to do.
        assert_eq!(eval.evaluate(), 0);

        // Rewriting the identical bit pattern does not dirty the input.
        eval.set_input("a", 1.0).unwrap();
        assert_eq!(eval.evaluate(), 0);
    }

    #[test]
    fn nan_overwrite_is_a_no_op() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Incremental);
        eval.set_input("a", f64::NAN).unwrap();
        assert_eq!(eval.evaluate(), 1);
        assert!(eval.value("sum").unwrap().is_nan());

        // Same NaN bit pattern again: no dirty mark, no recompute.
        eval.set_input("a", f64::NAN).unwrap();
        assert_eq!(eval.evaluate(), 0);
    }

    #[test]
    fn signed_zero_transition_marks_dirty() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Incremental);
        eval.set_input("a", 0.0).unwrap();
        eval.evaluate();
        // +0.0 and -0.0 compare equal but have distinct bit patterns.
        eval.set_input("a", -0.0).unwrap();
        assert_eq!(eval.evaluate(), 1);
    }

    #[test]
    fn mark_dirty_forces_recompute() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Incremental);
        eval.evaluate();
        assert_eq!(eval.evaluate(), 0);
        eval.mark_dirty("a").unwrap();
        assert_eq!(eval.evaluate(), 1);
    }

    #[test]
    fn mark_dirty_is_a_no_op_in_full_mode() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Full);
        eval.mark_dirty("a").unwrap();
        assert_eq!(eval.evaluate(), 1);
        // Still validates the target.
        assert!(eval.mark_dirty("sum").is_err());
    }

    #[test]
    fn batch_set_inputs() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Incremental);
        let a = eval.graph().input_id("a").unwrap();
        let b = eval.graph().input_id("b").unwrap();

        eval.set_inputs(&[a, b], &[1.0, 2.0]).unwrap();
        assert_eq!(eval.evaluate(), 1);
        assert_eq!(eval.value("sum"), Some(3.0));

        let err = eval.set_inputs(&[a, b], &[1.0]).unwrap_err();
        assert_eq!(err, EvalError::BatchLengthMismatch { ids: 2, values: 1 });
    }

    #[test]
    fn non_input_targets_rejected() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Incremental);
        assert_eq!(
            eval.set_input("sum", 1.0).unwrap_err(),
            EvalError::UnknownInput { node: "sum".into() }
        );
        assert_eq!(
            eval.set_input("ghost", 1.0).unwrap_err(),
            EvalError::UnknownInput {
                node: "ghost".into()
            }
        );
        let sum = eval.graph().node_id("sum").unwrap();
        assert!(eval.set_input_id(sum, 1.0).is_err());
        assert!(eval.mark_dirty_id(sum).is_err());
    }

    #[test]
    fn stats_accumulate_and_reset() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Full);
        eval.evaluate();
        eval.evaluate();
        let stats = eval.stats();
        assert_eq!(stats.evaluation_count, 2);
        assert_eq!(stats.total_nodes_computed, 2);
        assert_eq!(stats.mode, EvaluationMode::Full);
        assert!((stats.avg_nodes_per_evaluation() - 1.0).abs() < f64::EPSILON);

        eval.reset_stats();
        let stats = eval.stats();
        assert_eq!(stats.evaluation_count, 0);
        assert_eq!(stats.avg_nodes_per_evaluation(), 0.0);
    }

    #[test]
    fn full_evaluation_is_idempotent_bitwise() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Full);
        eval.evaluate();
        let first = eval.value("sum").unwrap();
        eval.evaluate();
        let second = eval.value("sum").unwrap();
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn into_graph_returns_ownership() {
        let mut eval = Evaluator::new(sum_graph(), EvaluationMode::Full);
        eval.evaluate();
        let graph = eval.into_graph();
        assert_eq!(graph.value("sum"), Some(30.0));
    }
}
