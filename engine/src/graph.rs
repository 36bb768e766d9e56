// graph.rs — Compiled runtime representation of a dataflow graph
//
// Struct-of-arrays layout: one packed f64 value plane, parent and child
// topology in CSR form, a kernel jump table, and precomputed topological
// orders. Structural arrays are immutable after compilation; only the value
// plane changes at evaluation time.
//
// Preconditions: constructed exclusively by `compile::compile`, which
//                validates names, parents, arities, and acyclicity.
// Postconditions: lookups are O(1); parent/child traversal is allocation-free.
// Failure modes: value/input lookups by unknown name return errors; id-based
//                accessors expect ids minted by this graph's compilation.
// Side effects: none.

use std::fmt;
use std::mem;

use indexmap::IndexMap;

use crate::error::EvalError;
use crate::kernel::Kernel;

// ── Public types ────────────────────────────────────────────────────────────

/// Unique identifier for a node. Ids are assigned in definition order and
/// double as indices into every per-node array of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The id as an array index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only view handed to kernels: the packed value plane plus the parent
/// CSR. This is the only path by which a kernel may read parent values — it
/// keeps the whole value plane in one contiguous buffer and rules out
/// dangling references.
pub struct KernelCtx<'a> {
    values: &'a [f64],
    parent_ids: &'a [NodeId],
    parent_offsets: &'a [u32],
}

impl<'a> KernelCtx<'a> {
    pub(crate) fn new(
        values: &'a [f64],
        parent_ids: &'a [NodeId],
        parent_offsets: &'a [u32],
    ) -> Self {
        KernelCtx {
            values,
            parent_ids,
            parent_offsets,
        }
    }

    /// The parents of `node`, in declaration order.
    #[inline]
    pub fn parents(&self, node: NodeId) -> &'a [NodeId] {
        let start = self.parent_offsets[node.index()] as usize;
        let end = self.parent_offsets[node.index() + 1] as usize;
        &self.parent_ids[start..end]
    }

    /// Current value of any node.
    #[inline]
    pub fn value(&self, id: NodeId) -> f64 {
        self.values[id.index()]
    }

    /// Current value of the `k`th parent of `node`.
    #[inline]
    pub fn parent_value(&self, node: NodeId, k: usize) -> f64 {
        self.value(self.parents(node)[k])
    }
}

/// Compiled, immutable-topology runtime form of a node graph.
///
/// Produced by [`crate::compile::compile`]; evaluated through
/// [`crate::eval::Evaluator`]. The graph owns its kernels and value plane,
/// so one graph plus one evaluator forms a single-writer unit.
pub struct CompiledGraph {
    // Metadata.
    pub(crate) node_count: usize,
    pub(crate) input_count: usize,
    pub(crate) compute_count: usize,
    pub(crate) edge_count: usize,

    // Naming and lookup. Both maps preserve definition order.
    pub(crate) names: Vec<String>,
    pub(crate) name_to_id: IndexMap<String, NodeId>,
    pub(crate) input_name_to_id: IndexMap<String, NodeId>,

    // The hot-path value plane: one f64 per node, indexed by id.
    pub(crate) values: Vec<f64>,

    // Kernel jump table: `None` for inputs, one owned kernel per compute node.
    pub(crate) kernels: Vec<Option<Box<dyn Kernel>>>,

    // Parent topology, CSR: parents of node i are
    // `parent_ids[parent_offsets[i] .. parent_offsets[i + 1]]`.
    pub(crate) parent_counts: Vec<u32>,
    pub(crate) parent_offsets: Vec<u32>,
    pub(crate) parent_ids: Vec<NodeId>,

    // Child topology, CSR: the transpose of the parent relation.
    pub(crate) child_offsets: Vec<u32>,
    pub(crate) child_ids: Vec<NodeId>,

    // Evaluation orders.
    pub(crate) compute_order: Vec<NodeId>,
    pub(crate) full_topo_order: Vec<NodeId>,

    // Compute nodes bound to stateful kernels, in topological order.
    pub(crate) stateful_nodes: Vec<NodeId>,
}

// ── Queries ─────────────────────────────────────────────────────────────────

impl CompiledGraph {
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn compute_count(&self) -> usize {
        self.compute_count
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Node name for `id`.
    pub fn name(&self, id: NodeId) -> &str {
        &self.names[id.index()]
    }

    /// All node names, indexed by id.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Resolve any node name to its id.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.name_to_id.get(name).copied()
    }

    /// Resolve an input name to its id. `None` for compute nodes too.
    pub fn input_id(&self, name: &str) -> Option<NodeId> {
        self.input_name_to_id.get(name).copied()
    }

    /// True if `name` names an input node.
    pub fn is_input(&self, name: &str) -> bool {
        self.input_name_to_id.contains_key(name)
    }

    /// True if `id` belongs to this graph and names an input node.
    pub fn is_input_id(&self, id: NodeId) -> bool {
        self.kernels
            .get(id.index())
            .is_some_and(|kernel| kernel.is_none())
    }

    /// Current value of a node by name.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.node_id(name).map(|id| self.value_id(id))
    }

    /// Current value of a node by id. Direct array access; `id` must have
    /// been minted by this graph's compilation.
    #[inline]
    pub fn value_id(&self, id: NodeId) -> f64 {
        self.values[id.index()]
    }

    /// The value of the last node in compute order, or NaN when the graph
    /// has no compute nodes. A convenient "result of the whole graph" for
    /// single-sink graphs.
    pub fn result(&self) -> f64 {
        match self.compute_order.last() {
            Some(&id) => self.value_id(id),
            None => f64::NAN,
        }
    }

    /// Write an input's value by name.
    pub fn set_input(&mut self, name: &str, value: f64) -> Result<(), EvalError> {
        let id = self
            .input_id(name)
            .ok_or_else(|| EvalError::UnknownInput { node: name.into() })?;
        self.values[id.index()] = value;
        Ok(())
    }

    /// Write an input's value by id.
    pub fn set_input_id(&mut self, id: NodeId, value: f64) -> Result<(), EvalError> {
        if !self.is_input_id(id) {
            return Err(EvalError::UnknownInput {
                node: self.display_name(id),
            });
        }
        self.values[id.index()] = value;
        Ok(())
    }

    /// Half-open range of `id`'s parents within the flat parent-id array.
    #[inline]
    pub fn parent_range(&self, id: NodeId) -> std::ops::Range<usize> {
        self.parent_offsets[id.index()] as usize..self.parent_offsets[id.index() + 1] as usize
    }

    /// Half-open range of `id`'s children within the flat child-id array.
    #[inline]
    pub fn child_range(&self, id: NodeId) -> std::ops::Range<usize> {
        self.child_offsets[id.index()] as usize..self.child_offsets[id.index() + 1] as usize
    }

    /// Parents of `id`, in declaration order. Allocation-free.
    #[inline]
    pub fn parents(&self, id: NodeId) -> &[NodeId] {
        &self.parent_ids[self.parent_range(id)]
    }

    /// Children of `id`, in ascending id order. Allocation-free.
    #[inline]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.child_ids[self.child_range(id)]
    }

    /// Compute nodes in a valid topological order.
    pub fn compute_order(&self) -> &[NodeId] {
        &self.compute_order
    }

    /// All nodes in a valid topological order (inputs appear as roots).
    pub fn full_topo_order(&self) -> &[NodeId] {
        &self.full_topo_order
    }

    /// Compute nodes bound to stateful kernels, in topological order.
    pub fn stateful_nodes(&self) -> &[NodeId] {
        &self.stateful_nodes
    }

    /// Inspect the kernel bound to `id`, if any. Inputs have none.
    pub fn kernel(&self, id: NodeId) -> Option<&dyn Kernel> {
        self.kernels.get(id.index())?.as_deref()
    }

    /// Read-only kernel view over this graph's value plane and parent CSR.
    pub fn kernel_ctx(&self) -> KernelCtx<'_> {
        KernelCtx::new(&self.values, &self.parent_ids, &self.parent_offsets)
    }

    /// Approximate heap footprint of the structural arrays and value plane,
    /// in bytes. Diagnostics only; kernel state and map overhead are
    /// estimated, not measured.
    pub fn memory_footprint(&self) -> usize {
        let mut bytes = 0usize;
        bytes += self.values.len() * mem::size_of::<f64>();
        bytes += self.parent_counts.len() * mem::size_of::<u32>();
        bytes += self.parent_offsets.len() * mem::size_of::<u32>();
        bytes += self.parent_ids.len() * mem::size_of::<NodeId>();
        bytes += self.child_offsets.len() * mem::size_of::<u32>();
        bytes += self.child_ids.len() * mem::size_of::<NodeId>();
        bytes += self.compute_order.len() * mem::size_of::<NodeId>();
        bytes += self.full_topo_order.len() * mem::size_of::<NodeId>();
        bytes += self.stateful_nodes.len() * mem::size_of::<NodeId>();
        bytes += self.kernels.len() * mem::size_of::<Option<Box<dyn Kernel>>>();
        bytes += self.names.iter().map(|n| n.capacity()).sum::<usize>();
        // Rough per-entry estimate for the two name maps.
        bytes += (self.name_to_id.len() + self.input_name_to_id.len()) * 48;
        bytes
    }

    /// Printable name for `id`: the node name when the id is in range,
    /// otherwise the raw id.
    pub(crate) fn display_name(&self, id: NodeId) -> String {
        match self.names.get(id.index()) {
            Some(name) => name.clone(),
            None => id.to_string(),
        }
    }
}

impl fmt::Display for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CompiledGraph[{} nodes ({} inputs, {} compute), {} edges, ~{} bytes]",
            self.node_count,
            self.input_count,
            self.compute_count,
            self.edge_count,
            self.memory_footprint()
        )
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("node_count", &self.node_count)
            .field("input_count", &self.input_count)
            .field("compute_count", &self.compute_count)
            .field("edge_count", &self.edge_count)
            .field("compute_order", &self.compute_order)
            .finish_non_exhaustive()
    }
}
