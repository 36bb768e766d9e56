// compile.rs — Graph compilation
//
// Transforms an ordered list of node definitions into a CompiledGraph:
// id assignment, parent CSR construction with arity validation, child CSR
// as the transpose, deterministic topological sort (Kahn), kernel binding,
// and value initialization.
//
// Preconditions: `registry` contains every operation the definitions name.
// Postconditions: the returned graph satisfies the GraphCert obligations
//                 (CSR symmetry, valid topological orders, arity and kernel
//                 placement); identical inputs produce identical graphs.
// Failure modes: any structural defect aborts with a `CompileError`; no
//                partial graph is ever returned.
// Side effects: emits `tracing` events per pass; no I/O.

use std::collections::VecDeque;
use std::time::Instant;

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::def::{NodeDefinition, NodeKind};
use crate::error::CompileError;
use crate::graph::{CompiledGraph, NodeId};
use crate::registry::{Arity, OperationRegistry};

// ── Public entry point ──────────────────────────────────────────────────────

/// Compile `definitions` against `registry` into an evaluable graph.
///
/// Definition order is significant: node ids are assigned by position, and
/// ties in the topological sort are broken by id, so identical inputs yield
/// bit-identical compiled graphs.
pub fn compile(
    definitions: &[NodeDefinition],
    registry: &OperationRegistry,
) -> Result<CompiledGraph, CompileError> {
    if definitions.is_empty() {
        return Err(CompileError::EmptyGraph);
    }
    let started = Instant::now();
    let node_count = definitions.len();

    // Pass 1: assign ids in definition order, rejecting duplicates.
    let mut names = Vec::with_capacity(node_count);
    let mut name_to_id: IndexMap<String, NodeId> = IndexMap::with_capacity(node_count);
    for (i, def) in definitions.iter().enumerate() {
        if let Some(prev) = name_to_id.get(def.name.as_str()) {
            return Err(CompileError::DuplicateName {
                name: def.name.clone(),
                first: prev.index(),
                second: i,
            });
        }
        name_to_id.insert(def.name.clone(), NodeId(i as u32));
        names.push(def.name.clone());
    }
    trace!(nodes = node_count, "assigned node ids");

    // Pass 2: parent CSR plus operation and arity validation.
    let mut parent_counts = vec![0u32; node_count];
    let mut parent_offsets = vec![0u32; node_count + 1];
    let mut parent_ids: Vec<NodeId> = Vec::new();
    let mut input_name_to_id: IndexMap<String, NodeId> = IndexMap::new();
    let mut input_count = 0usize;
    let mut compute_count = 0usize;

    for (i, def) in definitions.iter().enumerate() {
        match &def.kind {
            NodeKind::Input => {
                input_name_to_id.insert(def.name.clone(), NodeId(i as u32));
                input_count += 1;
            }
            NodeKind::Compute { operation, parents } => {
                compute_count += 1;
                match registry.arity(operation) {
                    None => {
                        return Err(CompileError::UnknownOperation {
                            node: def.name.clone(),
                            operation: operation.clone(),
                        });
                    }
                    Some(Arity::Fixed(expected)) if expected != parents.len() => {
                        return Err(CompileError::ArityMismatch {
                            node: def.name.clone(),
                            operation: operation.clone(),
                            expected,
                            found: parents.len(),
                        });
                    }
                    Some(_) => {}
                }
                for parent in parents {
                    let parent_id = name_to_id.get(parent.as_str()).copied().ok_or_else(|| {
                        CompileError::UnknownParent {
                            node: def.name.clone(),
                            parent: parent.clone(),
                        }
                    })?;
                    parent_ids.push(parent_id);
                }
            }
        }
        parent_counts[i] = def.parents().len() as u32;
        parent_offsets[i + 1] = parent_ids.len() as u32;
    }
    let edge_count = parent_ids.len();
    trace!(edges = edge_count, "built parent CSR");

    // Pass 3: child CSR as the transpose of the parent relation. Children
    // are filled in ascending child-id order, so the layout is canonical.
    let mut child_counts = vec![0u32; node_count];
    for &parent in &parent_ids {
        child_counts[parent.index()] += 1;
    }
    let mut child_offsets = vec![0u32; node_count + 1];
    for i in 0..node_count {
        child_offsets[i + 1] = child_offsets[i] + child_counts[i];
    }
    let mut cursor: Vec<u32> = child_offsets[..node_count].to_vec();
    let mut child_ids = vec![NodeId(0); edge_count];
    for child in 0..node_count {
        let start = parent_offsets[child] as usize;
        let end = parent_offsets[child + 1] as usize;
        for &parent in &parent_ids[start..end] {
            child_ids[cursor[parent.index()] as usize] = NodeId(child as u32);
            cursor[parent.index()] += 1;
        }
    }
    trace!("built child CSR");

    // Pass 4: topological sort (Kahn). The FIFO preserves id order among
    // simultaneously ready nodes, keeping the order deterministic.
    let full_topo_order = topological_sort(
        node_count,
        &parent_counts,
        &child_offsets,
        &child_ids,
        &names,
    )?;
    trace!("topological sort complete");

    // Pass 5: bind kernels in topological order and derive the compute-only
    // order. Stateful factories run once per node, so state is never shared.
    let mut kernels: Vec<Option<Box<dyn crate::kernel::Kernel>>> = Vec::with_capacity(node_count);
    kernels.resize_with(node_count, || None);
    let mut compute_order = Vec::with_capacity(compute_count);
    let mut stateful_nodes = Vec::new();
    for &id in &full_topo_order {
        let def = &definitions[id.index()];
        if let NodeKind::Compute { operation, .. } = &def.kind {
            let kernel = registry.create_kernel(operation).ok_or_else(|| {
                CompileError::UnknownOperation {
                    node: def.name.clone(),
                    operation: operation.clone(),
                }
            })?;
            kernels[id.index()] = Some(kernel);
            compute_order.push(id);
            if registry.is_stateful(operation) == Some(true) {
                stateful_nodes.push(id);
            }
        }
    }

    // Pass 6: seed the value plane from the definitions.
    let values: Vec<f64> = definitions.iter().map(|def| def.initial_value).collect();

    let graph = CompiledGraph {
        node_count,
        input_count,
        compute_count,
        edge_count,
        names,
        name_to_id,
        input_name_to_id,
        values,
        kernels,
        parent_counts,
        parent_offsets,
        parent_ids,
        child_offsets,
        child_ids,
        compute_order,
        full_topo_order,
        stateful_nodes,
    };
    debug_assert!(verify_graph(&graph, definitions, registry).all_pass());
    debug!(
        nodes = node_count,
        inputs = input_count,
        compute = compute_count,
        edges = edge_count,
        elapsed_us = started.elapsed().as_micros() as u64,
        "graph compiled"
    );
    Ok(graph)
}

/// Kahn's algorithm over the child CSR. Returns all nodes in a valid
/// topological order, or the set of nodes stuck on a cycle.
fn topological_sort(
    node_count: usize,
    parent_counts: &[u32],
    child_offsets: &[u32],
    child_ids: &[NodeId],
    names: &[String],
) -> Result<Vec<NodeId>, CompileError> {
    let mut in_degree = parent_counts.to_vec();
    let mut queue: VecDeque<NodeId> = VecDeque::with_capacity(node_count);
    for (i, &degree) in in_degree.iter().enumerate() {
        if degree == 0 {
            queue.push_back(NodeId(i as u32));
        }
    }

    let mut order = Vec::with_capacity(node_count);
    while let Some(id) = queue.pop_front() {
        order.push(id);
        let start = child_offsets[id.index()] as usize;
        let end = child_offsets[id.index() + 1] as usize;
        for &child in &child_ids[start..end] {
            in_degree[child.index()] -= 1;
            if in_degree[child.index()] == 0 {
                queue.push_back(child);
            }
        }
    }

    if order.len() != node_count {
        let nodes: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree > 0)
            .map(|(i, _)| names[i].clone())
            .collect();
        return Err(CompileError::Cycle { nodes });
    }
    Ok(order)
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for the compiler's structural postconditions.
#[derive(Debug, Clone)]
pub struct GraphCert {
    /// G1: child CSR is the exact transpose of the parent CSR and both flat
    /// arrays have `edge_count` entries.
    pub g1_csr_symmetry: bool,
    /// G2: both topological orders cover their node sets exactly once and
    /// every edge points forward.
    pub g2_topo_orders_valid: bool,
    /// G3: every fixed-arity compute node has exactly the declared number
    /// of parents.
    pub g3_fixed_arity_matches: bool,
    /// G4: every compute node carries a kernel; no input node does.
    pub g4_kernel_placement: bool,
}

impl GraphCert {
    pub fn all_pass(&self) -> bool {
        self.g1_csr_symmetry
            && self.g2_topo_orders_valid
            && self.g3_fixed_arity_matches
            && self.g4_kernel_placement
    }

    pub fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("G1_csr_symmetry", self.g1_csr_symmetry),
            ("G2_topo_orders_valid", self.g2_topo_orders_valid),
            ("G3_fixed_arity_matches", self.g3_fixed_arity_matches),
            ("G4_kernel_placement", self.g4_kernel_placement),
        ]
    }
}

/// Check a compiled graph against the definitions and registry it was
/// compiled from.
pub fn verify_graph(
    graph: &CompiledGraph,
    definitions: &[NodeDefinition],
    registry: &OperationRegistry,
) -> GraphCert {
    GraphCert {
        g1_csr_symmetry: verify_csr_symmetry(graph),
        g2_topo_orders_valid: verify_topo_orders(graph, definitions),
        g3_fixed_arity_matches: verify_fixed_arities(graph, definitions, registry),
        g4_kernel_placement: verify_kernel_placement(graph, definitions),
    }
}

fn verify_csr_symmetry(graph: &CompiledGraph) -> bool {
    let n = graph.node_count();
    let mut forward_edges = 0usize;
    for i in 0..n {
        let child = NodeId(i as u32);
        for &parent in graph.parents(child) {
            forward_edges += 1;
            if !graph.children(parent).contains(&child) {
                return false;
            }
        }
    }
    let mut backward_edges = 0usize;
    for i in 0..n {
        let parent = NodeId(i as u32);
        for &child in graph.children(parent) {
            backward_edges += 1;
            if !graph.parents(child).contains(&parent) {
                return false;
            }
        }
    }
    forward_edges == graph.edge_count() && backward_edges == graph.edge_count()
}

fn verify_topo_orders(graph: &CompiledGraph, definitions: &[NodeDefinition]) -> bool {
    let n = graph.node_count();
    let full = graph.full_topo_order();
    if full.len() != n {
        return false;
    }

    // Position of each node in the full order; also detects duplicates.
    let mut position = vec![usize::MAX; n];
    for (pos, &id) in full.iter().enumerate() {
        if position[id.index()] != usize::MAX {
            return false;
        }
        position[id.index()] = pos;
    }

    // Every edge must point forward.
    for i in 0..n {
        let child = NodeId(i as u32);
        for &parent in graph.parents(child) {
            if position[parent.index()] >= position[child.index()] {
                return false;
            }
        }
    }

    // The compute order is the full order restricted to compute nodes.
    let filtered: Vec<NodeId> = full
        .iter()
        .copied()
        .filter(|id| definitions[id.index()].is_compute())
        .collect();
    filtered == graph.compute_order()
}

fn verify_fixed_arities(
    graph: &CompiledGraph,
    definitions: &[NodeDefinition],
    registry: &OperationRegistry,
) -> bool {
    definitions.iter().enumerate().all(|(i, def)| {
        match def.operation().and_then(|op| registry.arity(op)) {
            Some(Arity::Fixed(expected)) => graph.parent_range(NodeId(i as u32)).len() == expected,
            _ => true,
        }
    })
}

fn verify_kernel_placement(graph: &CompiledGraph, definitions: &[NodeDefinition]) -> bool {
    definitions.iter().enumerate().all(|(i, def)| {
        let has_kernel = graph.kernel(NodeId(i as u32)).is_some();
        def.is_compute() == has_kernel
    })
}

// ── Provenance ──────────────────────────────────────────────────────────────

/// Fingerprint of a compilation's inputs, for cache keys and reproducibility
/// checks. Identical definitions and registry contents hash identically, and
/// compilation is deterministic, so equal provenance implies equal graphs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// SHA-256 of the canonical JSON of the definition list.
    pub definitions_hash: [u8; 32],
    /// SHA-256 of the canonical JSON of the registry's sorted
    /// `(name, arity, stateful)` table.
    pub registry_fingerprint: [u8; 32],
    /// Crate version that produced the graph.
    pub engine_version: &'static str,
}

impl Provenance {
    /// Hex string of the definitions hash (64 characters).
    pub fn definitions_hash_hex(&self) -> String {
        bytes_to_hex(&self.definitions_hash)
    }

    /// Hex string of the registry fingerprint (64 characters).
    pub fn registry_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.registry_fingerprint)
    }
}

/// Compute the provenance fingerprint for a compilation's inputs.
pub fn compute_provenance(
    definitions: &[NodeDefinition],
    registry: &OperationRegistry,
) -> Provenance {
    let defs_json =
        serde_json::to_string(definitions).expect("definition list serializes to JSON");
    let table_json = serde_json::to_string(&registry.canonical_table())
        .expect("registry table serializes to JSON");
    Provenance {
        definitions_hash: sha256(defs_json.as_bytes()),
        registry_fingerprint: sha256(table_json.as_bytes()),
        engine_version: env!("CARGO_PKG_VERSION"),
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::GraphBuilder;

    fn standard() -> OperationRegistry {
        OperationRegistry::standard()
    }

    #[test]
    fn empty_definition_list_rejected() {
        assert_eq!(
            compile(&[], &standard()).unwrap_err(),
            CompileError::EmptyGraph
        );
    }

    #[test]
    fn duplicate_name_reports_both_indices() {
        let defs = GraphBuilder::new()
            .input("a")
            .input("b")
            .input("a")
            .build();
        assert_eq!(
            compile(&defs, &standard()).unwrap_err(),
            CompileError::DuplicateName {
                name: "a".into(),
                first: 0,
                second: 2,
            }
        );
    }

    #[test]
    fn unknown_parent_rejected() {
        let defs = GraphBuilder::new()
            .input("a")
            .compute("b", "NEG", &["ghost"])
            .build();
        assert_eq!(
            compile(&defs, &standard()).unwrap_err(),
            CompileError::UnknownParent {
                node: "b".into(),
                parent: "ghost".into(),
            }
        );
    }

    #[test]
    fn unknown_operation_rejected() {
        let defs = GraphBuilder::new()
            .input("a")
            .compute("b", "FFT", &["a"])
            .build();
        assert_eq!(
            compile(&defs, &standard()).unwrap_err(),
            CompileError::UnknownOperation {
                node: "b".into(),
                operation: "FFT".into(),
            }
        );
    }

    #[test]
    fn arity_mismatch_reports_expected_and_found() {
        let defs = GraphBuilder::new()
            .input("a")
            .compute("z", "SUB", &["a"])
            .build();
        assert_eq!(
            compile(&defs, &standard()).unwrap_err(),
            CompileError::ArityMismatch {
                node: "z".into(),
                operation: "SUB".into(),
                expected: 2,
                found: 1,
            }
        );
    }

    #[test]
    fn two_node_cycle_rejected() {
        let defs = GraphBuilder::new()
            .compute("x", "ADD", &["y", "y"])
            .compute("y", "ADD", &["x", "x"])
            .build();
        match compile(&defs, &standard()).unwrap_err() {
            CompileError::Cycle { nodes } => {
                assert_eq!(nodes, vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_rejected() {
        let defs = GraphBuilder::new()
            .compute("x", "ADD", &["x", "x"])
            .build();
        assert!(matches!(
            compile(&defs, &standard()).unwrap_err(),
            CompileError::Cycle { .. }
        ));
    }

    #[test]
    fn ids_follow_definition_order_and_orders_are_topological() {
        let defs = GraphBuilder::new()
            .compute("out", "ADD", &["a", "b"]) // defined first, sorted last
            .input("a")
            .input("b")
            .build();
        let graph = compile(&defs, &standard()).unwrap();

        assert_eq!(graph.node_id("out"), Some(NodeId(0)));
        assert_eq!(graph.node_id("a"), Some(NodeId(1)));
        assert_eq!(
            graph.full_topo_order(),
            &[NodeId(1), NodeId(2), NodeId(0)][..]
        );
        assert_eq!(graph.compute_order(), &[NodeId(0)][..]);
    }

    #[test]
    fn compilation_is_deterministic() {
        let defs = GraphBuilder::new()
            .input_with("a", 1.0)
            .input_with("b", 2.0)
            .compute("s", "SUM", &["a", "b"])
            .compute("p", "PRODUCT", &["a", "b"])
            .compute("out", "SUB", &["s", "p"])
            .build();
        let first = compile(&defs, &standard()).unwrap();
        let second = compile(&defs, &standard()).unwrap();

        assert_eq!(first.full_topo_order(), second.full_topo_order());
        assert_eq!(first.compute_order(), second.compute_order());
        assert_eq!(first.edge_count(), second.edge_count());
        for i in 0..first.node_count() {
            let id = NodeId(i as u32);
            assert_eq!(
                first.value_id(id).to_bits(),
                second.value_id(id).to_bits()
            );
        }
    }

    #[test]
    fn cert_obligations_hold() {
        let defs = GraphBuilder::new()
            .input("a")
            .input("b")
            .compute("left", "ADD", &["a", "b"])
            .compute("right", "MUL", &["a", "b"])
            .compute("out", "MAX", &["left", "right", "a"])
            .build();
        let reg = standard();
        let graph = compile(&defs, &reg).unwrap();
        let cert = verify_graph(&graph, &defs, &reg);
        assert!(cert.all_pass(), "failed obligations: {:?}", cert.obligations());
    }

    #[test]
    fn stateful_nodes_recorded_in_topo_order() {
        let mut reg = standard();
        crate::sma::register_sma(&mut reg, "SMA_2", 2).unwrap();
        let defs = GraphBuilder::new()
            .input("price")
            .compute("fast", "SMA_2", &["price"])
            .compute("lag", "NEG", &["fast"])
            .build();
        let graph = compile(&defs, &reg).unwrap();
        assert_eq!(
            graph.stateful_nodes(),
            &[graph.node_id("fast").unwrap()][..]
        );
    }

    #[test]
    fn provenance_tracks_inputs() {
        let reg = standard();
        let defs_a = GraphBuilder::new().input_with("a", 1.0).build();
        let defs_b = GraphBuilder::new().input_with("a", 2.0).build();

        let p1 = compute_provenance(&defs_a, &reg);
        let p2 = compute_provenance(&defs_a, &reg);
        let p3 = compute_provenance(&defs_b, &reg);

        assert_eq!(p1, p2);
        assert_ne!(p1.definitions_hash, p3.definitions_hash);
        assert_eq!(p1.registry_fingerprint, p3.registry_fingerprint);
        assert_eq!(p1.definitions_hash_hex().len(), 64);
    }
}
