// def.rs — Node definitions and the fluent graph builder
//
// The user-facing description of graph structure. Definitions are immutable
// data; the compiler turns an ordered list of them into a CompiledGraph.
// Definition order matters: it becomes the node id assignment.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compile;
use crate::error::CompileError;
use crate::graph::CompiledGraph;
use crate::registry::OperationRegistry;

/// What a node is: an externally driven input, or a computation over parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Value set externally between evaluations.
    Input,
    /// Value computed from the named parents by a registered operation.
    Compute {
        operation: String,
        parents: Vec<String>,
    },
}

/// Immutable description of one node in the computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    pub kind: NodeKind,
    pub initial_value: f64,
}

impl NodeDefinition {
    /// An input node with initial value `0.0`.
    pub fn input(name: impl Into<String>) -> Self {
        Self::input_with(name, 0.0)
    }

    /// An input node with an explicit initial value.
    pub fn input_with(name: impl Into<String>, initial_value: f64) -> Self {
        NodeDefinition {
            name: name.into(),
            kind: NodeKind::Input,
            initial_value,
        }
    }

    /// A compute node applying `operation` to the named parents, in order.
    pub fn compute<I, S>(name: impl Into<String>, operation: impl Into<String>, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NodeDefinition {
            name: name.into(),
            kind: NodeKind::Compute {
                operation: operation.into(),
                parents: parents.into_iter().map(Into::into).collect(),
            },
            initial_value: 0.0,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, NodeKind::Input)
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.kind, NodeKind::Compute { .. })
    }

    /// Parent names in declaration order; empty for inputs.
    pub fn parents(&self) -> &[String] {
        match &self.kind {
            NodeKind::Input => &[],
            NodeKind::Compute { parents, .. } => parents,
        }
    }

    /// Operation name; `None` for inputs.
    pub fn operation(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Input => None,
            NodeKind::Compute { operation, .. } => Some(operation),
        }
    }
}

impl fmt::Display for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Input => write!(f, "input {} = {}", self.name, self.initial_value),
            NodeKind::Compute { operation, parents } => {
                write!(f, "{} = {}({})", self.name, operation, parents.join(", "))
            }
        }
    }
}

// ── Fluent builder ──────────────────────────────────────────────────────────

/// Fluent front door for assembling a definition list and compiling it.
///
/// ```
/// use fluxion::def::GraphBuilder;
/// use fluxion::registry::OperationRegistry;
///
/// let graph = GraphBuilder::new()
///     .input("bid")
///     .input("ask")
///     .compute("mid", "AVG", &["bid", "ask"])
///     .compile(&OperationRegistry::standard())
///     .unwrap();
/// assert_eq!(graph.node_count(), 3);
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    definitions: Vec<NodeDefinition>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input node with initial value `0.0`.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.definitions.push(NodeDefinition::input(name));
        self
    }

    /// Add an input node with an explicit initial value.
    pub fn input_with(mut self, name: impl Into<String>, initial_value: f64) -> Self {
        self.definitions
            .push(NodeDefinition::input_with(name, initial_value));
        self
    }

    /// Add a compute node.
    pub fn compute(
        mut self,
        name: impl Into<String>,
        operation: impl Into<String>,
        parents: &[&str],
    ) -> Self {
        self.definitions
            .push(NodeDefinition::compute(name, operation, parents.iter().copied()));
        self
    }

    /// Add a pre-built definition.
    pub fn node(mut self, definition: NodeDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Add several pre-built definitions, preserving their order.
    pub fn nodes(mut self, definitions: impl IntoIterator<Item = NodeDefinition>) -> Self {
        self.definitions.extend(definitions);
        self
    }

    /// The definitions accumulated so far, in id-assignment order.
    pub fn definitions(&self) -> &[NodeDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Finish building and return the definition list.
    pub fn build(self) -> Vec<NodeDefinition> {
        self.definitions
    }

    /// Compile the accumulated definitions against `registry`.
    pub fn compile(self, registry: &OperationRegistry) -> Result<CompiledGraph, CompileError> {
        compile::compile(&self.definitions, registry)
    }
}
