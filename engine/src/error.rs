// error.rs — Typed error surface
//
// One enum per error class: compile-time structural errors, registry
// mutation errors, and runtime call errors. All are returned as values;
// floating-point exceptional results (NaN, ±∞) are data, not errors.

use thiserror::Error;

/// Structural errors detected while compiling node definitions.
///
/// Any of these invalidates the whole graph: the compiler returns the error
/// without producing a partial graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The definition list was empty.
    #[error("cannot compile an empty definition list")]
    EmptyGraph,

    /// Two definitions share a name. Both offending indices are reported.
    #[error("duplicate node name '{name}' at definition indices {first} and {second}")]
    DuplicateName {
        name: String,
        first: usize,
        second: usize,
    },

    /// A compute node names a parent that no definition provides.
    #[error("node '{node}' references unknown parent '{parent}'")]
    UnknownParent { node: String, parent: String },

    /// A compute node uses an operation the registry does not know.
    #[error("node '{node}' uses unregistered operation '{operation}'")]
    UnknownOperation { node: String, operation: String },

    /// A fixed-arity operation was given the wrong number of parents.
    #[error("node '{node}': operation '{operation}' expects {expected} parents, found {found}")]
    ArityMismatch {
        node: String,
        operation: String,
        expected: usize,
        found: usize,
    },

    /// The parent relation contains a cycle. Lists the nodes left with
    /// unresolved dependencies after Kahn's sort.
    #[error("cycle detected; nodes with unresolved dependencies: {nodes:?}")]
    Cycle { nodes: Vec<String> },
}

/// Errors returned by registry mutators. The registry is unchanged on error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The operation name is already taken.
    #[error("operation '{name}' is already registered")]
    DuplicateOperation { name: String },

    /// A moving-average window of zero samples was requested.
    #[error("lookback must be positive")]
    NonPositiveLookback,
}

/// Errors returned by evaluator and graph calls at runtime. The graph and
/// its values are unchanged on error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// The named node does not exist or is not an input node.
    #[error("unknown or non-input node '{node}'")]
    UnknownInput { node: String },

    /// A batch update supplied differently sized id and value slices.
    #[error("batch length mismatch: {ids} node ids against {values} values")]
    BatchLengthMismatch { ids: usize, values: usize },
}
