// registry.rs — Operation registry
//
// Maps operation names to kernel factories plus arity and statefulness
// metadata. Registration happens before compilation; once a registry has
// been handed to the compiler it should be treated as read-only. The
// `standard()` preset covers the common scalar math operations.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RegistryError;
use crate::graph::{KernelCtx, NodeId};
use crate::kernel::{Kernel, KernelFactory, StatelessFn};

// ── Arity ───────────────────────────────────────────────────────────────────

/// How many parents an operation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arity {
    /// Exactly this many parents, checked at compile time.
    Fixed(usize),
    /// Any number of parents, including zero.
    Variadic,
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Fixed(n) => write!(f, "{n}"),
            Arity::Variadic => write!(f, "variadic"),
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Metadata for one registered operation.
struct OpEntry {
    factory: KernelFactory,
    arity: Arity,
    stateful: bool,
    description: String,
}

/// Registry of named operations available to the compiler.
///
/// Stateless operations register a plain function; it is wrapped into a
/// zero-sized kernel per node. Stateful operations register a factory that
/// must produce a fresh kernel per call — the compiler invokes it once per
/// node, so state is never aliased.
pub struct OperationRegistry {
    ops: IndexMap<String, OpEntry>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        OperationRegistry {
            ops: IndexMap::new(),
        }
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Register a stateless operation with an exact parent count.
    pub fn register_fixed<F>(
        &mut self,
        name: &str,
        arity: usize,
        kernel: F,
        description: &str,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(NodeId, &KernelCtx<'_>) -> f64 + Clone + Send + Sync + 'static,
    {
        self.register_entry(
            name,
            Arity::Fixed(arity),
            false,
            Box::new(move || -> Box<dyn Kernel> { Box::new(StatelessFn(kernel.clone())) }),
            description,
        )
    }

    /// Register a stateless operation accepting any number of parents.
    pub fn register_variadic<F>(
        &mut self,
        name: &str,
        kernel: F,
        description: &str,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(NodeId, &KernelCtx<'_>) -> f64 + Clone + Send + Sync + 'static,
    {
        self.register_entry(
            name,
            Arity::Variadic,
            false,
            Box::new(move || -> Box<dyn Kernel> { Box::new(StatelessFn(kernel.clone())) }),
            description,
        )
    }

    /// Register a stateful operation with an exact parent count. `factory`
    /// must return a fresh kernel on every call.
    pub fn register_fixed_stateful<F>(
        &mut self,
        name: &str,
        arity: usize,
        factory: F,
        description: &str,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn() -> Box<dyn Kernel> + Send + Sync + 'static,
    {
        self.register_entry(name, Arity::Fixed(arity), true, Box::new(factory), description)
    }

    /// Register a stateful operation accepting any number of parents.
    pub fn register_variadic_stateful<F>(
        &mut self,
        name: &str,
        factory: F,
        description: &str,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn() -> Box<dyn Kernel> + Send + Sync + 'static,
    {
        self.register_entry(name, Arity::Variadic, true, Box::new(factory), description)
    }

    fn register_entry(
        &mut self,
        name: &str,
        arity: Arity,
        stateful: bool,
        factory: KernelFactory,
        description: &str,
    ) -> Result<&mut Self, RegistryError> {
        if self.ops.contains_key(name) {
            return Err(RegistryError::DuplicateOperation { name: name.into() });
        }
        debug!(operation = name, %arity, stateful, "registered operation");
        self.ops.insert(
            name.to_string(),
            OpEntry {
                factory,
                arity,
                stateful,
                description: description.to_string(),
            },
        );
        Ok(self)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// True if `name` is registered.
    pub fn has(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    /// The arity of `name`, if registered.
    pub fn arity(&self, name: &str) -> Option<Arity> {
        self.ops.get(name).map(|entry| entry.arity)
    }

    /// Whether `name` is stateful, if registered.
    pub fn is_stateful(&self, name: &str) -> Option<bool> {
        self.ops.get(name).map(|entry| entry.stateful)
    }

    /// Human-readable description of `name`, if registered.
    pub fn description(&self, name: &str) -> Option<&str> {
        self.ops.get(name).map(|entry| entry.description.as_str())
    }

    /// Instantiate a kernel for `name` by invoking its factory. Stateful
    /// operations yield a fresh instance per call.
    pub fn create_kernel(&self, name: &str) -> Option<Box<dyn Kernel>> {
        self.ops.get(name).map(|entry| (entry.factory)())
    }

    /// All registered operation names, sorted.
    pub fn operation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Sorted `(name, arity, stateful)` rows — a canonical description of
    /// the registry's contents, used for fingerprinting.
    pub fn canonical_table(&self) -> Vec<(String, Arity, bool)> {
        let mut table: Vec<(String, Arity, bool)> = self
            .ops
            .iter()
            .map(|(name, entry)| (name.clone(), entry.arity, entry.stateful))
            .collect();
        table.sort_by(|a, b| a.0.cmp(&b.0));
        table
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    // ── Standard preset ─────────────────────────────────────────────────

    /// The standard scalar operation set.
    ///
    /// Variadic: `SUM`, `PRODUCT`, `MIN`, `MAX`, `AVG` — with zero parents,
    /// `SUM` and `PRODUCT` return their identities (0 and 1) while `MIN`,
    /// `MAX`, and `AVG` return NaN. Fixed: binary `ADD SUB MUL DIV POW MOD`,
    /// unary `SQRT ABS NEG SIN COS LOG EXP`, ternary `CLAMP` and `LERP`.
    /// All follow IEEE-754: division by zero and domain errors produce ±∞
    /// or NaN, never an `Err`.
    pub fn standard() -> Self {
        let mut reg = OperationRegistry::new();
        reg.preset(
            "SUM",
            Arity::Variadic,
            k_sum,
            "sum of all parent values (0 with no parents)",
        );
        reg.preset(
            "PRODUCT",
            Arity::Variadic,
            k_product,
            "product of all parent values (1 with no parents)",
        );
        reg.preset("MIN", Arity::Variadic, k_min, "minimum of all parent values");
        reg.preset("MAX", Arity::Variadic, k_max, "maximum of all parent values");
        reg.preset("AVG", Arity::Variadic, k_avg, "mean of all parent values");

        reg.preset("ADD", Arity::Fixed(2), k_add, "a + b");
        reg.preset("SUB", Arity::Fixed(2), k_sub, "a - b");
        reg.preset("MUL", Arity::Fixed(2), k_mul, "a * b");
        reg.preset("DIV", Arity::Fixed(2), k_div, "a / b");
        reg.preset("POW", Arity::Fixed(2), k_pow, "a raised to b");
        reg.preset("MOD", Arity::Fixed(2), k_mod, "remainder of a / b");

        reg.preset("SQRT", Arity::Fixed(1), k_sqrt, "square root");
        reg.preset("ABS", Arity::Fixed(1), k_abs, "absolute value");
        reg.preset("NEG", Arity::Fixed(1), k_neg, "negation");
        reg.preset("SIN", Arity::Fixed(1), k_sin, "sine");
        reg.preset("COS", Arity::Fixed(1), k_cos, "cosine");
        reg.preset("LOG", Arity::Fixed(1), k_log, "natural logarithm");
        reg.preset("EXP", Arity::Fixed(1), k_exp, "e raised to a");

        reg.preset(
            "CLAMP",
            Arity::Fixed(3),
            k_clamp,
            "x clamped to [lo, hi]",
        );
        reg.preset(
            "LERP",
            Arity::Fixed(3),
            k_lerp,
            "linear interpolation a + (b - a) * t",
        );
        reg
    }

    /// Insert a preset operation. Preset names are statically distinct, so
    /// this bypasses the duplicate check.
    fn preset(
        &mut self,
        name: &str,
        arity: Arity,
        kernel: fn(NodeId, &KernelCtx<'_>) -> f64,
        description: &str,
    ) {
        self.ops.insert(
            name.to_string(),
            OpEntry {
                factory: Box::new(move || -> Box<dyn Kernel> { Box::new(StatelessFn(kernel)) }),
                arity,
                stateful: false,
                description: description.to_string(),
            },
        );
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.operation_names())
            .finish()
    }
}

// ── Standard kernels ────────────────────────────────────────────────────────

fn k_sum(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parents(node).iter().map(|&p| ctx.value(p)).sum()
}

fn k_product(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parents(node).iter().map(|&p| ctx.value(p)).product()
}

fn k_min(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    let parents = ctx.parents(node);
    if parents.is_empty() {
        return f64::NAN;
    }
    // f64::min is NaN-ignoring; a NaN parent must poison the result.
    let mut min = f64::INFINITY;
    for &p in parents {
        let x = ctx.value(p);
        if x.is_nan() {
            return f64::NAN;
        }
        if x < min {
            min = x;
        }
    }
    min
}

fn k_max(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    let parents = ctx.parents(node);
    if parents.is_empty() {
        return f64::NAN;
    }
    let mut max = f64::NEG_INFINITY;
    for &p in parents {
        let x = ctx.value(p);
        if x.is_nan() {
            return f64::NAN;
        }
        if x > max {
            max = x;
        }
    }
    max
}

fn k_avg(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    let parents = ctx.parents(node);
    if parents.is_empty() {
        return f64::NAN;
    }
    let sum: f64 = parents.iter().map(|&p| ctx.value(p)).sum();
    sum / parents.len() as f64
}

fn k_add(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0) + ctx.parent_value(node, 1)
}

fn k_sub(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0) - ctx.parent_value(node, 1)
}

fn k_mul(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0) * ctx.parent_value(node, 1)
}

fn k_div(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0) / ctx.parent_value(node, 1)
}

fn k_pow(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0).powf(ctx.parent_value(node, 1))
}

fn k_mod(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0) % ctx.parent_value(node, 1)
}

fn k_sqrt(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0).sqrt()
}

fn k_abs(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0).abs()
}

fn k_neg(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    -ctx.parent_value(node, 0)
}

fn k_sin(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0).sin()
}

fn k_cos(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0).cos()
}

fn k_log(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0).ln()
}

fn k_exp(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    ctx.parent_value(node, 0).exp()
}

fn k_clamp(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    let x = ctx.parent_value(node, 0);
    let lo = ctx.parent_value(node, 1);
    let hi = ctx.parent_value(node, 2);
    // NaN in the value or either bound poisons the result.
    if x.is_nan() || lo.is_nan() || hi.is_nan() {
        f64::NAN
    } else if x < lo {
        lo
    } else if x > hi {
        hi
    } else {
        x
    }
}

fn k_lerp(node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
    let a = ctx.parent_value(node, 0);
    let b = ctx.parent_value(node, 1);
    let t = ctx.parent_value(node, 2);
    a + (b - a) * t
}
