// sma.rs — Simple moving average kernel
//
// Reference stateful kernel: O(1) moving average over a fixed lookback via
// a circular buffer and a running sum. One parent (the series to average);
// during warmup the mean of the samples seen so far is returned.

use std::num::NonZeroUsize;

use crate::error::RegistryError;
use crate::graph::{KernelCtx, NodeId};
use crate::kernel::Kernel;
use crate::registry::OperationRegistry;

/// Simple moving average over the last `lookback` samples.
///
/// Per compute call: evict the oldest sample once the buffer is full, store
/// the new one, and return `sum / samples_seen`. No allocation after
/// construction; the running sum makes each update O(1).
#[derive(Debug, Clone)]
pub struct Sma {
    window: NonZeroUsize,
    buffer: Vec<f64>,
    cursor: usize,
    filled: usize,
    sum: f64,
    evals: u64,
}

impl Sma {
    /// Create an SMA kernel. `lookback` must be positive.
    pub fn new(lookback: usize) -> Result<Self, RegistryError> {
        NonZeroUsize::new(lookback)
            .map(Self::with_window)
            .ok_or(RegistryError::NonPositiveLookback)
    }

    /// Create an SMA kernel from an already validated window length.
    pub fn with_window(window: NonZeroUsize) -> Self {
        Sma {
            window,
            buffer: vec![0.0; window.get()],
            cursor: 0,
            filled: 0,
            sum: 0.0,
            evals: 0,
        }
    }

    /// The configured lookback.
    pub fn lookback(&self) -> usize {
        self.window.get()
    }

    /// Samples currently held, capped at the lookback.
    pub fn sample_count(&self) -> usize {
        self.filled
    }
}

impl Kernel for Sma {
    fn compute(&mut self, node: NodeId, ctx: &KernelCtx<'_>) -> f64 {
        let sample = ctx.parent_value(node, 0);
        let window = self.window.get();

        if self.filled == window {
            self.sum -= self.buffer[self.cursor];
        }
        self.buffer[self.cursor] = sample;
        self.sum += sample;
        self.cursor = (self.cursor + 1) % window;
        if self.filled < window {
            self.filled += 1;
        }
        self.evals += 1;

        self.sum / self.filled as f64
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.cursor = 0;
        self.filled = 0;
        self.sum = 0.0;
        self.evals = 0;
    }

    fn is_ready(&self) -> bool {
        self.filled >= self.window.get()
    }

    fn evaluation_count(&self) -> u64 {
        self.evals
    }
}

/// Register `name` as a fixed-arity-1 stateful SMA operation with the given
/// lookback. Each node bound to the operation receives its own instance.
pub fn register_sma(
    registry: &mut OperationRegistry,
    name: &str,
    lookback: usize,
) -> Result<(), RegistryError> {
    let window = NonZeroUsize::new(lookback).ok_or(RegistryError::NonPositiveLookback)?;
    registry.register_fixed_stateful(
        name,
        1,
        move || Box::new(Sma::with_window(window)),
        &format!("simple moving average over the last {lookback} samples"),
    )?;
    Ok(())
}
