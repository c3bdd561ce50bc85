//! Cooperation with RNG generators so that replays draw fresh random numbers.
//!
//! A captured kernel cannot read the host-side Philox offset at replay time,
//! so during capture the generator hands out offsets relative to a base that
//! is published before every replay.

use std::sync::Arc;

use parking_lot::Mutex;

/// A generator whose state can be used from inside a captured graph.
pub trait GraphSafeGenerator: Send + Sync {
    /// Called before capture begins.
    fn capture_prologue(&self);
    /// Called once the graph is instantiated; returns the whole-graph offset increment.
    fn capture_epilogue(&self) -> u64;
    /// Called before every replay with the increment returned by `capture_epilogue`.
    fn replay_prologue(&self, wholegraph_increment: u64);
}

#[derive(Debug, Default)]
struct PhiloxState {
    seed: u64,
    offset: u64,
    capturing: bool,
    offset_intragraph: u64,
    /// Offset published for the current replay; captured kernels add their
    /// intragraph offset to it.
    replay_base: u64,
}

/// A Philox counter-based generator state.
#[derive(Debug, Default)]
pub struct PhiloxGenerator {
    state: Mutex<PhiloxState>,
}

impl PhiloxGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(PhiloxState {
                seed,
                ..Default::default()
            }),
        }
    }

    pub fn seed(&self) -> u64 {
        self.state.lock().seed
    }

    pub fn set_seed(&self, seed: u64) {
        let mut state = self.state.lock();
        state.seed = seed;
        state.offset = 0;
    }

    /// Current eager offset.
    pub fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    /// Base published by the latest `replay_prologue`.
    pub fn replay_base(&self) -> u64 {
        self.state.lock().replay_base
    }

    /// Reserve `n` counter values. Eagerly this returns the absolute offset;
    /// during capture it returns the offset relative to the replay base.
    pub fn increment(&self, n: u64) -> u64 {
        // Philox produces four 32-bit values per counter step.
        let n = n.div_ceil(4) * 4;
        let mut state = self.state.lock();
        if state.capturing {
            let at = state.offset_intragraph;
            state.offset_intragraph += n;
            at
        } else {
            let at = state.offset;
            state.offset += n;
            at
        }
    }
}

impl GraphSafeGenerator for PhiloxGenerator {
    fn capture_prologue(&self) {
        let mut state = self.state.lock();
        state.capturing = true;
        state.offset_intragraph = 0;
    }

    fn capture_epilogue(&self) -> u64 {
        let mut state = self.state.lock();
        state.capturing = false;
        state.offset_intragraph
    }

    fn replay_prologue(&self, wholegraph_increment: u64) {
        let mut state = self.state.lock();
        state.replay_base = state.offset;
        state.offset += wholegraph_increment;
    }
}

/// Owns the default generator every capture registers.
#[derive(Clone)]
pub struct GeneratorRegistry {
    default: Arc<dyn GraphSafeGenerator>,
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::new(Arc::new(PhiloxGenerator::new(67280421310721)))
    }
}

impl GeneratorRegistry {
    pub fn new(default: Arc<dyn GraphSafeGenerator>) -> Self {
        Self { default }
    }

    pub fn default_generator(&self) -> Arc<dyn GraphSafeGenerator> {
        Arc::clone(&self.default)
    }
}

/// The generators a graph touched, each with its whole-graph increment.
#[derive(Default, Clone)]
pub(crate) struct CapturedGenerators {
    entries: Vec<(Arc<dyn GraphSafeGenerator>, u64)>,
}

impl CapturedGenerators {
    /// Register `generator` unless it is already present.
    pub fn register(&mut self, generator: Arc<dyn GraphSafeGenerator>) {
        if !self.entries.iter().any(|(g, _)| same(g, &generator)) {
            self.entries.push((generator, 0));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capture_prologue(&self) {
        for (generator, _) in &self.entries {
            generator.capture_prologue();
        }
    }

    pub fn capture_epilogue(&mut self) {
        for (generator, increment) in &mut self.entries {
            *increment = generator.capture_epilogue();
        }
    }

    pub fn replay_prologue(&self) {
        for (generator, increment) in &self.entries {
            generator.replay_prologue(*increment);
        }
    }
}

fn same(a: &Arc<dyn GraphSafeGenerator>, b: &Arc<dyn GraphSafeGenerator>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
