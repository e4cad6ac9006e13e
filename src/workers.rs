//! Firing contract & stock workers
//!
//! A worker's logic is a [`Work`] implementation: one `work()` call is one
//! firing, reading exactly `pop` items per input port (with `peek - pop`
//! lookahead allowed) and writing exactly `push` items per output port,
//! through the [`WorkIo`] port view handed in by the executor. The contract is
//! the same whether the firing happens inside a compiled per-core step or in
//! the pull interpreter, which is what makes the two executors comparable
//! item for item.
//!
//! The stock workers here are deliberately small; they exist to exercise the
//! machinery and to seed the name-keyed registry that replaces by-name
//! reflection: construction is `registry().create(name, params)`, so a graph
//! description can be rebuilt from registry keys plus tunable parameters.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::graph::{Rate, WorkerRates};
use crate::Item;

// ============================================================================
// Port views
// ============================================================================

/// Read side of one input port during a firing.
pub trait PortRead {
    /// Items currently readable (popped or peeked) on this port.
    fn available(&self) -> usize;
    /// Look at item `offset` without consuming it.
    fn peek_at(&self, offset: usize) -> Item;
    /// Consume and return the next item.
    fn pop_next(&mut self) -> Item;
}

/// Write side of one output port during a firing.
pub trait PortWrite {
    fn push_next(&mut self, value: Item);
}

impl PortRead for VecDeque<Item> {
    fn available(&self) -> usize {
        self.len()
    }
    fn peek_at(&self, offset: usize) -> Item {
        *self.get(offset).expect("peek past end of input channel")
    }
    fn pop_next(&mut self) -> Item {
        self.pop_front().expect("pop from empty input channel")
    }
}

impl PortWrite for VecDeque<Item> {
    fn push_next(&mut self, value: Item) {
        self.push_back(value);
    }
}

impl PortWrite for Vec<Item> {
    fn push_next(&mut self, value: Item) {
        self.push(value);
    }
}

/// The ordered port view for one firing. Executors hand every firing a fresh
/// `WorkIo`; workers address ports by index.
pub struct WorkIo<'a> {
    inputs: Vec<&'a mut dyn PortRead>,
    outputs: Vec<&'a mut dyn PortWrite>,
}

impl<'a> WorkIo<'a> {
    pub fn new(inputs: Vec<&'a mut dyn PortRead>, outputs: Vec<&'a mut dyn PortWrite>) -> Self {
        Self { inputs, outputs }
    }

    pub fn input_ports(&self) -> usize {
        self.inputs.len()
    }
    pub fn output_ports(&self) -> usize {
        self.outputs.len()
    }

    pub fn pop(&mut self, port: usize) -> Item {
        self.inputs[port].pop_next()
    }
    pub fn peek(&self, port: usize, offset: usize) -> Item {
        self.inputs[port].peek_at(offset)
    }
    pub fn push(&mut self, port: usize, value: Item) {
        self.outputs[port].push_next(value);
    }
}

// ============================================================================
// Firing trait
// ============================================================================

/// One worker's firing logic plus its rate declaration.
///
/// `rates(ins, outs)` resolves the declared rate vectors once the connect
/// pass knows the port counts; unlimited splitters/joiners replicate their
/// per-port template here. `clone_box` exists so a stateless worker can be
/// replicated across data-parallel cores; stateful workers return `true` from
/// [`Work::stateful`] and are confined to a single core by the compiler.
pub trait Work: Send {
    /// Execute one firing against the given port view.
    fn work(&mut self, io: &mut WorkIo<'_>);

    /// Resolved rates for a connection with `ins` input and `outs` output
    /// ports.
    fn rates(&self, ins: usize, outs: usize) -> WorkerRates;

    fn clone_box(&self) -> Box<dyn Work>;

    /// Whether firings carry state from one execution to the next.
    fn stateful(&self) -> bool {
        false
    }
}

impl Clone for Box<dyn Work> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

// ============================================================================
// Stock filters
// ============================================================================

/// Forwards its input unchanged.
#[derive(Clone, Debug)]
pub struct Identity;

impl Work for Identity {
    fn work(&mut self, io: &mut WorkIo<'_>) {
        let v = io.pop(0);
        io.push(0, v);
    }
    fn rates(&self, _ins: usize, _outs: usize) -> WorkerRates {
        WorkerRates::filter(1, 1, 1)
    }
    fn clone_box(&self) -> Box<dyn Work> {
        Box::new(self.clone())
    }
}

/// Keeps the first of every group of `n` items.
#[derive(Clone, Debug)]
pub struct Compressor {
    n: u64,
}

impl Compressor {
    pub fn new(n: u64) -> Self {
        assert!(n > 0, "compression factor must be positive");
        Self { n }
    }
}

impl Work for Compressor {
    fn work(&mut self, io: &mut WorkIo<'_>) {
        let first = io.pop(0);
        for _ in 1..self.n {
            let _ = io.pop(0);
        }
        io.push(0, first);
    }
    fn rates(&self, _ins: usize, _outs: usize) -> WorkerRates {
        WorkerRates::filter(self.n, self.n, 1)
    }
    fn clone_box(&self) -> Box<dyn Work> {
        Box::new(self.clone())
    }
}

/// Emits each input item followed by `n - 1` zeros.
#[derive(Clone, Debug)]
pub struct Expander {
    n: u64,
}

impl Expander {
    pub fn new(n: u64) -> Self {
        assert!(n > 0, "expansion factor must be positive");
        Self { n }
    }
}

impl Work for Expander {
    fn work(&mut self, io: &mut WorkIo<'_>) {
        let v = io.pop(0);
        io.push(0, v);
        for _ in 1..self.n {
            io.push(0, 0);
        }
    }
    fn rates(&self, _ins: usize, _outs: usize) -> WorkerRates {
        WorkerRates::filter(1, 1, self.n)
    }
    fn clone_box(&self) -> Box<dyn Work> {
        Box::new(self.clone())
    }
}

/// Sliding-window sum: peeks `window` items, pops one, pushes the sum.
/// Exercises the excess-peek path (`peek > pop`).
#[derive(Clone, Debug)]
pub struct MovingSum {
    window: u64,
}

impl MovingSum {
    pub fn new(window: u64) -> Self {
        assert!(window > 0, "window must be positive");
        Self { window }
    }
}

impl Work for MovingSum {
    fn work(&mut self, io: &mut WorkIo<'_>) {
        let mut sum = 0;
        for i in 0..self.window {
            sum += io.peek(0, i as usize);
        }
        let _ = io.pop(0);
        io.push(0, sum);
    }
    fn rates(&self, _ins: usize, _outs: usize) -> WorkerRates {
        WorkerRates::filter(1, self.window, 1)
    }
    fn clone_box(&self) -> Box<dyn Work> {
        Box::new(self.clone())
    }
}

/// Running sum; the carried total makes it stateful.
#[derive(Clone, Debug, Default)]
pub struct Accumulator {
    total: Item,
}

impl Work for Accumulator {
    fn work(&mut self, io: &mut WorkIo<'_>) {
        self.total += io.pop(0);
        io.push(0, self.total);
    }
    fn rates(&self, _ins: usize, _outs: usize) -> WorkerRates {
        WorkerRates::filter(1, 1, 1)
    }
    fn clone_box(&self) -> Box<dyn Work> {
        Box::new(self.clone())
    }
    fn stateful(&self) -> bool {
        true
    }
}

// ============================================================================
// Stock splitters & joiners
// ============================================================================

/// Per-port weights of a round-robin splitter or joiner.
#[derive(Clone, Debug)]
pub enum Weights {
    /// Every port carries `w` items per firing.
    Uniform(u64),
    /// Port `i` carries `weights[i]` items per firing; the declared arity must
    /// match the vector length.
    PerPort(Vec<u64>),
}

impl Weights {
    fn resolve(&self, ports: usize) -> Vec<u64> {
        match self {
            Weights::Uniform(w) => vec![*w; ports],
            Weights::PerPort(v) => v.clone(),
        }
    }
}

/// Copies each popped item to every output port.
#[derive(Clone, Debug)]
pub struct Duplicate;

impl Work for Duplicate {
    fn work(&mut self, io: &mut WorkIo<'_>) {
        let v = io.pop(0);
        for port in 0..io.output_ports() {
            io.push(port, v);
        }
    }
    fn rates(&self, _ins: usize, outs: usize) -> WorkerRates {
        WorkerRates {
            pop: vec![Rate::Fixed(1)],
            peek: vec![Rate::Fixed(1)],
            push: vec![Rate::Fixed(1); outs],
        }
    }
    fn clone_box(&self) -> Box<dyn Work> {
        Box::new(self.clone())
    }
}

/// Deals weighted runs of items to its output ports in port order.
#[derive(Clone, Debug)]
pub struct RoundRobinSplitter {
    weights: Weights,
}

impl RoundRobinSplitter {
    pub fn uniform(weight: u64) -> Self {
        Self { weights: Weights::Uniform(weight) }
    }
    pub fn weighted(weights: Vec<u64>) -> Self {
        Self { weights: Weights::PerPort(weights) }
    }
}

impl Work for RoundRobinSplitter {
    fn work(&mut self, io: &mut WorkIo<'_>) {
        let w = self.weights.resolve(io.output_ports());
        for (port, weight) in w.iter().enumerate() {
            for _ in 0..*weight {
                let v = io.pop(0);
                io.push(port, v);
            }
        }
    }
    fn rates(&self, _ins: usize, outs: usize) -> WorkerRates {
        let w = self.weights.resolve(outs);
        let total: u64 = w.iter().sum();
        WorkerRates {
            pop: vec![Rate::Fixed(total)],
            peek: vec![Rate::Fixed(total)],
            push: w.into_iter().map(Rate::Fixed).collect(),
        }
    }
    fn clone_box(&self) -> Box<dyn Work> {
        Box::new(self.clone())
    }
}

/// Collects weighted runs of items from its input ports in port order.
#[derive(Clone, Debug)]
pub struct RoundRobinJoiner {
    weights: Weights,
}

impl RoundRobinJoiner {
    pub fn uniform(weight: u64) -> Self {
        Self { weights: Weights::Uniform(weight) }
    }
    pub fn weighted(weights: Vec<u64>) -> Self {
        Self { weights: Weights::PerPort(weights) }
    }
}

impl Work for RoundRobinJoiner {
    fn work(&mut self, io: &mut WorkIo<'_>) {
        let w = self.weights.resolve(io.input_ports());
        for (port, weight) in w.iter().enumerate() {
            for _ in 0..*weight {
                let v = io.pop(port);
                io.push(0, v);
            }
        }
    }
    fn rates(&self, ins: usize, _outs: usize) -> WorkerRates {
        let w = self.weights.resolve(ins);
        let total: u64 = w.iter().sum();
        WorkerRates {
            pop: w.iter().copied().map(Rate::Fixed).collect(),
            peek: w.into_iter().map(Rate::Fixed).collect(),
            push: vec![Rate::Fixed(total)],
        }
    }
    fn clone_box(&self) -> Box<dyn Work> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Name-keyed registry
// ============================================================================

/// Factory signature: integer tunables in, fresh worker logic out.
pub type WorkerFactory = fn(&[i64]) -> Box<dyn Work>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("worker `{0}` is already registered")]
    Duplicate(String),
}

/// Process-wide map from worker name to factory. Serialized graph
/// descriptions reference workers by these keys plus their parameters.
pub struct WorkerRegistry {
    factories: RwLock<BTreeMap<String, WorkerFactory>>,
}

impl WorkerRegistry {
    fn new() -> Self {
        Self { factories: RwLock::new(BTreeMap::new()) }
    }

    pub fn register(&self, name: &str, factory: WorkerFactory) -> Result<(), RegistryError> {
        let mut map = self.factories.write();
        if map.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        map.insert(name.to_string(), factory);
        Ok(())
    }

    /// Instantiate `name` with the given tunables, or `None` when the name is
    /// unknown.
    pub fn create(&self, name: &str, params: &[i64]) -> Option<Box<dyn Work>> {
        self.factories.read().get(name).map(|f| f(params))
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

fn param(params: &[i64], idx: usize, default: i64) -> u64 {
    params.get(idx).copied().unwrap_or(default).max(1) as u64
}

/// The process-wide registry, with the stock workers pre-registered.
pub fn registry() -> &'static WorkerRegistry {
    static REGISTRY: OnceLock<WorkerRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let r = WorkerRegistry::new();
        let stock: &[(&str, WorkerFactory)] = &[
            ("Identity", |_| Box::new(Identity)),
            ("Compressor", |p| Box::new(Compressor::new(param(p, 0, 2)))),
            ("Expander", |p| Box::new(Expander::new(param(p, 0, 2)))),
            ("MovingSum", |p| Box::new(MovingSum::new(param(p, 0, 2)))),
            ("Accumulator", |_| Box::new(Accumulator::default())),
            ("Duplicate", |_| Box::new(Duplicate)),
            ("RoundRobinSplitter", |p| Box::new(RoundRobinSplitter::uniform(param(p, 0, 1)))),
            ("RoundRobinJoiner", |p| Box::new(RoundRobinJoiner::uniform(param(p, 0, 1)))),
        ];
        for (name, factory) in stock {
            r.register(name, *factory).expect("stock names are distinct");
        }
        r
    })
}

// ============================================================================
// Tests
// ============================================================================
