//! Stream-graph data model & connect pass
//!
//! The model follows the arena discipline: workers live in a flat vector
//! indexed by stable [`WorkerId`]s, and every edge is named by a [`Token`]
//! `(producerId, consumerId)`. Predecessor/successor navigation goes through
//! per-port token vectors, never through owning references, so the graph stays
//! cycle-safe even though back-pressure makes the *runtime* relationship
//! between neighbours bidirectional.
//!
//! Contents:
//! - Index newtypes ([`WorkerId`], [`MachineId`], [`CoreId`], [`BlobId`]).
//! - Declared rates ([`Rate`], [`WorkerRates`]) and port arities ([`Arity`]).
//! - [`Token`] edge names, with the two sentinel forms for the overall input
//!   (no producer) and overall output (no consumer) of a stream.
//! - [`Channel`]: the runtime FIFO used at blob boundaries.
//! - The user-facing element tree ([`StreamElement`]) plus the visitor seam
//!   ([`StreamVisitor`]) used by the validation passes.
//! - The **connect pass** ([`StreamElement::lower`]): assigns ids, resolves
//!   splitter/joiner arities against branch counts, and wires every port to
//!   exactly one channel, producing a [`WorkerGraph`].
//!
//! Invariant: a lowered graph is feed-forward. Pipelines and splitjoins can
//! only express acyclic data flow, and the connect pass wires each port
//! exactly once, so topological traversal is always well-defined.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::workers::Work;
use crate::Item;

// ============================================================================
// Index newtypes
// ============================================================================

/// Stable identity of a worker inside one lowered graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct WorkerId(pub usize);
impl WorkerId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}
impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Identity of a machine (partitioning domain) in the configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct MachineId(pub usize);
impl MachineId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}
impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Index of a core slot inside one blob.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub usize);
impl CoreId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Process-unique identity of a compiled or interpreted blob.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct BlobId(pub usize);
impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob{}", self.0)
    }
}

// ============================================================================
// Rates & arities
// ============================================================================

/// A declared per-firing rate on one port: a fixed item count or DYNAMIC.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Rate {
    Fixed(u64),
    Dynamic,
}

impl Rate {
    /// The fixed value, or `None` for a dynamic rate.
    #[inline]
    pub fn fixed(self) -> Option<u64> {
        match self {
            Rate::Fixed(n) => Some(n),
            Rate::Dynamic => None,
        }
    }
    #[inline]
    pub fn is_dynamic(self) -> bool {
        matches!(self, Rate::Dynamic)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Fixed(n) => write!(f, "{n}"),
            Rate::Dynamic => write!(f, "*"),
        }
    }
}

/// Declared input/output port count of a splitter or joiner.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    /// Matches any branch count (splitters/joiners that replicate one port
    /// template per connected branch).
    Unlimited,
}

impl Arity {
    /// Whether a connection with `n` ports satisfies this declaration.
    #[inline]
    pub fn admits(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => k == n,
            Arity::Unlimited => true,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(k) => write!(f, "{k}"),
            Arity::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Resolved rate vectors of one worker: `pop`/`peek` per input port, `push`
/// per output port.
///
/// `peek` is the total lookahead a firing may examine, so a well-formed
/// declaration has `peek >= pop` on every port; the surplus
/// `max(peek - pop, 0)` is the per-port *excess peek* carried across steady
/// states by the buffers.
#[derive(Clone, Debug)]
pub struct WorkerRates {
    pub pop: Vec<Rate>,
    pub peek: Vec<Rate>,
    pub push: Vec<Rate>,
}

impl WorkerRates {
    /// Rates of a one-in one-out filter.
    pub fn filter(pop: u64, peek: u64, push: u64) -> Self {
        Self {
            pop: vec![Rate::Fixed(pop)],
            peek: vec![Rate::Fixed(peek.max(pop))],
            push: vec![Rate::Fixed(push)],
        }
    }

    pub fn input_ports(&self) -> usize {
        self.pop.len()
    }
    pub fn output_ports(&self) -> usize {
        self.push.len()
    }

    /// `max(peek - pop, 0)` for an input port, when both rates are fixed.
    pub fn excess_peeks(&self, port: usize) -> Option<u64> {
        match (self.peek[port], self.pop[port]) {
            (Rate::Fixed(peek), Rate::Fixed(pop)) => Some(peek.saturating_sub(pop)),
            _ => None,
        }
    }
}

// ============================================================================
// Tokens, channel metadata, boundary info
// ============================================================================

/// Name of an edge: the `(producer, consumer)` worker pair.
///
/// The two sentinel forms denote stream boundaries: the overall input has no
/// producer and the overall output has no consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct Token {
    producer: Option<WorkerId>,
    consumer: Option<WorkerId>,
}

impl Token {
    /// An internal edge between two workers.
    pub fn internal(producer: WorkerId, consumer: WorkerId) -> Self {
        Self { producer: Some(producer), consumer: Some(consumer) }
    }
    /// The overall-input edge feeding `consumer`.
    pub fn overall_input(consumer: WorkerId) -> Self {
        Self { producer: None, consumer: Some(consumer) }
    }
    /// The overall-output edge draining `producer`.
    pub fn overall_output(producer: WorkerId) -> Self {
        Self { producer: Some(producer), consumer: None }
    }

    pub fn producer(&self) -> Option<WorkerId> {
        self.producer
    }
    pub fn consumer(&self) -> Option<WorkerId> {
        self.consumer
    }
    pub fn is_overall_input(&self) -> bool {
        self.producer.is_none()
    }
    pub fn is_overall_output(&self) -> bool {
        self.consumer.is_none()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.producer, self.consumer) {
            (Some(p), Some(c)) => write!(f, "({p}->{c})"),
            (None, Some(c)) => write!(f, "(input->{c})"),
            (Some(p), None) => write!(f, "({p}->output)"),
            (None, None) => write!(f, "(invalid)"),
        }
    }
}

/// One endpoint of a channel: a worker plus the port index on its side.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub worker: WorkerId,
    pub port: usize,
}

/// Static description of one channel. The reverse lookup from token to
/// channel lives in a single map owned by the [`WorkerGraph`].
#[derive(Clone, Debug)]
pub struct ChannelMeta {
    pub token: Token,
    /// Producing endpoint; `None` for the overall input.
    pub producer: Option<Endpoint>,
    /// Consuming endpoint; `None` for the overall output.
    pub consumer: Option<Endpoint>,
}

/// Which side of a blob boundary a channel endpoint sits on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoundarySide {
    /// The blob consumes from this channel.
    Input,
    /// The blob produces into this channel.
    Output,
}

/// Per-channel boundary description for one blob.
#[derive(Clone, Debug)]
pub struct IoInfo {
    pub token: Token,
    /// `true` when the channel crosses the blob boundary (the other endpoint
    /// is outside the blob or is a stream boundary).
    pub crosses_boundary: bool,
    pub side: BoundarySide,
}

// ============================================================================
// Runtime channel (boundary FIFO)
// ============================================================================

/// A FIFO of items between exactly two parties, used wherever data crosses a
/// blob boundary at run time. Channels are the exclusive conduit between
/// workers; there is no shared memory.
///
/// All operations take the internal lock briefly; the steady-state hot path of
/// a compiled blob touches channels only during the inter-steady-state
/// handoff, never inside a core step.
pub struct Channel {
    q: Mutex<VecDeque<Item>>,
    cv: Condvar,
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    pub fn new() -> Self {
        Self { q: Mutex::new(VecDeque::new()), cv: Condvar::new() }
    }

    pub fn len(&self) -> usize {
        self.q.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }

    pub fn push(&self, value: Item) {
        self.q.lock().push_back(value);
        self.cv.notify_all();
    }

    pub fn push_many(&self, items: &[Item]) {
        let mut q = self.q.lock();
        q.extend(items.iter().copied());
        drop(q);
        self.cv.notify_all();
    }

    pub fn pop(&self) -> Option<Item> {
        self.q.lock().pop_front()
    }

    /// Read item `offset` without consuming anything.
    pub fn peek(&self, offset: usize) -> Option<Item> {
        self.q.lock().get(offset).copied()
    }

    /// Atomically remove `take` items and copy the following `lookahead`
    /// items without removing them. All-or-nothing: returns `None` when fewer
    /// than `take + lookahead` items are queued.
    pub fn take_with_lookahead(&self, take: usize, lookahead: usize) -> Option<Vec<Item>> {
        let mut q = self.q.lock();
        if q.len() < take + lookahead {
            return None;
        }
        let mut out = Vec::with_capacity(take + lookahead);
        out.extend(q.drain(..take));
        out.extend(q.iter().take(lookahead).copied());
        Some(out)
    }

    /// Remove and return everything currently queued.
    pub fn drain_all(&self) -> Vec<Item> {
        self.q.lock().drain(..).collect()
    }

    /// Block until at least `n` items are queued or `timeout` elapses.
    /// Returns the queue length observed last.
    pub fn wait_len(&self, n: usize, timeout: Duration) -> usize {
        let mut q = self.q.lock();
        if q.len() >= n {
            return q.len();
        }
        let _ = self.cv.wait_for(&mut q, timeout);
        q.len()
    }
}

// ============================================================================
// Message constraints
// ============================================================================

/// A control-message timing constraint between two workers: a message emitted
/// by `sender` at its `e`-th firing must be observed by `recipient` before
/// its `e + latency`-th firing. Constraints never carry data items.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageConstraint {
    pub sender: WorkerId,
    pub recipient: WorkerId,
    pub latency: u32,
}

// ============================================================================
// User-facing element tree & visitor seam
// ============================================================================

/// Kind discriminant of a primitive worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerKind {
    Filter,
    Splitter,
    Joiner,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Filter => write!(f, "filter"),
            WorkerKind::Splitter => write!(f, "splitter"),
            WorkerKind::Joiner => write!(f, "joiner"),
        }
    }
}

/// Declaration of a primitive worker: a registry-style name, the kind, the
/// declared arities, and the firing logic.
pub struct WorkerDecl {
    pub name: String,
    pub kind: WorkerKind,
    pub input_arity: Arity,
    pub output_arity: Arity,
    pub work: Box<dyn Work>,
}

impl WorkerDecl {
    /// A one-in one-out filter.
    pub fn filter(name: impl Into<String>, work: Box<dyn Work>) -> Self {
        Self {
            name: name.into(),
            kind: WorkerKind::Filter,
            input_arity: Arity::Exact(1),
            output_arity: Arity::Exact(1),
            work,
        }
    }

    /// A one-in many-out splitter with the given declared output arity.
    pub fn splitter(name: impl Into<String>, output_arity: Arity, work: Box<dyn Work>) -> Self {
        Self {
            name: name.into(),
            kind: WorkerKind::Splitter,
            input_arity: Arity::Exact(1),
            output_arity,
            work,
        }
    }

    /// A many-in one-out joiner with the given declared input arity.
    pub fn joiner(name: impl Into<String>, input_arity: Arity, work: Box<dyn Work>) -> Self {
        Self {
            name: name.into(),
            kind: WorkerKind::Joiner,
            input_arity,
            output_arity: Arity::Exact(1),
            work,
        }
    }

    /// Resolved rate vectors for a connection with `ins`/`outs` ports.
    pub fn rates(&self, ins: usize, outs: usize) -> WorkerRates {
        self.work.rates(ins, outs)
    }
}

impl fmt::Debug for WorkerDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDecl")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("input_arity", &self.input_arity)
            .field("output_arity", &self.output_arity)
            .finish_non_exhaustive()
    }
}

/// The user-facing graph: primitive workers composed serially by pipelines
/// and in parallel branches by splitjoins.
#[derive(Debug)]
pub enum StreamElement {
    Worker(WorkerDecl),
    Pipeline { name: String, children: Vec<StreamElement> },
    Splitjoin { name: String, splitter: WorkerDecl, joiner: WorkerDecl, branches: Vec<StreamElement> },
}

impl StreamElement {
    pub fn pipeline(name: impl Into<String>, children: Vec<StreamElement>) -> Self {
        StreamElement::Pipeline { name: name.into(), children }
    }

    pub fn splitjoin(
        name: impl Into<String>,
        splitter: WorkerDecl,
        joiner: WorkerDecl,
        branches: Vec<StreamElement>,
    ) -> Self {
        StreamElement::Splitjoin { name: name.into(), splitter, joiner, branches }
    }

    /// Read-only traversal of the element tree. The validation passes are
    /// compositions of visitors over this seam.
    pub fn accept(&self, v: &mut dyn StreamVisitor) {
        match self {
            StreamElement::Worker(decl) => v.visit_worker(decl),
            StreamElement::Pipeline { name, children } => {
                v.enter_pipeline(name);
                for child in children {
                    child.accept(v);
                }
                v.exit_pipeline(name);
            }
            StreamElement::Splitjoin { name, splitter, joiner, branches } => {
                v.enter_splitjoin(name, splitter, joiner, branches.len());
                for (i, branch) in branches.iter().enumerate() {
                    v.enter_branch(i);
                    branch.accept(v);
                    v.exit_branch(i);
                }
                v.exit_splitjoin(name);
            }
        }
    }
}

/// Visitor over the element tree. Default methods are no-ops so passes only
/// override the events they care about.
pub trait StreamVisitor {
    fn visit_worker(&mut self, _decl: &WorkerDecl) {}
    fn enter_pipeline(&mut self, _name: &str) {}
    fn exit_pipeline(&mut self, _name: &str) {}
    fn enter_splitjoin(
        &mut self,
        _name: &str,
        _splitter: &WorkerDecl,
        _joiner: &WorkerDecl,
        _branches: usize,
    ) {
    }
    fn exit_splitjoin(&mut self, _name: &str) {}
    fn enter_branch(&mut self, _index: usize) {}
    fn exit_branch(&mut self, _index: usize) {}
}

// ============================================================================
// Lowered graph
// ============================================================================

/// Errors raised by the connect pass or by graph integrity checks.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("pipeline `{path}` has no children")]
    EmptyPipeline { path: String },
    #[error("splitjoin `{path}` has no branches")]
    NoBranches { path: String },
    #[error("{kind} `{path}` declares {declared} ports but {found} are connected")]
    ArityMismatch { kind: WorkerKind, path: String, declared: Arity, found: usize },
    #[error("worker `{path}` resolved {got} rate entries for {want} ports")]
    BadRates { path: String, want: usize, got: usize },
    #[error("worker `{path}` of kind {kind} cannot stand alone in a pipeline")]
    MisplacedWorker { kind: WorkerKind, path: String },
    #[error("port already connected at `{path}` (element appears twice)")]
    PortAlreadyConnected { path: String },
    #[error("worker {id} appears more than once in the graph")]
    RepeatedWorker { id: WorkerId },
    #[error("channel {token} appears more than once in the graph")]
    RepeatedChannel { token: Token },
}

/// One lowered worker. Firing logic is held until the compiler (or the
/// interpreter) takes ownership of it; everything else is plain metadata.
pub struct WorkerNode {
    pub id: WorkerId,
    pub name: String,
    pub kind: WorkerKind,
    pub rates: WorkerRates,
    /// Element path through pipelines/splitjoins, e.g.
    /// `main/eq/branch1/LowPass`. Attached to validation errors.
    pub path: String,
    /// Token of the channel on each input port.
    pub inputs: Vec<Token>,
    /// Token of the channel on each output port.
    pub outputs: Vec<Token>,
    pub(crate) work: Option<Box<dyn Work>>,
}

impl WorkerNode {
    /// Take the firing logic out of the node. Panics if already taken; the
    /// compiler and the interpreter are the only callers and each graph is
    /// handed to exactly one of them.
    pub(crate) fn take_work(&mut self) -> Box<dyn Work> {
        self.work.take().expect("worker logic already taken")
    }

    /// Whether the firing logic carries state across executions. Stateful
    /// workers cannot be replicated across cores.
    pub fn is_stateful(&self) -> bool {
        self.work.as_ref().map(|w| w.stateful()).unwrap_or(false)
    }
}

impl fmt::Debug for WorkerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// A lowered, connected worker graph with a unique source and sink.
pub struct WorkerGraph {
    workers: Vec<WorkerNode>,
    channels: BTreeMap<Token, ChannelMeta>,
    constraints: Vec<MessageConstraint>,
    source: WorkerId,
    sink: WorkerId,
}

impl WorkerGraph {
    pub fn len(&self) -> usize {
        self.workers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, id: WorkerId) -> &WorkerNode {
        &self.workers[id.0]
    }
    pub fn worker_mut(&mut self, id: WorkerId) -> &mut WorkerNode {
        &mut self.workers[id.0]
    }
    pub fn workers(&self) -> impl Iterator<Item = &WorkerNode> {
        self.workers.iter()
    }
    pub fn ids(&self) -> impl Iterator<Item = WorkerId> {
        (0..self.workers.len()).map(WorkerId)
    }

    /// The single map holding every token-to-channel association.
    pub fn channels(&self) -> &BTreeMap<Token, ChannelMeta> {
        &self.channels
    }
    pub fn channel(&self, token: Token) -> Option<&ChannelMeta> {
        self.channels.get(&token)
    }

    /// Worker fed by the overall input.
    pub fn source(&self) -> WorkerId {
        self.source
    }
    /// Worker feeding the overall output.
    pub fn sink(&self) -> WorkerId {
        self.sink
    }

    pub fn predecessors(&self, id: WorkerId) -> impl Iterator<Item = WorkerId> + '_ {
        self.worker(id).inputs.iter().filter_map(|t| t.producer())
    }
    pub fn successors(&self, id: WorkerId) -> impl Iterator<Item = WorkerId> + '_ {
        self.worker(id).outputs.iter().filter_map(|t| t.consumer())
    }

    /// Attach a message constraint. The compiler rejects constraints whose
    /// endpoints end up on opposite sides of a blob boundary.
    pub fn add_constraint(&mut self, c: MessageConstraint) {
        self.constraints.push(c);
    }
    pub fn constraints(&self) -> &[MessageConstraint] {
        &self.constraints
    }

    /// Topological order over the whole graph (Kahn). The connect pass only
    /// produces feed-forward graphs, so this cannot fail.
    pub fn topo_order(&self) -> Vec<WorkerId> {
        let all: Vec<WorkerId> = self.ids().collect();
        self.topo_order_of(&all)
    }

    /// Topological order restricted to `subset`, considering only edges with
    /// both endpoints in the subset.
    pub fn topo_order_of(&self, subset: &[WorkerId]) -> Vec<WorkerId> {
        let inside: std::collections::BTreeSet<WorkerId> = subset.iter().copied().collect();
        let mut indegree: BTreeMap<WorkerId, usize> = subset.iter().map(|w| (*w, 0)).collect();
        for &w in subset {
            for p in self.predecessors(w) {
                if inside.contains(&p) {
                    *indegree.get_mut(&w).expect("subset member") += 1;
                }
            }
        }
        let mut ready: VecDeque<WorkerId> =
            subset.iter().copied().filter(|w| indegree[w] == 0).collect();
        let mut order = Vec::with_capacity(subset.len());
        while let Some(w) = ready.pop_front() {
            order.push(w);
            for s in self.successors(w) {
                if let Some(d) = indegree.get_mut(&s) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(s);
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), subset.len(), "lowered graphs are acyclic");
        order
    }

    /// Boundary description of `token` as seen from the worker set `inside`.
    pub fn io_info(&self, token: Token, inside: &std::collections::BTreeSet<WorkerId>) -> IoInfo {
        let producer_inside = token.producer().map(|p| inside.contains(&p)).unwrap_or(false);
        let consumer_inside = token.consumer().map(|c| inside.contains(&c)).unwrap_or(false);
        IoInfo {
            token,
            crosses_boundary: producer_inside != consumer_inside,
            side: if consumer_inside { BoundarySide::Input } else { BoundarySide::Output },
        }
    }

    /// Structural integrity: ids are dense and unique, every internal token
    /// appears exactly once on the producing and the consuming side. A second
    /// pass over an already-valid graph is a no-op.
    pub fn check_integrity(&self) -> Result<(), GraphError> {
        let mut seen_out: BTreeMap<Token, WorkerId> = BTreeMap::new();
        let mut seen_in: BTreeMap<Token, WorkerId> = BTreeMap::new();
        for (i, w) in self.workers.iter().enumerate() {
            if w.id.0 != i {
                return Err(GraphError::RepeatedWorker { id: w.id });
            }
            for t in &w.outputs {
                if seen_out.insert(*t, w.id).is_some() {
                    return Err(GraphError::RepeatedChannel { token: *t });
                }
            }
            for t in &w.inputs {
                if seen_in.insert(*t, w.id).is_some() {
                    return Err(GraphError::RepeatedChannel { token: *t });
                }
            }
        }
        for (t, meta) in &self.channels {
            let ok_prod = match meta.producer {
                Some(ep) => seen_out.get(t) == Some(&ep.worker),
                None => t.is_overall_input(),
            };
            let ok_cons = match meta.consumer {
                Some(ep) => seen_in.get(t) == Some(&ep.worker),
                None => t.is_overall_output(),
            };
            if !ok_prod || !ok_cons {
                return Err(GraphError::RepeatedChannel { token: *t });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for WorkerGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerGraph")
            .field("workers", &self.workers.len())
            .field("channels", &self.channels.len())
            .field("source", &self.source)
            .field("sink", &self.sink)
            .finish()
    }
}

// ============================================================================
// Connect pass (lowering)
// ============================================================================

struct NodeBuild {
    name: String,
    kind: WorkerKind,
    rates: WorkerRates,
    path: String,
    inputs: Vec<Option<Token>>,
    outputs: Vec<Option<Token>>,
    work: Box<dyn Work>,
}

struct Lowering {
    nodes: Vec<NodeBuild>,
    path: Vec<String>,
}

/// Entry/exit workers of one lowered sub-element.
#[derive(Copy, Clone)]
struct Segment {
    entry: WorkerId,
    exit: WorkerId,
}

impl Lowering {
    fn path_of(&self, leaf: &str) -> String {
        if self.path.is_empty() {
            leaf.to_string()
        } else {
            format!("{}/{}", self.path.join("/"), leaf)
        }
    }

    fn add_node(&mut self, decl: WorkerDecl, ins: usize, outs: usize) -> Result<WorkerId, GraphError> {
        let path = self.path_of(&decl.name);
        let rates = decl.rates(ins, outs);
        if rates.pop.len() != ins || rates.peek.len() != ins {
            return Err(GraphError::BadRates { path, want: ins, got: rates.pop.len() });
        }
        if rates.push.len() != outs {
            return Err(GraphError::BadRates { path, want: outs, got: rates.push.len() });
        }
        let id = WorkerId(self.nodes.len());
        self.nodes.push(NodeBuild {
            name: decl.name,
            kind: decl.kind,
            rates,
            path,
            inputs: vec![None; ins],
            outputs: vec![None; outs],
            work: decl.work,
        });
        Ok(id)
    }

    fn connect(&mut self, from: Endpoint, to: Endpoint) -> Result<(), GraphError> {
        let token = Token::internal(from.worker, to.worker);
        let out_slot = &mut self.nodes[from.worker.0].outputs[from.port];
        if out_slot.is_some() {
            return Err(GraphError::PortAlreadyConnected {
                path: self.nodes[from.worker.0].path.clone(),
            });
        }
        *out_slot = Some(token);
        let in_slot = &mut self.nodes[to.worker.0].inputs[to.port];
        if in_slot.is_some() {
            return Err(GraphError::PortAlreadyConnected {
                path: self.nodes[to.worker.0].path.clone(),
            });
        }
        *in_slot = Some(token);
        Ok(())
    }

    fn lower(&mut self, element: StreamElement) -> Result<Segment, GraphError> {
        match element {
            StreamElement::Worker(decl) => {
                if decl.kind != WorkerKind::Filter {
                    return Err(GraphError::MisplacedWorker {
                        kind: decl.kind,
                        path: self.path_of(&decl.name),
                    });
                }
                let id = self.add_node(decl, 1, 1)?;
                Ok(Segment { entry: id, exit: id })
            }
            StreamElement::Pipeline { name, children } => {
                if children.is_empty() {
                    return Err(GraphError::EmptyPipeline { path: self.path_of(&name) });
                }
                self.path.push(name);
                let mut segments = Vec::with_capacity(children.len());
                for child in children {
                    segments.push(self.lower(child)?);
                }
                self.path.pop();
                for pair in segments.windows(2) {
                    self.connect(
                        Endpoint { worker: pair[0].exit, port: 0 },
                        Endpoint { worker: pair[1].entry, port: 0 },
                    )?;
                }
                Ok(Segment {
                    entry: segments.first().expect("non-empty pipeline").entry,
                    exit: segments.last().expect("non-empty pipeline").exit,
                })
            }
            StreamElement::Splitjoin { name, splitter, joiner, branches } => {
                let n = branches.len();
                if n == 0 {
                    return Err(GraphError::NoBranches { path: self.path_of(&name) });
                }
                self.path.push(name.clone());
                if !splitter.output_arity.admits(n) {
                    let declared = splitter.output_arity;
                    let path = self.path_of(&splitter.name);
                    self.path.pop();
                    return Err(GraphError::ArityMismatch {
                        kind: WorkerKind::Splitter,
                        path,
                        declared,
                        found: n,
                    });
                }
                if !joiner.input_arity.admits(n) {
                    let declared = joiner.input_arity;
                    let path = self.path_of(&joiner.name);
                    self.path.pop();
                    return Err(GraphError::ArityMismatch {
                        kind: WorkerKind::Joiner,
                        path,
                        declared,
                        found: n,
                    });
                }
                let split_id = self.add_node(splitter, 1, n)?;
                let mut branch_segments = Vec::with_capacity(n);
                for (i, branch) in branches.into_iter().enumerate() {
                    self.path.push(format!("branch{i}"));
                    branch_segments.push(self.lower(branch)?);
                    self.path.pop();
                }
                let join_id = self.add_node(joiner, n, 1)?;
                for (i, seg) in branch_segments.iter().enumerate() {
                    self.connect(
                        Endpoint { worker: split_id, port: i },
                        Endpoint { worker: seg.entry, port: 0 },
                    )?;
                    self.connect(
                        Endpoint { worker: seg.exit, port: 0 },
                        Endpoint { worker: join_id, port: i },
                    )?;
                }
                self.path.pop();
                Ok(Segment { entry: split_id, exit: join_id })
            }
        }
    }
}

impl StreamElement {
    /// The connect pass: assign stable ids in visit order, resolve arities,
    /// and wire every port to exactly one channel. The root element must be
    /// one-in one-out; its free ports become the overall input and output.
    pub fn lower(self) -> Result<WorkerGraph, GraphError> {
        let mut lw = Lowering { nodes: Vec::new(), path: Vec::new() };
        let segment = lw.lower(self)?;

        let source = segment.entry;
        let sink = segment.exit;
        lw.nodes[source.0].inputs[0] = Some(Token::overall_input(source));
        lw.nodes[sink.0].outputs[0] = Some(Token::overall_output(sink));

        let mut channels = BTreeMap::new();
        let mut workers = Vec::with_capacity(lw.nodes.len());
        for (i, node) in lw.nodes.into_iter().enumerate() {
            let id = WorkerId(i);
            let inputs: Vec<Token> = node
                .inputs
                .into_iter()
                .map(|t| t.expect("connect pass wires every input port"))
                .collect();
            let outputs: Vec<Token> = node
                .outputs
                .into_iter()
                .map(|t| t.expect("connect pass wires every output port"))
                .collect();
            for (port, t) in inputs.iter().enumerate() {
                let meta = channels.entry(*t).or_insert(ChannelMeta {
                    token: *t,
                    producer: None,
                    consumer: None,
                });
                meta.consumer = Some(Endpoint { worker: id, port });
            }
            for (port, t) in outputs.iter().enumerate() {
                let meta = channels.entry(*t).or_insert(ChannelMeta {
                    token: *t,
                    producer: None,
                    consumer: None,
                });
                meta.producer = Some(Endpoint { worker: id, port });
            }
            workers.push(WorkerNode {
                id,
                name: node.name,
                kind: node.kind,
                rates: node.rates,
                path: node.path,
                inputs,
                outputs,
                work: Some(node.work),
            });
        }

        let graph = WorkerGraph { workers, channels, constraints: Vec::new(), source, sink };
        graph.check_integrity()?;
        Ok(graph)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::{Compressor, Duplicate, Identity, RoundRobinJoiner};

    fn identity() -> StreamElement {
        StreamElement::Worker(WorkerDecl::filter("Identity", Box::new(Identity)))
    }

    #[test]
    fn lower_pipeline_assigns_ids_and_boundaries() {
        let g = StreamElement::pipeline("main", vec![identity(), identity()])
            .lower()
            .unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(g.source(), WorkerId(0));
        assert_eq!(g.sink(), WorkerId(1));
        assert!(g.worker(WorkerId(0)).inputs[0].is_overall_input());
        assert!(g.worker(WorkerId(1)).outputs[0].is_overall_output());
        let t = Token::internal(WorkerId(0), WorkerId(1));
        let meta = g.channel(t).expect("internal channel");
        assert_eq!(meta.producer, Some(Endpoint { worker: WorkerId(0), port: 0 }));
        assert_eq!(meta.consumer, Some(Endpoint { worker: WorkerId(1), port: 0 }));
    }

    #[test]
    fn lower_splitjoin_wires_branches_in_order() {
        let sj = StreamElement::splitjoin(
            "sj",
            WorkerDecl::splitter("Dup", Arity::Unlimited, Box::new(Duplicate)),
            WorkerDecl::joiner("RR", Arity::Unlimited, Box::new(RoundRobinJoiner::uniform(1))),
            vec![identity(), identity()],
        );
        let g = StreamElement::pipeline("main", vec![sj]).lower().unwrap();
        // splitter, branch0, branch1, joiner in visit order
        assert_eq!(g.len(), 4);
        let split = WorkerId(0);
        let join = WorkerId(3);
        assert_eq!(g.worker(split).outputs.len(), 2);
        assert_eq!(g.worker(join).inputs.len(), 2);
        assert_eq!(g.successors(split).collect::<Vec<_>>(), vec![WorkerId(1), WorkerId(2)]);
        assert_eq!(g.predecessors(join).collect::<Vec<_>>(), vec![WorkerId(1), WorkerId(2)]);
        assert_eq!(g.worker(WorkerId(1)).path, "main/sj/branch0/Identity");
    }

    #[test]
    fn exact_arity_rejects_wrong_branch_count() {
        let sj = StreamElement::splitjoin(
            "sj",
            WorkerDecl::splitter("Dup", Arity::Exact(3), Box::new(Duplicate)),
            WorkerDecl::joiner("RR", Arity::Unlimited, Box::new(RoundRobinJoiner::uniform(1))),
            vec![identity(), identity()],
        );
        let err = sj.lower().unwrap_err();
        assert!(matches!(err, GraphError::ArityMismatch { found: 2, .. }));
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let err = StreamElement::pipeline("main", vec![]).lower().unwrap_err();
        assert!(matches!(err, GraphError::EmptyPipeline { .. }));
    }

    #[test]
    fn topo_order_respects_edges() {
        let g = StreamElement::pipeline(
            "main",
            vec![
                identity(),
                StreamElement::Worker(WorkerDecl::filter("Comp", Box::new(Compressor::new(2)))),
                identity(),
            ],
        )
        .lower()
        .unwrap();
        assert_eq!(g.topo_order(), vec![WorkerId(0), WorkerId(1), WorkerId(2)]);
        assert!(g.check_integrity().is_ok());
    }

    #[test]
    fn token_ordering_and_display() {
        let a = Token::overall_input(WorkerId(1));
        let b = Token::internal(WorkerId(0), WorkerId(1));
        assert!(a < b); // overall input sorts before internal edges
        assert_eq!(format!("{b}"), "(w0->w1)");
        assert_eq!(format!("{}", Token::overall_output(WorkerId(4))), "(w4->output)");
    }

    #[test]
    fn channel_lookahead_is_all_or_nothing() {
        let ch = Channel::new();
        ch.push_many(&[1, 2, 3]);
        assert_eq!(ch.take_with_lookahead(2, 2), None);
        assert_eq!(ch.take_with_lookahead(2, 1), Some(vec![1, 2, 3]));
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.peek(0), Some(3));
    }
}
