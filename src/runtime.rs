//! Blob runtime
//!
//! Executes the plans produced by the compiler. Each blob runs one OS thread
//! per core slot; a thread repeatedly calls its core's [`CoreCode::run`],
//! which performs one steady-state **round** (`multiplier` steady states).
//!
//! ## Round protocol
//!
//! Core 0 doubles as the round leader. A round is two barrier phases:
//!
//! 1. The leader flushes the previous round's writer segments downstream,
//!    pumps the reader segments from the boundary channels (including the
//!    standing `excessPeeks` lookahead, which is copied but not consumed),
//!    and publishes the round decision. Followers park at the barrier.
//! 2. Every core executes its assigned share of blob firings against its own
//!    reader/writer segments and per-core internal buffers. No channel locks
//!    and no cross-core data are touched inside the step.
//!
//! The barrier is the sole synchronization point per round, which gives the
//! happens-before edge between round-N producer writes and round-N+1
//! consumer reads. Because each blob firing is a complete internal steady
//! state, internal channels never cross cores; only boundary data is
//! distributed, in core order, which keeps the output item order identical
//! to the single-core execution.
//!
//! ## Drain
//!
//! `drain(callback)` sets a monotonic stop flag; the second request is
//! refused. Cores complete the round in flight, then the leader runs the
//! terminal sequence: remaining boundary input and the standing buffer
//! prefixes are pull-processed to exhaustion through the core-0 worker
//! instances, tail output is flushed downstream, the callback fires exactly
//! once, and the blob answers `is_drained()` from then on.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::compiler::{BlobPlan, StreamPlan};
use crate::graph::{BlobId, Channel, CoreId, Token, WorkerGraph, WorkerId};
use crate::workers::{PortRead, PortWrite, Work, WorkIo};
use crate::Item;

/// How long the round leader naps on an underfilled input before retrying.
const PUMP_WAIT: Duration = Duration::from_millis(5);

// ============================================================================
// Public contract
// ============================================================================

/// Completion callback passed to [`Blob::drain`]. Invoked exactly once.
pub type DrainCallback = Box<dyn FnOnce() + Send>;

/// Blob lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlobState {
    Ready,
    Running,
    Draining,
    Drained,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("drain already requested on {blob}")]
    DrainAlreadyRequested { blob: BlobId },
    #[error("token {token} is not a boundary of {blob}")]
    UnknownBoundary { blob: BlobId, token: Token },
    #[error("token {token} already wired on {blob}")]
    AlreadyWired { blob: BlobId, token: Token },
    #[error("boundary {token} of {blob} was never wired")]
    NotWired { blob: BlobId, token: Token },
}

/// One core's step routine. `run` performs one round and reports whether the
/// blob still has work; a drained blob returns `false` forever.
pub trait CoreCode: Send + Sync {
    fn run(&self) -> bool;
}

/// The execution contract a blob exposes to the outer runtime.
pub trait Blob: Send + Sync {
    fn id(&self) -> BlobId;
    fn workers(&self) -> BTreeSet<WorkerId>;
    fn input_tokens(&self) -> Vec<Token>;
    fn output_tokens(&self) -> Vec<Token>;
    /// Wire a boundary input. The upper layer connects channels after
    /// construction and before the first run.
    fn wire_input(&self, token: Token, channel: Arc<Channel>) -> Result<(), RuntimeError>;
    fn wire_output(&self, token: Token, channel: Arc<Channel>) -> Result<(), RuntimeError>;
    fn core_count(&self) -> usize;
    /// Idempotent getter; safe from any thread. The returned routine is meant
    /// to be run on core `core`.
    fn core_code(&self, core: CoreId) -> Arc<dyn CoreCode>;
    fn drain(&self, callback: DrainCallback) -> Result<(), RuntimeError>;
    fn is_drained(&self) -> bool;
    fn state(&self) -> BlobState;
}

// ============================================================================
// Compiled blob
// ============================================================================

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Decision {
    /// Segments are pumped; run the step.
    Run,
    /// Not enough boundary input yet; come back.
    Park,
    /// Stop flag observed; leader runs the terminal sequence.
    DrainNow,
}

/// Immutable per-blob execution metadata derived from the plan.
struct RoundMeta {
    /// Blob firings per round for each core (`core_firings · multiplier`).
    round_firings: Vec<u64>,
    /// Items one blob firing pops from each boundary input.
    pops_per_firing: BTreeMap<Token, u64>,
    /// Extra items core 0 pops once, before its first steady state.
    init_pops: BTreeMap<Token, u64>,
    /// Standing lookahead per boundary input.
    excess: BTreeMap<Token, u64>,
    /// Input/output tokens per worker, in port order.
    ports: BTreeMap<WorkerId, (Vec<Token>, Vec<Token>)>,
    /// Per-port peek requirement of each worker (used by the drain pull).
    peeks: BTreeMap<WorkerId, Vec<u64>>,
    /// Per-port pop counts of each worker (used by the drain pull).
    pops: BTreeMap<WorkerId, Vec<u64>>,
}

struct CoreState {
    workers: BTreeMap<WorkerId, Box<dyn Work>>,
    /// Intra-blob channels owned by this core; FIFO order within a round.
    internal: BTreeMap<Token, VecDeque<Item>>,
    initialized: bool,
}

struct Wiring {
    inputs: BTreeMap<Token, Option<Arc<Channel>>>,
    outputs: BTreeMap<Token, Option<Arc<Channel>>>,
}

struct Inner {
    plan: BlobPlan,
    meta: RoundMeta,
    state: AtomicU8,
    draining: AtomicBool,
    init_pumped: AtomicBool,
    callback: Mutex<Option<DrainCallback>>,
    barrier: Barrier,
    decision: Mutex<Decision>,
    wiring: Mutex<Wiring>,
    /// Reader segments: per boundary input, one FIFO per core, refilled by
    /// the leader each round.
    in_segments: BTreeMap<Token, Vec<Mutex<VecDeque<Item>>>>,
    /// Writer segments: per boundary output, one buffer per core, flushed by
    /// the leader in core order.
    out_segments: BTreeMap<Token, Vec<Mutex<Vec<Item>>>>,
    cores: Vec<Mutex<CoreState>>,
}

/// A compiled blob: plan metadata plus the per-core step routines.
pub struct CompiledBlob {
    inner: Arc<Inner>,
    codes: Vec<Arc<CoreHandle>>,
}

struct CoreHandle {
    inner: Arc<Inner>,
    core: usize,
}

impl CoreCode for CoreHandle {
    fn run(&self) -> bool {
        self.inner.round(self.core)
    }
}

const STATE_READY: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_DRAINED: u8 = 3;

fn state_of(v: u8) -> BlobState {
    match v {
        STATE_READY => BlobState::Ready,
        STATE_RUNNING => BlobState::Running,
        STATE_DRAINING => BlobState::Draining,
        _ => BlobState::Drained,
    }
}

impl CompiledBlob {
    /// Build the runtime object for one plan, taking ownership of the worker
    /// logic out of the graph. Core 0 receives the original instances (and
    /// with them any standing state); other cores receive replicas.
    pub fn instantiate(plan: BlobPlan, graph: &mut WorkerGraph) -> Self {
        let core_count = plan.core_firings.len();
        let mut ports = BTreeMap::new();
        let mut peeks = BTreeMap::new();
        let mut pops = BTreeMap::new();
        let mut originals: BTreeMap<WorkerId, Box<dyn Work>> = BTreeMap::new();
        for &w in &plan.workers {
            let node = graph.worker(w);
            ports.insert(w, (node.inputs.clone(), node.outputs.clone()));
            let peek_req: Vec<u64> = (0..node.rates.pop.len())
                .map(|p| {
                    let pop = node.rates.pop[p].fixed().unwrap_or(0);
                    node.rates.peek[p].fixed().unwrap_or(0).max(pop)
                })
                .collect();
            peeks.insert(w, peek_req);
            pops.insert(
                w,
                node.rates.pop.iter().map(|r| r.fixed().unwrap_or(0)).collect::<Vec<u64>>(),
            );
            originals.insert(w, graph.worker_mut(w).take_work());
        }

        let mut pops_per_firing = BTreeMap::new();
        let mut init_pops = BTreeMap::new();
        let mut excess = BTreeMap::new();
        for t in &plan.input_tokens {
            let consumer = graph.channel(*t).and_then(|m| m.consumer).expect("input consumer");
            let pop = pops[&consumer.worker][consumer.port];
            pops_per_firing.insert(*t, plan.internal_schedule[&consumer.worker] * pop);
            init_pops.insert(*t, plan.init_schedule[&consumer.worker] * pop);
            excess.insert(*t, plan.buffers[t].excess_peeks);
        }

        let meta = RoundMeta {
            round_firings: plan.core_firings.iter().map(|f| f * plan.multiplier).collect(),
            pops_per_firing,
            init_pops,
            excess,
            ports,
            peeks,
            pops,
        };

        let mut worker_sets: Vec<BTreeMap<WorkerId, Box<dyn Work>>> = (1..core_count)
            .map(|_| originals.iter().map(|(w, b)| (*w, b.clone_box())).collect())
            .collect();
        worker_sets.insert(0, originals);
        let cores: Vec<Mutex<CoreState>> = worker_sets
            .into_iter()
            .map(|workers| {
                let internal =
                    plan.internal_tokens.iter().map(|t| (*t, VecDeque::new())).collect();
                Mutex::new(CoreState { workers, internal, initialized: false })
            })
            .collect();

        let in_segments = plan
            .input_tokens
            .iter()
            .map(|t| (*t, (0..core_count).map(|_| Mutex::new(VecDeque::new())).collect()))
            .collect();
        let out_segments = plan
            .output_tokens
            .iter()
            .map(|t| (*t, (0..core_count).map(|_| Mutex::new(Vec::new())).collect()))
            .collect();
        let wiring = Wiring {
            inputs: plan.input_tokens.iter().map(|t| (*t, None)).collect(),
            outputs: plan.output_tokens.iter().map(|t| (*t, None)).collect(),
        };

        let inner = Arc::new(Inner {
            meta,
            state: AtomicU8::new(STATE_READY),
            draining: AtomicBool::new(false),
            init_pumped: AtomicBool::new(false),
            callback: Mutex::new(None),
            barrier: Barrier::new(core_count),
            decision: Mutex::new(Decision::Park),
            wiring: Mutex::new(wiring),
            in_segments,
            out_segments,
            cores,
            plan,
        });
        let codes = (0..core_count)
            .map(|core| Arc::new(CoreHandle { inner: Arc::clone(&inner), core }))
            .collect();
        Self { inner, codes }
    }

    pub fn plan(&self) -> &BlobPlan {
        &self.inner.plan
    }
}

impl Blob for CompiledBlob {
    fn id(&self) -> BlobId {
        self.inner.plan.id
    }
    fn workers(&self) -> BTreeSet<WorkerId> {
        self.inner.plan.workers.clone()
    }
    fn input_tokens(&self) -> Vec<Token> {
        self.inner.plan.input_tokens.clone()
    }
    fn output_tokens(&self) -> Vec<Token> {
        self.inner.plan.output_tokens.clone()
    }
    fn wire_input(&self, token: Token, channel: Arc<Channel>) -> Result<(), RuntimeError> {
        self.inner.wire(token, channel, true)
    }
    fn wire_output(&self, token: Token, channel: Arc<Channel>) -> Result<(), RuntimeError> {
        self.inner.wire(token, channel, false)
    }
    fn core_count(&self) -> usize {
        self.codes.len()
    }
    fn core_code(&self, core: CoreId) -> Arc<dyn CoreCode> {
        self.codes[core.as_usize()].clone()
    }
    fn drain(&self, callback: DrainCallback) -> Result<(), RuntimeError> {
        self.inner.request_drain(callback)
    }
    fn is_drained(&self) -> bool {
        self.state() == BlobState::Drained
    }
    fn state(&self) -> BlobState {
        state_of(self.inner.state.load(Ordering::Acquire))
    }
}

// ============================================================================
// Round execution
// ============================================================================

/// Port handle used while assembling a firing's `WorkIo`: either an internal
/// buffer temporarily removed from the core state, or a locked segment.
enum InHandle<'a> {
    Owned(Token, VecDeque<Item>),
    Segment(MutexGuard<'a, VecDeque<Item>>),
}

enum OutHandle<'a> {
    Owned(Token, VecDeque<Item>),
    Segment(MutexGuard<'a, Vec<Item>>),
}

impl Inner {
    fn wire(&self, token: Token, channel: Arc<Channel>, input: bool) -> Result<(), RuntimeError> {
        let blob = self.plan.id;
        let mut wiring = self.wiring.lock();
        let slot = if input {
            wiring.inputs.get_mut(&token)
        } else {
            wiring.outputs.get_mut(&token)
        };
        match slot {
            None => Err(RuntimeError::UnknownBoundary { blob, token }),
            Some(Some(_)) => Err(RuntimeError::AlreadyWired { blob, token }),
            Some(slot @ None) => {
                *slot = Some(channel);
                Ok(())
            }
        }
    }

    fn request_drain(&self, callback: DrainCallback) -> Result<(), RuntimeError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::DrainAlreadyRequested { blob: self.plan.id });
        }
        *self.callback.lock() = Some(callback);
        // Ready/Running -> Draining; a later terminal round moves to Drained.
        let _ = self.state.compare_exchange(
            STATE_READY,
            STATE_DRAINING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_DRAINING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tracing::debug!(blob = %self.plan.id, "drain requested");
        Ok(())
    }

    fn input_channel(&self, token: Token) -> Result<Arc<Channel>, RuntimeError> {
        self.wiring.lock().inputs[&token]
            .clone()
            .ok_or(RuntimeError::NotWired { blob: self.plan.id, token })
    }

    fn output_channel(&self, token: Token) -> Result<Arc<Channel>, RuntimeError> {
        self.wiring.lock().outputs[&token]
            .clone()
            .ok_or(RuntimeError::NotWired { blob: self.plan.id, token })
    }

    fn round(&self, core: usize) -> bool {
        if self.state.load(Ordering::Acquire) == STATE_DRAINED {
            return false;
        }
        if core == 0 {
            let decision = self.leader_prepare();
            *self.decision.lock() = decision;
        }
        self.barrier.wait();
        let decision = *self.decision.lock();
        match decision {
            Decision::Run => self.execute_step(core),
            Decision::Park => {}
            Decision::DrainNow => {
                if core == 0 {
                    self.terminal_drain();
                }
            }
        }
        self.barrier.wait();
        decision != Decision::DrainNow
    }

    /// Leader phase: flush last round's output, then either pump every input
    /// segment for a full round or report why the step cannot run.
    fn leader_prepare(&self) -> Decision {
        self.flush_outputs();
        if self.draining.load(Ordering::Acquire) {
            return Decision::DrainNow;
        }

        let first_round = !self.init_pumped.load(Ordering::Acquire);
        // Per-input total pops for this round, plus per-core shares.
        let mut pump: Vec<(Arc<Channel>, Token, Vec<u64>, u64)> = Vec::new();
        for token in &self.plan.input_tokens {
            let channel = match self.input_channel(*token) {
                Ok(c) => c,
                Err(_) => return Decision::Park,
            };
            let per_firing = self.meta.pops_per_firing[token];
            let mut shares: Vec<u64> =
                self.meta.round_firings.iter().map(|f| f * per_firing).collect();
            if first_round {
                shares[0] += self.meta.init_pops[token];
            }
            let excess = self.meta.excess[token];
            let total: u64 = shares.iter().sum::<u64>() + excess;
            if (channel.len() as u64) < total {
                // Park until the upstream blob (or the host pump) catches up.
                channel.wait_len(total as usize, PUMP_WAIT);
                return Decision::Park;
            }
            pump.push((channel, *token, shares, excess));
        }

        // All inputs can serve a full round; move the data into the reader
        // segments. The excess tail is copied, not consumed, which is what
        // carries the lookahead into the next round.
        for (channel, token, shares, excess) in pump {
            let total_pops: u64 = shares.iter().sum();
            let data = channel
                .take_with_lookahead(total_pops as usize, excess as usize)
                .expect("length checked under the pump");
            let mut offset = 0usize;
            for (core, share) in shares.iter().enumerate() {
                let end = offset + *share as usize + excess as usize;
                let mut segment = self.in_segments[&token][core].lock();
                segment.clear();
                segment.extend(data[offset..end.min(data.len())].iter().copied());
                offset += *share as usize;
            }
        }
        self.init_pumped.store(true, Ordering::Release);
        let _ = self.state.compare_exchange(
            STATE_READY,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Decision::Run
    }

    /// Push every writer segment downstream, core order first, then clear.
    fn flush_outputs(&self) {
        for token in &self.plan.output_tokens {
            let Ok(channel) = self.output_channel(*token) else {
                continue;
            };
            for segment in &self.out_segments[token] {
                let mut seg = segment.lock();
                if !seg.is_empty() {
                    channel.push_many(&seg);
                    seg.clear();
                }
            }
        }
    }

    /// One core's share of the round: init firings once on core 0, then the
    /// assigned blob firings, each a full internal steady state in
    /// topological order.
    fn execute_step(&self, core: usize) {
        let mut cs = self.cores[core].lock();
        if !cs.initialized {
            if core == 0 {
                for &w in &self.plan.topo {
                    for _ in 0..self.plan.init_schedule.get(&w).copied().unwrap_or(0) {
                        self.fire(&mut cs, core, w);
                    }
                }
            }
            cs.initialized = true;
        }
        for _ in 0..self.meta.round_firings[core] {
            for &w in &self.plan.topo {
                for _ in 0..self.plan.internal_schedule[&w] {
                    self.fire(&mut cs, core, w);
                }
            }
        }
    }

    /// Execute one firing of `w` on `core`, routing each port to its internal
    /// buffer or boundary segment.
    fn fire(&self, cs: &mut CoreState, core: usize, w: WorkerId) {
        let (in_tokens, out_tokens) = self.meta.ports[&w].clone();

        let mut in_handles: Vec<InHandle<'_>> = in_tokens
            .iter()
            .map(|t| match cs.internal.remove(t) {
                Some(buf) => InHandle::Owned(*t, buf),
                None => InHandle::Segment(self.in_segments[t][core].lock()),
            })
            .collect();
        let mut out_handles: Vec<OutHandle<'_>> = out_tokens
            .iter()
            .map(|t| match cs.internal.remove(t) {
                Some(buf) => OutHandle::Owned(*t, buf),
                None => OutHandle::Segment(self.out_segments[t][core].lock()),
            })
            .collect();

        {
            let reads: Vec<&mut dyn PortRead> = in_handles
                .iter_mut()
                .map(|h| match h {
                    InHandle::Owned(_, buf) => buf as &mut dyn PortRead,
                    InHandle::Segment(guard) => &mut **guard as &mut dyn PortRead,
                })
                .collect();
            let writes: Vec<&mut dyn PortWrite> = out_handles
                .iter_mut()
                .map(|h| match h {
                    OutHandle::Owned(_, buf) => buf as &mut dyn PortWrite,
                    OutHandle::Segment(guard) => &mut **guard as &mut dyn PortWrite,
                })
                .collect();
            let mut io = WorkIo::new(reads, writes);
            cs.workers.get_mut(&w).expect("worker on its core").work(&mut io);
        }

        for handle in in_handles {
            if let InHandle::Owned(t, buf) = handle {
                cs.internal.insert(t, buf);
            }
        }
        for handle in out_handles {
            if let OutHandle::Owned(t, buf) = handle {
                cs.internal.insert(t, buf);
            }
        }
    }

    /// Terminal sequence: pull-process everything still reachable through the
    /// core-0 instances, flush it downstream, fire the callback once.
    fn terminal_drain(&self) {
        self.flush_outputs();
        let mut cs = self.cores[0].lock();

        // Remaining boundary input comes from the channels alone: reader
        // segments hold only the lookahead copies of items the channel still
        // retains, so taking both would duplicate the tail.
        let mut inputs: BTreeMap<Token, VecDeque<Item>> = BTreeMap::new();
        for token in &self.plan.input_tokens {
            for segment in &self.in_segments[token] {
                segment.lock().clear();
            }
            let leftover: VecDeque<Item> = match self.input_channel(*token) {
                Ok(ch) => ch.drain_all().into(),
                Err(_) => VecDeque::new(),
            };
            inputs.insert(*token, leftover);
        }
        let mut outputs: BTreeMap<Token, Vec<Item>> = self
            .plan
            .output_tokens
            .iter()
            .map(|t| (*t, Vec::new()))
            .collect();

        // Greedy forward passes: fire any worker whose peek requirement is
        // met until nothing fires. On a DAG this flushes exactly what a pull
        // interpreter would.
        loop {
            let mut progress = false;
            for &w in &self.plan.topo {
                while self.drain_can_fire(&cs, &inputs, w) {
                    self.drain_fire(&mut cs, &mut inputs, &mut outputs, w);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        for (token, items) in outputs {
            if items.is_empty() {
                continue;
            }
            if let Ok(ch) = self.output_channel(token) {
                ch.push_many(&items);
            }
        }

        self.state.store(STATE_DRAINED, Ordering::Release);
        if let Some(cb) = self.callback.lock().take() {
            cb();
        }
        tracing::debug!(blob = %self.plan.id, "drained");
    }

    fn drain_can_fire(
        &self,
        cs: &CoreState,
        inputs: &BTreeMap<Token, VecDeque<Item>>,
        w: WorkerId,
    ) -> bool {
        let (in_tokens, _) = &self.meta.ports[&w];
        let peeks = &self.meta.peeks[&w];
        // A firing that consumes nothing makes no drain progress.
        if self.meta.pops[&w].iter().sum::<u64>() == 0 {
            return false;
        }
        in_tokens.iter().enumerate().all(|(port, t)| {
            let available = cs
                .internal
                .get(t)
                .map(|b| b.len())
                .or_else(|| inputs.get(t).map(|b| b.len()))
                .unwrap_or(0);
            available as u64 >= peeks[port]
        })
    }

    fn drain_fire(
        &self,
        cs: &mut CoreState,
        inputs: &mut BTreeMap<Token, VecDeque<Item>>,
        outputs: &mut BTreeMap<Token, Vec<Item>>,
        w: WorkerId,
    ) {
        let (in_tokens, out_tokens) = self.meta.ports[&w].clone();
        let mut in_bufs: Vec<(Token, bool, VecDeque<Item>)> = in_tokens
            .iter()
            .map(|t| match cs.internal.remove(t) {
                Some(b) => (*t, true, b),
                None => (*t, false, inputs.remove(t).unwrap_or_default()),
            })
            .collect();
        let mut out_bufs: Vec<(Token, bool, VecDeque<Item>)> = out_tokens
            .iter()
            .map(|t| match cs.internal.remove(t) {
                Some(b) => (*t, true, b),
                None => (*t, false, VecDeque::new()),
            })
            .collect();
        {
            let reads: Vec<&mut dyn PortRead> =
                in_bufs.iter_mut().map(|(_, _, b)| b as &mut dyn PortRead).collect();
            let writes: Vec<&mut dyn PortWrite> =
                out_bufs.iter_mut().map(|(_, _, b)| b as &mut dyn PortWrite).collect();
            let mut io = WorkIo::new(reads, writes);
            cs.workers.get_mut(&w).expect("worker on core 0").work(&mut io);
        }
        for (t, internal, b) in in_bufs {
            if internal {
                cs.internal.insert(t, b);
            } else {
                inputs.insert(t, b);
            }
        }
        for (t, internal, b) in out_bufs {
            if internal {
                cs.internal.insert(t, b);
            } else {
                outputs.get_mut(&t).expect("output token").extend(b);
            }
        }
    }
}

// ============================================================================
// Stream host
// ============================================================================

/// In-process driver for a set of blobs: wires the boundary channels along
/// the topological order, runs one thread per blob core, and propagates
/// drain from the stream input to the stream output.
pub struct StreamHost {
    blobs: Vec<Arc<dyn Blob>>,
    input: Arc<Channel>,
    output: Arc<Channel>,
    threads: Vec<JoinHandle<()>>,
}

impl StreamHost {
    /// Wire `blobs` (topological order) and start their core threads.
    pub fn start(blobs: Vec<Arc<dyn Blob>>) -> Result<Self, RuntimeError> {
        let input = Arc::new(Channel::new());
        let output = Arc::new(Channel::new());
        let mut edges: BTreeMap<Token, Arc<Channel>> = BTreeMap::new();

        for blob in &blobs {
            for token in blob.input_tokens() {
                let channel = if token.is_overall_input() {
                    input.clone()
                } else {
                    edges.entry(token).or_insert_with(|| Arc::new(Channel::new())).clone()
                };
                blob.wire_input(token, channel)?;
            }
            for token in blob.output_tokens() {
                let channel = if token.is_overall_output() {
                    output.clone()
                } else {
                    edges.entry(token).or_insert_with(|| Arc::new(Channel::new())).clone()
                };
                blob.wire_output(token, channel)?;
            }
        }

        let mut threads = Vec::new();
        for blob in &blobs {
            for core in 0..blob.core_count() {
                let code = blob.core_code(CoreId(core));
                threads.push(std::thread::spawn(move || while code.run() {}));
            }
        }
        tracing::debug!(blobs = blobs.len(), threads = threads.len(), "stream host started");
        Ok(Self { blobs, input, output, threads })
    }

    /// Stream input channel; the caller pushes items here.
    pub fn input(&self) -> &Arc<Channel> {
        &self.input
    }
    /// Stream output channel; results accumulate here.
    pub fn output(&self) -> &Arc<Channel> {
        &self.output
    }

    /// Drain every blob in topological order, waiting for each completion
    /// callback, then join the core threads. Returns the drained output.
    /// Blobs already drained (or draining) by an outside call are waited on
    /// rather than re-drained.
    pub fn drain_and_join(mut self) -> Result<Vec<Item>, RuntimeError> {
        for blob in &self.blobs {
            let (tx, rx) = mpsc::channel::<()>();
            match blob.drain(Box::new(move || {
                let _ = tx.send(());
            })) {
                Ok(()) => rx.recv().expect("drain callback fires"),
                Err(RuntimeError::DrainAlreadyRequested { .. }) => {
                    while !blob.is_drained() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                Err(other) => return Err(other),
            }
            debug_assert!(blob.is_drained());
        }
        for t in self.threads.drain(..) {
            t.join().expect("core thread exits cleanly");
        }
        Ok(self.output.drain_all())
    }
}

// ============================================================================
// Instantiation helper
// ============================================================================

/// Instantiate every plan of a compiled stream, in topological order.
pub fn instantiate_stream(plan: StreamPlan, graph: &mut WorkerGraph) -> Vec<Arc<dyn Blob>> {
    plan.plans
        .into_iter()
        .map(|p| Arc::new(CompiledBlob::instantiate(p, graph)) as Arc<dyn Blob>)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::config::single_machine;
    use crate::graph::{StreamElement, WorkerDecl};
    use crate::workers::Identity;

    fn identity() -> StreamElement {
        StreamElement::Worker(WorkerDecl::filter("Identity", Box::new(Identity)))
    }

    fn compiled_identity_pair() -> (Vec<Arc<dyn Blob>>, WorkerGraph) {
        let graph = StreamElement::pipeline("main", vec![identity(), identity()])
            .lower()
            .unwrap();
        let plan = compile(&graph, &single_machine(2, 1)).unwrap();
        let mut graph = graph;
        let blobs = instantiate_stream(plan, &mut graph);
        (blobs, graph)
    }

    #[test]
    fn identity_stream_round_trips() {
        let (blobs, _graph) = compiled_identity_pair();
        let host = StreamHost::start(blobs).unwrap();
        host.input().push_many(&[1, 2, 3]);
        let out = host.drain_and_join().unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn blob_state_machine_and_drain_misuse() {
        let (blobs, _graph) = compiled_identity_pair();
        let blob = blobs[0].clone();
        assert_eq!(blob.state(), BlobState::Ready);
        let host = StreamHost::start(blobs).unwrap();
        host.input().push_many(&[7]);
        let out = host.drain_and_join().unwrap();
        assert_eq!(out, vec![7]);
        assert!(blob.is_drained());
        // A drained blob refuses a second drain request.
        let err = blob.drain(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, RuntimeError::DrainAlreadyRequested { .. }));
    }

    #[test]
    fn wire_rejects_unknown_and_double_wiring() {
        let graph = StreamElement::pipeline("main", vec![identity()]).lower().unwrap();
        let plan = compile(&graph, &single_machine(1, 1)).unwrap();
        let mut graph = graph;
        let plans: Vec<BlobPlan> = plan.plans.into_iter().collect();
        let blob = CompiledBlob::instantiate(plans.into_iter().next().unwrap(), &mut graph);
        let t = Token::overall_input(WorkerId(0));
        blob.wire_input(t, Arc::new(Channel::new())).unwrap();
        assert!(matches!(
            blob.wire_input(t, Arc::new(Channel::new())),
            Err(RuntimeError::AlreadyWired { .. })
        ));
        assert!(matches!(
            blob.wire_input(Token::overall_output(WorkerId(0)), Arc::new(Channel::new())),
            Err(RuntimeError::UnknownBoundary { .. })
        ));
    }

    #[test]
    fn multiplier_amortizes_rounds_without_changing_output() {
        let graph = StreamElement::pipeline("main", vec![identity(), identity()])
            .lower()
            .unwrap();
        let plan = compile(&graph, &single_machine(2, 4)).unwrap();
        let mut graph = graph;
        let blobs = instantiate_stream(plan, &mut graph);
        let host = StreamHost::start(blobs).unwrap();
        let items: Vec<Item> = (0..13).collect();
        host.input().push_many(&items);
        let out = host.drain_and_join().unwrap();
        assert_eq!(out, items);
    }
}
