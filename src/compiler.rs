//! Compilation back-end
//!
//! Turns a validated worker graph plus a tuning configuration into per-blob
//! execution plans. For each blob:
//!
//! 1. **Rate legality.** Every pop/peek rate inside the blob is fixed; the
//!    only dynamic rate tolerated anywhere is the push of the worker feeding
//!    the overall output.
//! 2. **Message legality.** A message constraint whose sender and recipient
//!    sit in different blobs cannot be honored by independent per-blob
//!    steady states and is rejected.
//! 3. **Internal schedule.** The balance solver over intra-blob channels
//!    yields the per-worker firing counts of one blob execution.
//! 4. **External schedule.** The same solver over the blob DAG, with each
//!    boundary channel's rates aggregated by the internal multiplicities of
//!    its endpoints, yields the per-blob firing counts of one stream steady
//!    state.
//! 5. **Buffer sizing.** Per boundary channel: `excessPeeks = max(peek -
//!    pop, 0)`, `capacity = execs(d) · M_ext · multiplier · pop +
//!    excessPeeks`, preloaded to capacity; the overall output is sized from
//!    the producer side and starts empty.
//! 6. **Init schedule.** Minimal pre-firings that leave every internal
//!    channel holding its standing lookahead before the first steady state.
//! 7. **Core assignment.** `M_ext` firings split as evenly as the remainder
//!    allows across the blob's core slots; blobs whose execution carries
//!    state between firings keep everything on core 0.
//!
//! All failures here are fatal and carry the offending workers or tokens.
//! The plan deliberately stops at "per-core firing counts plus buffer
//! metadata": fusing a blob's firing loop into specialized code is a
//! back-end detail behind the same plan shape.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::blob_graph::{BlobGraph, CyclicBlobsError};
use crate::config::{names, Configuration};
use crate::graph::{BlobId, GraphError, MachineId, Rate, Token, WorkerGraph, WorkerId};
use crate::partition::{partition, PartitionError};
use crate::schedule::{self, SchedChannel, UnschedulableError};
use crate::validate::{validate_graph, InvalidGraphError};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum UnsupportedConstruct {
    #[error("dynamic rate on internal port {port} of worker {worker}")]
    DynamicInternalRate { worker: WorkerId, port: usize },
    #[error("message constraint crosses a blob boundary ({sender} -> {recipient})")]
    CrossBlobMessage { sender: WorkerId, recipient: WorkerId },
    #[error("the distributed back-end is not available (noOfMachines={0})")]
    DistributedBackend(i64),
}

/// Top-level compile failure, aggregating every fatal cause.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    InvalidGraph(#[from] InvalidGraphError),
    #[error(transparent)]
    Structure(#[from] GraphError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    CyclicBlobs(#[from] CyclicBlobsError),
    #[error(transparent)]
    Unschedulable(#[from] UnschedulableError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedConstruct),
}

// ============================================================================
// Plan types
// ============================================================================

/// Sizing of one boundary buffer.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct BufferData {
    pub token: Token,
    /// Items per steady-state round; `None` when the overall-output push is
    /// dynamic and the buffer must grow on demand.
    pub capacity: Option<u64>,
    /// Items preloaded before the first round (zero for the overall output).
    pub initial_size: u64,
    /// Standing lookahead retained across rounds.
    pub excess_peeks: u64,
    /// Name of the buffer on the consuming side; absent for the overall
    /// output, which has no reader.
    pub reader_buffer: Option<String>,
    /// Name of the buffer on the producing side; absent for the overall
    /// input, which has no writer.
    pub writer_buffer: Option<String>,
}

/// Execution plan of one blob.
#[derive(Debug)]
pub struct BlobPlan {
    pub id: BlobId,
    pub machine: MachineId,
    /// Process-unique namespace for this blob's generated artifacts.
    pub namespace: String,
    pub workers: BTreeSet<WorkerId>,
    /// Intra-blob topological firing order.
    pub topo: Vec<WorkerId>,
    pub internal_tokens: Vec<Token>,
    pub input_tokens: Vec<Token>,
    pub output_tokens: Vec<Token>,
    /// Per-worker firings in one blob execution.
    pub internal_schedule: BTreeMap<WorkerId, u64>,
    /// Blob executions per stream steady state.
    pub external_multiplicity: u64,
    /// Steady-state replication factor shared by the whole stream.
    pub multiplier: u64,
    /// Pre-firings establishing the standing lookahead.
    pub init_schedule: BTreeMap<WorkerId, u64>,
    /// Standing prefix per internal channel once init completes.
    pub init_fills: BTreeMap<Token, u64>,
    /// Boundary buffer sizing, keyed by token (inputs and outputs).
    pub buffers: BTreeMap<Token, BufferData>,
    /// Blob executions per steady state assigned to each core slot; sums to
    /// `external_multiplicity`.
    pub core_firings: Vec<u64>,
}

impl BlobPlan {
    /// Items one core round pops from a boundary input per assigned firing.
    pub fn pops_per_firing(&self, graph: &WorkerGraph, token: Token) -> u64 {
        let ep = graph.channel(token).and_then(|m| m.consumer).expect("input token");
        let pop = fixed_rate(graph, ep.worker, |r| r.pop[ep.port]);
        self.internal_schedule[&ep.worker] * pop
    }
}

/// The whole compiled stream: one plan per blob, in topological order.
#[derive(Debug)]
pub struct StreamPlan {
    pub plans: Vec<BlobPlan>,
    /// Blob ids in execution (topological) order.
    pub topo: Vec<BlobId>,
    pub multiplier: u64,
}

impl StreamPlan {
    pub fn plan(&self, id: BlobId) -> &BlobPlan {
        self.plans.iter().find(|p| p.id == id).expect("plan per blob")
    }
}

// ============================================================================
// Namespace counter
// ============================================================================

/// Process-wide counter handing out unique blob namespaces.
static NAMESPACE_SEQ: AtomicU64 = AtomicU64::new(0);

fn fresh_namespace() -> String {
    format!("blobns{}", NAMESPACE_SEQ.fetch_add(1, Ordering::Relaxed))
}

// ============================================================================
// Compilation
// ============================================================================

fn fixed_rate(graph: &WorkerGraph, w: WorkerId, f: impl Fn(&crate::graph::WorkerRates) -> Rate) -> u64 {
    f(&graph.worker(w).rates).fixed().expect("rate legality was checked")
}

/// Compile `graph` under `cfg` into per-blob plans.
pub fn compile(graph: &WorkerGraph, cfg: &Configuration) -> Result<StreamPlan, CompileError> {
    if let Some(n) = cfg.int_value(names::NO_OF_MACHINES) {
        if n > 1 {
            return Err(UnsupportedConstruct::DistributedBackend(n).into());
        }
    }

    validate_graph(graph)?;
    let partitioning = partition(graph, cfg)?;
    let blob_graph = BlobGraph::build(graph, &partitioning)?;
    let multiplier = cfg.multiplier();

    // Message constraints must stay inside one blob.
    for c in graph.constraints() {
        if blob_graph.blob_of(c.sender) != blob_graph.blob_of(c.recipient) {
            return Err(UnsupportedConstruct::CrossBlobMessage {
                sender: c.sender,
                recipient: c.recipient,
            }
            .into());
        }
    }

    // Internal schedules, blob by blob.
    let mut internals: BTreeMap<BlobId, BTreeMap<WorkerId, u64>> = BTreeMap::new();
    let mut topos: BTreeMap<BlobId, Vec<WorkerId>> = BTreeMap::new();
    for blob in blob_graph.blobs() {
        check_rate_legality(graph, &blob.workers)?;
        let members: Vec<WorkerId> = blob.workers.iter().copied().collect();
        let topo = graph.topo_order_of(&members);
        let channels = internal_channels(graph, &blob.workers);
        let m = schedule::solve(&topo, &channels)?;
        debug_assert!(schedule::balanced(&channels, &m));
        internals.insert(blob.id, m);
        topos.insert(blob.id, topo);
    }

    // External schedule over the blob DAG, with rates aggregated by the
    // internal multiplicities of the endpoints.
    let blob_ids: Vec<BlobId> = blob_graph.topo().to_vec();
    let external_channels: Vec<SchedChannel<BlobId>> = blob_graph
        .boundary_tokens()
        .into_iter()
        .map(|t| {
            let (p, c) = (t.producer().expect("boundary"), t.consumer().expect("boundary"));
            let (pb, cb) = (blob_graph.blob_of(p), blob_graph.blob_of(c));
            let meta = graph.channel(t).expect("token is mapped");
            let push = fixed_rate(graph, p, |r| r.push[meta.producer.expect("producer").port]);
            let pop = fixed_rate(graph, c, |r| r.pop[meta.consumer.expect("consumer").port]);
            SchedChannel::balance(pb, cb, push * internals[&pb][&p], pop * internals[&cb][&c])
        })
        .collect();
    let external = schedule::solve(&blob_ids, &external_channels)?;
    tracing::debug!(blobs = blob_ids.len(), ?external, "external schedule solved");

    // Buffer sizing per boundary token, computed once with both endpoints'
    // plans in scope.
    let namespaces: BTreeMap<BlobId, String> =
        blob_ids.iter().map(|b| (*b, fresh_namespace())).collect();
    let mut buffers: BTreeMap<Token, BufferData> = BTreeMap::new();
    for (token, meta) in graph.channels() {
        let producer_blob = meta.producer.map(|ep| blob_graph.blob_of(ep.worker));
        let consumer_blob = meta.consumer.map(|ep| blob_graph.blob_of(ep.worker));
        if producer_blob == consumer_blob {
            continue; // intra-blob; handled by the per-core buffers
        }
        let data = match (meta.producer, meta.consumer) {
            (producer, Some(dep)) => {
                // Consumer-side sizing, which covers the overall input too.
                let cb = consumer_blob.expect("consumer endpoint");
                let pop = fixed_rate(graph, dep.worker, |r| r.pop[dep.port]);
                let peek = fixed_rate(graph, dep.worker, |r| r.peek[dep.port]);
                let excess = peek.saturating_sub(pop);
                let capacity =
                    internals[&cb][&dep.worker] * external[&cb] * multiplier * pop + excess;
                BufferData {
                    token: *token,
                    capacity: Some(capacity),
                    initial_size: capacity,
                    excess_peeks: excess,
                    reader_buffer: Some(format!("{}.in{}", namespaces[&cb], dep.port)),
                    writer_buffer: producer.map(|pep| {
                        let pb = producer_blob.expect("producer endpoint");
                        format!("{}.out{}", namespaces[&pb], pep.port)
                    }),
                }
            }
            (Some(pep), None) => {
                // Overall output: producer-side sizing, empty start.
                let pb = producer_blob.expect("producer endpoint");
                let push = graph.worker(pep.worker).rates.push[pep.port];
                let capacity = push
                    .fixed()
                    .map(|q| internals[&pb][&pep.worker] * external[&pb] * multiplier * q);
                BufferData {
                    token: *token,
                    capacity,
                    initial_size: 0,
                    excess_peeks: 0,
                    reader_buffer: None,
                    writer_buffer: Some(format!("{}.out{}", namespaces[&pb], pep.port)),
                }
            }
            (None, None) => unreachable!("tokens have at least one endpoint"),
        };
        buffers.insert(*token, data);
    }

    // Assemble per-blob plans.
    let mut plans = Vec::with_capacity(blob_ids.len());
    for blob in blob_graph.blobs() {
        let topo = topos.remove(&blob.id).expect("topo per blob");
        let internal_schedule = internals.remove(&blob.id).expect("schedule per blob");
        let internal = internal_channels(graph, &blob.workers);
        let init_schedule = schedule::init_schedule(&topo, &internal)?;
        let init_fills: BTreeMap<Token, u64> = schedule::init_fills(&internal, &init_schedule)
            .into_iter()
            .map(|((p, c), fill)| (Token::internal(p, c), fill))
            .collect();
        let (input_tokens, output_tokens) = blob_graph.io_of(graph, blob.id);
        let blob_buffers: BTreeMap<Token, BufferData> = input_tokens
            .iter()
            .chain(output_tokens.iter())
            .map(|t| (*t, buffers[t].clone()))
            .collect();

        let pinned = blob.workers.iter().any(|w| graph.worker(*w).is_stateful())
            || init_fills.values().any(|f| *f > 0);
        let core_firings = assign_cores(external[&blob.id], blob.cores, pinned);
        debug_assert_eq!(core_firings.iter().sum::<u64>(), external[&blob.id]);

        plans.push(BlobPlan {
            id: blob.id,
            machine: blob.machine,
            namespace: namespaces[&blob.id].clone(),
            workers: blob.workers.clone(),
            internal_tokens: internal.iter().map(|c| Token::internal(c.producer, c.consumer)).collect(),
            input_tokens,
            output_tokens,
            topo,
            internal_schedule,
            external_multiplicity: external[&blob.id],
            multiplier,
            init_schedule,
            init_fills,
            buffers: blob_buffers,
            core_firings,
        });
    }
    // Emit plans in topological order so instantiation can wire left to right.
    plans.sort_by_key(|p| blob_ids.iter().position(|b| *b == p.id).expect("blob in topo"));

    tracing::info!(
        blobs = plans.len(),
        multiplier,
        "stream compiled"
    );
    Ok(StreamPlan { plans, topo: blob_ids, multiplier })
}

/// Pop/peek must be fixed on every port; push must be fixed everywhere except
/// the overall output.
fn check_rate_legality(
    graph: &WorkerGraph,
    workers: &BTreeSet<WorkerId>,
) -> Result<(), UnsupportedConstruct> {
    for &w in workers {
        let node = graph.worker(w);
        for port in 0..node.rates.pop.len() {
            if node.rates.pop[port].is_dynamic() || node.rates.peek[port].is_dynamic() {
                return Err(UnsupportedConstruct::DynamicInternalRate { worker: w, port });
            }
        }
        for (port, rate) in node.rates.push.iter().enumerate() {
            if rate.is_dynamic() && !node.outputs[port].is_overall_output() {
                return Err(UnsupportedConstruct::DynamicInternalRate { worker: w, port });
            }
        }
    }
    Ok(())
}

/// Balance channels for the edges with both endpoints inside `workers`,
/// carrying the consumer's excess peeks for the init solver.
fn internal_channels(
    graph: &WorkerGraph,
    workers: &BTreeSet<WorkerId>,
) -> Vec<SchedChannel<WorkerId>> {
    graph
        .channels()
        .values()
        .filter_map(|meta| {
            let (pep, cep) = (meta.producer?, meta.consumer?);
            if !workers.contains(&pep.worker) || !workers.contains(&cep.worker) {
                return None;
            }
            let push = fixed_rate(graph, pep.worker, |r| r.push[pep.port]);
            let pop = fixed_rate(graph, cep.worker, |r| r.pop[cep.port]);
            let peek = fixed_rate(graph, cep.worker, |r| r.peek[cep.port]);
            let mut ch = SchedChannel::balance(pep.worker, cep.worker, push, pop);
            ch.excess_peeks = peek.saturating_sub(pop);
            Some(ch)
        })
        .collect()
}

/// Distribute `m` firings over `cores` slots: `floor(m/cores)` each, the
/// remainder to the first slots. Pinned blobs put everything on core 0.
fn assign_cores(m: u64, cores: usize, pinned: bool) -> Vec<u64> {
    let cores = cores.max(1);
    if pinned || cores == 1 {
        let mut v = vec![0; cores];
        v[0] = m;
        return v;
    }
    let base = m / cores as u64;
    let remainder = (m % cores as u64) as usize;
    (0..cores).map(|i| base + u64::from(i < remainder)).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::single_machine;
    use crate::graph::{MessageConstraint, StreamElement, WorkerDecl, WorkerRates};
    use crate::workers::{Compressor, Expander, Identity, MovingSum, Work, WorkIo};

    fn identity() -> StreamElement {
        StreamElement::Worker(WorkerDecl::filter("Identity", Box::new(Identity)))
    }

    fn pipeline(children: Vec<StreamElement>) -> WorkerGraph {
        StreamElement::pipeline("main", children).lower().unwrap()
    }

    #[test]
    fn identity_pipeline_single_blob() {
        let g = pipeline(vec![identity(), identity()]);
        let plan = compile(&g, &single_machine(2, 3)).unwrap();
        assert_eq!(plan.plans.len(), 1);
        let b = &plan.plans[0];
        assert_eq!(b.internal_schedule[&WorkerId(0)], 1);
        assert_eq!(b.internal_schedule[&WorkerId(1)], 1);
        assert_eq!(b.external_multiplicity, 1);
        let input = &b.buffers[&Token::overall_input(WorkerId(0))];
        // capacity = 1 · 1 · multiplier · pop
        assert_eq!(input.capacity, Some(3));
        assert_eq!(input.initial_size, 3);
        assert_eq!(input.excess_peeks, 0);
        assert!(input.writer_buffer.is_none());
        let output = &b.buffers[&Token::overall_output(WorkerId(1))];
        assert_eq!(output.initial_size, 0);
        assert!(output.reader_buffer.is_none());
    }

    #[test]
    fn compressor_expander_schedule() {
        let g = pipeline(vec![
            StreamElement::Worker(WorkerDecl::filter("Comp", Box::new(Compressor::new(2)))),
            StreamElement::Worker(WorkerDecl::filter("Exp", Box::new(Expander::new(2)))),
        ]);
        let plan = compile(&g, &single_machine(2, 1)).unwrap();
        let b = &plan.plans[0];
        // Compressor pushes 1 per firing and the expander pops 1, so the
        // internal schedule is already balanced at one firing each.
        assert_eq!(b.internal_schedule[&WorkerId(0)], 1);
        assert_eq!(b.internal_schedule[&WorkerId(1)], 1);
        let input = &b.buffers[&Token::overall_input(WorkerId(0))];
        assert_eq!(input.capacity, Some(2)); // compressor pops 2
    }

    #[test]
    fn moving_sum_buffers_carry_excess() {
        let g = pipeline(vec![
            StreamElement::Worker(WorkerDecl::filter("Sum", Box::new(MovingSum::new(3)))),
            identity(),
        ]);
        let plan = compile(&g, &single_machine(2, 1)).unwrap();
        let b = &plan.plans[0];
        let input = &b.buffers[&Token::overall_input(WorkerId(0))];
        assert_eq!(input.excess_peeks, 2);
        assert_eq!(input.capacity, Some(3)); // 1·1·1·1 + 2
        assert_eq!(input.initial_size, input.capacity.unwrap());
    }

    #[test]
    fn internal_excess_produces_init_firings() {
        let g = pipeline(vec![
            identity(),
            StreamElement::Worker(WorkerDecl::filter("Sum", Box::new(MovingSum::new(4)))),
        ]);
        let plan = compile(&g, &single_machine(2, 1)).unwrap();
        let b = &plan.plans[0];
        assert_eq!(b.init_schedule[&WorkerId(0)], 3);
        assert_eq!(b.init_fills[&Token::internal(WorkerId(0), WorkerId(1))], 3);
        // Standing lookahead pins the blob to core 0.
        assert_eq!(b.core_firings[0], b.external_multiplicity);
    }

    #[test]
    fn split_machines_solve_external_schedule() {
        let cfg = single_machine(3, 1)
            .replaced_int(&names::worker_to_machine(WorkerId(1)), 1)
            .unwrap();
        // Build an uneven-rate chain: comp(2) | id on another machine | exp(2).
        let g = pipeline(vec![
            StreamElement::Worker(WorkerDecl::filter("Comp", Box::new(Compressor::new(2)))),
            identity(),
            StreamElement::Worker(WorkerDecl::filter("Exp", Box::new(Expander::new(2)))),
        ]);
        let plan = compile(&g, &cfg).unwrap();
        assert_eq!(plan.plans.len(), 3);
        // Each blob fires once per steady state: rates already balance 1:1:1.
        for p in &plan.plans {
            assert_eq!(p.external_multiplicity, 1);
        }
        // Plans come out in topological order.
        let firsts: Vec<WorkerId> =
            plan.plans.iter().map(|p| *p.workers.iter().next().unwrap()).collect();
        assert_eq!(firsts, vec![WorkerId(0), WorkerId(1), WorkerId(2)]);
    }

    #[test]
    fn cross_blob_message_is_rejected() {
        let mut g = pipeline(vec![identity(), identity()]);
        g.add_constraint(MessageConstraint {
            sender: WorkerId(0),
            recipient: WorkerId(1),
            latency: 1,
        });
        let cfg = single_machine(2, 1)
            .replaced_int(&names::worker_to_machine(WorkerId(1)), 1)
            .unwrap();
        let err = compile(&g, &cfg).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Unsupported(UnsupportedConstruct::CrossBlobMessage { .. })
        ));
    }

    #[test]
    fn dynamic_internal_rate_is_rejected() {
        #[derive(Clone)]
        struct DynPush;
        impl Work for DynPush {
            fn work(&mut self, io: &mut WorkIo<'_>) {
                let v = io.pop(0);
                io.push(0, v);
            }
            fn rates(&self, _ins: usize, _outs: usize) -> WorkerRates {
                WorkerRates {
                    pop: vec![Rate::Fixed(1)],
                    peek: vec![Rate::Fixed(1)],
                    push: vec![Rate::Dynamic],
                }
            }
            fn clone_box(&self) -> Box<dyn Work> {
                Box::new(self.clone())
            }
        }
        // Dynamic push mid-pipeline: rejected.
        let g = pipeline(vec![
            StreamElement::Worker(WorkerDecl::filter("Dyn", Box::new(DynPush))),
            identity(),
        ]);
        let err = compile(&g, &single_machine(2, 1)).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Unsupported(UnsupportedConstruct::DynamicInternalRate { .. })
        ));

        // Dynamic push on the overall output: allowed, capacity open.
        let g = pipeline(vec![
            identity(),
            StreamElement::Worker(WorkerDecl::filter("Dyn", Box::new(DynPush))),
        ]);
        let plan = compile(&g, &single_machine(2, 1)).unwrap();
        let out = &plan.plans[0].buffers[&Token::overall_output(WorkerId(1))];
        assert_eq!(out.capacity, None);
    }

    #[test]
    fn core_assignment_conserves_firings() {
        assert_eq!(assign_cores(7, 3, false), vec![3, 2, 2]);
        assert_eq!(assign_cores(2, 4, false), vec![1, 1, 0, 0]);
        assert_eq!(assign_cores(7, 3, true), vec![7, 0, 0]);
        for (m, cores) in [(1u64, 1usize), (5, 2), (12, 5), (3, 8)] {
            let v = assign_cores(m, cores, false);
            assert_eq!(v.iter().sum::<u64>(), m);
            assert_eq!(v.len(), cores);
        }
    }

    #[test]
    fn distributed_backend_is_reported_unsupported() {
        let g = pipeline(vec![identity()]);
        let cfg = Configuration::builder()
            .add_int(names::NO_OF_MACHINES, 1, 64, 4)
            .unwrap()
            .build();
        let err = compile(&g, &cfg).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Unsupported(UnsupportedConstruct::DistributedBackend(4))
        ));
    }
}
