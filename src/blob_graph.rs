//! Blob DAG
//!
//! Nodes are the blob slots produced by the partitioner; edges are inherited
//! from worker channels whose endpoints landed in different blobs. The graph
//! must be acyclic: a cycle means the assignment asks two blobs to wait on
//! each other's steady states, which can never make progress. Cycle detection
//! runs at construction; the offending assignment is dumped alongside the
//! error so a bad tuning round can be reproduced.
//!
//! The topological order computed here is reused for the external schedule,
//! for boundary wiring, and for drain propagation.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::graph::{BlobId, BoundarySide, MachineId, Token, WorkerGraph, WorkerId};
use crate::partition::Partitioning;

/// One blob slot with its stream-local identity.
#[derive(Clone, Debug)]
pub struct BlobNode {
    pub id: BlobId,
    pub machine: MachineId,
    pub workers: BTreeSet<WorkerId>,
    pub cores: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("cycles found in the worker->blob assignment:\n{dump}")]
pub struct CyclicBlobsError {
    pub dump: String,
}

/// Topologically ordered DAG of blobs.
#[derive(Debug)]
pub struct BlobGraph {
    blobs: Vec<BlobNode>,
    membership: BTreeMap<WorkerId, BlobId>,
    dag: DiGraph<BlobId, Token>,
    topo: Vec<BlobId>,
}

impl BlobGraph {
    pub fn build(graph: &WorkerGraph, partitioning: &Partitioning) -> Result<Self, CyclicBlobsError> {
        let mut blobs = Vec::new();
        let mut membership = BTreeMap::new();
        let mut dag: DiGraph<BlobId, Token> = DiGraph::new();
        let mut node_of: Vec<NodeIndex> = Vec::new();

        for spec in partitioning.blobs() {
            let id = BlobId(blobs.len());
            for w in &spec.workers {
                membership.insert(*w, id);
            }
            node_of.push(dag.add_node(id));
            blobs.push(BlobNode {
                id,
                machine: spec.machine,
                workers: spec.workers.clone(),
                cores: spec.cores,
            });
        }

        for (token, _) in graph.channels() {
            let (Some(p), Some(c)) = (token.producer(), token.consumer()) else {
                continue;
            };
            let (from, to) = (membership[&p], membership[&c]);
            if from != to {
                dag.add_edge(node_of[from.0], node_of[to.0], *token);
            }
        }

        let topo = match toposort(&dag, None) {
            Ok(order) => order.into_iter().map(|ix| dag[ix]).collect(),
            Err(_) => {
                let dump = partitioning.dump();
                tracing::error!(%dump, "blob assignment contains a cycle");
                return Err(CyclicBlobsError { dump });
            }
        };

        Ok(Self { blobs, membership, dag, topo })
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn blobs(&self) -> &[BlobNode] {
        &self.blobs
    }
    pub fn blob(&self, id: BlobId) -> &BlobNode {
        &self.blobs[id.0]
    }
    pub fn blob_of(&self, w: WorkerId) -> BlobId {
        self.membership[&w]
    }

    /// Blob ids in topological order.
    pub fn topo(&self) -> &[BlobId] {
        &self.topo
    }

    /// Worker-graph tokens that cross a blob boundary (excluding the overall
    /// input/output of the stream).
    pub fn boundary_tokens(&self) -> Vec<Token> {
        self.dag.edge_weights().copied().collect()
    }

    /// Tokens entering and leaving `blob`, including the stream boundary
    /// tokens when the overall source or sink lives inside it.
    pub fn io_of(&self, graph: &WorkerGraph, blob: BlobId) -> (Vec<Token>, Vec<Token>) {
        let inside = &self.blob(blob).workers;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for token in graph.channels().keys() {
            let info = graph.io_info(*token, inside);
            if !info.crosses_boundary {
                continue;
            }
            match info.side {
                BoundarySide::Input => inputs.push(*token),
                BoundarySide::Output => outputs.push(*token),
            }
        }
        (inputs, outputs)
    }
}

// ============================================================================
// Tests
// ============================================================================
