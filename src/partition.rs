//! Worker→machine partitioning
//!
//! Reads the per-worker machine assignment out of a [`Configuration`], groups
//! workers by machine, and splits each machine's group into weakly connected
//! worker sets by BFS over intra-machine edges. Each connected set becomes
//! one blob slot. An explicit `PARTITION` parameter short-circuits the
//! grouping and is validated against the same invariants: every worker in
//! exactly one blob, every blob connected inside its machine.
//!
//! On failure the offending assignment is dumped in a human-readable form so
//! a bad tuning round can be diagnosed offline.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::config::{names, Configuration};
use crate::graph::{MachineId, WorkerGraph, WorkerId};

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("explicit partition does not place worker {0}")]
    MissingWorker(WorkerId),
    #[error("worker {0} is placed in more than one blob")]
    OverlappingBlobs(WorkerId),
    #[error("blob {workers:?} on machine {machine} is not connected inside the machine")]
    DisconnectedBlob { machine: MachineId, workers: BTreeSet<WorkerId> },
    #[error("explicit partition places unknown worker {0}")]
    UnknownWorker(WorkerId),
}

/// One blob slot: a connected worker set pinned to a machine, with the core
/// count granted to it.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BlobSpec {
    pub machine: MachineId,
    pub workers: BTreeSet<WorkerId>,
    pub cores: usize,
}

/// The partitioning result: per machine, the ordered list of blob slots.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct Partitioning {
    pub machines: BTreeMap<MachineId, Vec<BlobSpec>>,
}

impl Partitioning {
    pub fn blobs(&self) -> impl Iterator<Item = &BlobSpec> {
        self.machines.values().flatten()
    }

    pub fn worker_count(&self) -> usize {
        self.blobs().map(|b| b.workers.len()).sum()
    }

    /// Human-readable dump of the assignment, for failure diagnostics.
    pub fn dump(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// Split `graph` into blobs according to `cfg`.
pub fn partition(graph: &WorkerGraph, cfg: &Configuration) -> Result<Partitioning, PartitionError> {
    let cores = cfg.int_value(names::MAX_NUM_CORES).unwrap_or(1).max(1) as usize;
    let result = match cfg.partition_parameter(names::PARTITION) {
        Some(explicit) => from_explicit(graph, &explicit.machines, cores)?,
        None => from_assignment(graph, cfg, cores),
    };
    tracing::debug!(
        machines = result.machines.len(),
        blobs = result.blobs().count(),
        "partitioned worker graph"
    );
    Ok(result)
}

fn from_assignment(graph: &WorkerGraph, cfg: &Configuration, cores: usize) -> Partitioning {
    let mut by_machine: BTreeMap<MachineId, BTreeSet<WorkerId>> = BTreeMap::new();
    for id in graph.ids() {
        by_machine.entry(cfg.machine_of(id)).or_default().insert(id);
    }

    let mut machines = BTreeMap::new();
    for (machine, mut unassigned) in by_machine {
        let mut slots = Vec::new();
        // BFS over intra-machine successor and predecessor edges; one
        // connected set per blob slot, in ascending seed order.
        while let Some(&seed) = unassigned.iter().next() {
            let mut set = BTreeSet::new();
            let mut queue = VecDeque::from([seed]);
            unassigned.remove(&seed);
            set.insert(seed);
            while let Some(w) = queue.pop_front() {
                let neighbours = graph.predecessors(w).chain(graph.successors(w));
                for n in neighbours {
                    if unassigned.remove(&n) {
                        set.insert(n);
                        queue.push_back(n);
                    }
                }
            }
            slots.push(BlobSpec { machine, workers: set, cores });
        }
        machines.insert(machine, slots);
    }
    Partitioning { machines }
}

fn from_explicit(
    graph: &WorkerGraph,
    machines: &[Vec<BTreeSet<WorkerId>>],
    cores: usize,
) -> Result<Partitioning, PartitionError> {
    let known: BTreeSet<WorkerId> = graph.ids().collect();
    let mut seen: BTreeSet<WorkerId> = BTreeSet::new();
    let mut out = BTreeMap::new();
    for (m, blobs) in machines.iter().enumerate() {
        let machine = MachineId(m);
        let mut slots = Vec::new();
        for workers in blobs {
            for w in workers {
                if !known.contains(w) {
                    return Err(PartitionError::UnknownWorker(*w));
                }
                if !seen.insert(*w) {
                    return Err(PartitionError::OverlappingBlobs(*w));
                }
            }
            if !is_connected(graph, workers) {
                return Err(PartitionError::DisconnectedBlob {
                    machine,
                    workers: workers.clone(),
                });
            }
            slots.push(BlobSpec { machine, workers: workers.clone(), cores });
        }
        out.insert(machine, slots);
    }
    if let Some(missing) = known.difference(&seen).next() {
        return Err(PartitionError::MissingWorker(*missing));
    }
    Ok(Partitioning { machines: out })
}

/// Weak connectivity of `set` through edges with both endpoints in the set.
fn is_connected(graph: &WorkerGraph, set: &BTreeSet<WorkerId>) -> bool {
    let Some(&seed) = set.iter().next() else {
        return false;
    };
    let mut visited = BTreeSet::from([seed]);
    let mut queue = VecDeque::from([seed]);
    while let Some(w) = queue.pop_front() {
        let neighbours = graph.predecessors(w).chain(graph.successors(w));
        for n in neighbours {
            if set.contains(&n) && visited.insert(n) {
                queue.push_back(n);
            }
        }
    }
    visited.len() == set.len()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{names, Configuration, Parameter, PartitionParameter};
    use crate::graph::{StreamElement, WorkerDecl};
    use crate::workers::Identity;

    fn chain(n: usize) -> WorkerGraph {
        let children = (0..n)
            .map(|_| StreamElement::Worker(WorkerDecl::filter("Identity", Box::new(Identity))))
            .collect();
        StreamElement::pipeline("main", children).lower().unwrap()
    }

    fn assign(machines: &[usize]) -> Configuration {
        let mut b = Configuration::builder();
        for (w, m) in machines.iter().enumerate() {
            b = b
                .add_int(names::worker_to_machine(WorkerId(w)), 0, 64, *m as i64)
                .unwrap();
        }
        b.build()
    }

    #[test]
    fn single_machine_chain_is_one_blob() {
        let g = chain(3);
        let p = partition(&g, &assign(&[0, 0, 0])).unwrap();
        assert_eq!(p.machines.len(), 1);
        let blobs = &p.machines[&MachineId(0)];
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].workers.len(), 3);
    }

    #[test]
    fn machine_split_follows_connectivity() {
        // w0,w1 on m0; w2 on m1; w3 back on m0 -> m0 gets two blob slots.
        let g = chain(4);
        let p = partition(&g, &assign(&[0, 0, 1, 0])).unwrap();
        let m0 = &p.machines[&MachineId(0)];
        assert_eq!(m0.len(), 2);
        assert_eq!(m0[0].workers, BTreeSet::from([WorkerId(0), WorkerId(1)]));
        assert_eq!(m0[1].workers, BTreeSet::from([WorkerId(3)]));
        assert_eq!(p.machines[&MachineId(1)][0].workers, BTreeSet::from([WorkerId(2)]));
        assert_eq!(p.worker_count(), 4);
    }

    #[test]
    fn explicit_partition_must_cover_all_workers() {
        let g = chain(2);
        let param = PartitionParameter {
            name: names::PARTITION.to_string(),
            machines: vec![vec![BTreeSet::from([WorkerId(0)])]],
        };
        let cfg = Configuration::builder()
            .add(Parameter::Partition(param))
            .unwrap()
            .build();
        let err = partition(&g, &cfg).unwrap_err();
        assert!(matches!(err, PartitionError::MissingWorker(WorkerId(1))));
    }

    #[test]
    fn explicit_partition_rejects_disconnected_blob() {
        let g = chain(3);
        let param = PartitionParameter {
            name: names::PARTITION.to_string(),
            machines: vec![vec![
                BTreeSet::from([WorkerId(0), WorkerId(2)]),
                BTreeSet::from([WorkerId(1)]),
            ]],
        };
        let cfg = Configuration::builder()
            .add(Parameter::Partition(param))
            .unwrap()
            .build();
        let err = partition(&g, &cfg).unwrap_err();
        assert!(matches!(err, PartitionError::DisconnectedBlob { .. }));
    }

    #[test]
    fn dump_is_valid_json() {
        let g = chain(2);
        let p = partition(&g, &assign(&[0, 1])).unwrap();
        let dump = p.dump();
        assert!(serde_json::from_str::<serde_json::Value>(&dump).is_ok());
    }
}
