//! Happy-path crate API
//!
//! Wraps the pipeline of passes with a small, ergonomic surface:
//! - [`compile`]: validate → connect → compile → instantiate, one call.
//! - [`CompiledStream::run_to_completion`]: feed a finite input, drain, and
//!   collect the output.
//! - [`interpret`]: the same computation through the pull interpreter, used
//!   as the oracle in the equivalence tests.
//! - [`seeds`]: ready-made graphs shared by the demo binary and the tests.
//!
//! Everything delegates to the typed modules; only the one-shot helpers trade
//! typed errors for `anyhow` context, at the outermost boundary.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use crate::compiler::{self, CompileError};
use crate::config::Configuration;
use crate::graph::{BlobId, StreamElement};
use crate::interp::InterpreterBlob;
use crate::runtime::{instantiate_stream, Blob, StreamHost};
use crate::validate;
use crate::Item;

/// A fully instantiated stream: one runtime blob per plan, in topological
/// order, ready to be wired and started.
pub struct CompiledStream {
    blobs: Vec<Arc<dyn Blob>>,
}

impl std::fmt::Debug for CompiledStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledStream")
            .field("blob_count", &self.blobs.len())
            .finish()
    }
}

impl CompiledStream {
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// The instantiated blobs, in execution order.
    pub fn blobs(&self) -> &[Arc<dyn Blob>] {
        &self.blobs
    }

    /// Hand the blobs to a [`StreamHost`]: wires boundary channels and spawns
    /// one thread per core.
    pub fn start(self) -> anyhow::Result<StreamHost> {
        StreamHost::start(self.blobs).map_err(|e| anyhow::anyhow!("stream start failed: {e}"))
    }

    /// Push a finite input, drain the stream, and return the whole output.
    pub fn run_to_completion(self, input: &[Item]) -> anyhow::Result<Vec<Item>> {
        let host = self.start()?;
        host.input().push_many(input);
        host.drain_and_join().map_err(|e| anyhow::anyhow!("stream drain failed: {e}"))
    }
}

/// Validate, connect, compile, and instantiate `element` under `cfg`.
pub fn compile(element: StreamElement, cfg: &Configuration) -> Result<CompiledStream, CompileError> {
    validate::validate(&element)?;
    let mut graph = element.lower()?;
    let plan = compiler::compile(&graph, cfg)?;
    let blobs = instantiate_stream(plan, &mut graph);
    Ok(CompiledStream { blobs })
}

/// Run `element` over `input` through the pull interpreter. Single-threaded,
/// no configuration; the output is the reference answer for the compiled
/// path.
pub fn interpret(element: StreamElement, input: &[Item]) -> anyhow::Result<Vec<Item>> {
    validate::validate(&element).map_err(|e| anyhow::anyhow!("invalid stream graph: {e}"))?;
    let mut graph = element.lower().map_err(|e| anyhow::anyhow!("connect failed: {e}"))?;
    let interp = InterpreterBlob::of_graph(&mut graph, BlobId(0))
        .map_err(|e| anyhow::anyhow!("interpreter rejected graph: {e}"))?;
    let input_ch = Arc::new(crate::graph::Channel::new());
    let output_ch = Arc::new(crate::graph::Channel::new());
    for t in interp.input_tokens() {
        interp
            .wire_input(t, input_ch.clone())
            .map_err(|e| anyhow::anyhow!("wiring failed: {e}"))?;
    }
    for t in interp.output_tokens() {
        interp
            .wire_output(t, output_ch.clone())
            .map_err(|e| anyhow::anyhow!("wiring failed: {e}"))?;
    }
    input_ch.push_many(input);
    interp.pull_once().map_err(|e| anyhow::anyhow!("pull failed: {e}"))?;
    Ok(output_ch.drain_all())
}

// ===============================================================================================
/* Seed graphs */
// ===============================================================================================

pub mod seeds {
    //! Ready-made stream graphs exercising the characteristic shapes:
    //! straight pipelines, splitjoins, rate-changing filters, and lookahead.

    use crate::graph::{Arity, StreamElement, WorkerDecl};
    use crate::workers::{Compressor, Duplicate, Expander, Identity, MovingSum, RoundRobinJoiner};

    fn identity() -> StreamElement {
        StreamElement::Worker(WorkerDecl::filter("Identity", Box::new(Identity)))
    }

    /// `Pipeline(Identity, Identity)`.
    pub fn identity_pipeline() -> StreamElement {
        StreamElement::pipeline("main", vec![identity(), identity()])
    }

    /// Duplicate splitter over two identity branches, round-robin joined.
    pub fn duplicate_splitjoin() -> StreamElement {
        StreamElement::pipeline(
            "main",
            vec![StreamElement::splitjoin(
                "mirror",
                WorkerDecl::splitter("Dup", Arity::Unlimited, Box::new(Duplicate)),
                WorkerDecl::joiner("RR", Arity::Unlimited, Box::new(RoundRobinJoiner::uniform(1))),
                vec![identity(), identity()],
            )],
        )
    }

    /// Compressor(2) feeding Expander(2): halve, then zero-fill back.
    pub fn compressor_expander() -> StreamElement {
        StreamElement::pipeline(
            "main",
            vec![
                StreamElement::Worker(WorkerDecl::filter("Comp", Box::new(Compressor::new(2)))),
                StreamElement::Worker(WorkerDecl::filter("Exp", Box::new(Expander::new(2)))),
            ],
        )
    }

    /// Identity into a window-3 sliding sum; exercises standing lookahead.
    pub fn moving_sum_pipeline() -> StreamElement {
        StreamElement::pipeline(
            "main",
            vec![
                identity(),
                StreamElement::Worker(WorkerDecl::filter("Sum", Box::new(MovingSum::new(3)))),
            ],
        )
    }

    /// Build one of the seeds by name; `None` for an unknown name.
    pub fn by_name(name: &str) -> Option<StreamElement> {
        match name {
            "identity" => Some(identity_pipeline()),
            "mirror" => Some(duplicate_splitjoin()),
            "compexp" => Some(compressor_expander()),
            "movingsum" => Some(moving_sum_pipeline()),
            _ => None,
        }
    }
}

// ===============================================================================================
// Tests — end-to-end scenarios
// ===============================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{names, single_machine};
    use crate::graph::{Arity, Rate, WorkerDecl, WorkerId, WorkerRates};
    use crate::validate::InvalidGraphError;
    use crate::workers::{Identity, RoundRobinJoiner, RoundRobinSplitter, Work, WorkIo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn identity_pipeline_end_to_end() {
        let out = compile(seeds::identity_pipeline(), &single_machine(2, 1))
            .unwrap()
            .run_to_completion(&[1, 2, 3])
            .unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_splitjoin_end_to_end() {
        let out = compile(seeds::duplicate_splitjoin(), &single_machine(4, 1))
            .unwrap()
            .run_to_completion(&[10, 20])
            .unwrap();
        assert_eq!(out, vec![10, 10, 20, 20]);
    }

    #[test]
    fn compressor_expander_end_to_end() {
        let out = compile(seeds::compressor_expander(), &single_machine(2, 1))
            .unwrap()
            .run_to_completion(&[1, 2, 3, 4])
            .unwrap();
        assert_eq!(out, vec![1, 0, 3, 0]);
    }

    #[test]
    fn unbalanced_splitjoin_fails_before_scheduling() {
        #[derive(Clone)]
        struct Gain(u64);
        impl Work for Gain {
            fn work(&mut self, io: &mut WorkIo<'_>) {
                let v = io.pop(0);
                for _ in 0..self.0 {
                    io.push(0, v);
                }
            }
            fn rates(&self, _ins: usize, _outs: usize) -> WorkerRates {
                WorkerRates {
                    pop: vec![Rate::Fixed(1)],
                    peek: vec![Rate::Fixed(1)],
                    push: vec![Rate::Fixed(self.0)],
                }
            }
            fn clone_box(&self) -> Box<dyn Work> {
                Box::new(self.clone())
            }
        }
        let el = StreamElement::pipeline(
            "main",
            vec![StreamElement::splitjoin(
                "sj",
                WorkerDecl::splitter(
                    "RR",
                    Arity::Unlimited,
                    Box::new(RoundRobinSplitter::uniform(1)),
                ),
                WorkerDecl::joiner("RR", Arity::Unlimited, Box::new(RoundRobinJoiner::uniform(1))),
                vec![
                    StreamElement::Worker(WorkerDecl::filter("x2", Box::new(Gain(2)))),
                    StreamElement::Worker(WorkerDecl::filter("x3", Box::new(Gain(3)))),
                ],
            )],
        );
        let err = compile(el, &single_machine(4, 1)).unwrap_err();
        assert!(matches!(
            err,
            CompileError::InvalidGraph(InvalidGraphError::UnbalancedSplitjoin { .. })
        ));
    }

    #[test]
    fn partition_cycle_is_rejected() {
        // splitter + branch0 + joiner on machine 0, branch1 on machine 1:
        // the two blobs wait on each other.
        let cfg = single_machine(4, 1)
            .replaced_int(&names::worker_to_machine(WorkerId(2)), 1)
            .unwrap();
        let el = StreamElement::pipeline(
            "main",
            vec![StreamElement::splitjoin(
                "sj",
                WorkerDecl::splitter(
                    "RR",
                    Arity::Unlimited,
                    Box::new(RoundRobinSplitter::uniform(1)),
                ),
                WorkerDecl::joiner("RR", Arity::Unlimited, Box::new(RoundRobinJoiner::uniform(1))),
                vec![
                    StreamElement::Worker(WorkerDecl::filter("Identity", Box::new(Identity))),
                    StreamElement::Worker(WorkerDecl::filter("Identity", Box::new(Identity))),
                ],
            )],
        );
        let err = compile(el, &cfg).unwrap_err();
        assert!(matches!(err, CompileError::CyclicBlobs(_)));
    }

    #[test]
    fn drain_race_single_callback() {
        let compiled = compile(seeds::identity_pipeline(), &single_machine(2, 1)).unwrap();
        let blob = compiled.blobs()[0].clone();
        let host = compiled.start().unwrap();
        host.input().push_many(&(0..64).collect::<Vec<_>>());
        // Let at least one steady state happen before draining.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while host.output().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!host.output().is_empty(), "no steady state before drain");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        blob.drain(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        // A second request is misuse.
        assert!(blob.drain(Box::new(|| {})).is_err());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !blob.is_drained() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(blob.is_drained());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The host skips the externally drained blob and finishes the rest.
        let out = host.drain_and_join().unwrap();
        assert_eq!(out, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn oracle_equivalence_across_configurations() {
        let input: Vec<i64> = (1..=24).collect();
        for (name, workers) in [("identity", 2), ("mirror", 4), ("compexp", 2), ("movingsum", 2)] {
            let reference = interpret(seeds::by_name(name).unwrap(), &input).unwrap();
            for multiplier in [1, 3] {
                let cfg = single_machine(workers, multiplier);
                let out = compile(seeds::by_name(name).unwrap(), &cfg)
                    .unwrap()
                    .run_to_completion(&input)
                    .unwrap();
                let common = reference.len().min(out.len());
                assert_eq!(
                    out[..common],
                    reference[..common],
                    "{name} with multiplier {multiplier} diverged from the interpreter"
                );
            }
        }
    }

    #[test]
    fn oracle_equivalence_across_machines() {
        let input: Vec<i64> = (1..=16).collect();
        let reference = interpret(seeds::compressor_expander(), &input).unwrap();
        let cfg = single_machine(2, 1)
            .replaced_int(&names::worker_to_machine(WorkerId(1)), 1)
            .unwrap();
        let compiled = compile(seeds::compressor_expander(), &cfg).unwrap();
        assert_eq!(compiled.blob_count(), 2);
        let out = compiled.run_to_completion(&input).unwrap();
        assert_eq!(out, reference);
    }

    #[test]
    fn multicore_blob_matches_single_core() {
        let input: Vec<i64> = (0..40).collect();
        let reference = interpret(seeds::identity_pipeline(), &input).unwrap();
        let cfg = Configuration::builder()
            .add_int(names::MULTIPLIER, 1, 16, 2)
            .unwrap()
            .add_int(names::MAX_NUM_CORES, 1, 16, 3)
            .unwrap()
            .build();
        let out = compile(seeds::identity_pipeline(), &cfg)
            .unwrap()
            .run_to_completion(&input)
            .unwrap();
        assert_eq!(out, reference);
    }
}
