//! Crate root: public surface, core aliases, and runtime-wide invariants
//!
//! This module is the single canonical entry point for downstream users of
//! the library. It centralizes the item alias, the small index newtypes,
//! shared error categories, and re-exports the submodules that implement the
//! synchronous-dataflow compiler and runtime.
//!
//! ## Invariants
//!
//! - **Graphs are feed-forward.** Pipelines and splitjoins only express
//!   acyclic data flow; the connect pass wires every port exactly once and
//!   assigns stable integer ids, so edges are plain `(producer, consumer)`
//!   tokens and traversal never chases owning references.
//! - **Steady states balance.** After a successful compile, every channel
//!   `u -> d` satisfies `M(u)·push = M(d)·pop` with `M` the unique minimum
//!   positive multiplicity vector, both inside each blob and across the blob
//!   DAG. Buffers are sized so a steady state is guaranteed to make progress
//!   without blocking.
//! - **One synchronization point per round.** Compiled cores share data only
//!   through the inter-round handoff; steps themselves touch no channels and
//!   no cross-core state.
//! - **Failures are precise.** Compile-time failures are typed errors with
//!   the offending workers or tokens attached and are never retried; a
//!   worker failure at run time aborts its blob without invoking the drain
//!   callback. We forbid unsafe code throughout the crate.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Stream-graph data model and connect pass (workers, rates, tokens,
/// channels, element tree).
pub mod graph;
/// Firing contract, stock workers, and the name-keyed worker registry.
pub mod workers;
/// Graph validation: arity, splitjoin rate balance, structural integrity.
pub mod validate;
/// Synchronous-dataflow balance solver and initialization solver.
pub mod schedule;
/// Tuning configuration: typed parameters, builder, recognized names.
pub mod config;
/// Worker→machine partitioning into connected blob slots.
pub mod partition;
/// Topologically ordered DAG of blobs; rejects cyclic assignments.
pub mod blob_graph;
/// Per-blob compilation: schedules, buffer sizing, core assignment.
pub mod compiler;
/// Blob runtime: per-core rounds, buffer handoff, drain, stream host.
pub mod runtime;
/// Pull interpreter; the behavioral oracle for the compiled path.
pub mod interp;
/// Happy-path one-shot helpers and seed graphs.
pub mod api;

// ============================================================================
// Canonical aliases and root-level re-exports
// ============================================================================

/// The item type carried on every channel. The core is monomorphic by
/// design; widening this to a user-chosen element type is an API concern
/// that sits entirely above the scheduling and buffer machinery.
pub type Item = i64;

pub use crate::graph::{Arity, BlobId, CoreId, MachineId, Rate, Token, WorkerId};

pub use crate::compiler::{CompileError, UnsupportedConstruct};
pub use crate::graph::GraphError;
pub use crate::interp::IllegalStreamGraph;
pub use crate::runtime::RuntimeError;
pub use crate::schedule::UnschedulableError;
pub use crate::validate::InvalidGraphError;

// ============================================================================
// Public orchestrators
// ============================================================================

pub use crate::api::{compile, interpret, CompiledStream};
pub use crate::config::Configuration;
pub use crate::runtime::{Blob, BlobState, CoreCode, DrainCallback, StreamHost};
