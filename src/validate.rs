//! Stream-graph validation
//!
//! Three layers, run in order before any scheduling:
//!
//! 1. **Arity.** Every splitjoin's splitter must declare an output count
//!    matching its branch count, and its joiner an input count likewise
//!    (UNLIMITED satisfies any count). Implemented as a [`StreamVisitor`]
//!    pass over the element tree.
//! 2. **Rate balance.** Each branch of a splitjoin maps the splitjoin's
//!    input rate to its output rate by a rational gain; with DYNAMIC rates
//!    the gain widens to an interval with an open upper bound. The
//!    intersection of the branch gains must be non-empty, or no steady state
//!    exists and compilation must fail before the scheduler ever runs.
//! 3. **Structure.** Integrity of the lowered graph: dense unique ids, each
//!    port wired to exactly one channel, a unique source and sink. A second
//!    pass over a valid graph is a no-op.
//!
//! All errors here are fatal and never retried.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use num_rational::Ratio;

use crate::graph::{
    Arity, GraphError, Rate, StreamElement, StreamVisitor, WorkerDecl, WorkerGraph, WorkerKind,
};

/// Fatal validation failures. The offending element path is attached where
/// one exists.
#[derive(Debug, thiserror::Error)]
pub enum InvalidGraphError {
    #[error("element repeated in the stream graph: `{first}` and `{second}`")]
    ElementRepeated { first: String, second: String },
    #[error("{kind} `{path}` declares {declared} ports but the splitjoin has {found} branches")]
    ArityMismatch { kind: WorkerKind, path: String, declared: Arity, found: usize },
    #[error("splitjoin `{path}` is rate-unbalanced: branch gains {gains} never intersect")]
    UnbalancedSplitjoin { path: String, gains: String },
    #[error("incompatible rate at `{path}`: {detail}")]
    IncompatibleRates { path: String, detail: String },
    #[error(transparent)]
    Structure(#[from] GraphError),
}

// ============================================================================
// Rate-ratio intervals
// ============================================================================

/// A closed interval of non-negative rationals, with `hi == None` standing
/// for an open, unbounded upper end (introduced by DYNAMIC rates).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RateInterval {
    lo: Ratio<u64>,
    hi: Option<Ratio<u64>>,
}

impl RateInterval {
    /// The point interval `[q/p, q/p]`.
    fn point(push: u64, pop: u64) -> Self {
        let r = Ratio::new(push, pop);
        Self { lo: r, hi: Some(r) }
    }

    /// The interval contributed by a DYNAMIC rate: anything non-negative.
    fn unbounded() -> Self {
        Self { lo: Ratio::new(0, 1), hi: None }
    }

    fn identity() -> Self {
        Self::point(1, 1)
    }

    fn mul(self, other: Self) -> Self {
        Self {
            lo: self.lo * other.lo,
            hi: match (self.hi, other.hi) {
                (Some(a), Some(b)) => Some(a * b),
                _ => None,
            },
        }
    }

    fn intersect(self, other: Self) -> Self {
        Self {
            lo: self.lo.max(other.lo),
            hi: match (self.hi, other.hi) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) | (None, Some(a)) => Some(a),
                (None, None) => None,
            },
        }
    }

    fn is_empty(self) -> bool {
        matches!(self.hi, Some(hi) if hi < self.lo)
    }
}

impl fmt::Display for RateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hi {
            Some(hi) if hi == self.lo => write!(f, "{}", self.lo),
            Some(hi) => write!(f, "[{}, {}]", self.lo, hi),
            None => write!(f, "[{}, inf)", self.lo),
        }
    }
}

/// Interval for one `push/pop` rate pair. A zero pop with a positive push
/// (or the reverse) cannot form a gain and is reported as incompatible.
fn rate_pair_interval(
    push: Rate,
    pop: Rate,
    path: &str,
) -> Result<RateInterval, InvalidGraphError> {
    match (push, pop) {
        (Rate::Fixed(q), Rate::Fixed(p)) => {
            if p == 0 && q == 0 {
                Ok(RateInterval::identity())
            } else if p == 0 || q == 0 {
                Err(InvalidGraphError::IncompatibleRates {
                    path: path.to_string(),
                    detail: format!("one-sided zero rate (push={push}, pop={pop})"),
                })
            } else {
                Ok(RateInterval::point(q, p))
            }
        }
        _ => Ok(RateInterval::unbounded()),
    }
}

// ============================================================================
// Arity pass (visitor)
// ============================================================================

struct ArityCheck {
    path: Vec<String>,
    error: Option<InvalidGraphError>,
}

impl ArityCheck {
    fn path_of(&self, leaf: &str) -> String {
        if self.path.is_empty() {
            leaf.to_string()
        } else {
            format!("{}/{}", self.path.join("/"), leaf)
        }
    }
}

impl StreamVisitor for ArityCheck {
    fn enter_pipeline(&mut self, name: &str) {
        self.path.push(name.to_string());
    }
    fn exit_pipeline(&mut self, _name: &str) {
        self.path.pop();
    }
    fn enter_splitjoin(
        &mut self,
        name: &str,
        splitter: &WorkerDecl,
        joiner: &WorkerDecl,
        branches: usize,
    ) {
        self.path.push(name.to_string());
        if self.error.is_some() {
            return;
        }
        if !splitter.output_arity.admits(branches) {
            self.error = Some(InvalidGraphError::ArityMismatch {
                kind: WorkerKind::Splitter,
                path: self.path_of(&splitter.name),
                declared: splitter.output_arity,
                found: branches,
            });
        } else if !joiner.input_arity.admits(branches) {
            self.error = Some(InvalidGraphError::ArityMismatch {
                kind: WorkerKind::Joiner,
                path: self.path_of(&joiner.name),
                declared: joiner.input_arity,
                found: branches,
            });
        }
    }
    fn exit_splitjoin(&mut self, _name: &str) {
        self.path.pop();
    }
    fn enter_branch(&mut self, index: usize) {
        self.path.push(format!("branch{index}"));
    }
    fn exit_branch(&mut self, _index: usize) {
        self.path.pop();
    }
}

// ============================================================================
// Rate-balance pass (recursive gain computation)
// ============================================================================

fn join_path(prefix: &str, leaf: &str) -> String {
    if prefix.is_empty() {
        leaf.to_string()
    } else {
        format!("{prefix}/{leaf}")
    }
}

fn element_gain(element: &StreamElement, path: &str) -> Result<RateInterval, InvalidGraphError> {
    match element {
        StreamElement::Worker(decl) => {
            let rates = decl.rates(1, 1);
            rate_pair_interval(rates.push[0], rates.pop[0], &join_path(path, &decl.name))
        }
        StreamElement::Pipeline { name, children } => {
            let here = join_path(path, name);
            let mut gain = RateInterval::identity();
            for child in children {
                gain = gain.mul(element_gain(child, &here)?);
            }
            Ok(gain)
        }
        StreamElement::Splitjoin { name, splitter, joiner, branches } => {
            let here = join_path(path, name);
            let n = branches.len();
            let split_rates = splitter.rates(1, n);
            let join_rates = joiner.rates(n, 1);

            let mut intersection: Option<RateInterval> = None;
            let mut gains = Vec::with_capacity(n);
            for (i, branch) in branches.iter().enumerate() {
                let branch_path = format!("{here}/branch{i}");
                // Gain of the whole splitjoin as seen through branch i:
                // splitter input -> branch -> joiner output.
                let through_split = rate_pair_interval(
                    split_rates.push[i],
                    split_rates.pop[0],
                    &format!("{here}/{}", splitter.name),
                )?;
                let through_join = rate_pair_interval(
                    join_rates.push[0],
                    join_rates.pop[i],
                    &format!("{here}/{}", joiner.name),
                )?;
                let g = through_split
                    .mul(element_gain(branch, &branch_path)?)
                    .mul(through_join);
                gains.push(g);
                intersection = Some(match intersection {
                    None => g,
                    Some(acc) => acc.intersect(g),
                });
            }
            let intersection = intersection.expect("splitjoins have at least one branch");
            if intersection.is_empty() {
                let gains = gains.iter().map(|g| g.to_string()).collect::<Vec<_>>().join(", ");
                return Err(InvalidGraphError::UnbalancedSplitjoin { path: here, gains });
            }
            Ok(intersection)
        }
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Tree-level validation: arity match, then rate balance across every
/// splitjoin. Reports the first failure with its element path.
pub fn validate(element: &StreamElement) -> Result<(), InvalidGraphError> {
    let mut arity = ArityCheck { path: Vec::new(), error: None };
    element.accept(&mut arity);
    if let Some(err) = arity.error {
        return Err(err);
    }
    element_gain(element, "")?;
    Ok(())
}

/// Graph-level validation of a lowered graph. Safe to run repeatedly;
/// valid graphs pass unchanged.
pub fn validate_graph(graph: &WorkerGraph) -> Result<(), InvalidGraphError> {
    graph.check_integrity().map_err(|e| match e {
        GraphError::RepeatedWorker { id } => InvalidGraphError::ElementRepeated {
            first: graph.worker(id).path.clone(),
            second: graph.worker(id).path.clone(),
        },
        other => InvalidGraphError::Structure(other),
    })?;
    // A connected one-in one-out graph has exactly one overall input and one
    // overall output token.
    let boundary_inputs =
        graph.channels().keys().filter(|t| t.is_overall_input()).count();
    let boundary_outputs =
        graph.channels().keys().filter(|t| t.is_overall_output()).count();
    if boundary_inputs != 1 || boundary_outputs != 1 {
        return Err(InvalidGraphError::IncompatibleRates {
            path: String::new(),
            detail: format!(
                "expected one overall input and output, found {boundary_inputs} and {boundary_outputs}"
            ),
        });
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::WorkerRates;
    use crate::workers::{
        Duplicate, Identity, RoundRobinJoiner, RoundRobinSplitter, Work, WorkIo,
    };

    /// Filter with arbitrary fixed or dynamic rates, for exercising the
    /// balance checks.
    #[derive(Clone)]
    struct TestRates {
        pop: Rate,
        push: Rate,
    }

    impl Work for TestRates {
        fn work(&mut self, io: &mut WorkIo<'_>) {
            if let Rate::Fixed(p) = self.pop {
                for _ in 0..p {
                    let _ = io.pop(0);
                }
            }
            if let Rate::Fixed(q) = self.push {
                for _ in 0..q {
                    io.push(0, 0);
                }
            }
        }
        fn rates(&self, _ins: usize, _outs: usize) -> WorkerRates {
            WorkerRates { pop: vec![self.pop], peek: vec![self.pop], push: vec![self.push] }
        }
        fn clone_box(&self) -> Box<dyn Work> {
            Box::new(self.clone())
        }
    }

    fn fixed(pop: u64, push: u64) -> StreamElement {
        StreamElement::Worker(WorkerDecl::filter(
            format!("F{pop}_{push}"),
            Box::new(TestRates { pop: Rate::Fixed(pop), push: Rate::Fixed(push) }),
        ))
    }

    fn identity() -> StreamElement {
        StreamElement::Worker(WorkerDecl::filter("Identity", Box::new(Identity)))
    }

    fn splitjoin_of(branches: Vec<StreamElement>) -> StreamElement {
        StreamElement::splitjoin(
            "sj",
            WorkerDecl::splitter("RR", Arity::Unlimited, Box::new(RoundRobinSplitter::uniform(1))),
            WorkerDecl::joiner("RR", Arity::Unlimited, Box::new(RoundRobinJoiner::uniform(1))),
            branches,
        )
    }

    #[test]
    fn balanced_identity_splitjoin_passes() {
        let el = StreamElement::pipeline("main", vec![splitjoin_of(vec![identity(), identity()])]);
        assert!(validate(&el).is_ok());
    }

    #[test]
    fn unbalanced_branch_gains_fail() {
        // Branch gains 2 and 3 against a 1:1 joiner.
        let el = StreamElement::pipeline(
            "main",
            vec![splitjoin_of(vec![fixed(1, 2), fixed(1, 3)])],
        );
        let err = validate(&el).unwrap_err();
        assert!(matches!(err, InvalidGraphError::UnbalancedSplitjoin { .. }));
    }

    #[test]
    fn dynamic_branch_widens_instead_of_failing() {
        let dynamic = StreamElement::Worker(WorkerDecl::filter(
            "Dyn",
            Box::new(TestRates { pop: Rate::Fixed(1), push: Rate::Dynamic }),
        ));
        let el = StreamElement::pipeline("main", vec![splitjoin_of(vec![dynamic, fixed(1, 3)])]);
        assert!(validate(&el).is_ok());
    }

    #[test]
    fn duplicate_splitter_balances_equal_branches() {
        let el = StreamElement::pipeline(
            "main",
            vec![StreamElement::splitjoin(
                "sj",
                WorkerDecl::splitter("Dup", Arity::Unlimited, Box::new(Duplicate)),
                WorkerDecl::joiner(
                    "RR",
                    Arity::Unlimited,
                    Box::new(RoundRobinJoiner::uniform(1)),
                ),
                vec![identity(), identity()],
            )],
        );
        assert!(validate(&el).is_ok());
    }

    #[test]
    fn arity_mismatch_reports_path() {
        let el = StreamElement::pipeline(
            "main",
            vec![StreamElement::splitjoin(
                "sj",
                WorkerDecl::splitter(
                    "RR3",
                    Arity::Exact(3),
                    Box::new(RoundRobinSplitter::uniform(1)),
                ),
                WorkerDecl::joiner("RR", Arity::Unlimited, Box::new(RoundRobinJoiner::uniform(1))),
                vec![identity(), identity()],
            )],
        );
        match validate(&el).unwrap_err() {
            InvalidGraphError::ArityMismatch { path, declared, found, .. } => {
                assert_eq!(path, "main/sj/RR3");
                assert_eq!(declared, Arity::Exact(3));
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn nested_splitjoins_validate_recursively() {
        let inner = splitjoin_of(vec![identity(), identity()]);
        let el = StreamElement::pipeline(
            "main",
            vec![splitjoin_of(vec![inner, StreamElement::pipeline("p", vec![identity()])])],
        );
        assert!(validate(&el).is_ok());
    }

    #[test]
    fn graph_validation_is_idempotent() {
        let g = StreamElement::pipeline("main", vec![identity(), identity()]).lower().unwrap();
        assert!(validate_graph(&g).is_ok());
        assert!(validate_graph(&g).is_ok());
    }
}
