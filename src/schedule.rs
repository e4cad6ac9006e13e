//! Synchronous-dataflow balance solver
//!
//! Given a finite set of scheduler channels `{(producer, consumer, push,
//! pop)}` over an arbitrary node type, [`solve`] returns the unique minimum
//! positive integer multiplicity vector `M` with `M(u)·push = M(d)·pop` on
//! every channel, or fails with [`UnschedulableError`] when the balance
//! equations admit no positive solution.
//!
//! The algorithm is the classical one: union-find over the channels to find
//! weakly connected components, then within each component pick a seed with
//! multiplicity 1 and propagate along channels with exact rational
//! arithmetic, keeping the LCM of the denominators. Multiplying the component
//! by that LCM makes every entry integral; dividing by the component GCD
//! makes the vector minimal. Distinct components are independent and each is
//! normalized separately.
//!
//! The same channel description drives the **initialization solver**
//! ([`init_schedule`]): minimal per-node init firing counts that leave every
//! channel holding its standing lookahead (`excess_peeks`) on top of what the
//! first steady state pops, counting `initial_tokens` as preloaded. On the
//! acyclic graphs produced by the connect pass the reverse-topological
//! recurrence below yields the component-wise minimum; an unsatisfiable
//! requirement surfaces as an error rather than a loop.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use num_integer::Integer;
use num_rational::Ratio;
use petgraph::unionfind::UnionFind;

/// One channel as seen by the solver: endpoint nodes, the per-firing rates,
/// and the initialization context (`initial_tokens`, `excess_peeks`) consumed
/// only by [`init_schedule`].
#[derive(Copy, Clone, Debug)]
pub struct SchedChannel<N> {
    pub producer: N,
    pub consumer: N,
    pub push: u64,
    pub pop: u64,
    /// Tokens already present on the channel before any firing.
    pub initial_tokens: u64,
    /// Standing lookahead the channel must retain across steady states.
    pub excess_peeks: u64,
}

impl<N> SchedChannel<N> {
    /// A steady-state balance constraint with empty initialization context.
    pub fn balance(producer: N, consumer: N, push: u64, pop: u64) -> Self {
        Self { producer, consumer, push, pop, initial_tokens: 0, excess_peeks: 0 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnschedulableError {
    #[error("balance equations are inconsistent at {edge}")]
    Inconsistent { edge: String },
    #[error("{edge} has a one-sided zero rate (push={push}, pop={pop})")]
    ZeroRate { edge: String, push: u64, pop: u64 },
    #[error("initialization cannot cover the lookahead on {edge}")]
    InitInfeasible { edge: String },
}

fn edge_name<N: fmt::Debug>(c: &SchedChannel<N>) -> String {
    format!("({:?}->{:?})", c.producer, c.consumer)
}

// ============================================================================
// Steady-state solve
// ============================================================================

/// Solve the balance equations over `nodes`. Nodes untouched by any
/// constraining channel form singleton components with multiplicity 1.
///
/// Channels with `push == pop == 0` carry no tokens and no constraint; a
/// channel with exactly one zero rate can never balance against a positive
/// multiplicity and is rejected.
pub fn solve<N: Copy + Ord + fmt::Debug>(
    nodes: &[N],
    channels: &[SchedChannel<N>],
) -> Result<BTreeMap<N, u64>, UnschedulableError> {
    let index: BTreeMap<N, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let n = nodes.len();

    // Weakly connected components over the constraining channels.
    let mut components: UnionFind<usize> = UnionFind::new(n);
    let mut adjacency: Vec<Vec<(usize, Ratio<i128>, String)>> = vec![Vec::new(); n];
    for c in channels {
        match (c.push, c.pop) {
            (0, 0) => continue,
            (0, _) | (_, 0) => {
                return Err(UnschedulableError::ZeroRate {
                    edge: edge_name(c),
                    push: c.push,
                    pop: c.pop,
                })
            }
            _ => {}
        }
        let u = index[&c.producer];
        let d = index[&c.consumer];
        components.union(u, d);
        // M(d) = M(u) · push/pop and the reverse relation.
        let forward = Ratio::new(c.push as i128, c.pop as i128);
        adjacency[u].push((d, forward, edge_name(c)));
        adjacency[d].push((u, forward.recip(), edge_name(c)));
    }

    // Seeded rational propagation, one BFS per component.
    let mut ratio: Vec<Option<Ratio<i128>>> = vec![None; n];
    for seed in 0..n {
        if ratio[seed].is_some() {
            continue;
        }
        ratio[seed] = Some(Ratio::from_integer(1));
        let mut queue = VecDeque::from([seed]);
        while let Some(cur) = queue.pop_front() {
            let cur_ratio = ratio[cur].expect("queued nodes are assigned");
            for (next, rel, edge) in &adjacency[cur] {
                let propagated = cur_ratio * *rel;
                match ratio[*next] {
                    None => {
                        ratio[*next] = Some(propagated);
                        queue.push_back(*next);
                    }
                    Some(existing) if existing != propagated => {
                        return Err(UnschedulableError::Inconsistent { edge: edge.clone() });
                    }
                    Some(_) => {}
                }
            }
        }
    }

    // Normalize each component: scale by the denominator LCM, then divide by
    // the component GCD so the vector is the minimum positive solution.
    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        members.entry(components.find(i)).or_default().push(i);
    }
    let mut out = BTreeMap::new();
    for group in members.values() {
        let lcm = group
            .iter()
            .map(|i| *ratio[*i].expect("all nodes assigned").denom())
            .fold(1i128, |acc, d| acc.lcm(&d));
        let scaled: Vec<i128> = group
            .iter()
            .map(|i| (ratio[*i].expect("all nodes assigned") * lcm).to_integer())
            .collect();
        let gcd = scaled.iter().fold(0i128, |acc, v| acc.gcd(v));
        for (i, v) in group.iter().zip(scaled) {
            let m = (v / gcd) as u64;
            debug_assert!(m > 0, "multiplicities are strictly positive");
            out.insert(nodes[*i], m);
        }
    }
    Ok(out)
}

/// Check a multiplicity vector against the balance equations. Used by tests
/// and by debug assertions in the compiler.
pub fn balanced<N: Copy + Ord>(channels: &[SchedChannel<N>], m: &BTreeMap<N, u64>) -> bool {
    channels.iter().all(|c| {
        let mu = m.get(&c.producer).copied().unwrap_or(0);
        let md = m.get(&c.consumer).copied().unwrap_or(0);
        mu * c.push == md * c.pop
    })
}

// ============================================================================
// Initialization solve
// ============================================================================

/// Minimal init firing counts over `topo` (producers before consumers) such
/// that after the init phase every channel holds at least `excess_peeks`
/// tokens. Channels whose producer is absent from `topo` are fed by a
/// boundary buffer and impose no local requirement.
pub fn init_schedule<N: Copy + Ord + fmt::Debug>(
    topo: &[N],
    channels: &[SchedChannel<N>],
) -> Result<BTreeMap<N, u64>, UnschedulableError> {
    let inside: BTreeMap<N, usize> = topo.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let mut init: BTreeMap<N, u64> = topo.iter().map(|n| (*n, 0)).collect();

    for node in topo.iter().rev() {
        let mut fires = 0u64;
        for c in channels.iter().filter(|c| c.producer == *node) {
            if !inside.contains_key(&c.consumer) {
                continue;
            }
            let consumed = init[&c.consumer] * c.pop;
            let needed = (c.excess_peeks + consumed).saturating_sub(c.initial_tokens);
            if needed == 0 {
                continue;
            }
            if c.push == 0 {
                return Err(UnschedulableError::InitInfeasible { edge: edge_name(c) });
            }
            fires = fires.max(needed.div_ceil(c.push));
        }
        init.insert(*node, fires);
    }

    // The recurrence runs consumers-first, so every requirement is final by
    // the time its producer is sized; re-check as a guard against a caller
    // passing a non-topological order.
    for c in channels {
        if !inside.contains_key(&c.producer) || !inside.contains_key(&c.consumer) {
            continue;
        }
        let fill = c.initial_tokens + init[&c.producer] * c.push;
        if fill < init[&c.consumer] * c.pop + c.excess_peeks {
            return Err(UnschedulableError::InitInfeasible { edge: edge_name(c) });
        }
    }
    Ok(init)
}

/// Residual channel fills after the init phase: `initial_tokens +
/// init(u)·push − init(d)·pop` per channel. These become the standing buffer
/// prefixes the steady state carries forward.
pub fn init_fills<N: Copy + Ord>(
    channels: &[SchedChannel<N>],
    init: &BTreeMap<N, u64>,
) -> BTreeMap<(N, N), u64> {
    channels
        .iter()
        .map(|c| {
            let produced = init.get(&c.producer).copied().unwrap_or(0) * c.push;
            let consumed = init.get(&c.consumer).copied().unwrap_or(0) * c.pop;
            ((c.producer, c.consumer), c.initial_tokens + produced - consumed)
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identity_pipeline_is_all_ones() {
        let nodes = [0, 1];
        let channels = [SchedChannel::balance(0, 1, 1, 1)];
        let m = solve(&nodes, &channels).unwrap();
        assert_eq!(m[&0], 1);
        assert_eq!(m[&1], 1);
    }

    #[test]
    fn compressor_expander_multiplicities() {
        // src -(1:2)-> comp -(1:1)-> exp
        let nodes = [0, 1, 2];
        let channels =
            [SchedChannel::balance(0, 1, 1, 2), SchedChannel::balance(1, 2, 1, 1)];
        let m = solve(&nodes, &channels).unwrap();
        assert_eq!(m[&0], 2);
        assert_eq!(m[&1], 1);
        assert_eq!(m[&2], 1);
        assert!(balanced(&channels, &m));
    }

    #[test]
    fn single_node_is_trivially_balanced() {
        let m = solve(&[7], &[]).unwrap();
        assert_eq!(m[&7], 1);
    }

    #[test]
    fn inconsistent_splitjoin_rates_fail() {
        // Branches multiply the source rate by 2 and by 3, then merge 1:1.
        let nodes = [0, 1, 2, 3];
        let channels = [
            SchedChannel::balance(0, 1, 1, 1),
            SchedChannel::balance(0, 2, 1, 1),
            SchedChannel::balance(1, 3, 2, 1),
            SchedChannel::balance(2, 3, 3, 1),
        ];
        let err = solve(&nodes, &channels).unwrap_err();
        assert!(matches!(err, UnschedulableError::Inconsistent { .. }));
    }

    #[test]
    fn one_sided_zero_rate_is_rejected() {
        let channels = [SchedChannel::balance(0, 1, 0, 1)];
        let err = solve(&[0, 1], &channels).unwrap_err();
        assert!(matches!(err, UnschedulableError::ZeroRate { .. }));
    }

    #[test]
    fn components_normalize_independently() {
        // Two disjoint pipelines; neither inflates the other's entries.
        let nodes = [0, 1, 2, 3];
        let channels =
            [SchedChannel::balance(0, 1, 3, 1), SchedChannel::balance(2, 3, 1, 5)];
        let m = solve(&nodes, &channels).unwrap();
        assert_eq!((m[&0], m[&1]), (1, 3));
        assert_eq!((m[&2], m[&3]), (5, 1));
    }

    #[test]
    fn init_schedule_covers_lookahead() {
        // id -> moving-sum(window 4): the consumer needs 3 standing tokens.
        let topo = [0, 1];
        let mut ch = SchedChannel::balance(0, 1, 1, 1);
        ch.excess_peeks = 3;
        let init = init_schedule(&topo, &[ch]).unwrap();
        assert_eq!(init[&0], 3);
        assert_eq!(init[&1], 0);
        let fills = init_fills(&[ch], &init);
        assert_eq!(fills[&(0, 1)], 3);
    }

    #[test]
    fn init_schedule_chains_upstream() {
        // a -(push 2)-> b -(pop 1, excess 5)-> c
        let topo = [0, 1, 2];
        let mut bc = SchedChannel::balance(1, 2, 1, 1);
        bc.excess_peeks = 5;
        let ab = SchedChannel::balance(0, 1, 2, 1);
        let init = init_schedule(&topo, &[ab, bc]).unwrap();
        // c: 0; b must fire 5 times; a must cover b's 5 pops with push 2.
        assert_eq!(init[&2], 0);
        assert_eq!(init[&1], 5);
        assert_eq!(init[&0], 3);
        let fills = init_fills(&[ab, bc], &init);
        assert_eq!(fills[&(1, 2)], 5);
        assert_eq!(fills[&(0, 1)], 1); // 3·2 − 5·1
    }

    #[test]
    fn preloaded_tokens_reduce_init_firings() {
        let topo = [0, 1];
        let mut ch = SchedChannel::balance(0, 1, 1, 1);
        ch.excess_peeks = 3;
        ch.initial_tokens = 2;
        let init = init_schedule(&topo, &[ch]).unwrap();
        assert_eq!(init[&0], 1);
    }

    proptest! {
        /// Random pipelines: the solution balances every channel, is
        /// strictly positive, and is normalized (component GCD is 1).
        #[test]
        fn random_pipeline_balance(rates in proptest::collection::vec((1u64..=6, 1u64..=6), 1..8)) {
            let nodes: Vec<usize> = (0..=rates.len()).collect();
            let channels: Vec<SchedChannel<usize>> = rates
                .iter()
                .enumerate()
                .map(|(i, (push, pop))| SchedChannel::balance(i, i + 1, *push, *pop))
                .collect();
            let m = solve(&nodes, &channels).unwrap();
            prop_assert!(balanced(&channels, &m));
            prop_assert!(m.values().all(|&v| v > 0));
            let gcd = m.values().fold(0u64, |acc, v| acc.gcd(v));
            prop_assert_eq!(gcd, 1);
        }

        /// Scheduling is idempotent: aggregating each channel's rates by the
        /// solved multiplicities yields a system whose solution is uniform.
        #[test]
        fn solved_rates_rebalance_to_ones(rates in proptest::collection::vec((1u64..=5, 1u64..=5), 1..6)) {
            let nodes: Vec<usize> = (0..=rates.len()).collect();
            let channels: Vec<SchedChannel<usize>> = rates
                .iter()
                .enumerate()
                .map(|(i, (push, pop))| SchedChannel::balance(i, i + 1, *push, *pop))
                .collect();
            let m = solve(&nodes, &channels).unwrap();
            let scaled: Vec<SchedChannel<usize>> = channels
                .iter()
                .map(|c| SchedChannel::balance(c.producer, c.consumer, c.push * m[&c.producer], c.pop * m[&c.consumer]))
                .collect();
            let again = solve(&nodes, &scaled).unwrap();
            prop_assert!(again.values().all(|&v| v == 1));
        }
    }
}
