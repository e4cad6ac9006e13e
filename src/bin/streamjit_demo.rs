//! Seed-graph runner
//!
//! Compiles one of the built-in seed graphs, prints the computed schedules
//! and buffer sizing, then executes the stream twice — once through the
//! compiled blobs, once through the pull interpreter — and compares the
//! outputs.
//!
//! Usage:
//!   streamjit_demo [--graph identity|mirror|compexp|movingsum]
//!                  [--input 1,2,3,...] [--multiplier N] [--cores N]
//!
//! Set `RUST_LOG=streamjit=debug` to watch the compile phases and blob
//! lifecycle transitions.

#![forbid(unsafe_code)]

use std::env;

use tracing_subscriber::EnvFilter;

use streamjit::api::{self, seeds};
use streamjit::config::{names, Configuration};
use streamjit::{compiler, Item};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn parse_items(s: &str) -> anyhow::Result<Vec<Item>> {
    s.split([',', ' '])
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<Item>().map_err(|e| anyhow::anyhow!("bad item `{t}`: {e}")))
        .collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let graph_name = parse_flag(&args, "--graph").unwrap_or_else(|| "identity".to_string());
    let multiplier: i64 = parse_flag(&args, "--multiplier").map_or(Ok(1), |s| s.parse())?;
    let cores: i64 = parse_flag(&args, "--cores").map_or(Ok(1), |s| s.parse())?;
    let input = match parse_flag(&args, "--input") {
        Some(s) => parse_items(&s)?,
        None => (1..=16).collect(),
    };

    let element = seeds::by_name(&graph_name)
        .ok_or_else(|| anyhow::anyhow!("unknown graph `{graph_name}` (try identity, mirror, compexp, movingsum)"))?;

    let cfg = Configuration::builder()
        .add_int(names::MULTIPLIER, 1, i64::MAX, multiplier.max(1))?
        .add_int(names::MAX_NUM_CORES, 1, 64, cores.clamp(1, 64))?
        .build();

    // Compile once for inspection, printing the plan the runtime will follow.
    let lowered = seeds::by_name(&graph_name).expect("same name").lower()?;
    let plan = compiler::compile(&lowered, &cfg)?;
    println!("graph `{graph_name}`: {} blob(s), multiplier {}", plan.plans.len(), plan.multiplier);
    for blob in &plan.plans {
        println!(
            "  {} on {}: workers {:?}, {} firing(s) per steady state over {} core slot(s)",
            blob.id,
            blob.machine,
            blob.workers.iter().map(|w| w.as_usize()).collect::<Vec<_>>(),
            blob.external_multiplicity,
            blob.core_firings.len(),
        );
        for (w, m) in &blob.internal_schedule {
            println!("    {w}: x{m}");
        }
        for (token, data) in &blob.buffers {
            let capacity = data
                .capacity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unbounded".to_string());
            println!(
                "    buffer {token}: capacity {capacity}, initial {}, excess peeks {}",
                data.initial_size, data.excess_peeks
            );
        }
    }

    let compiled_out = api::compile(seeds::by_name(&graph_name).expect("same name"), &cfg)?
        .run_to_completion(&input)?;
    let interp_out = api::interpret(element, &input)?;

    println!("input:       {input:?}");
    println!("compiled:    {compiled_out:?}");
    println!("interpreted: {interp_out:?}");
    if compiled_out == interp_out {
        println!("outputs agree");
    } else {
        anyhow::bail!("compiled and interpreted outputs diverge");
    }
    Ok(())
}
