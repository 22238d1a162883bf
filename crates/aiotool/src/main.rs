//! Async I/O command-line tool
//!
//! Drives batched operations through the scheduler against the in-memory
//! store and reports how they completed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use aioconfig::ConfFile;
use aiocore::{
    Callback, CompareOp, Completion, CompletionEvent, Failure, MemStore, MemStoreConfig,
    ObjectAddress, Objecter, ObjecterConfig, Operation, OperationFlags, Phase,
};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aiotool")]
#[command(about = "Batched async object operations against an in-memory store", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, env = "AIO_CONF", default_value = "/etc/aio/aio.conf")]
    conf: String,

    /// Override a configuration option (key=value, repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit batches and report how they completed
    Bench {
        /// Number of operations to submit
        #[arg(long, default_value = "100")]
        ops: usize,
        /// Sub-operations per batch
        #[arg(long, default_value = "4")]
        batch: usize,
        /// Bytes written by each sub-operation
        #[arg(long, default_value = "4096")]
        size: usize,
        /// Pool to write into
        #[arg(long, default_value = "1")]
        pool: u64,
        /// Abort the rest of a batch when a sub-operation fails
        #[arg(long)]
        ordered: bool,
        /// Replace this sub-operation index with a guard that always fails
        #[arg(long)]
        fail_index: Option<usize>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

/// Outcome of a bench run
#[derive(Debug, Serialize)]
struct BenchReport {
    ops: usize,
    batch: usize,
    ordered: bool,
    fail_index: Option<usize>,
    submitted_callbacks: usize,
    durable_callbacks: usize,
    phases: BTreeMap<String, usize>,
    failed_subops: usize,
    aborted_subops: usize,
    bytes_written: u64,
    first_failure: Option<Failure>,
    elapsed_ms: f64,
    ops_per_sec: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let conf = load_conf(&cli.conf, &cli.overrides)?;
    let objecter_config = ObjecterConfig::load(&conf).context("Invalid scheduler configuration")?;
    let store_config = MemStoreConfig::load(&conf).context("Invalid store configuration")?;

    match cli.command {
        Commands::Bench {
            ops,
            batch,
            size,
            pool,
            ordered,
            fail_index,
            json,
        } => {
            if batch == 0 {
                return Err(anyhow!("--batch must be at least 1"));
            }
            if let Some(index) = fail_index {
                if index >= batch {
                    return Err(anyhow!(
                        "--fail-index {} is outside a batch of {}",
                        index,
                        batch
                    ));
                }
            }

            let store = Arc::new(MemStore::new(&store_config));
            let objecter =
                Objecter::new(store, &objecter_config).context("Failed to create scheduler")?;
            let report = bench(&objecter, ops, batch, size, pool, ordered, fail_index).await?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to encode report")?
                );
            } else {
                print_report(&report);
            }
        }
        Commands::Config => {
            println!("{:#?}", objecter_config);
            println!("{:#?}", store_config);
        }
    }

    Ok(())
}

/// Read the configuration file if present, then apply overrides
fn load_conf(path: &str, overrides: &[String]) -> Result<ConfFile> {
    let mut conf = if Path::new(path).exists() {
        debug!("Loading configuration from: {}", path);
        ConfFile::from_file(path).with_context(|| format!("Failed to parse {}", path))?
    } else {
        debug!("Configuration file not found: {}", path);
        ConfFile::default()
    };
    for assignment in overrides {
        conf.apply_override(assignment)
            .with_context(|| format!("Bad override: {}", assignment))?;
    }
    Ok(conf)
}

fn build_op(
    pool: u64,
    i: usize,
    batch: usize,
    chunk: &Bytes,
    ordered: bool,
    fail_index: Option<usize>,
) -> Result<Operation> {
    let mut op = Operation::new_write(ObjectAddress::new(pool, format!("bench_{}", i)));
    for j in 0..batch {
        if fail_index == Some(j) {
            op.cmpxattr("bench.missing", CompareOp::Eq, Bytes::new())?;
        } else {
            op.write((j * chunk.len()) as u64, chunk.clone())?;
        }
    }
    if ordered {
        op.set_flags(OperationFlags::ORDERED)?;
    }
    Ok(op)
}

fn counter(count: &Arc<AtomicUsize>) -> Callback {
    let count = count.clone();
    Box::new(move |_: &CompletionEvent| {
        count.fetch_add(1, Ordering::Relaxed);
    })
}

async fn bench(
    objecter: &Objecter,
    ops: usize,
    batch: usize,
    size: usize,
    pool: u64,
    ordered: bool,
    fail_index: Option<usize>,
) -> Result<BenchReport> {
    info!(
        "bench: {} ops x {} sub-ops of {} bytes, ordered={}, fail_index={:?}",
        ops, batch, size, ordered, fail_index
    );
    let chunk = Bytes::from(vec![0xa5u8; size]);
    let submitted = Arc::new(AtomicUsize::new(0));
    let durable = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut completions: Vec<Completion> = Vec::with_capacity(ops);
    for i in 0..ops {
        let mut op = build_op(pool, i, batch, &chunk, ordered, fail_index)?;
        let completion =
            objecter.create_completion(Some(counter(&submitted)), Some(counter(&durable)));
        objecter
            .submit(&mut op, &completion)
            .with_context(|| format!("Failed to submit operation {}", i))?;
        completions.push(completion);
    }

    let mut phases = BTreeMap::new();
    let mut failed_subops = 0;
    let mut aborted_subops = 0;
    let mut bytes_written = 0;
    let mut first_failure = None;
    for completion in &completions {
        let phase = completion
            .wait_for_phase_and_callback(Phase::Durable)
            .await
            .context("Lost track of a completion")?;
        *phases.entry(phase.to_string()).or_insert(0) += 1;

        if let Some(failure) = completion.failure()? {
            if first_failure.is_none() {
                warn!("completion {} failed: {:?}", completion.id(), failure);
                first_failure = Some(failure);
            }
        }
        if let Ok(results) = completion.results() {
            for result in &results {
                if result.aborted {
                    aborted_subops += 1;
                } else if !result.is_ok() {
                    failed_subops += 1;
                }
                bytes_written += result.bytes_transferred.unwrap_or(0);
            }
        }
        completion.release()?;
    }
    objecter.flush().await;

    let elapsed = start.elapsed();
    Ok(BenchReport {
        ops,
        batch,
        ordered,
        fail_index,
        submitted_callbacks: submitted.load(Ordering::Relaxed),
        durable_callbacks: durable.load(Ordering::Relaxed),
        phases,
        failed_subops,
        aborted_subops,
        bytes_written,
        first_failure,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        ops_per_sec: ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    })
}

fn print_report(report: &BenchReport) {
    println!(
        "{} ops x {} sub-ops in {:.1} ms ({:.0} ops/s)",
        report.ops, report.batch, report.elapsed_ms, report.ops_per_sec
    );
    for (phase, count) in &report.phases {
        println!("  {:<10} {}", phase, count);
    }
    println!(
        "  callbacks  submitted={} durable={}",
        report.submitted_callbacks, report.durable_callbacks
    );
    println!(
        "  sub-ops    failed={} aborted={}",
        report.failed_subops, report.aborted_subops
    );
    println!("  written    {} bytes", report.bytes_written);
    if let Some(failure) = &report.first_failure {
        println!("  first failure: {:?}", failure);
    }
}
