// src/lib.rs

pub mod blob;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod pool;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blob::LocalBlobSynchroniser;
use crate::cli::CliArgs;
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::dag::SpecDescriptorFactory;
use crate::engine::{
    GraphExecutor, JobCompletionStatus, JobResponse, OutputStream, ResponseSink,
    TaskCompletionStatus,
};
use crate::exec::{ExecutionManager, TokioProcessExecutor};
use crate::pool::{LocalWorkerCoreProvider, WorkerPool};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - job loading and validation
/// - the worker pool with a local core provider
/// - the graph executor
/// - response printing
/// - Ctrl-C handling (treated as caller cancellation)
///
/// Returns whether the job succeeded.
pub async fn run(args: CliArgs) -> Result<bool> {
    let job_path = PathBuf::from(&args.job);
    let cfg = load_and_validate(&job_path)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(true);
    }

    let graph = cfg.build_graph()?;
    let recovery = cfg.recovery_policy();
    let tool_cache_dir = cfg.tool_cache_dir();
    let local_cores = args
        .local_cores
        .map(|n| n as usize)
        .unwrap_or(cfg.config.local_cores);

    // Worker side: local cores run requests through the execution manager.
    let manager = Arc::new(
        ExecutionManager::new(Arc::new(TokioProcessExecutor), tool_cache_dir.clone())
            .with_transient_exit(recovery.transient_exit()),
    );
    let pool = Arc::new(WorkerPool::new());
    pool.add_provider(Arc::new(LocalWorkerCoreProvider::new(
        "local",
        local_cores,
        manager,
    )));
    info!(local_cores, "worker pool ready");

    let executor = GraphExecutor::new(
        Arc::clone(&pool),
        Arc::new(SpecDescriptorFactory),
        Arc::new(LocalBlobSynchroniser::new(tool_cache_dir)),
    )
    .with_recovery(recovery)
    .with_options(cfg.engine_options());

    // Ctrl-C → caller cancellation.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; cancelling job");
            cancel.cancel();
        });
    }

    let (sink, rx) = ResponseSink::channel();
    let printer = tokio::spawn(print_responses(rx, args.json));

    let status = executor.execute(graph, sink, cancel).await;
    drop(executor);
    printer.await?;

    let status = status?;
    debug!(?status, statistics = ?pool.statistics(), "job finished");
    Ok(status == JobCompletionStatus::Success)
}

async fn print_responses(mut rx: mpsc::UnboundedReceiver<JobResponse>, json: bool) {
    while let Some(response) = rx.recv().await {
        if json {
            match serde_json::to_string(&response) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to serialise job response"),
            }
        } else {
            print_human(&response);
        }
    }
}

fn print_human(response: &JobResponse) {
    match response {
        JobResponse::JobParsed { total_tasks } => println!("corefarm: {total_tasks} tasks"),
        JobResponse::TaskStarted {
            caption,
            worker: Some(worker),
            ..
        } => println!("[start] {caption} on {worker}"),
        JobResponse::TaskStarted { .. } => {}
        JobResponse::TaskOutput {
            task,
            stream: OutputStream::Stdout,
            line,
        } => println!("  {task} | {line}"),
        JobResponse::TaskOutput {
            task,
            stream: OutputStream::Stderr,
            line,
        } => eprintln!("  {task} ! {line}"),
        JobResponse::TaskCompleted {
            task,
            status,
            exit_code,
            exception_message,
            total_seconds,
            ..
        } => match status {
            TaskCompletionStatus::Success => println!("[ok] {task} ({total_seconds:.2}s)"),
            TaskCompletionStatus::Failure => {
                println!("[FAILED] {task} (exit code {})", exit_code.unwrap_or(-1))
            }
            TaskCompletionStatus::Cancelled => match exception_message {
                Some(message) => println!("[cancelled] {task}: {message}"),
                None => println!("[cancelled] {task}"),
            },
            TaskCompletionStatus::Exception => println!(
                "[error] {task}: {}",
                exception_message.as_deref().unwrap_or("unknown error")
            ),
        },
        JobResponse::JobComplete {
            status,
            total_seconds,
            exception_message,
            statistics,
        } => {
            println!(
                "job {status:?} in {total_seconds:.2}s ({} tasks)",
                statistics.total
            );
            if let Some(message) = exception_message {
                println!("  {message}");
            }
        }
        JobResponse::TaskPreparing { .. }
        | JobResponse::TaskPrepared { .. }
        | JobResponse::TaskPhaseChange { .. } => {}
    }
}

/// Simple dry-run output: print settings, tasks and dependencies.
fn print_dry_run(cfg: &ConfigFile) {
    println!("corefarm dry-run");
    println!("  config.local_cores = {}", cfg.config.local_cores);
    println!("  config.stall_threshold = {:?}", cfg.config.stall_threshold);
    println!(
        "  config.fast_local_core_timeout = {:?}",
        cfg.config.fast_local_core_timeout
    );
    println!("  config.auto_recover rules = {}", cfg.config.auto_recover.len());
    println!();

    println!("tasks ({}):", cfg.task.len());
    for (name, task) in cfg.task.iter() {
        println!("  - {name} ({:?})", task.kind);
        if let Some(ref caption) = task.caption {
            println!("      caption: {caption}");
        }
        if let Some(ref tool) = task.tool {
            println!("      tool: {} {}", tool.display(), task.args.join(" "));
        }
        if let (Some(from), Some(to)) = (&task.copy_from, &task.copy_to) {
            println!("      copy: {} -> {}", from.display(), to.display());
        }
        if task.remotable {
            println!("      remotable: true");
        }
        if !task.after.is_empty() {
            println!("      after: {:?}", task.after);
        }
    }

    debug!("dry-run complete (no execution)");
}
