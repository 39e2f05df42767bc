//! Demo and worker entry point.
//!
//! Invoked as `demo --worker [--run-id <id>] [--slow]` this process becomes
//! a pool worker; any other invocation runs a small host demo against its
//! own binary. Integration tests exec this binary for their workers.

use anyhow::Result;
use std::time::Duration;
use taskring_pool::{
    run_worker, MockKernel, PoolConfig, RegionConfig, WorkerPool,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Artificial kernel delay selected by `--slow`; models a busy GPU.
const SLOW_KERNEL_DELAY: Duration = Duration::from_millis(25);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("--worker") {
        return worker_main(&args[2..]);
    }
    host_demo()
}

fn worker_main(args: &[String]) -> Result<()> {
    let mut run_id = None;
    let mut slow = false;

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--run-id" => run_id = it.next().cloned(),
            "--slow" => slow = true,
            other => anyhow::bail!("unknown worker argument: {other}"),
        }
    }

    let config = match run_id {
        Some(id) => RegionConfig::for_run(&id),
        None => RegionConfig::default(),
    };
    let kernel = if slow {
        MockKernel::with_delay(SLOW_KERNEL_DELAY)
    } else {
        MockKernel::new()
    };

    run_worker(config, &kernel)?;
    Ok(())
}

fn host_demo() -> Result<()> {
    let exec = std::env::current_exe()?;
    let mut pool = WorkerPool::start(PoolConfig::new(2), &exec)?;

    let task = pool.submit_text("test message")?;
    let resp = task.wait()?;
    info!(
        status = resp.status,
        text = %String::from_utf8_lossy(resp.text_bytes()),
        "text round trip"
    );

    let samples = vec![1000.0 / 32768.0; 401];
    let task = pool.submit_audio(16000, &samples)?;
    let resp = task.wait()?;
    info!(
        status = resp.status,
        mel_len = resp.mel_features().len(),
        processing_us = resp.processing_ns / 1_000,
        "audio round trip"
    );

    info!(metrics = ?pool.metrics(), "demo finished");
    pool.stop();
    Ok(())
}
