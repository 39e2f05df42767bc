//! End-to-end tests with real forked worker processes.
//!
//! Workers are the `demo` binary of this crate re-executed with `--worker`;
//! every test gets its own run id so regions never collide across the test
//! harness's threads.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use taskring_pool::{PoolConfig, PoolError, TaskError, WorkerPool};

fn demo_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_demo"))
}

fn unique_config(workers: usize) -> PoolConfig {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let id = SEQ.fetch_add(1, Ordering::Relaxed);
    PoolConfig::new(workers).with_run_id(format!("pooltest-{}-{id}", std::process::id()))
}

fn reversed(input: &str) -> Vec<u8> {
    input.bytes().rev().collect()
}

#[test]
fn text_round_trip() {
    let mut pool = WorkerPool::start(unique_config(2), &demo_bin()).unwrap();

    let task = pool.submit_text("test message").unwrap();
    let resp = task.wait().unwrap();

    assert!(resp.is_success());
    assert_eq!(resp.text_bytes(), b"egassem tset");
    assert_eq!(resp.len, 12);
    pool.stop();
}

#[test]
fn audio_mock_round_trip() {
    let mut pool = WorkerPool::start(unique_config(2), &demo_bin()).unwrap();

    let samples = vec![1000.0 / 32768.0; 401];
    let task = pool.submit_audio(16000, &samples).unwrap();
    let resp = task.wait().unwrap();

    assert!(resp.is_success());
    assert_eq!(resp.len, 200);
    assert_eq!(resp.mel_features().len(), 200);
    assert!(resp.mel_features().iter().all(|&v| v == 0.5));
    pool.stop();
}

#[test]
fn concurrent_fan_out_completes_every_task_once() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 125;

    let mut pool = WorkerPool::start(unique_config(4), &demo_bin()).unwrap();
    let completed = Mutex::new(HashSet::new());

    thread::scope(|s| {
        for t in 0..THREADS {
            let pool = &pool;
            let completed = &completed;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let text = format!("msg-{}", t * PER_THREAD + i);
                    // Back off on saturation; the workers are draining.
                    let task = loop {
                        match pool.submit_text(&text) {
                            Ok(task) => break task,
                            Err(PoolError::QueueFull) => thread::yield_now(),
                            Err(other) => panic!("submit failed: {other}"),
                        }
                    };
                    let task_id = task.task_id();
                    let resp = task.wait().unwrap();
                    assert!(resp.is_success());
                    assert_eq!(resp.text_bytes(), reversed(&text));
                    assert!(
                        completed.lock().unwrap().insert(task_id),
                        "task {task_id} completed twice"
                    );
                }
            });
        }
    });

    let completed = completed.into_inner().unwrap();
    assert_eq!(completed.len(), THREADS * PER_THREAD);
    // Ids are assigned monotonically from 1 and every one came back.
    assert_eq!(
        completed,
        (1..=(THREADS * PER_THREAD) as u64).collect::<HashSet<_>>()
    );

    let metrics = pool.metrics();
    assert_eq!(metrics.completed, (THREADS * PER_THREAD) as u64);
    assert_eq!(metrics.orphans, 0);
    pool.stop();
}

#[test]
fn saturation_rejects_then_all_accepted_complete() {
    // Slow workers so the ring genuinely fills.
    let config = unique_config(2).with_worker_arg("--slow");
    let mut pool = WorkerPool::start(config, &demo_bin()).unwrap();

    let mut accepted = Vec::new();
    let mut saw_queue_full = false;
    for i in 0..5000 {
        match pool.submit_text(&format!("sat-{i}")) {
            Ok(task) => accepted.push(task),
            Err(PoolError::QueueFull) => {
                saw_queue_full = true;
                break;
            }
            Err(other) => panic!("submit failed: {other}"),
        }
    }
    assert!(saw_queue_full, "ring never saturated");
    assert!(pool.metrics().queue_full >= 1);

    // Everything that was accepted must still complete once the workers
    // grind through the backlog.
    let total = accepted.len() as u64;
    for task in accepted {
        let resp = task.wait().unwrap();
        assert!(resp.is_success());
    }
    assert_eq!(pool.metrics().completed, total);
    assert_eq!(pool.metrics().orphans, 0);
    pool.stop();
}

#[test]
fn graceful_shutdown_mid_flight() {
    let config = unique_config(2).with_worker_arg("--slow");
    let mut pool = WorkerPool::start(config, &demo_bin()).unwrap();

    let handles: Vec<_> = (0..50)
        .map(|i| pool.submit_text(&format!("flight-{i}")).unwrap())
        .collect();

    // Stop immediately: children are reaped, the drain thread is joined,
    // and whatever did not complete is failed, not leaked.
    pool.stop();
    assert_eq!(pool.worker_count(), 0);

    for task in handles {
        match task.wait() {
            Ok(resp) => assert!(resp.is_success()),
            Err(TaskError::WorkerCrash) => {}
            Err(other) => panic!("unexpected task error: {other}"),
        }
    }
    assert_eq!(pool.pending_tasks(), 0);

    assert!(matches!(
        pool.submit_text("after stop"),
        Err(PoolError::Stopped)
    ));
}

#[test]
fn crash_resilience_survives_a_killed_worker() {
    let mut pool = WorkerPool::start(unique_config(2), &demo_bin()).unwrap();
    assert_eq!(pool.worker_count(), 2);

    // Kill one idle worker outright.
    let victim = pool.worker_pids()[0];
    // SAFETY: victim is a child this pool forked.
    unsafe {
        libc::kill(victim, libc::SIGKILL);
    }
    thread::sleep(Duration::from_millis(100));

    // The survivor keeps draining the queue.
    let handles: Vec<_> = (0..20)
        .map(|i| pool.submit_text(&format!("alive-{i}")).unwrap())
        .collect();
    for task in handles {
        assert!(task.wait().unwrap().is_success());
    }

    // The watchdog sweep replaces the dead child.
    assert_eq!(pool.revive_crashed(), 1);
    assert_eq!(pool.worker_count(), 2);

    let task = pool.submit_text("post-revival").unwrap();
    assert_eq!(task.wait().unwrap().text_bytes(), b"laviver-tsop");

    pool.stop();
    assert_eq!(pool.worker_count(), 0);
}

#[test]
fn shutdown_one_contracts_without_replacement() {
    let mut pool = WorkerPool::start(unique_config(2), &demo_bin()).unwrap();

    pool.shutdown_one().unwrap();
    thread::sleep(Duration::from_millis(300));

    // A clean exit is contraction, not a crash; nothing is replaced.
    assert_eq!(pool.revive_crashed(), 0);
    assert_eq!(pool.worker_count(), 1);

    let task = pool.submit_text("still here").unwrap();
    assert_eq!(task.wait().unwrap().text_bytes(), b"ereh llits");
    pool.stop();
}

#[test]
fn start_rejects_oversized_pools() {
    let err = WorkerPool::start(unique_config(taskring_pool::MAX_WORKERS + 1), &demo_bin())
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, PoolError::TooManyWorkers { .. }));
}
