//! Resource lock behavior under contention

use agent_orchestration::{
    worker_fn, LockMode, LockOwner, ResourceLockManager, TaskRunner, WorkOutput,
};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_exclusive_lock_admits_one_holder_at_a_time() {
    let locks = Arc::new(ResourceLockManager::new(
        Duration::from_secs(10),
        Duration::from_secs(60),
    ));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            thread::spawn(move || {
                let owner = LockOwner::new(format!("thread-{}", i));
                for _ in 0..5 {
                    locks
                        .acquire_as(
                            "shared.txt",
                            LockMode::Exclusive,
                            Duration::from_secs(10),
                            &owner,
                        )
                        .expect("lock within timeout");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    assert!(locks.release_as("shared.txt", &owner));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(locks.active_count(), 0);
}

#[test]
fn test_shared_holders_block_exclusive() {
    let locks = ResourceLockManager::default();
    let reader_a = LockOwner::new("reader-a");
    let reader_b = LockOwner::new("reader-b");
    let writer = LockOwner::new("writer");

    assert!(locks.try_acquire_as("doc", LockMode::Shared, &reader_a).is_some());
    assert!(locks.try_acquire_as("doc", LockMode::Shared, &reader_b).is_some());
    assert!(locks.try_acquire_as("doc", LockMode::Exclusive, &writer).is_none());
    assert_eq!(locks.holders("doc").len(), 2);

    // Only the owner can release
    assert!(!locks.release_as("doc", &writer));
    assert!(locks.release_as("doc", &reader_a));
    assert!(locks.release_as("doc", &reader_b));
    assert!(locks.try_acquire_as("doc", LockMode::Exclusive, &writer).is_some());
}

#[test]
fn test_waiter_wakes_when_holder_releases() {
    let locks = Arc::new(ResourceLockManager::default());
    let holder = LockOwner::new("holder");
    locks
        .try_acquire_as("res", LockMode::Exclusive, &holder)
        .unwrap();

    let waiter = {
        let locks = Arc::clone(&locks);
        thread::spawn(move || {
            locks
                .acquire_as(
                    "res",
                    LockMode::Exclusive,
                    Duration::from_secs(5),
                    &LockOwner::new("waiter"),
                )
                .is_some()
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(locks.release_as("res", &holder));
    assert!(waiter.join().unwrap());
}

#[test]
fn test_expired_lock_is_reclaimed() {
    let locks = ResourceLockManager::new(Duration::from_secs(1), Duration::from_millis(30));
    let stale = LockOwner::new("crashed-worker");
    locks
        .try_acquire_as("res", LockMode::Exclusive, &stale)
        .unwrap();

    thread::sleep(Duration::from_millis(60));
    assert!(!locks.is_locked("res"));
    assert!(locks
        .try_acquire_as("res", LockMode::Exclusive, &LockOwner::new("fresh"))
        .is_some());
}

#[test]
fn test_runner_skips_item_held_elsewhere_and_retries_next_run() {
    let dir = TempDir::new().unwrap();
    let files: Vec<_> = ["one.txt", "two.txt", "three.txt"]
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            fs::write(&path, name).unwrap();
            path
        })
        .collect();

    let locks = Arc::new(ResourceLockManager::default());
    let outsider = LockOwner::new("another-process");
    let held = files[1].to_string_lossy().into_owned();
    locks
        .try_acquire_as(&held, LockMode::Exclusive, &outsider)
        .unwrap();

    let runner = TaskRunner::builder()
        .lock_manager(Arc::clone(&locks))
        .lock_timeout(Duration::from_millis(50))
        .build();
    let calls = AtomicUsize::new(0);
    let worker = worker_fn(|_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(WorkOutput::unchanged())
    });

    let summary = runner.run(&files, &worker).unwrap();
    assert_eq!(summary.successful, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.metrics.lock_timeouts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // Run-owned locks are all released; the outsider's survives
    assert_eq!(locks.active_count(), 1);

    assert!(locks.release_as(&held, &outsider));
    let retry = runner.run(&files, &worker).unwrap();
    assert_eq!(retry.processed, 1);
    assert_eq!(retry.results[0].identity, held);
}
