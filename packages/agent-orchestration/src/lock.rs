//! Advisory per-resource locks
//!
//! Process-local registry of exclusive/shared locks keyed by resource id
//! (normally a file path). Waiters block on a condition variable (threads)
//! or a `tokio::sync::Notify` (async tasks) until a compatible grant is
//! possible, their timeout elapses, or a blocking lock expires.
//!
//! Invariants:
//! - at most one Exclusive lock per resource at any instant
//! - any number of Shared locks may coexist, never alongside an Exclusive
//! - expired locks are purged on every acquisition attempt
//! - only the recorded owner can release a lock
//!
//! Locks are re-entrant per owner and mode: asking again refreshes the
//! expiry and returns the existing grant.

use agent_state::epoch_now;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Identity of a lock holder
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner(String);

impl LockOwner {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Owner identity of the calling thread in this process
    pub fn current() -> Self {
        Self(format!(
            "pid:{}/thread:{:?}",
            std::process::id(),
            std::thread::current().id()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A granted lock
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLock {
    pub resource_id: String,
    pub mode: LockMode,
    pub owner: LockOwner,
    /// Epoch seconds
    pub acquired_at: f64,
    /// Epoch seconds; past this the lock is abandoned
    pub expires_at: f64,
    deadline: Instant,
}

impl ResourceLock {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<String, Vec<ResourceLock>>,
}

impl LockTable {
    /// Drop expired locks everywhere; returns how many were purged
    fn sweep(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        self.locks.retain(|resource_id, holders| {
            holders.retain(|lock| {
                let expired = lock.is_expired_at(now);
                if expired {
                    purged += 1;
                    warn!(
                        resource = %resource_id,
                        owner = %lock.owner,
                        "purging expired lock"
                    );
                }
                !expired
            });
            !holders.is_empty()
        });
        purged
    }

    fn compatible(&self, resource_id: &str, mode: LockMode) -> bool {
        match self.locks.get(resource_id) {
            None => true,
            Some(holders) => match mode {
                LockMode::Exclusive => holders.is_empty(),
                LockMode::Shared => holders.iter().all(|l| l.mode == LockMode::Shared),
            },
        }
    }

    fn earliest_expiry(&self, resource_id: &str) -> Option<Instant> {
        self.locks
            .get(resource_id)
            .and_then(|holders| holders.iter().map(|l| l.deadline).min())
    }

    fn held_by(
        &mut self,
        resource_id: &str,
        mode: LockMode,
        owner: &LockOwner,
    ) -> Option<&mut ResourceLock> {
        self.locks
            .get_mut(resource_id)?
            .iter_mut()
            .find(|l| l.mode == mode && &l.owner == owner)
    }

    fn grant(
        &mut self,
        resource_id: &str,
        mode: LockMode,
        owner: &LockOwner,
        ttl: Duration,
    ) -> ResourceLock {
        let acquired_at = epoch_now();
        let lock = ResourceLock {
            resource_id: resource_id.to_string(),
            mode,
            owner: owner.clone(),
            acquired_at,
            expires_at: acquired_at + ttl.as_secs_f64(),
            deadline: Instant::now() + ttl,
        };
        self.locks
            .entry(resource_id.to_string())
            .or_default()
            .push(lock.clone());
        lock
    }

    /// Sweep, then grant if possible. Also returns how many expired locks
    /// the sweep purged so the caller can wake other waiters.
    fn try_grant(
        &mut self,
        resource_id: &str,
        mode: LockMode,
        owner: &LockOwner,
        ttl: Duration,
        now: Instant,
    ) -> (Option<ResourceLock>, usize) {
        let purged = self.sweep(now);

        if let Some(existing) = self.held_by(resource_id, mode, owner) {
            let acquired_at = epoch_now();
            existing.expires_at = acquired_at + ttl.as_secs_f64();
            existing.deadline = now + ttl;
            return (Some(existing.clone()), purged);
        }

        if self.compatible(resource_id, mode) {
            return (Some(self.grant(resource_id, mode, owner, ttl)), purged);
        }
        (None, purged)
    }
}

pub struct ResourceLockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    async_released: Notify,
    default_timeout: Duration,
    lock_ttl: Duration,
}

impl Default for ResourceLockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT, DEFAULT_LOCK_TTL)
    }
}

impl ResourceLockManager {
    pub fn new(default_timeout: Duration, lock_ttl: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            async_released: Notify::new(),
            default_timeout,
            lock_ttl,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Acquire for the calling thread; `None` on timeout
    pub fn acquire(
        &self,
        resource_id: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Option<ResourceLock> {
        self.acquire_as(
            resource_id,
            mode,
            timeout.unwrap_or(self.default_timeout),
            &LockOwner::current(),
        )
    }

    pub fn acquire_as(
        &self,
        resource_id: &str,
        mode: LockMode,
        timeout: Duration,
        owner: &LockOwner,
    ) -> Option<ResourceLock> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();

        loop {
            let now = Instant::now();
            let (granted, purged) = table.try_grant(resource_id, mode, owner, self.lock_ttl, now);
            if purged > 0 {
                self.wake_waiters();
            }
            if let Some(lock) = granted {
                debug!(resource = resource_id, ?mode, owner = %owner, "lock acquired");
                return Some(lock);
            }
            if now >= deadline {
                debug!(resource = resource_id, ?mode, owner = %owner, "lock acquisition timed out");
                return None;
            }

            let wake = table
                .earliest_expiry(resource_id)
                .map_or(deadline, |expiry| expiry.min(deadline));
            self.released.wait_until(&mut table, wake);
        }
    }

    /// Grant immediately or not at all
    pub fn try_acquire_as(
        &self,
        resource_id: &str,
        mode: LockMode,
        owner: &LockOwner,
    ) -> Option<ResourceLock> {
        let mut table = self.table.lock();
        let (granted, purged) =
            table.try_grant(resource_id, mode, owner, self.lock_ttl, Instant::now());
        if purged > 0 {
            self.wake_waiters();
        }
        granted
    }

    /// Async acquisition: suspends the task instead of blocking the thread
    pub async fn acquire_async_as(
        &self,
        resource_id: &str,
        mode: LockMode,
        timeout: Duration,
        owner: &LockOwner,
    ) -> Option<ResourceLock> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a release in between is not lost
            let notified = self.async_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = {
                let mut table = self.table.lock();
                let now = Instant::now();
                let (granted, purged) =
                    table.try_grant(resource_id, mode, owner, self.lock_ttl, now);
                if purged > 0 {
                    self.wake_waiters();
                }
                if let Some(lock) = granted {
                    debug!(resource = resource_id, ?mode, owner = %owner, "lock acquired");
                    return Some(lock);
                }
                if now >= deadline {
                    debug!(
                        resource = resource_id,
                        ?mode,
                        owner = %owner,
                        "lock acquisition timed out"
                    );
                    return None;
                }
                table
                    .earliest_expiry(resource_id)
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
            }
        }
    }

    /// Release the calling thread's lock on `resource_id`
    pub fn release(&self, resource_id: &str) -> bool {
        self.release_as(resource_id, &LockOwner::current())
    }

    /// Release `owner`'s lock; false if `owner` holds none on `resource_id`
    pub fn release_as(&self, resource_id: &str, owner: &LockOwner) -> bool {
        let mut table = self.table.lock();
        let Some(holders) = table.locks.get_mut(resource_id) else {
            return false;
        };
        let Some(pos) = holders.iter().position(|l| &l.owner == owner) else {
            debug!(resource = resource_id, owner = %owner, "release refused: not the owner");
            return false;
        };

        holders.remove(pos);
        if holders.is_empty() {
            table.locks.remove(resource_id);
        }
        drop(table);

        debug!(resource = resource_id, owner = %owner, "lock released");
        self.wake_waiters();
        true
    }

    /// Purge expired locks now; returns the number purged
    pub fn sweep_expired(&self) -> usize {
        let purged = self.table.lock().sweep(Instant::now());
        if purged > 0 {
            self.wake_waiters();
        }
        purged
    }

    pub fn is_locked(&self, resource_id: &str) -> bool {
        let now = Instant::now();
        self.table
            .lock()
            .locks
            .get(resource_id)
            .is_some_and(|holders| holders.iter().any(|l| !l.is_expired_at(now)))
    }

    pub fn holders(&self, resource_id: &str) -> Vec<ResourceLock> {
        self.table
            .lock()
            .locks
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_count(&self) -> usize {
        self.table.lock().locks.values().map(Vec::len).sum()
    }

    fn wake_waiters(&self) {
        self.released.notify_all();
        self.async_released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn manager() -> ResourceLockManager {
        ResourceLockManager::new(Duration::from_millis(200), Duration::from_secs(60))
    }

    #[test]
    fn test_shared_locks_coexist() {
        let mgr = manager();
        let a = LockOwner::new("a");
        let b = LockOwner::new("b");

        let l1 = mgr.acquire_as("f.py", LockMode::Shared, Duration::ZERO, &a);
        let l2 = mgr.acquire_as("f.py", LockMode::Shared, Duration::ZERO, &b);

        assert!(l1.is_some());
        assert!(l2.is_some());
        assert_eq!(mgr.holders("f.py").len(), 2);
    }

    #[test]
    fn test_exclusive_blocked_by_shared_times_out() {
        let mgr = manager();
        let reader = LockOwner::new("reader");
        let writer = LockOwner::new("writer");
        mgr.acquire_as("f.py", LockMode::Shared, Duration::ZERO, &reader)
            .unwrap();

        let start = Instant::now();
        let res = mgr.acquire_as("f.py", LockMode::Exclusive, Duration::from_millis(50), &writer);
        assert!(res.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_shared_blocked_by_exclusive() {
        let mgr = manager();
        mgr.acquire_as("f", LockMode::Exclusive, Duration::ZERO, &LockOwner::new("w"))
            .unwrap();
        assert!(mgr
            .try_acquire_as("f", LockMode::Shared, &LockOwner::new("r"))
            .is_none());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let mgr = Arc::new(manager());
        let holder = LockOwner::new("holder");
        mgr.acquire_as("f.py", LockMode::Exclusive, Duration::ZERO, &holder)
            .unwrap();

        let releaser = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                assert!(mgr.release_as("f.py", &holder));
            })
        };

        let start = Instant::now();
        let lock = mgr.acquire_as(
            "f.py",
            LockMode::Exclusive,
            Duration::from_secs(5),
            &LockOwner::new("waiter"),
        );
        releaser.join().unwrap();

        assert!(lock.is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_non_owner_release_is_refused() {
        let mgr = manager();
        let owner = LockOwner::new("owner");
        mgr.acquire_as("f.py", LockMode::Exclusive, Duration::ZERO, &owner)
            .unwrap();

        assert!(!mgr.release_as("f.py", &LockOwner::new("intruder")));
        assert!(mgr.is_locked("f.py"));
        assert!(mgr.release_as("f.py", &owner));
        assert!(!mgr.is_locked("f.py"));
    }

    #[test]
    fn test_release_uses_thread_identity() {
        let mgr = Arc::new(manager());
        assert!(mgr.acquire("g.py", LockMode::Exclusive, None).is_some());

        let other = Arc::clone(&mgr);
        let released_elsewhere = thread::spawn(move || other.release("g.py"))
            .join()
            .unwrap();
        assert!(!released_elsewhere);
        assert!(mgr.release("g.py"));
    }

    #[test]
    fn test_expired_lock_is_purged_for_waiter() {
        let mgr = ResourceLockManager::new(Duration::from_secs(1), Duration::from_millis(40));
        mgr.acquire_as("f", LockMode::Exclusive, Duration::ZERO, &LockOwner::new("crashed"))
            .unwrap();

        let start = Instant::now();
        let lock = mgr.acquire_as(
            "f",
            LockMode::Exclusive,
            Duration::from_secs(2),
            &LockOwner::new("next"),
        );
        assert!(lock.is_some());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(mgr.holders("f").len(), 1);
        assert_eq!(mgr.holders("f")[0].owner, LockOwner::new("next"));
    }

    #[test]
    fn test_reentrant_refresh() {
        let mgr = manager();
        let owner = LockOwner::new("me");
        let first = mgr
            .acquire_as("f", LockMode::Exclusive, Duration::ZERO, &owner)
            .unwrap();
        let second = mgr
            .acquire_as("f", LockMode::Exclusive, Duration::ZERO, &owner)
            .unwrap();

        assert!(second.expires_at >= first.expires_at);
        assert_eq!(mgr.active_count(), 1);
    }

    #[test]
    fn test_exclusive_never_held_twice() {
        let mgr = Arc::new(ResourceLockManager::new(
            Duration::from_secs(10),
            Duration::from_secs(60),
        ));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let mgr = Arc::clone(&mgr);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let owner = LockOwner::new(format!("t{}", t));
                    for _ in 0..25 {
                        mgr.acquire_as("hot", LockMode::Exclusive, Duration::from_secs(10), &owner)
                            .unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        assert!(mgr.release_as("hot", &owner));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn test_async_waiter_wakes_on_release() {
        let mgr = Arc::new(manager());
        let holder = LockOwner::new("holder");
        mgr.acquire_as("f", LockMode::Exclusive, Duration::ZERO, &holder)
            .unwrap();

        let releaser = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                mgr.release_as("f", &holder)
            })
        };

        let lock = mgr
            .acquire_async_as(
                "f",
                LockMode::Exclusive,
                Duration::from_secs(5),
                &LockOwner::new("task"),
            )
            .await;
        assert!(releaser.await.unwrap());
        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn test_async_timeout() {
        let mgr = manager();
        mgr.acquire_as("f", LockMode::Exclusive, Duration::ZERO, &LockOwner::new("a"))
            .unwrap();
        let lock = mgr
            .acquire_async_as(
                "f",
                LockMode::Exclusive,
                Duration::from_millis(30),
                &LockOwner::new("b"),
            )
            .await;
        assert!(lock.is_none());
    }
}
