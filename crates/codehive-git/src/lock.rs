//! TTL-based exclusive branch locks
//!
//! Locks are soft leases held in process: acquiring never blocks, and an
//! expired lock is simply replaced by the next caller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use codehive_core::{Clock, CodehiveError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchLock {
    pub branch: String,
    pub holder: String,
    pub cycle_id: String,
    /// Milliseconds since the Unix epoch
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl BranchLock {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at
    }
}

pub struct LockTable {
    locks: Mutex<HashMap<String, BranchLock>>,
    clock: Arc<dyn Clock>,
    ttl_millis: i64,
}

impl LockTable {
    pub fn new(clock: Arc<dyn Clock>, ttl_millis: i64) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            clock,
            ttl_millis,
        }
    }

    /// Take the lock unless another unexpired lease exists
    pub fn acquire(&self, cycle_id: &str, branch: &str, holder: &str) -> bool {
        let now = self.clock.now_millis();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = locks.get(branch) {
            if !existing.is_expired(now) {
                debug!(
                    "Lock on {} still held by cycle {} until {}",
                    branch, existing.cycle_id, existing.expires_at
                );
                return false;
            }
            info!("Replacing expired lock on {} (cycle {})", branch, existing.cycle_id);
        }

        locks.insert(
            branch.to_string(),
            BranchLock {
                branch: branch.to_string(),
                holder: holder.to_string(),
                cycle_id: cycle_id.to_string(),
                acquired_at: now,
                expires_at: now + self.ttl_millis,
            },
        );
        true
    }

    /// Drop the lock regardless of who holds it
    pub fn release(&self, branch: &str) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(branch)
            .is_some()
    }

    /// Current unexpired lease on `branch`
    pub fn holder(&self, branch: &str) -> Option<BranchLock> {
        let now = self.clock.now_millis();
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(branch)
            .filter(|lock| !lock.is_expired(now))
            .cloned()
    }

    /// Fail when another cycle holds an unexpired lease on `branch`
    pub fn check_access(&self, cycle_id: &str, branch: &str) -> Result<()> {
        match self.holder(branch) {
            Some(lock) if lock.cycle_id != cycle_id => Err(CodehiveError::LockConflict {
                branch: branch.to_string(),
                holder_cycle: lock.cycle_id,
            }),
            _ => Ok(()),
        }
    }

    /// Release every lock held by `cycle_id`
    pub fn release_all_for(&self, cycle_id: &str) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let before = locks.len();
        locks.retain(|_, lock| lock.cycle_id != cycle_id);
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codehive_core::FixedClock;

    const TTL: i64 = 30 * 60 * 1000;

    fn table() -> (Arc<FixedClock>, LockTable) {
        let clock = Arc::new(FixedClock::new(1_000_000));
        let table = LockTable::new(clock.clone(), TTL);
        (clock, table)
    }

    #[test]
    fn test_acquire_held_then_expired() {
        let (clock, locks) = table();

        assert!(locks.acquire("c1", "feature/x", "agent-a"));
        assert!(!locks.acquire("c2", "feature/x", "agent-b"));

        let lock = locks.holder("feature/x").unwrap();
        assert_eq!(lock.acquired_at, 1_000_000);
        assert_eq!(lock.expires_at, 1_000_000 + TTL);

        clock.set(1_000_000 + 1_800_001);
        assert!(locks.holder("feature/x").is_none());
        assert!(locks.acquire("c2", "feature/x", "agent-b"));
        assert_eq!(locks.holder("feature/x").unwrap().cycle_id, "c2");
    }

    #[test]
    fn test_lock_valid_at_exact_expiry() {
        let (clock, locks) = table();
        assert!(locks.acquire("c1", "feature/x", "agent-a"));
        clock.set(1_000_000 + TTL);
        assert!(!locks.acquire("c2", "feature/x", "agent-b"));
    }

    #[test]
    fn test_release_is_unconditional() {
        let (_clock, locks) = table();
        assert!(locks.acquire("c1", "feature/x", "agent-a"));
        assert!(locks.release("feature/x"));
        assert!(!locks.release("feature/x"));
        assert!(locks.acquire("c2", "feature/x", "agent-b"));
    }

    #[test]
    fn test_check_access() {
        let (_clock, locks) = table();
        locks.acquire("c1", "feature/x", "agent-a");

        assert!(locks.check_access("c1", "feature/x").is_ok());
        let err = locks.check_access("c2", "feature/x").unwrap_err();
        assert!(err.to_string().starts_with("Branch is locked: feature/x"));
        assert!(locks.check_access("c2", "feature/other").is_ok());
    }

    #[test]
    fn test_release_all_for_cycle() {
        let (_clock, locks) = table();
        locks.acquire("c1", "a", "h");
        locks.acquire("c1", "b", "h");
        locks.acquire("c2", "c", "h");
        assert_eq!(locks.release_all_for("c1"), 2);
        assert!(locks.holder("c").is_some());
    }
}
