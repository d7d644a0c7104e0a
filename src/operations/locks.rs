//! Operation locks
//!
//! Per-operation-id locks and the singleton recovery lock. Both are owned by an
//! engine instance and released by RAII guards on every exit path. Acquiring is
//! synchronous so callers take the lock before their first suspension point.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::{WalletError, WalletResult};

/// Set of operation ids currently being worked on
#[derive(Clone, Default)]
pub struct OperationLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl OperationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire the lock for an operation
    /// Fails with `AlreadyInProgress` if another call holds it
    pub fn acquire(&self, operation_id: &str) -> WalletResult<OperationGuard> {
        let mut held = self.held();
        if !held.insert(operation_id.to_string()) {
            log::warn!("Operation already in progress: {}", operation_id);
            return Err(WalletError::in_progress(operation_id));
        }
        log::debug!("Acquired operation lock: {}", operation_id);
        Ok(OperationGuard {
            held: self.held.clone(),
            operation_id: operation_id.to_string(),
        })
    }

    pub fn is_locked(&self, operation_id: &str) -> bool {
        self.held().contains(operation_id)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Guard that releases the operation lock when dropped
pub struct OperationGuard {
    held: Arc<Mutex<HashSet<String>>>,
    operation_id: String,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.operation_id);
        log::debug!("Released operation lock: {}", self.operation_id);
    }
}

/// Only one recovery pass per engine at a time
#[derive(Clone, Default)]
pub struct RecoveryLock {
    running: Arc<AtomicBool>,
}

impl RecoveryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, name: &str) -> WalletResult<RecoveryGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("Recovery already in progress: {}", name);
            return Err(WalletError::in_progress(name));
        }
        Ok(RecoveryGuard {
            running: self.running.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct RecoveryGuard {
    running: Arc<AtomicBool>,
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_lock_is_exclusive_per_id() {
        let locks = OperationLocks::new();
        let guard = locks.acquire("op-1").unwrap();

        let err = locks.acquire("op-1").err().unwrap();
        assert!(err.is_conflict());
        assert!(locks.acquire("op-2").is_ok());
        assert!(locks.is_locked("op-1"));

        drop(guard);
        assert!(!locks.is_locked("op-1"));
        assert!(locks.acquire("op-1").is_ok());
    }

    #[test]
    fn test_lock_released_on_error_path() {
        fn failing(locks: &OperationLocks) -> WalletResult<()> {
            let _guard = locks.acquire("op-1")?;
            Err(WalletError::validation("boom"))
        }

        let locks = OperationLocks::new();
        assert!(failing(&locks).is_err());
        assert!(!locks.is_locked("op-1"));
    }

    #[test]
    fn test_independent_instances_do_not_share_state() {
        let a = OperationLocks::new();
        let b = OperationLocks::new();
        let _guard = a.acquire("op-1").unwrap();
        assert!(b.acquire("op-1").is_ok());
    }

    #[test]
    fn test_recovery_lock() {
        let lock = RecoveryLock::new();
        let guard = lock.acquire("send-recovery").unwrap();
        assert!(lock.acquire("send-recovery").is_err());
        drop(guard);
        assert!(!lock.is_running());
        assert!(lock.acquire("send-recovery").is_ok());
    }
}
