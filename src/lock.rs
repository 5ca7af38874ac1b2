// src/lock.rs

//! Per-repository read/write locks
//!
//! Queries hold a shared guard, mutations an exclusive one. Acquisition is
//! bounded: callers either wait up to a timeout or fail immediately, so no
//! operation blocks forever. Cross-process exclusion is left to SQLite
//! (`db::transaction`).

use crate::error::{Error, Result};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default time to wait for a contended lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// How to behave when a lock is held elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Wait up to the given duration
    Wait(Duration),
    /// Fail at once (`--quick`, `--pretend`)
    NoWait,
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::Wait(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockMode {
    /// `NoWait` when `quick` is set, the default wait otherwise
    pub fn quick(quick: bool) -> Self {
        if quick {
            LockMode::NoWait
        } else {
            LockMode::default()
        }
    }
}

/// Shared guard over one repository
pub struct SharedGuard {
    _guard: ArcRwLockReadGuard<parking_lot::RawRwLock, ()>,
}

/// Exclusive guard over one repository
pub struct ExclusiveGuard {
    _guard: ArcRwLockWriteGuard<parking_lot::RawRwLock, ()>,
}

/// Lock table keyed by repository name
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, repository: &str) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(repository.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Take a shared guard for queries
    pub fn shared(&self, repository: &str, mode: LockMode) -> Result<SharedGuard> {
        let lock = self.lock_for(repository);
        let guard = match mode {
            LockMode::Wait(timeout) => lock.try_read_arc_for(timeout),
            LockMode::NoWait => lock.try_read_arc(),
        };

        match guard {
            Some(guard) => {
                debug!("Shared lock acquired on {}", repository);
                Ok(SharedGuard { _guard: guard })
            }
            None => Err(Error::LockContention {
                repository: repository.to_string(),
            }),
        }
    }

    /// Take an exclusive guard for mutations
    pub fn exclusive(&self, repository: &str, mode: LockMode) -> Result<ExclusiveGuard> {
        let lock = self.lock_for(repository);
        let guard = match mode {
            LockMode::Wait(timeout) => lock.try_write_arc_for(timeout),
            LockMode::NoWait => lock.try_write_arc(),
        };

        match guard {
            Some(guard) => {
                debug!("Exclusive lock acquired on {}", repository);
                Ok(ExclusiveGuard { _guard: guard })
            }
            None => Err(Error::LockContention {
                repository: repository.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_guards_coexist() {
        let table = LockTable::new();
        let _a = table.shared("main", LockMode::NoWait).unwrap();
        let _b = table.shared("main", LockMode::NoWait).unwrap();
        assert!(matches!(
            table.exclusive("main", LockMode::NoWait),
            Err(Error::LockContention { .. })
        ));
    }

    #[test]
    fn test_exclusive_blocks_and_times_out() {
        let table = LockTable::new();
        let guard = table.exclusive("main", LockMode::NoWait).unwrap();

        let err = table
            .shared("main", LockMode::Wait(Duration::from_millis(20)))
            .err()
            .unwrap();
        assert!(err.is_retryable());

        // Other repositories are unaffected
        assert!(table.exclusive("other", LockMode::NoWait).is_ok());

        drop(guard);
        assert!(table.exclusive("main", LockMode::NoWait).is_ok());
    }

    #[test]
    fn test_quick_mode() {
        assert_eq!(LockMode::quick(true), LockMode::NoWait);
        assert_eq!(LockMode::quick(false), LockMode::Wait(DEFAULT_LOCK_TIMEOUT));
    }
}
