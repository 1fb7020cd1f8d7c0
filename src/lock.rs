//! Keyed advisory locks.
//!
//! Event handlers take a lock named after themselves so that only one
//! instance drives a given handler at a time. Losing the race is not a
//! correctness problem (everything downstream is idempotent), it only
//! avoids noisy concurrent-update errors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Errors from lock acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to acquire lock {key}: {reason}")]
    Acquire { key: String, reason: String },
}

/// Held lock; released on drop.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Hands out advisory locks by key.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn lock(&self, key: &str) -> Result<LockGuard>;
}

/// Process-local lock manager over keyed async mutexes.
#[derive(Default)]
pub struct LocalLockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LocalLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn lock(&self, key: &str) -> Result<LockGuard> {
        let mutex = self.entry(key);
        Ok(LockGuard {
            _guard: mutex.lock_owned().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let manager = LocalLockManager::new();

        let held = manager.lock("handler").await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), manager.lock("handler")).await;
        assert!(second.is_err(), "second lock should block while held");

        drop(held);
        manager.lock("handler").await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let manager = LocalLockManager::new();
        let _a = manager.lock("a").await.unwrap();
        let _b = manager.lock("b").await.unwrap();
    }
}
