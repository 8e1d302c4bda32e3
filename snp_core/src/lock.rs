//! The single global networking lock (§5): one `tokio::sync::Mutex`
//! guarding all listener/connection/poll-group state, with a hold-time
//! warning so a slow callback is visible in logs rather than silently
//! serializing every other connection.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::clock::Clock;

/// Warn when a single lock acquisition is held longer than this.
pub const SLOW_LOCK_WARN_THRESHOLD: Duration = Duration::from_millis(2);

pub struct NetworkingLock<T> {
    inner: Mutex<T>,
    clock: Clock,
}

pub struct NetworkingLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    acquired_at: tokio::time::Instant,
    label: &'static str,
}

impl<T> NetworkingLock<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Mutex::new(value), clock: Clock::new() }
    }

    /// Acquires the lock, tagging the acquisition with `label` (typically
    /// the calling API function's name) for the slow-hold warning.
    pub async fn lock(&self, label: &'static str) -> NetworkingLockGuard<'_, T> {
        let guard = self.inner.lock().await;
        NetworkingLockGuard { guard, acquired_at: tokio::time::Instant::now(), label }
    }

    pub fn now(&self) -> crate::clock::UsecTime {
        self.clock.now()
    }
}

impl<T> std::ops::Deref for NetworkingLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for NetworkingLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for NetworkingLockGuard<'_, T> {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        if held > SLOW_LOCK_WARN_THRESHOLD {
            warn!(label = self.label, held_ms = held.as_millis() as u64, "networking lock held unusually long");
        }
    }
}
