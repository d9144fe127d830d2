//! Process-local rate window store
//!
//! Same semantics as the shared store but no cross-process visibility. Used
//! directly when no shared store is configured and as the fallback when the
//! shared store is unreachable.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;

use super::store::RateWindowStore;
use super::types::RateLimitResult;

#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: DashMap<String, VecDeque<f64>>,
    lockouts: DashMap<String, f64>,
    /// (count, expires_at)
    violations: DashMap<String, (u32, f64)>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(window: &mut VecDeque<f64>, cutoff: f64) {
        while window.front().is_some_and(|ts| *ts <= cutoff) {
            window.pop_front();
        }
    }
}

#[async_trait]
impl RateWindowStore for InMemoryWindowStore {
    async fn try_admit(
        &self,
        key: &str,
        max: u32,
        window_secs: f64,
        now: f64,
        _member: &str,
    ) -> RateLimitResult<bool> {
        // The entry guard holds the shard lock for the whole check-and-record
        let mut window = self.windows.entry(key.to_string()).or_default();
        Self::prune(&mut window, now - window_secs);

        if window.len() < max as usize {
            window.push_back(now);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn count(&self, key: &str, window_secs: f64, now: f64) -> RateLimitResult<u32> {
        let cutoff = now - window_secs;
        Ok(self
            .windows
            .get(key)
            .map(|w| w.iter().filter(|ts| **ts > cutoff && **ts <= now).count() as u32)
            .unwrap_or(0))
    }

    async fn lockout_until(&self, key: &str, now: f64) -> RateLimitResult<Option<f64>> {
        let until = self.lockouts.get(key).map(|v| *v);
        match until {
            Some(until) if until > now => Ok(Some(until)),
            Some(_) => {
                self.lockouts.remove_if(key, |_, until| *until <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_lockout(&self, key: &str, until: f64, _now: f64) -> RateLimitResult<()> {
        self.lockouts.insert(key.to_string(), until);
        Ok(())
    }

    async fn increment_violations(&self, key: &str, reset_secs: u64, now: f64) -> RateLimitResult<u32> {
        let mut entry = self.violations.entry(key.to_string()).or_insert((0, now));
        let (count, expires_at) = *entry;
        let count = if expires_at <= now { 1 } else { count + 1 };
        *entry = (count, now + reset_secs as f64);
        Ok(count)
    }

    async fn violations(&self, key: &str, now: f64) -> RateLimitResult<u32> {
        Ok(self
            .violations
            .get(key)
            .filter(|v| v.1 > now)
            .map(|v| v.0)
            .unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admits_up_to_max_within_window() {
        let store = InMemoryWindowStore::new();
        assert!(store.try_admit("k", 2, 1.0, 100.0, "a").await.unwrap());
        assert!(store.try_admit("k", 2, 1.0, 100.2, "b").await.unwrap());
        assert!(!store.try_admit("k", 2, 1.0, 100.5, "c").await.unwrap());
        assert_eq!(store.count("k", 1.0, 100.5).await.unwrap(), 2);

        // First entry ages out at exactly 101.0
        assert!(store.try_admit("k", 2, 1.0, 101.0, "d").await.unwrap());
        assert!(!store.try_admit("k", 2, 1.0, 101.1, "e").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = InMemoryWindowStore::new();
        assert!(store.try_admit("a", 1, 10.0, 0.0, "x").await.unwrap());
        assert!(store.try_admit("b", 1, 10.0, 0.0, "x").await.unwrap());
        assert!(!store.try_admit("a", 1, 10.0, 5.0, "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_lockout_expires() {
        let store = InMemoryWindowStore::new();
        store.set_lockout("l", 160.0, 100.0).await.unwrap();
        assert_eq!(store.lockout_until("l", 120.0).await.unwrap(), Some(160.0));
        assert_eq!(store.lockout_until("l", 160.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_violation_counter_resets_after_quiet_period() {
        let store = InMemoryWindowStore::new();
        assert_eq!(store.increment_violations("v", 3600, 0.0).await.unwrap(), 1);
        assert_eq!(store.increment_violations("v", 3600, 100.0).await.unwrap(), 2);
        assert_eq!(store.violations("v", 3000.0).await.unwrap(), 2);

        // Quiet for longer than the reset period
        assert_eq!(store.violations("v", 3701.0).await.unwrap(), 0);
        assert_eq!(store.increment_violations("v", 3600, 3701.0).await.unwrap(), 1);
    }
}
