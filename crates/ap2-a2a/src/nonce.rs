//! Nonce anti-replay.
//!
//! One mutex-guarded map from nonce to expiry instant. `check_and_record`
//! is atomic: under concurrent access exactly one caller is accepted per
//! nonce within the TTL window. Applies to A2A `message_id`s and mandate
//! nonces alike.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default nonce TTL; matches the A2A timestamp freshness window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// How often the opportunistic sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Result of a nonce check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceOutcome {
    /// First use within the TTL window; recorded.
    Accepted,
    /// Seen before and still unexpired; replay.
    Rejected,
}

struct State {
    used: HashMap<String, Instant>,
    last_sweep: Instant,
}

/// TTL-bounded single-use nonce store.
pub struct NonceManager {
    state: Mutex<State>,
    ttl: Duration,
}

impl NonceManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                used: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            ttl,
        }
    }

    /// Atomically check a nonce and record it if fresh.
    pub fn check_and_record(&self, nonce: &str) -> NonceOutcome {
        let now = Instant::now();
        let mut state = self.state.lock().expect("nonce mutex poisoned");

        if now.duration_since(state.last_sweep) > SWEEP_INTERVAL {
            state.used.retain(|_, expiry| *expiry > now);
            state.last_sweep = now;
        }

        if let Some(expiry) = state.used.get(nonce) {
            if *expiry > now {
                return NonceOutcome::Rejected;
            }
            state.used.remove(nonce);
        }

        state.used.insert(nonce.to_string(), now + self.ttl);
        NonceOutcome::Accepted
    }

    /// Drop expired entries now.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("nonce mutex poisoned");
        let before = state.used.len();
        state.used.retain(|_, expiry| *expiry > now);
        state.last_sweep = now;
        let removed = before - state.used.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired nonces");
        }
    }

    /// Number of tracked (possibly expired) nonces.
    pub fn len(&self) -> usize {
        self.state.lock().expect("nonce mutex poisoned").used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NonceManager {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_use_accepted_second_rejected() {
        let manager = NonceManager::default();
        assert_eq!(manager.check_and_record("n1"), NonceOutcome::Accepted);
        assert_eq!(manager.check_and_record("n1"), NonceOutcome::Rejected);
    }

    #[test]
    fn test_distinct_nonces_independent() {
        let manager = NonceManager::default();
        assert_eq!(manager.check_and_record("n1"), NonceOutcome::Accepted);
        assert_eq!(manager.check_and_record("n2"), NonceOutcome::Accepted);
    }

    #[test]
    fn test_readmitted_exactly_once_after_ttl() {
        let manager = NonceManager::new(Duration::from_millis(20));
        assert_eq!(manager.check_and_record("n1"), NonceOutcome::Accepted);
        assert_eq!(manager.check_and_record("n1"), NonceOutcome::Rejected);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(manager.check_and_record("n1"), NonceOutcome::Accepted);
        assert_eq!(manager.check_and_record("n1"), NonceOutcome::Rejected);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let manager = NonceManager::new(Duration::from_millis(10));
        manager.check_and_record("n1");
        manager.check_and_record("n2");
        assert_eq!(manager.len(), 2);

        std::thread::sleep(Duration::from_millis(20));
        manager.sweep();
        assert!(manager.is_empty());
    }

    #[test]
    fn test_exactly_one_winner_under_concurrency() {
        let manager = Arc::new(NonceManager::default());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            handles.push(std::thread::spawn(move || {
                manager.check_and_record("contested")
            }));
        }

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == NonceOutcome::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }
}
