//! Per-identity cooldown gate.
//!
//! One accepted post per identity per `window`. The check and the record
//! happen inside a single critical section, so a burst of concurrent posts
//! from the same identity cannot race past the gate: exactly one wins, the
//! rest observe the freshly recorded timestamp and cool down.
//!
//! Entries are evicted by [`RateLimiter::sweep`], which the server runs on
//! an interval; without it the map would grow with distinct-identity churn
//! for the life of the process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::identity::SenderIdentity;

/// Default cooldown between accepted posts from one identity.
pub const DEFAULT_RATE_MS: u64 = 4000;

/// Idle entries older than `window * EVICT_MULTIPLIER` are swept.
const EVICT_MULTIPLIER: u32 = 8;

/// Outcome of a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Admitted,
    Cooling { remaining: Duration },
}

/// Cooldown gate keyed by sender identity.
///
/// Owns the identity → last-accepted map exclusively; nothing else reads
/// or mutates it. Lock hold times are a map probe, so a std `Mutex` is
/// enough (no await point inside).
pub struct RateLimiter {
    window: Duration,
    last_accepted: Mutex<HashMap<SenderIdentity, Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Duration::from_millis(DEFAULT_RATE_MS))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit or reject a post from `identity` at time `now`.
    ///
    /// On admission the timestamp is recorded before returning; rejection
    /// records nothing, so probing while cooling does not extend the
    /// cooldown.
    pub fn check_and_record(&self, identity: &SenderIdentity, now: Instant) -> Gate {
        let mut map = self.lock();
        match map.get(identity) {
            Some(&last) if now.duration_since(last) < self.window => {
                let remaining = self.window - now.duration_since(last);
                Gate::Cooling { remaining }
            }
            _ => {
                map.insert(*identity, now);
                Gate::Admitted
            }
        }
    }

    /// Evict entries idle long enough that they can no longer affect a
    /// gate decision. Returns the number of entries removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let ttl = self.window * EVICT_MULTIPLIER;
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, &mut last| now.duration_since(last) < ttl);
        before - map.len()
    }

    /// Number of identities currently tracked.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SenderIdentity, Instant>> {
        // A poisoned map is still a valid map; the panic that poisoned it
        // happened outside our critical section.
        self.last_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentitySalt;

    fn identity(address: &str) -> SenderIdentity {
        SenderIdentity::derive(&IdentitySalt::from_bytes([9u8; 16]), address)
    }

    #[test]
    fn test_first_post_admitted() {
        let limiter = RateLimiter::new(Duration::from_millis(4000));
        assert_eq!(
            limiter.check_and_record(&identity("10.0.0.1"), Instant::now()),
            Gate::Admitted
        );
    }

    #[test]
    fn test_cooldown_timeline() {
        // t=0 accepted, t=1000 rejected, t=4001 accepted (window 4000ms)
        let limiter = RateLimiter::new(Duration::from_millis(4000));
        let id = identity("10.0.0.1");
        let t0 = Instant::now();

        assert_eq!(limiter.check_and_record(&id, t0), Gate::Admitted);

        match limiter.check_and_record(&id, t0 + Duration::from_millis(1000)) {
            Gate::Cooling { remaining } => {
                assert_eq!(remaining, Duration::from_millis(3000));
            }
            Gate::Admitted => panic!("should be cooling at t=1000"),
        }

        assert_eq!(
            limiter.check_and_record(&id, t0 + Duration::from_millis(4001)),
            Gate::Admitted
        );
    }

    #[test]
    fn test_rejection_does_not_extend_cooldown() {
        let limiter = RateLimiter::new(Duration::from_millis(4000));
        let id = identity("10.0.0.1");
        let t0 = Instant::now();

        limiter.check_and_record(&id, t0);
        // Repeated probes while cooling must not move last_accepted
        for ms in [500u64, 1000, 2000, 3999] {
            assert!(matches!(
                limiter.check_and_record(&id, t0 + Duration::from_millis(ms)),
                Gate::Cooling { .. }
            ));
        }
        assert_eq!(
            limiter.check_and_record(&id, t0 + Duration::from_millis(4000)),
            Gate::Admitted
        );
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = RateLimiter::new(Duration::from_millis(4000));
        let t0 = Instant::now();
        assert_eq!(limiter.check_and_record(&identity("10.0.0.1"), t0), Gate::Admitted);
        assert_eq!(limiter.check_and_record(&identity("10.0.0.2"), t0), Gate::Admitted);
        assert!(matches!(
            limiter.check_and_record(&identity("10.0.0.1"), t0 + Duration::from_millis(1)),
            Gate::Cooling { .. }
        ));
    }

    #[test]
    fn test_admission_records_new_timestamp() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let id = identity("10.0.0.1");
        let t0 = Instant::now();

        limiter.check_and_record(&id, t0);
        let t1 = t0 + Duration::from_millis(150);
        assert_eq!(limiter.check_and_record(&id, t1), Gate::Admitted);
        // Window now measured from t1, not t0
        assert!(matches!(
            limiter.check_and_record(&id, t1 + Duration::from_millis(50)),
            Gate::Cooling { .. }
        ));
    }

    #[test]
    fn test_sweep_evicts_idle_entries() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let t0 = Instant::now();

        limiter.check_and_record(&identity("10.0.0.1"), t0);
        limiter.check_and_record(&identity("10.0.0.2"), t0 + Duration::from_millis(750));
        assert_eq!(limiter.len(), 2);

        // TTL is 8 * 100ms; at t=850 only the first entry is stale
        let evicted = limiter.sweep(t0 + Duration::from_millis(850));
        assert_eq!(evicted, 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_sweep_keeps_fresh_entries() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let t0 = Instant::now();
        limiter.check_and_record(&identity("10.0.0.1"), t0);

        assert_eq!(limiter.sweep(t0 + Duration::from_millis(10)), 0);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_swept_identity_is_admitted_again() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let id = identity("10.0.0.1");
        let t0 = Instant::now();

        limiter.check_and_record(&id, t0);
        limiter.sweep(t0 + Duration::from_millis(1000));
        assert!(limiter.is_empty());
        assert_eq!(
            limiter.check_and_record(&id, t0 + Duration::from_millis(1001)),
            Gate::Admitted
        );
    }

    #[test]
    fn test_concurrent_burst_single_admission() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(4000)));
        let id = identity("10.0.0.1");
        let now = Instant::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.check_and_record(&id, now))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|g| *g == Gate::Admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}
