use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Per-room "last reply" clock for rate-limited handlers.
///
/// `ready` and `mark` are separate calls, so two events racing through
/// `ready` before either marks can both fire. That race is tolerated; the
/// map itself is never left inconsistent.
pub struct RateLimiter {
    interval_us: i64,
    last_fired: Mutex<HashMap<String, i64>>,
}

impl RateLimiter {
    pub fn new(interval_us: i64) -> Self {
        Self {
            interval_us,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval_us(&self) -> i64 {
        self.interval_us
    }

    pub fn ready(&self, room_id: &str, now_us: i64) -> bool {
        let map = self.last_fired.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get(room_id) {
            Some(last) => now_us.saturating_sub(*last) > self.interval_us,
            None => true,
        }
    }

    /// Record a reply at `now_us`. Never moves a room's clock backwards.
    pub fn mark(&self, room_id: &str, now_us: i64) {
        let mut map = self.last_fired.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(room_id.to_string())
            .and_modify(|last| *last = (*last).max(now_us))
            .or_insert(now_us);
    }

    pub fn last_fired(&self, room_id: &str) -> Option<i64> {
        self.last_fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn window_is_strict() {
        let f = 1_000;
        let limiter = RateLimiter::new(f);
        let t = 50_000;
        assert!(limiter.ready("!r", t));
        limiter.mark("!r", t);
        assert!(!limiter.ready("!r", t + f - 1));
        assert!(!limiter.ready("!r", t + f));
        assert!(limiter.ready("!r", t + f + 1));
    }

    #[test]
    fn rooms_are_independent() {
        let limiter = RateLimiter::new(1_000);
        limiter.mark("!a", 10);
        assert!(!limiter.ready("!a", 20));
        assert!(limiter.ready("!b", 20));
    }

    #[test]
    fn mark_keeps_latest() {
        let limiter = RateLimiter::new(1_000);
        limiter.mark("!a", 500);
        limiter.mark("!a", 200);
        assert_eq!(limiter.last_fired("!a"), Some(500));
    }

    #[test]
    fn concurrent_marks_do_not_panic() {
        let limiter = Arc::new(RateLimiter::new(10));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let l = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for t in 0..200 {
                        let room = format!("!r{}", t % 3);
                        if l.ready(&room, t * 8 + i) {
                            l.mark(&room, t * 8 + i);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(limiter.last_fired("!r0").is_some());
    }
}
