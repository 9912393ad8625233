//! Brute-force guard for the `/auth` endpoint
//!
//! Counts failed authentication attempts per client IP. Only failures are
//! recorded; a successful authentication clears the IP's entry. The reset
//! deadline is fixed when the first failure of a window lands, so a
//! steady stream of bad attempts cannot push it out indefinitely.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

struct AuthAttempt {
    count: u32,
    reset_at: Instant,
}

pub struct AuthThrottle {
    max_attempts: u32,
    window: Duration,
    attempts: Mutex<HashMap<String, AuthAttempt>>,
}

impl Default for AuthThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW)
    }
}

impl AuthThrottle {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Gate an incoming `/auth` call. `Err` carries the seconds the caller
    /// should wait before retrying.
    pub fn check(&self, ip: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().expect("auth throttle lock");

        match attempts.get(ip) {
            Some(entry) if now >= entry.reset_at => {
                attempts.remove(ip);
                Ok(())
            }
            Some(entry) if entry.count >= self.max_attempts => {
                let remaining_ms = entry.reset_at.saturating_duration_since(now).as_millis() as u64;
                Err(remaining_ms.div_ceil(1000).max(1))
            }
            _ => Ok(()),
        }
    }

    /// Records one failed attempt for `ip`.
    pub fn record_failure(&self, ip: &str) {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().expect("auth throttle lock");

        match attempts.get_mut(ip) {
            Some(entry) if now < entry.reset_at => {
                entry.count += 1;
            }
            _ => {
                attempts.insert(
                    ip.to_string(),
                    AuthAttempt {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
            }
        }
    }

    /// Successful authentication wipes the IP's failure history.
    pub fn clear(&self, ip: &str) {
        self.attempts.lock().expect("auth throttle lock").remove(ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_max_failures() {
        let throttle = AuthThrottle::default();

        for _ in 0..4 {
            throttle.record_failure("10.0.0.1");
            assert!(throttle.check("10.0.0.1").is_ok());
        }

        throttle.record_failure("10.0.0.1");
        let retry_after = throttle.check("10.0.0.1").unwrap_err();
        assert!(retry_after >= 1);
        assert!(retry_after <= 60);
    }

    #[test]
    fn success_clears_the_counter() {
        let throttle = AuthThrottle::default();
        for _ in 0..5 {
            throttle.record_failure("10.0.0.1");
        }
        assert!(throttle.check("10.0.0.1").is_err());

        throttle.clear("10.0.0.1");
        assert!(throttle.check("10.0.0.1").is_ok());
    }

    #[test]
    fn window_expiry_unlocks() {
        let throttle = AuthThrottle::new(1, Duration::from_millis(30));
        throttle.record_failure("10.0.0.1");
        assert!(throttle.check("10.0.0.1").is_err());

        std::thread::sleep(Duration::from_millis(40));
        assert!(throttle.check("10.0.0.1").is_ok());
    }

    #[test]
    fn ips_are_isolated() {
        let throttle = AuthThrottle::new(1, DEFAULT_WINDOW);
        throttle.record_failure("10.0.0.1");
        assert!(throttle.check("10.0.0.1").is_err());
        assert!(throttle.check("10.0.0.2").is_ok());
    }

    #[test]
    fn reset_deadline_is_not_extended_by_later_failures() {
        let throttle = AuthThrottle::new(10, Duration::from_millis(50));
        throttle.record_failure("10.0.0.1");
        let first_reset = throttle.attempts.lock().unwrap().get("10.0.0.1").unwrap().reset_at;

        std::thread::sleep(Duration::from_millis(10));
        throttle.record_failure("10.0.0.1");
        let second_reset = throttle.attempts.lock().unwrap().get("10.0.0.1").unwrap().reset_at;

        assert_eq!(first_reset, second_reset);
    }
}
