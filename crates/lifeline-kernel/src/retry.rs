//! Bounded retry with a fixed delay between attempts.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use lifeline_kernel::retry;
//!
//! let mut calls = 0;
//! let out: Result<u32, String> = retry("probe", 3, Duration::ZERO, |attempt| {
//!     calls += 1;
//!     if attempt < 2 { Err("not yet".into()) } else { Ok(attempt) }
//! });
//! assert_eq!(out, Ok(2));
//! assert_eq!(calls, 2);
//! ```

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

/// Run `op` up to `attempts` times (at least once), sleeping `delay`
/// between failures.  `op` receives the 1-based attempt number.
///
/// Returns the first success, or the last error once attempts run out.
pub fn retry<T, E, F>(label: &str, attempts: u32, delay: Duration, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    info!(evt = "RETRY_RECOVERED", op = label, attempt, "operation recovered");
                }
                return Ok(value);
            }
            Err(e) if attempt < attempts => {
                warn!(
                    evt = "RETRY",
                    op = label,
                    attempt,
                    attempts,
                    error = %e,
                    "operation failed; retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                error!(evt = "RETRY_EXHAUSTED", op = label, attempts, error = %e, "operation failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn first_success_short_circuits() {
        let mut calls = 0;
        let out: Result<&str, String> = retry("op", 3, Duration::ZERO, |_| {
            calls += 1;
            Ok("done")
        });
        assert_eq!(out, Ok("done"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn exhausted_attempts_return_last_error() {
        let mut calls = 0;
        let out: Result<(), String> = retry("op", 3, Duration::ZERO, |attempt| {
            calls += 1;
            Err(format!("fail {attempt}"))
        });
        assert_eq!(out, Err("fail 3".to_string()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _: Result<(), String> = retry("op", 0, Duration::ZERO, |_| {
            calls += 1;
            Err("nope".into())
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn delay_applies_only_between_attempts() {
        let start = Instant::now();
        let _: Result<(), String> =
            retry("op", 3, Duration::from_millis(10), |_| Err("nope".into()));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(500));
    }
}
