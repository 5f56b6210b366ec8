//! Fixed-schedule retry for transient storage failures.
//!
//! Only errors whose class says "try again" are retried: connection loss,
//! serialization failure, deadlock, statement completion unknown. Anything else
//! (constraint violations, bad input, kind conflicts) surfaces on first sight.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Delays between attempts; the number of retries is the schedule length.
pub const DEFAULT_BACKOFF: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(5)];

/// SQLSTATE codes worth a second attempt.
const RETRIABLE_SQLSTATES: [&str; 4] = [
    "08000", // connection_exception
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "40003", // statement_completion_unknown
];

pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

pub fn is_retriable_sqlstate(code: &str) -> bool {
    RETRIABLE_SQLSTATES.contains(&code)
}

/// Classifies a driver error. Lost or unobtainable connections count as the
/// connection exception class even when the server never sent a SQLSTATE.
pub fn is_retriable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_retriable_sqlstate(&code)),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

impl Retriable for sqlx::Error {
    fn is_retriable(&self) -> bool {
        is_retriable_db_error(self)
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    schedule: Vec<Duration>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF.to_vec())
    }
}

impl RetryExecutor {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    /// Runs `op` until it succeeds, fails with a non-retriable error, or the
    /// schedule is exhausted; the last error is returned as is.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retriable + Display,
    {
        let mut delays = self.schedule.iter();
        let mut attempt = 1usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() => match delays.next() {
                    Some(delay) => {
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retriable storage error, backing off");
                        tokio::time::sleep(*delay).await;
                        attempt += 1;
                    }
                    None => {
                        error!(attempts = attempt, error = %e, "storage retries exhausted");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Transient,
        Fatal,
    }

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retriable for FakeError {
        fn is_retriable(&self) -> bool {
            *self == FakeError::Transient
        }
    }

    fn fast() -> RetryExecutor {
        RetryExecutor::new(vec![Duration::from_millis(1); 3])
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = fast()
            .run(move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(FakeError::Transient),
                    n => Ok(n),
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast()
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Fatal)
            })
            .await;
        assert_eq!(result, Err(FakeError::Fatal));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_schedule() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast()
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Transient)
            })
            .await;
        assert_eq!(result, Err(FakeError::Transient));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_sqlstate_classes() {
        for code in ["08000", "40001", "40P01", "40003"] {
            assert!(is_retriable_sqlstate(code), "{code}");
        }
        for code in ["23505", "22003", "42P01", ""] {
            assert!(!is_retriable_sqlstate(code), "{code}");
        }
        assert!(!sqlx::Error::RowNotFound.is_retriable());
        assert!(sqlx::Error::PoolTimedOut.is_retriable());
    }

    #[test]
    fn test_default_schedule() {
        assert_eq!(
            RetryExecutor::default().schedule,
            vec![Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(5)]
        );
    }
}
