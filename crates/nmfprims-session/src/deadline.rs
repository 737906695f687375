use std::time::{Duration, Instant};

use crate::error::{Result, SessionError};

/// Splits one caller-supplied timeout across the several connection calls
/// an operation makes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<Instant>,
    timeout: Duration,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
            timeout,
        }
    }

    /// Time left, or [`SessionError::TimedOut`] carrying the original
    /// timeout once it has run out.
    pub(crate) fn remaining(&self) -> Result<Duration> {
        let Some(at) = self.at else {
            return Ok(Duration::MAX);
        };
        match at.checked_duration_since(Instant::now()) {
            Some(left) if !left.is_zero() => Ok(left),
            _ => Err(SessionError::TimedOut(self.timeout)),
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_already_expired() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.remaining().unwrap_err().is_timeout());
    }

    #[test]
    fn remaining_never_exceeds_timeout() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let left = deadline.remaining().unwrap();
        assert!(left <= Duration::from_secs(5));
        assert_eq!(deadline.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        let deadline = Deadline::after(Duration::MAX);
        assert_eq!(deadline.remaining().unwrap(), Duration::MAX);
    }
}
