use std::time::Duration;

/// Timing knobs for [`EnvironmentLock`](super::EnvironmentLock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long a written record stays valid.
    pub ttl: Duration,
    /// Overall deadline for `acquire` in waiting mode.
    pub acquire_timeout: Duration,
    /// Pause between attempts while the lock is held elsewhere.
    pub retry_interval: Duration,
    /// Renewal period; must be well inside `ttl`.
    pub renew_interval: Duration,
    /// Deadline for each individual object store call.
    pub op_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(5 * 60))
    }
}

impl LockOptions {
    /// Defaults scaled to `ttl`: renew at a third of it, acquire timeout
    /// equal to it.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            acquire_timeout: ttl,
            retry_interval: Duration::from_secs(5).min(ttl / 10).max(Duration::from_millis(10)),
            renew_interval: ttl / 3,
            op_timeout: Duration::from_secs(30),
        }
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = LockOptions::default();
        assert_eq!(options.ttl, Duration::from_secs(300));
        assert_eq!(options.acquire_timeout, Duration::from_secs(300));
        assert_eq!(options.retry_interval, Duration::from_secs(5));
        assert!(options.renew_interval < options.ttl);
    }

    #[test]
    fn test_scaled() {
        let options = LockOptions::with_ttl(Duration::from_secs(3));
        assert_eq!(options.retry_interval, Duration::from_millis(300));
        assert_eq!(options.renew_interval, Duration::from_secs(1));
    }
}
