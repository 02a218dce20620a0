//! Retransmission timer.
//!
//! Both engines wait `initial_delay * 2^timeouts` for a reply, capped at
//! `max_delay`. Any progress from the peer resets the count. The transfer is
//! abandoned once `max_timeouts` consecutive waits expire.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First wait, and the wait after any progress.
    pub initial_delay: Duration,
    /// Ceiling for a single wait.
    pub max_delay: Duration,
    /// Consecutive expired waits that end the transfer.
    pub max_timeouts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_timeouts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no reply after {timeouts} consecutive timeouts")]
pub struct RetryExhausted {
    pub timeouts: u32,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    timeouts: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Backoff {
            config,
            timeouts: 0,
            current: config.initial_delay,
        }
    }

    /// How long the next read should wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive timeouts since the last progress.
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// Record an expired wait. Returns the next wait, or the error once the
    /// ceiling is reached.
    pub fn on_timeout(&mut self) -> Result<Duration, RetryExhausted> {
        self.timeouts += 1;
        if self.timeouts >= self.config.max_timeouts {
            return Err(RetryExhausted {
                timeouts: self.timeouts,
            });
        }

        let factor = 1u32.checked_shl(self.timeouts).unwrap_or(u32::MAX);
        self.current = self
            .config
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);
        Ok(self.current)
    }

    pub fn on_progress(&mut self) {
        self.timeouts = 0;
        self.current = self.config.initial_delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn doubles_until_exhausted() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        assert_eq!(backoff.current(), ms(500));
        assert_eq!(backoff.on_timeout(), Ok(ms(1000)));
        assert_eq!(backoff.on_timeout(), Ok(ms(2000)));
        assert_eq!(backoff.on_timeout(), Ok(ms(4000)));
        assert_eq!(backoff.on_timeout(), Ok(ms(8000)));
        assert_eq!(backoff.on_timeout(), Err(RetryExhausted { timeouts: 5 }));
    }

    #[test]
    fn capped_at_max_delay() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: ms(100),
            max_delay: ms(300),
            max_timeouts: 100,
        });
        let delays: Vec<_> = (0..5).map(|_| backoff.on_timeout().unwrap()).collect();
        assert_eq!(delays, vec![ms(200), ms(300), ms(300), ms(300), ms(300)]);
    }

    #[test]
    fn huge_timeout_counts_do_not_overflow() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_timeouts: 1000,
        });
        for _ in 0..100 {
            assert!(backoff.on_timeout().unwrap() <= Duration::from_secs(30));
        }
    }

    #[test]
    fn progress_resets() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_timeouts: 3,
            ..Default::default()
        });
        backoff.on_timeout().unwrap();
        backoff.on_timeout().unwrap();
        backoff.on_progress();
        assert_eq!(backoff.timeouts(), 0);
        assert_eq!(backoff.current(), ms(500));

        // Two more are allowed again before the third ends it.
        backoff.on_timeout().unwrap();
        backoff.on_timeout().unwrap();
        assert!(backoff.on_timeout().is_err());
    }
}
