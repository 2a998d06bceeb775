use std::{future::Future, time::Duration};

/// How often, and how many times, to check a condition before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        PollPolicy {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Fits as many `interval`-spaced attempts into `timeout` as possible; always at least one.
    pub fn from_timeout(timeout: Duration, interval: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1
        } else {
            timeout.as_millis() / interval.as_millis().max(1)
        };

        PollPolicy::new(interval, u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Result of a [`poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub satisfied: bool,
    pub attempts: u32,
}

/// Runs `check` until it returns `true` or the policy's attempts are used up.
///
/// Sleeps `policy.interval` between attempts but not after the last one.
pub async fn poll<F, Fut>(policy: PollPolicy, mut check: F) -> PollOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        if check(attempts).await {
            return PollOutcome {
                satisfied: true,
                attempts,
            };
        }

        if attempts >= policy.max_attempts {
            log::trace!("gave up after {attempts} attempts");
            return PollOutcome {
                satisfied: false,
                attempts,
            };
        }

        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn policy_from_timeout() {
        let policy = PollPolicy::from_timeout(Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 12);
        assert_eq!(policy.budget(), Duration::from_secs(55));

        let policy = PollPolicy::from_timeout(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 1);

        let policy = PollPolicy::from_timeout(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let calls = Cell::new(0);
        let policy = PollPolicy::new(Duration::from_millis(1), 10);

        let outcome = poll(policy, |attempt| {
            calls.set(calls.get() + 1);
            async move { attempt == 3 }
        })
        .await;

        assert_eq!(
            outcome,
            PollOutcome {
                satisfied: true,
                attempts: 3
            }
        );
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn bounded_by_max_attempts() {
        let policy = PollPolicy::new(Duration::from_millis(1), 4);
        let outcome = poll(policy, |_| async { false }).await;

        assert!(!outcome.satisfied);
        assert_eq!(outcome.attempts, 4);
    }
}
