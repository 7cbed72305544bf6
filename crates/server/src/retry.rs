//! Restart policy for the local assistant process.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    Unbounded,
    /// Give up after this many consecutive failures.
    Bounded(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Restart,
    GiveUp,
    /// An exit or switch was already requested; the failure is part of it.
    Teardown,
}

impl RetryPolicy {
    pub fn from_limit(limit: Option<u32>) -> Self {
        limit.map_or(Self::Unbounded, Self::Bounded)
    }

    /// Decide what follows a failed run. `failures` counts this one.
    pub fn decide(&self, teardown_requested: bool, failures: u32) -> RetryDecision {
        if teardown_requested {
            return RetryDecision::Teardown;
        }
        match self {
            Self::Unbounded => RetryDecision::Restart,
            Self::Bounded(limit) if failures <= *limit => RetryDecision::Restart,
            Self::Bounded(_) => RetryDecision::GiveUp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_request_wins_over_any_budget() {
        assert_eq!(
            RetryPolicy::Unbounded.decide(true, 1),
            RetryDecision::Teardown
        );
        assert_eq!(
            RetryPolicy::Bounded(5).decide(true, 1),
            RetryDecision::Teardown
        );
    }

    #[test]
    fn unbounded_always_restarts() {
        assert_eq!(
            RetryPolicy::Unbounded.decide(false, 10_000),
            RetryDecision::Restart
        );
    }

    #[test]
    fn bounded_gives_up_past_the_limit() {
        let policy = RetryPolicy::from_limit(Some(2));
        assert_eq!(policy.decide(false, 1), RetryDecision::Restart);
        assert_eq!(policy.decide(false, 2), RetryDecision::Restart);
        assert_eq!(policy.decide(false, 3), RetryDecision::GiveUp);
        assert_eq!(RetryPolicy::from_limit(None), RetryPolicy::Unbounded);
    }
}
