//! Small forwarding-budget helpers.

use std::time::{Duration, Instant};

/// Time left to finish the whole forwarding process that began at
/// `start`, out of a total budget of `budget`.
///
/// Clock oddities (a start in the future) count as no time spent.
pub fn forward_timeout(budget: Duration, start: Instant, now: Instant) -> Duration {
    budget.saturating_sub(now.saturating_duration_since(start))
}

/// Whether there is still time to retry after a previous connection
/// failure.
pub fn enough_time_to_reforward(budget: Duration, start: Instant, now: Instant) -> bool {
    forward_timeout(budget, start, now) > Duration::ZERO
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn budget_accounting() {
        let start = Instant::now();
        let budget = Duration::from_secs(240);
        assert_eq!(forward_timeout(budget, start, start), budget);
        assert_eq!(
            forward_timeout(budget, start, start + Duration::from_secs(100)),
            Duration::from_secs(140)
        );
        assert_eq!(
            forward_timeout(budget, start, start + Duration::from_secs(1000)),
            Duration::ZERO
        );
        assert!(enough_time_to_reforward(budget, start, start));
        assert!(!enough_time_to_reforward(
            budget,
            start,
            start + Duration::from_secs(240)
        ));
    }

    #[test]
    fn backwards_clock_is_tolerated() {
        let start = Instant::now();
        let budget = Duration::from_secs(240);
        // A "now" before the start spends none of the budget.
        assert_eq!(forward_timeout(budget, start + Duration::from_secs(5), start), budget);
    }
}
