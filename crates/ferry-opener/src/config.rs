//! Configuration for connection opening.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The cap on spare connection attempts running concurrently in one
/// worker process.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SpareLimit {
    /// No cap.
    #[default]
    Unlimited,
    /// At most this many concurrent spares; zero prohibits concurrent
    /// spares entirely (a spare may start only after its prime has no
    /// chance left).
    Limit(u32),
}

/// Configuration for [`HappyConnOpener`](crate::HappyConnOpener) and the
/// pacing gates, shared by every opener in the process.
///
/// The gap and limit are interpreted as cluster-wide targets: both are
/// scaled by `workers` so that uncoordinated worker processes
/// collectively approximate them.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, derive_builder::Builder)]
#[builder(derive(Debug))]
pub struct OpenerConfig {
    /// How long the prime attempt runs alone before a spare may start.
    #[builder(default = "Duration::from_millis(250)")]
    pub prime_head_start: Duration,
    /// Minimum delay between successive spare starts across all openers.
    #[builder(default)]
    pub spare_gap: Duration,
    /// Cap on concurrent spare attempts across all openers.
    #[builder(default)]
    pub spare_limit: SpareLimit,
    /// Number of worker processes sharing the configured gap and limit.
    #[builder(default = "1")]
    pub workers: u32,
    /// Per-transaction cap on connection attempts (reuse included).
    #[builder(default = "25")]
    pub max_tries: u32,
    /// Wall-clock budget for all forwarding work of one transaction.
    #[builder(default = "Duration::from_secs(4 * 60)")]
    pub forward_timeout: Duration,
    /// Connect timeout for destinations without a per-peer override.
    #[builder(default = "Duration::from_secs(60)")]
    pub connect_timeout: Duration,
}

impl OpenerConfig {
    /// Return a new builder for constructing an [`OpenerConfig`].
    pub fn builder() -> OpenerConfigBuilder {
        OpenerConfigBuilder::default()
    }

    /// The prime head start, scaled for uncoordinated workers.
    pub(crate) fn scaled_head_start(&self) -> Duration {
        self.prime_head_start * self.workers.max(1)
    }

    /// The spare gap, scaled for uncoordinated workers.
    pub(crate) fn scaled_gap(&self) -> Duration {
        self.spare_gap * self.workers.max(1)
    }

    /// Whether `level` outstanding allowances already reach the spare cap.
    pub(crate) fn spare_limit_reached(&self, level: u32) -> bool {
        match self.spare_limit {
            SpareLimit::Unlimited => false,
            SpareLimit::Limit(0) => true,
            SpareLimit::Limit(n) => level.saturating_mul(self.workers.max(1)) >= n,
        }
    }
}

impl Default for OpenerConfig {
    fn default() -> Self {
        OpenerConfig {
            prime_head_start: Duration::from_millis(250),
            spare_gap: Duration::ZERO,
            spare_limit: SpareLimit::Unlimited,
            workers: 1,
            max_tries: 25,
            forward_timeout: Duration::from_secs(4 * 60),
            connect_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults() {
        let config = OpenerConfig::default();
        assert_eq!(config.prime_head_start, Duration::from_millis(250));
        assert_eq!(config.spare_limit, SpareLimit::Unlimited);
        assert_eq!(config.max_tries, 25);
        let built = OpenerConfig::builder().build().unwrap();
        assert_eq!(built, config);
    }

    #[test]
    fn worker_scaling() {
        let config = OpenerConfig::builder()
            .prime_head_start(Duration::from_millis(100))
            .spare_gap(Duration::from_millis(10))
            .spare_limit(SpareLimit::Limit(4))
            .workers(2)
            .build()
            .unwrap();
        assert_eq!(config.scaled_head_start(), Duration::from_millis(200));
        assert_eq!(config.scaled_gap(), Duration::from_millis(20));
        // 2 local allowances represent ~4 cluster-wide: limit reached.
        assert!(config.spare_limit_reached(2));
        assert!(!config.spare_limit_reached(1));
    }

    #[test]
    fn limit_zero_always_reached() {
        let config = OpenerConfig::builder()
            .spare_limit(SpareLimit::Limit(0))
            .build()
            .unwrap();
        assert!(config.spare_limit_reached(0));
    }
}
