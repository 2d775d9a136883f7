//! Configuration for the forwarding drivers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ferry_opener::OpenerConfig;

/// Configuration shared by [`FwdState`](crate::FwdState) and
/// [`TunnelState`](crate::TunnelState).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, derive_builder::Builder)]
#[builder(derive(Debug))]
pub struct ForwardConfig {
    /// Connection-opening configuration (attempt and time budgets live
    /// here, since the opener enforces them too).
    #[builder(default)]
    pub opener: OpenerConfig,
    /// Idle timeout for each tunnel direction; any successful I/O on
    /// either direction resets it.
    #[builder(default = "Duration::from_secs(15 * 60)")]
    pub read_idle_timeout: Duration,
    /// Ceiling on the total lifetime of a tunnel that has not yet begun
    /// shoveling.
    #[builder(default = "Duration::from_secs(24 * 60 * 60)")]
    pub lifetime_timeout: Duration,
    /// The `User-Agent` value presented in fabricated CONNECT requests.
    #[builder(default = "String::from(\"ferry\")")]
    pub user_agent: String,
    /// Name of the access list guarding cache misses, if one is
    /// configured.  Internal requests bypass it.
    #[builder(default)]
    pub miss_access: Option<String>,
}

impl ForwardConfig {
    /// Return a new builder for constructing a [`ForwardConfig`].
    pub fn builder() -> ForwardConfigBuilder {
        ForwardConfigBuilder::default()
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        ForwardConfig {
            opener: OpenerConfig::default(),
            read_idle_timeout: Duration::from_secs(15 * 60),
            lifetime_timeout: Duration::from_secs(24 * 60 * 60),
            user_agent: String::from("ferry"),
            miss_access: None,
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn builder_matches_default() {
        assert_eq!(ForwardConfig::builder().build().unwrap(), ForwardConfig::default());
    }
}
