//! Node configuration.

use crate::messages::PeerInfo;
use crate::node_id::NodeId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Hook invoked on every maintenance tick, after refresh work. The
/// application layer hangs republish of its stored values here.
pub type MaintenanceHook = Arc<dyn Fn() + Send + Sync>;

/// Operator-tunable node configuration.
///
/// Every field has a default; validation happens once at node
/// construction and is the only fatal error path in the crate.
#[derive(Clone)]
pub struct DhtConfig {
    /// Maximum peers per bucket.
    pub k: usize,
    /// Iterative-lookup parallelism.
    pub alpha: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Supervisor cleaner period. Defaults to a quarter of
    /// `request_timeout` so a timed-out request waits at most ~1.25x its
    /// deadline for the sweep.
    pub sweep_interval: Duration,
    /// Maintenance (CRON) period.
    pub maintenance_interval: Duration,
    /// Bucket freshness horizon: buckets with no traffic for this long
    /// get a refresh lookup, and a table idle this long triggers a
    /// self-lookup.
    pub stale_after: Duration,
    /// Seed peers for the initial self-lookup.
    pub bootstrap: Vec<PeerInfo>,
    /// Fixed local id; generated at random when `None`.
    pub local_id: Option<NodeId>,
    /// Republish hook, invoked each maintenance tick.
    pub maintenance_hook: Option<MaintenanceHook>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        let request_timeout = Duration::from_secs(5);
        Self {
            k: 20,
            alpha: 3,
            request_timeout,
            sweep_interval: request_timeout / 4,
            maintenance_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(15 * 60),
            bootstrap: Vec::new(),
            local_id: None,
            maintenance_hook: None,
        }
    }
}

impl DhtConfig {
    /// Add a bootstrap peer.
    pub fn add_bootstrap_peer(&mut self, peer: PeerInfo) {
        self.bootstrap.push(peer);
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k == 0 {
            return Err(ConfigError::InvalidK(self.k));
        }
        if self.alpha == 0 || self.alpha > self.k {
            return Err(ConfigError::InvalidAlpha {
                alpha: self.alpha,
                k: self.k,
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("request_timeout"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("sweep_interval"));
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("maintenance_interval"));
        }
        if let Some(local_id) = self.local_id {
            if self.bootstrap.iter().any(|p| p.id == local_id) {
                return Err(ConfigError::BootstrapIsSelf);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DhtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtConfig")
            .field("k", &self.k)
            .field("alpha", &self.alpha)
            .field("request_timeout", &self.request_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("maintenance_interval", &self.maintenance_interval)
            .field("stale_after", &self.stale_after)
            .field("bootstrap", &self.bootstrap)
            .field("local_id", &self.local_id)
            .field("maintenance_hook", &self.maintenance_hook.is_some())
            .finish()
    }
}

/// Configuration errors; fatal at startup only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `k` must be at least 1.
    #[error("k must be at least 1, got {0}")]
    InvalidK(usize),

    /// `alpha` must be in `1..=k`.
    #[error("alpha must be in 1..=k ({k}), got {alpha}")]
    InvalidAlpha {
        /// Configured parallelism.
        alpha: usize,
        /// Configured bucket capacity.
        k: usize,
    },

    /// A timer was configured as zero.
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),

    /// The bootstrap list contains the local id.
    #[error("bootstrap list contains the local node id")]
    BootstrapIsSelf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_defaults_valid() {
        let config = DhtConfig::default();
        assert_eq!(config.k, 20);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.sweep_interval, Duration::from_millis(1250));
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_k() {
        let config = DhtConfig {
            k: 0,
            ..DhtConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidK(0)));
    }

    #[test]
    fn test_invalid_alpha() {
        let config = DhtConfig {
            alpha: 0,
            ..DhtConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAlpha { .. })
        ));

        let config = DhtConfig {
            k: 2,
            alpha: 3,
            ..DhtConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAlpha { .. })
        ));
    }

    #[test]
    fn test_zero_interval() {
        let config = DhtConfig {
            request_timeout: Duration::ZERO,
            ..DhtConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("request_timeout"))
        );
    }

    #[test]
    fn test_bootstrap_containing_self_rejected() {
        let local_id = NodeId::random();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut config = DhtConfig {
            local_id: Some(local_id),
            ..DhtConfig::default()
        };
        config.add_bootstrap_peer(PeerInfo { id: local_id, addr });
        assert_eq!(config.validate(), Err(ConfigError::BootstrapIsSelf));
    }

    #[test]
    fn test_debug_hides_hook() {
        let config = DhtConfig {
            maintenance_hook: Some(Arc::new(|| {})),
            ..DhtConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("maintenance_hook: true"));
    }
}
