//! Runtime configuration
//!
//! Every section has defaults, so an empty TOML document is a valid config.
//!
//! ```toml
//! replica_id = "node-a"
//!
//! [gossip]
//! fanout = 3
//! interval_ms = 500
//!
//! [retry]
//! max_attempts = 5
//! exclusion_rounds = 10
//!
//! [conflict]
//! default_strategy = "manual-review"
//!
//! [conflict.overrides]
//! graph = "keep-latest"
//! ```

use crate::conflict::StrategyKind;
use crate::error::{Result, SyncError};
use crate::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Top-level configuration of a sync node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Stable replica identity; generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_id: Option<ReplicaId>,
    pub gossip: GossipConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub batching: BatchingConfig,
    pub protocol: ProtocolConfig,
    pub conflict: ConflictConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Peers each round (and each relay) reaches
    pub fanout: usize,
    pub interval_ms: u64,
    /// Relay budget carried by every delta
    pub max_relay_hops: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            interval_ms: 500,
            max_relay_hops: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handshake_ms: u64,
    /// Deadline for one delivery round (send batch, receive ack)
    pub round_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_ms: 5_000,
            round_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
    /// Gossip rounds an exhausted peer sits out before being retried
    pub exclusion_rounds: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            max_attempts: 5,
            exclusion_rounds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_deltas: usize,
    pub max_bytes: usize,
    pub flush_interval_ms: u64,
    /// Pre-merge pending deltas of the same object before sending
    pub compress: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_deltas: 64,
            max_bytes: 256 * 1024,
            flush_interval_ms: 250,
            compress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_frame_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub default_strategy: StrategyKind,
    /// Strategy per CRDT kind name (`workflow`, `graph`, ...)
    pub overrides: BTreeMap<String, StrategyKind>,
}

impl SyncConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.gossip.fanout == 0 {
            return Err(SyncError::Config("gossip.fanout must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(SyncError::Config("retry.multiplier must be >= 1.0".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(SyncError::Config(
                "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        if self.protocol.max_frame_bytes == 0 {
            return Err(SyncError::Config("protocol.max_frame_bytes must be non-zero".into()));
        }
        if self.batching.max_deltas == 0 {
            return Err(SyncError::Config("batching.max_deltas must be at least 1".into()));
        }
        if let Some(id) = &self.replica_id {
            if id.is_empty() {
                return Err(SyncError::Config("replica_id must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Configured replica id, or a fresh UUID
    pub fn resolve_replica_id(&self) -> ReplicaId {
        self.replica_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip.interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.handshake_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.round_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.batching.flush_interval_ms)
    }
}
