//! Typed configuration for the scheduler and the in-memory store

use aioconfig::{define_options, ConfFile, Count, Duration, Size, DEFAULT_SECTIONS};

use crate::error::Result;
use crate::throttle::Throttle;
use crate::tracker::TrackerConfig;

define_options! {
    /// Scheduler limits
    pub struct ObjecterConfig {
        /// Maximum requests in flight
        objecter_inflight_ops: Count = Count(1024),
        /// Maximum bytes in flight
        objecter_inflight_op_bytes: Size = Size(100 * 1024 * 1024),
        /// Per-request timeout; zero waits forever
        rados_osd_op_timeout: Duration = Duration(std::time::Duration::from_secs(30)),
    }
}

impl ObjecterConfig {
    /// Load from `[client]` falling back to `[global]`
    pub fn load(conf: &ConfFile) -> Result<Self> {
        Ok(Self::from_conf(conf, DEFAULT_SECTIONS)?)
    }

    pub fn throttle(&self) -> Throttle {
        Throttle::new(
            self.objecter_inflight_ops.0 as usize,
            self.objecter_inflight_op_bytes.0 as usize,
        )
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            operation_timeout: self.rados_osd_op_timeout.0,
        }
    }
}

define_options! {
    /// In-memory store behaviour
    pub struct MemStoreConfig {
        /// Delay before a batch is acknowledged
        memstore_ack_latency: Duration = Duration(std::time::Duration::ZERO),
        /// Delay between acknowledgment and durability
        memstore_commit_latency: Duration = Duration(std::time::Duration::from_millis(1)),
        /// Random extra delay added to each latency, up to this much
        memstore_latency_jitter: Duration = Duration(std::time::Duration::ZERO),
        /// Number of independently locked object shards
        memstore_shards: Count = Count(16),
    }
}

impl MemStoreConfig {
    pub fn load(conf: &ConfFile) -> Result<Self> {
        Ok(Self::from_conf(conf, DEFAULT_SECTIONS)?)
    }
}
