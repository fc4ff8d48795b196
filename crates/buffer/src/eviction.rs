//! LRU eviction of Ready buffers.
//!
//! Bounds are checked after every successful publish. Buffers are evicted in
//! least-recently-used order until both the buffer count and the combined
//! estimated size are back within bounds. The buffer that was just
//! published is never a candidate.

use crate::criteria::FilterHash;
use crate::error::Result;
use crate::registry::Registry;
use glint_config::BufferConfig;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub max_buffer_count: u64,
    pub max_total_size_bytes: u64,
}

impl EvictionPolicy {
    pub fn new(max_buffer_count: u64, max_total_size_bytes: u64) -> Self {
        Self { max_buffer_count, max_total_size_bytes }
    }

    pub fn is_over(&self, count: u64, bytes: u64) -> bool {
        count > self.max_buffer_count || bytes > self.max_total_size_bytes
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::from(&BufferConfig::default())
    }
}

impl From<&BufferConfig> for EvictionPolicy {
    fn from(config: &BufferConfig) -> Self {
        Self::new(u64::from(config.max_buffer_count), config.max_total_size_bytes)
    }
}

/// Evict least recently used buffers, sparing `protect`, until the registry
/// is within `policy`. Returns the hashes that were evicted, oldest first.
///
/// Stops early (with a warning) if the only buffer left is the protected
/// one; a single buffer can't be over the size bound because builds refuse
/// to produce one.
pub async fn enforce(registry: &Registry, policy: &EvictionPolicy, protect: Option<&FilterHash>) -> Result<Vec<FilterHash>> {
    let mut evicted = Vec::new();
    loop {
        let (count, bytes) = registry.totals().await?;
        if !policy.is_over(count, bytes) {
            break;
        }
        let Some(candidate) = registry.lru_candidate(protect).await? else {
            warn!(count, bytes, "buffer bounds exceeded with nothing left to evict");
            break;
        };
        // Someone else may have removed it in the meantime; either way it's gone.
        if registry.remove(&candidate.hash).await? {
            info!(
                hash = %candidate.hash.short(),
                rows = candidate.row_count,
                bytes = candidate.byte_size,
                "evicted least recently used buffer"
            );
        }
        evicted.push(candidate.hash);
    }
    Ok(evicted)
}
