//! Configuration for the overlay engine
//!
//! Operational policy knobs only; the on-disk layout itself is private
//! to the store and not configurable.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default identity watermark reservation gap
pub const DEFAULT_ID_RESERVE_BATCH: u64 = 1024;

/// Default advisory cap on inline payloads: 1MB
pub const DEFAULT_INLINE_LIMIT: u64 = 1024 * 1024;

/// What the session does after the store reports an I/O failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoErrorPolicy {
    /// Refuse every subsequent operation, reads included
    FailFast,
    /// Keep serving reads, refuse mutations until remounted
    DegradeReadOnly,
}

/// Overlay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Flush the store after every committed transaction so that an
    /// acknowledged operation is durable across power loss
    pub sync_on_commit: bool,

    /// How many identities to reserve per watermark persistence; a
    /// crash forfeits at most this many unissued identities
    pub id_reserve_batch: u64,

    /// Behavior after a StoreUnavailable error
    pub io_error_policy: IoErrorPolicy,

    /// Advisory size above which inline payloads are flagged by the
    /// admin inspection tooling (content is stored verbatim regardless)
    pub inline_limit: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            sync_on_commit: true,
            id_reserve_batch: DEFAULT_ID_RESERVE_BATCH,
            io_error_policy: IoErrorPolicy::DegradeReadOnly,
            inline_limit: DEFAULT_INLINE_LIMIT,
        }
    }
}

impl OverlayConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}
